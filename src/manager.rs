//! High-level package operations
//!
//! [`PackageManager`] builds, signs, verifies and unpacks packages. Loaded
//! containers stay open so their files can be queried and extracted until
//! [`PackageManager::clear_packages`] is called. Containers nested inside ZIP,
//! GZIP and LZ4 packages are extracted next to the package (or into the
//! configured temp dir) and loaded in turn.

use crate::algorithm::{digest_stream, sign_algorithm, CertVerifier, SignAlgorithm};
use crate::codec::{codec_for, CodecContext};
use crate::config::ManagerConfig;
use crate::error::{PkgError, Result};
use crate::format::{DigestMethod, PackageType, SignMethod, SIGN_TOTAL_LEN};
use crate::info::{FileInfo, PackageInfo};
use crate::package::{accept_all, new_container, Container, PkgVerifier, UPGRADE_RESERVE_LEN};
use crate::plan::PackagePlan;
use crate::stream::{
    borrow_stream, read_exact_at, ByteStream, MemoryStream, OpenMode,
    ProcessorCallback, ProcessorStream, SharedStream, StreamCache,
};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Progress report from [`PackageManager::verify_package`]: outcome so far and percent done
pub type ProgressCallback<'a> = dyn FnMut(std::result::Result<(), &PkgError>, u32) + 'a;

struct LoadedPackage {
    path: PathBuf,
    container: Box<dyn Container>,
    /// Leaf files reported when this package was loaded, nested ones
    /// included for a package loaded by path
    leaf_ids: Vec<String>,
}

/// Builds, loads and verifies packages
pub struct PackageManager {
    config: ManagerConfig,
    streams: StreamCache,
    packages: Vec<LoadedPackage>,
    temp_files: Vec<PathBuf>,
}

impl Default for PackageManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl PackageManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            streams: StreamCache::new(),
            packages: Vec::new(),
            temp_files: Vec::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Container type for a package path, from its extension
    pub fn package_type_for<P: AsRef<Path>>(path: P) -> PackageType {
        PackageType::from_path(path)
    }

    /// Build a package at `path` from `files`, signing it with `key_path`
    /// when the header asks for a signature
    ///
    /// Returns the offset of the signature slot.
    pub fn create_package<P: AsRef<Path>>(
        &mut self,
        path: P,
        key_path: Option<&Path>,
        header: &PackageInfo,
        files: &[(PathBuf, FileInfo)],
    ) -> Result<usize> {
        let path = path.as_ref();
        let header = normalize_header(header, files)?;
        if header.sign_method != SignMethod::None && key_path.is_none() {
            return Err(PkgError::InvalidParam(format!(
                "{:?} signature requested without a key",
                header.sign_method
            )));
        }
        info!(
            "Creating {:?} package {} with {} files",
            header.package_type,
            path.display(),
            files.len()
        );

        let stream = self.streams.open_file(path, OpenMode::Write)?;
        let name = path.display().to_string();
        let result = self.build_package(stream, &header, files).and_then(|(stream, sign_offset)| {
            if let (SignMethod::Rsa | SignMethod::Ecdsa, Some(key)) = (header.sign_method, key_path) {
                self.sign_package(&stream, &header, sign_offset, key)?;
            }
            Ok(sign_offset)
        });
        let closed = self.streams.close(&name);
        let sign_offset = result?;
        closed?;
        Ok(sign_offset)
    }

    /// Build an unsigned upgrade package and return the hex digest of the file
    pub fn create_package_digest<P: AsRef<Path>>(
        &mut self,
        path: P,
        header: &PackageInfo,
        files: &[(PathBuf, FileInfo)],
    ) -> Result<String> {
        let path = path.as_ref();
        let mut header = header.clone();
        if header.package_type == PackageType::None {
            header.package_type = PackageType::Upgrade;
        }
        if header.package_type != PackageType::Upgrade {
            return Err(PkgError::InvalidParam(format!(
                "digest-only builds need an upgrade package, got {:?}",
                header.package_type
            )));
        }
        header.sign_method = SignMethod::None;
        self.create_package(path, None, &header, files)?;

        let method = upgrade_digest_method(header.digest_method);
        let digest = self.file_digest(path, method, None)?;
        info!("Digest of {}: {}", path.display(), hex::encode(&digest));
        Ok(hex::encode(digest))
    }

    /// Build the package a plan describes
    pub fn create_package_from_plan<P: AsRef<Path>>(
        &mut self,
        plan: &PackagePlan,
        output: P,
        key_path: Option<&Path>,
    ) -> Result<usize> {
        plan.validate()?;
        let files = plan.file_infos();
        for (file, (source, _)) in plan.files.iter().zip(&files) {
            let Some(expected) = file.expected_digest()? else {
                continue;
            };
            let actual = self.file_digest(source, DigestMethod::Sha256, None)?;
            if actual != expected {
                return Err(PkgError::InvalidDigest(format!(
                    "{} has sha256 {}, plan expects {}",
                    source.display(),
                    hex::encode(&actual),
                    hex::encode(&expected)
                )));
            }
        }
        self.create_package(output, key_path, &plan.header(), &files)
    }

    fn build_package(
        &mut self,
        stream: SharedStream,
        header: &PackageInfo,
        files: &[(PathBuf, FileInfo)],
    ) -> Result<(SharedStream, usize)> {
        let mut container = new_container(header.package_type, stream.clone(), header.clone())?;
        for (source, file) in files {
            let input = self.streams.open_file(source, OpenMode::Read)?;
            let source_name = source.display().to_string();
            let added = borrow_stream(&input).and_then(|mut input| container.add_entry(file, &mut *input));
            self.streams.close(&source_name)?;
            added?;
        }
        let sign_offset = container.save_package()?;
        Ok((stream, sign_offset))
    }

    fn sign_package(
        &self,
        stream: &SharedStream,
        header: &PackageInfo,
        sign_offset: usize,
        key_path: &Path,
    ) -> Result<()> {
        let method = header.digest_method;
        let area = sign_offset - method.signature_slot();
        let zeroed = if header.package_type == PackageType::Upgrade {
            area - UPGRADE_RESERVE_LEN..area + SIGN_TOTAL_LEN
        } else {
            area..area + SIGN_TOTAL_LEN
        };

        let mut pkg = borrow_stream(stream)?;
        let digest = digest_stream(&mut *pkg, method, Some(zeroed), self.config.buffer_size)?;
        let signer = sign_algorithm(key_path, header.sign_method, method)?;
        let signature = signer.sign(&digest)?;
        if signature.len() > method.signature_len() {
            return Err(PkgError::InvalidSignature(format!(
                "signature of {} bytes does not fit the {} byte slot",
                signature.len(),
                method.signature_len()
            )));
        }
        pkg.write(&signature, sign_offset)?;
        let length = pkg.len();
        pkg.flush(length)?;
        debug!(
            "Signed {} with {:?}/{:?} ({} byte signature at {})",
            pkg.name(),
            header.sign_method,
            method,
            signature.len(),
            sign_offset
        );
        Ok(())
    }

    /// Load a package and every package nested inside it
    ///
    /// Returns the identities of the leaf files. Loading a path that is
    /// already loaded returns its earlier result.
    pub fn load_package<P: AsRef<Path>>(&mut self, path: P, key_path: Option<&Path>) -> Result<Vec<String>> {
        let path = path.as_ref();
        if let Some(loaded) = self.packages.iter().find(|loaded| loaded.path.as_path() == path) {
            debug!("Package {} already loaded", path.display());
            return Ok(loaded.leaf_ids.clone());
        }
        let package_type = PackageType::from_path(path);
        if package_type == PackageType::None {
            return Err(PkgError::InvalidParam(format!(
                "unknown package type for {}",
                path.display()
            )));
        }

        let mut ids = Vec::new();
        match self.load_recursive(path, package_type, key_path, 0, &mut ids) {
            Ok(()) => {
                if let Some(root) = self.packages.iter_mut().find(|loaded| loaded.path.as_path() == path) {
                    root.leaf_ids = ids.clone();
                }
                info!("Loaded {} with {} files", path.display(), ids.len());
                Ok(ids)
            }
            Err(err) => {
                warn!("Loading {} failed: {}", path.display(), err);
                if let Err(clear_err) = self.clear_packages() {
                    warn!("Cleanup after failed load: {}", clear_err);
                }
                Err(err)
            }
        }
    }

    /// Load a single container without following nested packages or checking signatures
    pub fn load_package_without_unpack<P: AsRef<Path>>(&mut self, path: P) -> Result<Vec<String>> {
        let path = path.as_ref();
        let package_type = PackageType::from_path(path);
        let stream = self.streams.open_file(path, OpenMode::Read)?;
        let loaded = self.load_container(path, stream, package_type, &accept_all());
        if loaded.is_err() {
            self.streams.close(&path.display().to_string())?;
        }
        loaded
    }

    /// Load a container from an already open stream, without checking signatures
    pub fn parse_package(&mut self, stream: SharedStream, package_type: PackageType) -> Result<Vec<String>> {
        let name = borrow_stream(&stream)?.name().to_string();
        self.load_container(Path::new(&name), stream, package_type, &accept_all())
    }

    fn load_container(
        &mut self,
        path: &Path,
        stream: SharedStream,
        package_type: PackageType,
        verifier: &PkgVerifier,
    ) -> Result<Vec<String>> {
        let mut container = new_container(package_type, stream, PackageInfo::new(package_type))?;
        let names = container.load_package(verifier)?;
        self.packages.push(LoadedPackage {
            path: path.to_path_buf(),
            container,
            leaf_ids: names.clone(),
        });
        Ok(names)
    }

    fn load_recursive(
        &mut self,
        path: &Path,
        package_type: PackageType,
        key_path: Option<&Path>,
        depth: usize,
        ids: &mut Vec<String>,
    ) -> Result<()> {
        if depth > self.config.max_nesting_depth {
            return Err(PkgError::InvalidPkgFormat(format!(
                "{} is nested deeper than {} levels",
                path.display(),
                self.config.max_nesting_depth
            )));
        }
        let verifier = verifier_for(package_type, key_path)?;
        let stream = self.streams.open_file(path, OpenMode::Read)?;
        let mut container = new_container(package_type, stream, PackageInfo::new(package_type))?;
        let names = match container.load_package(&verifier) {
            Ok(names) => names,
            Err(err) => {
                self.streams.close(&path.display().to_string())?;
                return Err(err);
            }
        };
        debug!("{} holds {:?}", path.display(), names);

        let mut leaf_ids = Vec::new();
        let mut nested = Vec::new();
        let mut extracted = Ok(());
        for name in names {
            let member_type = PackageType::from_path(&name);
            if package_type == PackageType::Upgrade || member_type == PackageType::None {
                leaf_ids.push(name);
                continue;
            }
            match self.extract_nested(container.as_mut(), path, &name) {
                Ok(target) => nested.push((target, member_type)),
                Err(err) => {
                    extracted = Err(err);
                    break;
                }
            }
        }
        ids.extend(leaf_ids.iter().cloned());
        // Registered before recursing so a failure below releases this stream too
        self.packages.push(LoadedPackage {
            path: path.to_path_buf(),
            container,
            leaf_ids,
        });
        extracted?;

        for (target, member_type) in nested {
            self.load_recursive(&target, member_type, key_path, depth + 1, ids)?;
        }
        Ok(())
    }

    /// Extract a nested package member to `<dir>/<name>.tmp`
    fn extract_nested(&mut self, container: &mut dyn Container, package: &Path, name: &str) -> Result<PathBuf> {
        let dir = match &self.config.temp_dir {
            Some(dir) => dir.clone(),
            None => package.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        let file_name = Path::new(name)
            .file_name()
            .map(|file_name| file_name.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let target = dir.join(format!("{}.tmp", file_name));
        let size = container.file_info(name).map_or(0, |info| info.unpacked_size);

        let to_file = self.config.unzip_to_file || container.package_type() == PackageType::Gzip || size == 0;
        let output = if to_file {
            self.streams.open_file(&target, OpenMode::Write)?
        } else {
            self.streams.open_memory_map(&target, size)?
        };
        self.temp_files.push(target.clone());
        debug!("Extracting nested package {} to {}", name, target.display());

        let extracted = borrow_stream(&output).and_then(|mut output| container.extract_file(name, &mut *output));
        self.streams.close(&target.display().to_string())?;
        extracted?;
        Ok(target)
    }

    /// Check a package's digest and signature
    ///
    /// `version` selects the digest: versions naming sha384 use SHA-384,
    /// everything else SHA-256. `progress` is told the outcome at 50% (whole
    /// file digest) and 100% (signature) for signed containers, and at 100%
    /// for upgrade packages.
    pub fn verify_package<P: AsRef<Path>>(
        &mut self,
        path: P,
        key_path: &Path,
        version: &str,
        expected_digest: Option<&[u8]>,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<()> {
        let path = path.as_ref();
        let method = DigestMethod::from_version(version);
        let result = self.verify_steps(path, key_path, method, expected_digest, progress);
        if let Err(err) = &result {
            warn!("Verification of {} failed: {}", path.display(), err);
            progress(Err(err), 100);
        }
        result
    }

    fn verify_steps(
        &mut self,
        path: &Path,
        key_path: &Path,
        method: DigestMethod,
        expected_digest: Option<&[u8]>,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<()> {
        if let Some(expected) = expected_digest {
            if expected.len() != method.digest_len() {
                return Err(PkgError::InvalidParam(format!(
                    "expected digest has {} bytes, {:?} needs {}",
                    expected.len(),
                    method,
                    method.digest_len()
                )));
            }
        }
        let package_type = PackageType::from_path(path);
        if package_type == PackageType::None {
            return Err(PkgError::InvalidParam(format!(
                "unknown package type for {}",
                path.display()
            )));
        }

        let has_sign = self.file_digest(path, method, None)?;
        if let Some(expected) = expected_digest {
            if has_sign != expected {
                return Err(PkgError::InvalidSignature(format!(
                    "digest {} does not match expected {}",
                    hex::encode(&has_sign),
                    hex::encode(expected)
                )));
            }
        }
        if package_type == PackageType::Upgrade {
            progress(Ok(()), 100);
            return Ok(());
        }
        progress(Ok(()), 50);

        let stream = self.streams.open_file(path, OpenMode::Read)?;
        let name = path.display().to_string();
        let checked = borrow_stream(&stream).and_then(|mut pkg| {
            let length = pkg.len();
            if length < SIGN_TOTAL_LEN {
                return Err(PkgError::InvalidFile(format!(
                    "{} is too short to carry a signature",
                    name
                )));
            }
            let area = length - SIGN_TOTAL_LEN;
            let no_sign = digest_stream(&mut *pkg, method, Some(area..length), self.config.buffer_size)?;
            let mut signature = vec![0u8; method.signature_len()];
            read_exact_at(&mut *pkg, area + method.signature_slot(), &mut signature)?;
            CertVerifier::from_pem_file(key_path, method)?.verify(&no_sign, &signature)
        });
        self.streams.close(&name)?;
        checked?;

        progress(Ok(()), 100);
        info!("Verified {}", path.display());
        Ok(())
    }

    fn file_digest(&mut self, path: &Path, method: DigestMethod, zeroed: Option<std::ops::Range<usize>>) -> Result<Vec<u8>> {
        let stream = self.streams.open_file(path, OpenMode::Read)?;
        let digest = borrow_stream(&stream)
            .and_then(|mut pkg| digest_stream(&mut *pkg, method, zeroed, self.config.buffer_size));
        self.streams.close(&path.display().to_string())?;
        digest
    }

    /// Extract a file from whichever loaded package holds it
    pub fn extract_file(&mut self, name: &str, output: &mut dyn ByteStream) -> Result<()> {
        let loaded = self
            .packages
            .iter_mut()
            .find(|loaded| loaded.container.file_info(name).is_some())
            .ok_or_else(|| PkgError::InvalidParam(format!("no loaded package holds {}", name)))?;
        loaded.container.extract_file(name, output)
    }

    /// Metadata of a file in any loaded package
    pub fn file_info(&self, name: &str) -> Option<&FileInfo> {
        self.packages
            .iter()
            .find_map(|loaded| loaded.container.file_info(name))
    }

    /// Header of a loaded package, looked up by its stream name
    pub fn package_info<P: AsRef<Path>>(&self, path: P) -> Option<&PackageInfo> {
        let name = path.as_ref().display().to_string();
        self.packages
            .iter()
            .find(|loaded| loaded.container.name() == name)
            .map(|loaded| loaded.container.info())
    }

    /// Compress `data` into `output` with the method in `info`, returning the packed size
    pub fn compress_buffer(&self, info: &mut FileInfo, data: &[u8], output: &mut dyn ByteStream) -> Result<usize> {
        let codec = codec_for(info)?;
        let mut input = MemoryStream::borrowed(info.identity.clone(), data);
        let mut ctx = CodecContext::new(0, 0, 0, data.len(), info.digest_method);
        codec.pack(&mut input, output, &mut ctx)?;
        output.flush(ctx.packed_size)?;
        info.packed_size = ctx.packed_size;
        info.unpacked_size = data.len();
        Ok(ctx.packed_size)
    }

    /// Decompress `data` into `output` with the method in `info`, returning the unpacked size
    pub fn decompress_buffer(&self, info: &mut FileInfo, data: &[u8], output: &mut dyn ByteStream) -> Result<usize> {
        let codec = codec_for(info)?;
        let mut input = MemoryStream::borrowed(info.identity.clone(), data);
        let mut ctx = CodecContext::new(0, 0, data.len(), 0, info.digest_method);
        codec.unpack(&mut input, output, &mut ctx)?;
        output.flush(ctx.unpacked_size)?;
        info.packed_size = ctx.packed_size;
        info.unpacked_size = ctx.unpacked_size;
        Ok(ctx.unpacked_size)
    }

    /// Open a cached file stream
    pub fn create_file_stream<P: AsRef<Path>>(&mut self, path: P, mode: OpenMode) -> Result<SharedStream> {
        self.streams.open_file(path, mode)
    }

    /// Open a cached memory map; `size` zero maps an existing file read-only
    pub fn create_memory_stream<P: AsRef<Path>>(&mut self, path: P, size: usize) -> Result<SharedStream> {
        self.streams.open_memory_map(path, size)
    }

    /// Uncached stream over an owned buffer
    pub fn create_buffer_stream(&self, name: &str, bytes: Vec<u8>) -> SharedStream {
        Rc::new(RefCell::new(MemoryStream::from_vec(name, bytes)))
    }

    /// Uncached stream that forwards writes to `callback`
    pub fn create_processor_stream(&self, name: &str, callback: ProcessorCallback) -> SharedStream {
        Rc::new(RefCell::new(ProcessorStream::new(name, callback)))
    }

    /// Release one reference to a cached stream
    pub fn close_stream(&mut self, name: &str) -> Result<()> {
        self.streams.close(name)
    }

    pub fn stream_ref_count(&self, name: &str) -> usize {
        self.streams.ref_count(name)
    }

    /// Identities of the loaded packages' streams
    pub fn loaded_packages(&self) -> Vec<String> {
        self.packages
            .iter()
            .map(|loaded| loaded.container.name())
            .collect()
    }

    /// Drop every loaded package, release its stream and remove extracted temp files
    pub fn clear_packages(&mut self) -> Result<()> {
        for loaded in self.packages.drain(..) {
            let name = loaded.container.name();
            drop(loaded);
            self.streams.close(&name)?;
        }
        for path in self.temp_files.drain(..) {
            if let Err(err) = fs::remove_file(&path) {
                warn!("Cannot remove {}: {}", path.display(), err);
            }
        }
        Ok(())
    }
}

impl Drop for PackageManager {
    fn drop(&mut self) {
        if let Err(err) = self.clear_packages() {
            warn!("Releasing packages failed: {}", err);
        }
    }
}

/// Fill in defaults and check the file list against the package type
fn normalize_header(header: &PackageInfo, files: &[(PathBuf, FileInfo)]) -> Result<PackageInfo> {
    let mut header = header.clone();
    match header.package_type {
        PackageType::None => {
            return Err(PkgError::InvalidParam(
                "package type must be set".to_string(),
            ))
        }
        PackageType::Lz4 if files.len() != 1 => {
            return Err(PkgError::InvalidParam(format!(
                "lz4 packages hold exactly one file, got {}",
                files.len()
            )))
        }
        _ if files.is_empty() => {
            return Err(PkgError::InvalidParam("no files to package".to_string()))
        }
        PackageType::Upgrade => {
            if header.entry_count == 0 {
                header.entry_count = files.len() as u32;
            }
            header.digest_method = upgrade_digest_method(header.digest_method);
        }
        _ => {
            header.entry_count = files.len() as u32;
        }
    }
    if header.sign_method != SignMethod::None
        && !matches!(header.digest_method, DigestMethod::Sha256 | DigestMethod::Sha384)
    {
        header.digest_method = DigestMethod::Sha256;
    }
    Ok(header)
}

/// Upgrade packages are always digested with SHA-256 or SHA-384
fn upgrade_digest_method(method: DigestMethod) -> DigestMethod {
    match method {
        DigestMethod::Sha384 => DigestMethod::Sha384,
        _ => DigestMethod::Sha256,
    }
}

/// Verifier checking package signatures against the certificate at `key_path`
fn verifier_for(package_type: PackageType, key_path: Option<&Path>) -> Result<PkgVerifier> {
    match key_path {
        Some(key) => {
            let cert = key.to_path_buf();
            Ok(Box::new(move |info: &PackageInfo, digest: &[u8], signature: &[u8]| {
                CertVerifier::from_pem_file(&cert, info.digest_method)?.verify(digest, signature)
            }))
        }
        None if package_type == PackageType::Upgrade => Err(PkgError::InvalidParam(
            "upgrade packages need a certificate to load".to_string(),
        )),
        None => Ok(accept_all()),
    }
}
