//! LZ4 container: one file stored as an LZ4 frame or as an LZ4 block chain

use super::{pad_stream, ContainerState, Entry, PackageBase, PkgVerifier};
use crate::codec::{
    codec_for, decode_frame_params, walk_block_chain, CodecContext, LZ4B_MAGIC, LZ4_FRAME_MAGIC,
};
use crate::error::{PkgError, Result};
use crate::format::{read_le32, DigestMethod, PackMethod, PackageType, SIGN_TOTAL_LEN};
use crate::info::{FileInfo, FormatParams, Lz4Params, PackageInfo, DEFAULT_LZ4_LEVEL};
use crate::stream::{read_exact_at, ByteStream, SharedStream};
use std::path::Path;
use tracing::{debug, info};

const MAGIC_LEN: usize = 4;

/// Enough bytes for the magic and a frame descriptor
const HEADER_PROBE_LEN: usize = 19;

/// The single file of an LZ4 package
#[derive(Debug, Clone, Default)]
pub struct Lz4Entry {
    info: FileInfo,
}

impl Entry for Lz4Entry {
    fn info(&self) -> &FileInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut FileInfo {
        &mut self.info
    }

    fn init(&mut self, info: &FileInfo, input: &mut dyn ByteStream) -> Result<()> {
        let pack_method = match info.pack_method {
            PackMethod::None | PackMethod::Lz4 => PackMethod::Lz4,
            PackMethod::Lz4Block => PackMethod::Lz4Block,
            other => {
                return Err(PkgError::InvalidParam(format!(
                    "pack method {:?} cannot be stored in an lz4 package",
                    other
                )))
            }
        };
        self.info = info.clone();
        self.info.pack_method = pack_method;
        self.info.digest_method = DigestMethod::Crc;
        if self.info.unpacked_size == 0 {
            self.info.unpacked_size = input.len();
        }
        if self.info.modified_time == 0 {
            self.info.modified_time = super::now_unix();
        }
        self.info.params = FormatParams::Lz4(info.lz4_params());
        Ok(())
    }

    /// The frame or block magic is written by the codec
    fn encode_header(&mut self, _pkg: &mut dyn ByteStream, start: usize) -> Result<usize> {
        self.info.header_offset = start;
        Ok(0)
    }

    fn pack(
        &mut self,
        input: &mut dyn ByteStream,
        pkg: &mut dyn ByteStream,
        start: usize,
    ) -> Result<usize> {
        pad_stream(pkg, start)?;
        let codec = codec_for(&self.info)?;
        let mut ctx = CodecContext::new(0, start, 0, self.info.unpacked_size, self.info.digest_method);
        codec.pack(input, pkg, &mut ctx)?;
        self.info.data_offset = start;
        self.info.packed_size = ctx.packed_size;
        Ok(ctx.packed_size)
    }

    fn decode_header(
        &mut self,
        _pkg: &mut dyn ByteStream,
        buffer: &[u8],
        header_offset: usize,
        _data_offset: usize,
    ) -> Result<usize> {
        if buffer.len() < MAGIC_LEN {
            return Err(PkgError::InvalidLz4("lz4 header too short".to_string()));
        }
        let (pack_method, params) = match read_le32(buffer, 0) {
            LZ4_FRAME_MAGIC => (
                PackMethod::Lz4,
                decode_frame_params(buffer, DEFAULT_LZ4_LEVEL)?,
            ),
            LZ4B_MAGIC => (PackMethod::Lz4Block, Lz4Params::default()),
            other => {
                return Err(PkgError::InvalidLz4(format!(
                    "unknown lz4 magic {:08x}",
                    other
                )))
            }
        };
        self.info.pack_method = pack_method;
        self.info.digest_method = DigestMethod::Crc;
        self.info.header_offset = header_offset;
        self.info.data_offset = header_offset;
        self.info.params = FormatParams::Lz4(params);
        Ok(MAGIC_LEN)
    }

    fn unpack(&mut self, pkg: &mut dyn ByteStream, output: &mut dyn ByteStream) -> Result<()> {
        let codec = codec_for(&self.info)?;
        let mut ctx = CodecContext::new(
            self.info.data_offset,
            0,
            self.info.packed_size,
            0,
            DigestMethod::Crc,
        );
        codec.unpack(pkg, output, &mut ctx)?;
        self.info.unpacked_size = ctx.unpacked_size;
        output.flush(ctx.unpacked_size)
    }
}

/// File name of the package without its `.lz4` extension
fn name_from_stream(stream_name: &str) -> String {
    let path = Path::new(stream_name);
    let is_lz4 = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("lz4"));
    let name = if is_lz4 { path.file_stem() } else { path.file_name() };
    name.map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Length of a block chain starting at 0, allowing for a trailing signature area
fn block_chain_len(pkg: &mut dyn ByteStream) -> Result<usize> {
    let file_len = pkg.len();
    if walk_block_chain(pkg, 0, file_len)? == file_len {
        return Ok(file_len);
    }
    if file_len >= MAGIC_LEN + SIGN_TOTAL_LEN {
        let limit = file_len - SIGN_TOTAL_LEN;
        if walk_block_chain(pkg, 0, limit)? == limit {
            return Ok(limit);
        }
    }
    Err(PkgError::InvalidLz4(format!(
        "lz4 block chain does not end at {} bytes",
        file_len
    )))
}

/// LZ4 (`.lz4`) package
pub struct Lz4Package {
    base: PackageBase<Lz4Entry>,
}

impl Lz4Package {
    pub fn new(stream: SharedStream, info: PackageInfo) -> Self {
        Self {
            base: PackageBase::new(stream, info),
        }
    }

    fn read_package(&mut self) -> Result<Vec<String>> {
        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let pkg = &mut *pkg;

        let file_len = pkg.len();
        if file_len < MAGIC_LEN {
            return Err(PkgError::InvalidFile(format!(
                "lz4 file of {} bytes is too short",
                file_len
            )));
        }
        let mut header = vec![0u8; file_len.min(HEADER_PROBE_LEN)];
        read_exact_at(pkg, 0, &mut header)?;

        let mut entry = Lz4Entry::default();
        entry.decode_header(pkg, &header, 0, 0)?;
        entry.info.identity = name_from_stream(pkg.name());
        entry.info.packed_size = match entry.info.pack_method {
            PackMethod::Lz4Block => block_chain_len(pkg)?,
            // The frame decoder stops at the end mark
            _ => file_len,
        };
        debug!(
            "Lz4 package {}: {:?}, {} packed bytes",
            pkg.name(),
            entry.info.pack_method,
            entry.info.packed_size
        );

        let name = entry.info.identity.clone();
        self.base.entries.insert(entry)?;
        self.base.info.package_type = PackageType::Lz4;
        self.base.info.entry_count = 1;
        info!("Loaded lz4 package {}", pkg.name());
        Ok(vec![name])
    }
}

impl super::Container for Lz4Package {
    fn package_type(&self) -> PackageType {
        PackageType::Lz4
    }

    fn state(&self) -> ContainerState {
        self.base.state
    }

    fn info(&self) -> &PackageInfo {
        &self.base.info
    }

    fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    fn name(&self) -> String {
        self.base.name()
    }

    fn add_entry(&mut self, info: &FileInfo, input: &mut dyn ByteStream) -> Result<()> {
        if !self.base.entries.is_empty() {
            return Err(PkgError::InvalidParam(
                "an lz4 package holds a single file".to_string(),
            ));
        }
        self.base.check_state(
            &[ContainerState::Idle, ContainerState::Working],
            ContainerState::Working,
        )?;

        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let mut entry = Lz4Entry::default();
        entry.init(info, input)?;
        if entry.info.identity.is_empty() {
            entry.info.identity = name_from_stream(pkg.name());
        }
        info!("Add file {} to lz4 package", entry.info.identity);

        let cursor = self.base.cursor;
        let header_len = entry.encode_header(&mut *pkg, cursor)?;
        let packed = entry.pack(input, &mut *pkg, cursor + header_len)?;
        self.base.cursor += header_len + packed;
        self.base.entries.insert(entry)?;
        self.base.info.entry_count = 1;
        Ok(())
    }

    fn save_package(&mut self) -> Result<usize> {
        self.base.check_state(&[ContainerState::Working], ContainerState::Closed)?;
        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let cursor = self.base.cursor;
        let sign_offset = self.base.append_sign_area(&mut *pkg, cursor)?;
        pkg.flush(self.base.cursor)?;
        info!("Saved lz4 package {} ({} bytes)", pkg.name(), self.base.cursor);
        Ok(sign_offset)
    }

    fn load_package(&mut self, _verifier: &PkgVerifier) -> Result<Vec<String>> {
        self.base.require_state(&[ContainerState::Idle])?;
        let info = self.base.info.clone();
        let loaded = self.read_package();
        self.base.finish_load(loaded, info)
    }

    fn extract_file(&mut self, name: &str, output: &mut dyn ByteStream) -> Result<()> {
        self.base.extract(name, output)
    }

    fn file_info(&self, name: &str) -> Option<&FileInfo> {
        self.base.entries.get(name).map(|entry| entry.info())
    }

    fn entry_names(&self) -> Vec<String> {
        self.base.entries.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::{noise, text};
    use crate::format::SignMethod;
    use crate::package::{accept_all, Container};
    use crate::stream::MemoryStream;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn build(info: PackageInfo, method: PackMethod, data: &[u8]) -> Vec<u8> {
        let memory = Rc::new(RefCell::new(MemoryStream::growable("image.lz4")));
        let stream: SharedStream = memory.clone();
        let mut package = Lz4Package::new(stream, info);
        let mut input = MemoryStream::borrowed("image", data);
        package
            .add_entry(&FileInfo::new("", method), &mut input)
            .unwrap();
        package.save_package().unwrap();
        drop(package);
        let bytes = memory.borrow().as_slice().to_vec();
        bytes
    }

    fn extract(bytes: Vec<u8>) -> Result<(Lz4Package, Vec<u8>)> {
        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::from_vec("image.lz4", bytes)));
        let mut package = Lz4Package::new(stream, PackageInfo::default());
        package.load_package(&accept_all())?;
        let mut out = MemoryStream::growable("image");
        package.extract_file("image", &mut out)?;
        Ok((package, out.into_bytes()))
    }

    #[test]
    fn test_frame_package_roundtrip() {
        let data = text(200_000);
        let bytes = build(PackageInfo::new(PackageType::Lz4), PackMethod::Lz4, &data);
        assert_eq!(read_le32(&bytes, 0), LZ4_FRAME_MAGIC);

        let (package, out) = extract(bytes).unwrap();
        assert_eq!(out, data);
        let info = package.file_info("image").unwrap();
        assert_eq!(info.pack_method, PackMethod::Lz4);
        assert_eq!(info.unpacked_size, data.len());
    }

    #[test]
    fn test_block_package_roundtrip() {
        let data = noise(10 * 1024, 42);
        let bytes = build(PackageInfo::new(PackageType::Lz4), PackMethod::Lz4Block, &data);
        assert_eq!(read_le32(&bytes, 0), LZ4B_MAGIC);

        let (package, out) = extract(bytes).unwrap();
        assert_eq!(out, data);
        assert_eq!(
            package.file_info("image").unwrap().pack_method,
            PackMethod::Lz4Block
        );
    }

    #[test]
    fn test_signed_block_package_skips_signature_area() {
        let data = text(50_000);
        let info = PackageInfo::new(PackageType::Lz4)
            .with_signing(SignMethod::Ecdsa, DigestMethod::Sha256);
        let mut bytes = build(info, PackMethod::Lz4Block, &data);
        let sign_start = bytes.len() - SIGN_TOTAL_LEN;
        // An ECDSA signature starts with a small length prefix
        bytes[sign_start] = 71;

        let (package, out) = extract(bytes).unwrap();
        assert_eq!(out, data);
        assert_eq!(package.file_info("image").unwrap().packed_size, sign_start);
    }

    #[test]
    fn test_signed_frame_package_ignores_signature_area() {
        let data = text(20_000);
        let info = PackageInfo::new(PackageType::Lz4)
            .with_signing(SignMethod::Rsa, DigestMethod::Sha256);
        let mut bytes = build(info, PackMethod::Lz4, &data);
        let sign_start = bytes.len() - SIGN_TOTAL_LEN;
        bytes[sign_start..sign_start + 8].copy_from_slice(b"SIGNATUR");

        let (_, out) = extract(bytes).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_unknown_magic() {
        let bytes = vec![0xAA; 64];
        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::from_vec("x.lz4", bytes)));
        let mut package = Lz4Package::new(stream, PackageInfo::default());
        let err = package.load_package(&accept_all()).unwrap_err();
        assert!(matches!(err, PkgError::InvalidLz4(_)));
    }

    #[test]
    fn test_name_from_stream() {
        assert_eq!(name_from_stream("/data/rootfs.img.lz4"), "rootfs.img");
        assert_eq!(name_from_stream("rootfs.LZ4"), "rootfs");
        assert_eq!(name_from_stream("rootfs.bin"), "rootfs.bin");
    }
}
