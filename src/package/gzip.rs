//! GZIP (RFC 1952) container holding a single member

use super::{pad_stream, ContainerState, Entry, PackageBase, PkgVerifier};
use crate::codec::{codec_for, CodecContext};
use crate::error::{PkgError, Result};
use crate::format::{read_le16, read_le32, DigestMethod, PackMethod, PackageType};
use crate::info::{FileInfo, FormatParams, PackageInfo, ZipParams};
use crate::stream::{read_exact_at, ByteStream, SharedStream};
use std::path::Path;
use tracing::{debug, info};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 8;
const FIXED_HEADER_LEN: usize = 10;
const TRAILER_LEN: usize = 8;
const OS_UNIX: u8 = 3;

const FLAG_HCRC: u8 = 0x02;
const FLAG_EXTRA: u8 = 0x04;
const FLAG_NAME: u8 = 0x08;
const FLAG_COMMENT: u8 = 0x10;
const FLAG_ENCRYPTED: u8 = 0x20;

/// Most header bytes read when loading
const MAX_HEADER_LEN: usize = 64 * 1024;

/// The single member of a GZIP file
#[derive(Debug, Clone, Default)]
pub struct GzipEntry {
    info: FileInfo,
    crc: u32,
    /// Name stored in the FNAME field
    stored_name: Option<String>,
    comment: Option<String>,
}

impl GzipEntry {
    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

impl Entry for GzipEntry {
    fn info(&self) -> &FileInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut FileInfo {
        &mut self.info
    }

    fn init(&mut self, info: &FileInfo, input: &mut dyn ByteStream) -> Result<()> {
        if info.identity.contains('\0') {
            return Err(PkgError::InvalidParam(format!(
                "gzip member name {:?} contains a NUL byte",
                info.identity
            )));
        }
        self.info = info.clone();
        self.info.pack_method = PackMethod::Gzip;
        self.info.digest_method = DigestMethod::Crc;
        if self.info.unpacked_size == 0 {
            self.info.unpacked_size = input.len();
        }
        if self.info.modified_time == 0 {
            self.info.modified_time = super::now_unix();
        }
        self.info.params = FormatParams::Zip(info.zip_params());
        self.stored_name = if info.identity.is_empty() {
            None
        } else {
            Some(info.identity.clone())
        };
        Ok(())
    }

    fn encode_header(&mut self, pkg: &mut dyn ByteStream, start: usize) -> Result<usize> {
        let mut header = Vec::with_capacity(FIXED_HEADER_LEN + self.info.identity.len() + 1);
        header.extend_from_slice(&GZIP_MAGIC);
        header.push(METHOD_DEFLATE);
        header.push(if self.stored_name.is_some() { FLAG_NAME } else { 0 });
        header.extend_from_slice(&(self.info.modified_time.min(u32::MAX as u64) as u32).to_le_bytes());
        header.push(0);
        header.push(OS_UNIX);
        if let Some(name) = &self.stored_name {
            header.extend_from_slice(name.as_bytes());
            header.push(0);
        }
        pkg.write(&header, start)?;
        self.info.header_offset = start;
        Ok(header.len())
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
        self.crc = ctx.crc;
        self.info.data_offset = start;

        let mut trailer = [0u8; TRAILER_LEN];
        trailer[..4].copy_from_slice(&ctx.crc.to_le_bytes());
        trailer[4..].copy_from_slice(&(self.info.unpacked_size as u32).to_le_bytes());
        pkg.write(&trailer, ctx.dest_offset)?;
        self.info.packed_size = ctx.packed_size + TRAILER_LEN;
        Ok(self.info.packed_size)
    }

    fn decode_header(
        &mut self,
        _pkg: &mut dyn ByteStream,
        buffer: &[u8],
        header_offset: usize,
        _data_offset: usize,
    ) -> Result<usize> {
        if buffer.len() < FIXED_HEADER_LEN || buffer[..2] != GZIP_MAGIC {
            return Err(PkgError::InvalidPkgFormat("not a gzip header".to_string()));
        }
        if buffer[2] != METHOD_DEFLATE {
            return Err(PkgError::InvalidPkgFormat(format!(
                "gzip compression method {} is not deflate",
                buffer[2]
            )));
        }
        let flags = buffer[3];
        if flags & FLAG_ENCRYPTED != 0 {
            return Err(PkgError::InvalidPkgFormat(
                "encrypted gzip members are not supported".to_string(),
            ));
        }
        let mtime = read_le32(buffer, 4);

        let mut pos = FIXED_HEADER_LEN;
        if flags & FLAG_EXTRA != 0 {
            if pos + 2 > buffer.len() {
                return Err(truncated_header());
            }
            pos += 2 + read_le16(buffer, pos) as usize;
        }
        if flags & FLAG_NAME != 0 {
            let (name, next) = read_zero_terminated(buffer, pos)?;
            self.stored_name = Some(name);
            pos = next;
        }
        if flags & FLAG_COMMENT != 0 {
            let (comment, next) = read_zero_terminated(buffer, pos)?;
            self.comment = Some(comment);
            pos = next;
        }
        if flags & FLAG_HCRC != 0 {
            if pos + 2 > buffer.len() {
                return Err(truncated_header());
            }
            let expected = read_le16(buffer, pos);
            let actual = (crc32fast::hash(&buffer[..pos]) & 0xffff) as u16;
            if expected != actual {
                return Err(PkgError::InvalidPkgFormat(format!(
                    "gzip header crc {:04x} does not match {:04x}",
                    expected, actual
                )));
            }
            pos += 2;
        }
        if pos > buffer.len() {
            return Err(truncated_header());
        }

        self.info = FileInfo {
            identity: self.stored_name.clone().unwrap_or_default(),
            pack_method: PackMethod::Gzip,
            digest_method: DigestMethod::Crc,
            modified_time: mtime as u64,
            header_offset,
            data_offset: header_offset + pos,
            params: FormatParams::Zip(ZipParams::default()),
            ..FileInfo::default()
        };
        Ok(pos)
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

        let mut trailer = [0u8; TRAILER_LEN];
        if ctx.src_offset + TRAILER_LEN > pkg.len() {
            return Err(PkgError::InvalidPkgFormat(
                "gzip trailer missing".to_string(),
            ));
        }
        read_exact_at(pkg, ctx.src_offset, &mut trailer)?;
        let expected_crc = read_le32(&trailer, 0);
        let expected_size = read_le32(&trailer, 4);
        if expected_crc != ctx.crc {
            return Err(PkgError::CrcMismatch {
                expected: expected_crc,
                actual: ctx.crc,
            });
        }
        if expected_size != ctx.unpacked_size as u32 {
            return Err(PkgError::InvalidPkgFormat(format!(
                "gzip size {} does not match {} bytes decoded",
                expected_size, ctx.unpacked_size
            )));
        }

        self.crc = ctx.crc;
        self.info.packed_size = ctx.packed_size + TRAILER_LEN;
        self.info.unpacked_size = ctx.unpacked_size;
        output.flush(ctx.unpacked_size)
    }
}

fn truncated_header() -> PkgError {
    PkgError::InvalidPkgFormat("truncated gzip header".to_string())
}

fn read_zero_terminated(buffer: &[u8], start: usize) -> Result<(String, usize)> {
    let rest = buffer.get(start..).ok_or_else(truncated_header)?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(truncated_header)?;
    Ok((
        String::from_utf8_lossy(&rest[..end]).into_owned(),
        start + end + 1,
    ))
}

/// Member name implied by the package file name
fn name_from_stream(stream_name: &str) -> String {
    let file_name = Path::new(stream_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file_name.len().checked_sub(3) {
        Some(cut) if file_name[cut..].eq_ignore_ascii_case(".gz") => file_name[..cut].to_string(),
        _ => file_name,
    }
}

/// GZIP (`.gz`) package
pub struct GzipPackage {
    base: PackageBase<GzipEntry>,
}

impl GzipPackage {
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
        if file_len < FIXED_HEADER_LEN + TRAILER_LEN {
            return Err(PkgError::InvalidFile(format!(
                "gzip file of {} bytes is too short",
                file_len
            )));
        }
        let mut header = vec![0u8; file_len.min(MAX_HEADER_LEN)];
        read_exact_at(pkg, 0, &mut header)?;

        let mut entry = GzipEntry::default();
        let header_len = entry.decode_header(pkg, &header, 0, 0)?;
        if header_len + TRAILER_LEN > file_len {
            return Err(truncated_header());
        }
        let mut size_hint = [0u8; 4];
        read_exact_at(pkg, file_len - 4, &mut size_hint)?;

        let info = entry.info_mut();
        if info.identity.is_empty() {
            info.identity = name_from_stream(pkg.name());
        }
        info.packed_size = file_len - header_len;
        info.unpacked_size = u32::from_le_bytes(size_hint) as usize;
        debug!(
            "Gzip member {} data at {} ({} bytes, about {} unpacked)",
            info.identity, info.data_offset, info.packed_size, info.unpacked_size
        );

        let name = info.identity.clone();
        self.base.entries.insert(entry)?;
        self.base.info.package_type = PackageType::Gzip;
        self.base.info.entry_count = 1;
        info!("Loaded gzip package {}", pkg.name());
        Ok(vec![name])
    }
}

impl super::Container for GzipPackage {
    fn package_type(&self) -> PackageType {
        PackageType::Gzip
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
                "a gzip package holds a single file".to_string(),
            ));
        }
        self.base.check_state(
            &[ContainerState::Idle, ContainerState::Working],
            ContainerState::Working,
        )?;
        info!("Add file {} to gzip package", info.identity);

        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let mut entry = GzipEntry::default();
        entry.init(info, input)?;
        let header_len = entry.encode_header(&mut *pkg, self.base.cursor)?;
        let packed = entry.pack(input, &mut *pkg, self.base.cursor + header_len)?;
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
        info!("Saved gzip package {} ({} bytes)", pkg.name(), self.base.cursor);
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
    use crate::codec::test_support::text;
    use crate::package::{accept_all, Container};
    use crate::stream::MemoryStream;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn build(name: &str, data: &[u8]) -> Vec<u8> {
        let memory = Rc::new(RefCell::new(MemoryStream::growable("out.gz")));
        let stream: SharedStream = memory.clone();
        let mut package = GzipPackage::new(stream, PackageInfo::new(PackageType::Gzip));
        let mut input = MemoryStream::borrowed(name, data);
        package
            .add_entry(&FileInfo::new(name, PackMethod::Gzip), &mut input)
            .unwrap();
        package.save_package().unwrap();
        drop(package);
        let bytes = memory.borrow().as_slice().to_vec();
        bytes
    }

    fn load(name: &str, bytes: Vec<u8>) -> Result<GzipPackage> {
        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::from_vec(name, bytes)));
        let mut package = GzipPackage::new(stream, PackageInfo::default());
        package.load_package(&accept_all())?;
        Ok(package)
    }

    #[test]
    fn test_roundtrip() {
        let data = text(30_000);
        let bytes = build("payload.txt", &data);
        assert_eq!(&bytes[..3], &[0x1f, 0x8b, 8]);
        assert_eq!(bytes[3], FLAG_NAME);
        assert_eq!(read_le32(&bytes, bytes.len() - 4) as usize, data.len());

        let mut package = load("out.gz", bytes).unwrap();
        assert_eq!(package.entry_names(), vec!["payload.txt"]);
        assert_eq!(package.file_info("payload.txt").unwrap().unpacked_size, data.len());

        let mut out = MemoryStream::growable("payload.txt");
        package.extract_file("payload.txt", &mut out).unwrap();
        assert_eq!(out.as_slice(), &data[..]);
    }

    #[test]
    fn test_single_entry_only() {
        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::growable("out.gz")));
        let mut package = GzipPackage::new(stream, PackageInfo::new(PackageType::Gzip));
        let data = b"one".to_vec();
        let mut input = MemoryStream::borrowed("a", &data);
        package.add_entry(&FileInfo::new("a", PackMethod::Gzip), &mut input).unwrap();
        let err = package
            .add_entry(&FileInfo::new("b", PackMethod::Gzip), &mut input)
            .unwrap_err();
        assert!(err.to_string().contains("single file"));
    }

    #[test]
    fn test_name_defaults_to_file_name() {
        // Header without FNAME, as written by `gzip -n`
        let mut bytes = build("x", b"hello gzip");
        bytes[3] = 0;
        bytes.drain(FIXED_HEADER_LEN..FIXED_HEADER_LEN + 2);

        let package = load("/tmp/firmware.img.gz", bytes).unwrap();
        assert_eq!(package.entry_names(), vec!["firmware.img"]);
    }

    #[test]
    fn test_trailer_crc_checked() {
        let data = text(1_000);
        let mut bytes = build("t.txt", &data);
        let crc_at = bytes.len() - TRAILER_LEN;
        bytes[crc_at] ^= 0xFF;

        let mut package = load("t.gz", bytes).unwrap();
        let mut out = MemoryStream::growable("t.txt");
        let err = package.extract_file("t.txt", &mut out).unwrap_err();
        assert!(matches!(err, PkgError::CrcMismatch { .. }));
    }

    #[test]
    fn test_rejects_encrypted_and_bad_method() {
        let mut bytes = build("e", b"secret");
        bytes[3] |= FLAG_ENCRYPTED;
        assert!(matches!(load("e.gz", bytes), Err(PkgError::InvalidPkgFormat(_))));

        let mut bytes = build("m", b"method");
        bytes[2] = 7;
        let err = load("m.gz", bytes).err().unwrap();
        assert!(err.to_string().contains("not deflate"));
    }

    #[test]
    fn test_optional_header_fields() {
        let mut header = vec![0x1f, 0x8b, 8, FLAG_EXTRA | FLAG_NAME | FLAG_COMMENT | FLAG_HCRC];
        header.extend_from_slice(&[0, 0, 0, 0, 0, OS_UNIX]);
        header.extend_from_slice(&[3, 0, b'a', b'b', b'c']);
        header.extend_from_slice(b"n.bin\0note\0");
        let crc = (crc32fast::hash(&header) & 0xffff) as u16;
        header.extend_from_slice(&crc.to_le_bytes());

        let mut memory = MemoryStream::growable("h");
        let mut entry = GzipEntry::default();
        let len = entry.decode_header(&mut memory, &header, 0, 0).unwrap();
        assert_eq!(len, header.len());
        assert_eq!(entry.info().identity, "n.bin");
        assert_eq!(entry.comment(), Some("note"));

        let last = header.len() - 1;
        header[last] ^= 0xFF;
        assert!(entry.decode_header(&mut memory, &header, 0, 0).is_err());
    }
}
