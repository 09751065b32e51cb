//! ZIP archive container
//!
//! Entries are written as local header + data (+ optional data descriptor),
//! followed by the central directory, the ZIP64 records when any value
//! overflows 32 bits, and the end record. A signed package carries the
//! signature area after the end record.

use super::zip_records::{
    CentralDirectoryHeader, DataDescriptor, EndOfCentralDirectory, LocalFileHeader, Zip64EndRecord,
    Zip64Extra, Zip64Locator, END_RECORD_SIZE, FLAG_DATA_DESCRIPTOR, LOCAL_HEADER_SIZE,
    METHOD_DEFLATED, METHOD_STORED, VERSION_NEEDED, VERSION_NEEDED_ZIP64, ZIP64_END_RECORD_SIZE,
    ZIP64_LOCATOR_SIZE, ZIP64_MARKER,
};
use super::{pad_stream, signature_error, ContainerState, Entry, PackageBase, PkgVerifier};
use crate::algorithm::digest_stream;
use crate::codec::{codec_for, CodecContext};
use crate::error::{PkgError, Result};
use crate::format::{read_le16, DigestMethod, PackMethod, PackageType, SIGN_SHA256_LEN, SIGN_TOTAL_LEN};
use crate::info::{FileInfo, FormatParams, PackageInfo};
use crate::stream::{read_exact_at, ByteStream, SharedStream};
use chrono::{Datelike, Local, NaiveDate, TimeZone, Timelike};
use tracing::{debug, info, warn};

/// Longest entry name kept on load
const MAX_NAME_LEN: usize = 255;

const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// One file in a ZIP archive
#[derive(Debug, Clone, Default)]
pub struct ZipEntry {
    info: FileInfo,
    /// Raw compression method from the archive
    method: u16,
    crc: u32,
    flags: u16,
    dos_time: u16,
    dos_date: u16,
}

impl ZipEntry {
    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn method(&self) -> u16 {
        self.method
    }

    fn zip64(&self) -> bool {
        self.info.unpacked_size as u64 >= ZIP64_MARKER as u64
            || self.info.packed_size as u64 >= ZIP64_MARKER as u64
            || self.info.header_offset as u64 >= ZIP64_MARKER as u64
    }

    fn has_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    fn local_header(&self, data_known: bool) -> LocalFileHeader {
        let zip64 = self.info.unpacked_size as u64 >= ZIP64_MARKER as u64;
        let mut header = LocalFileHeader {
            version_needed: if zip64 { VERSION_NEEDED_ZIP64 } else { VERSION_NEEDED },
            flags: self.flags,
            method: self.method,
            dos_time: self.dos_time,
            dos_date: self.dos_date,
            name: self.info.identity.as_bytes().to_vec(),
            ..LocalFileHeader::default()
        };
        if zip64 {
            header.compressed_size = ZIP64_MARKER;
            header.uncompressed_size = ZIP64_MARKER;
            header.extra = Zip64Extra {
                uncompressed_size: Some(self.info.unpacked_size as u64),
                compressed_size: Some(self.info.packed_size as u64),
                local_header_offset: None,
            }
            .encode();
        } else if data_known && !self.has_descriptor() {
            header.compressed_size = self.info.packed_size as u32;
            header.uncompressed_size = self.info.unpacked_size as u32;
        }
        if data_known && !self.has_descriptor() {
            header.crc32 = self.crc;
        }
        header
    }

    fn central_header(&self) -> CentralDirectoryHeader {
        let mut extra = Zip64Extra::default();
        let mut header = CentralDirectoryHeader {
            version_made_by: VERSION_NEEDED,
            version_needed: VERSION_NEEDED,
            flags: self.flags,
            method: self.method,
            dos_time: self.dos_time,
            dos_date: self.dos_date,
            crc32: self.crc,
            compressed_size: self.info.packed_size as u32,
            uncompressed_size: self.info.unpacked_size as u32,
            local_header_offset: self.info.header_offset as u32,
            name: self.info.identity.as_bytes().to_vec(),
            ..CentralDirectoryHeader::default()
        };
        if self.info.unpacked_size as u64 >= ZIP64_MARKER as u64 {
            header.uncompressed_size = ZIP64_MARKER;
            extra.uncompressed_size = Some(self.info.unpacked_size as u64);
        }
        if self.info.packed_size as u64 >= ZIP64_MARKER as u64 {
            header.compressed_size = ZIP64_MARKER;
            extra.compressed_size = Some(self.info.packed_size as u64);
        }
        if self.info.header_offset as u64 >= ZIP64_MARKER as u64 {
            header.local_header_offset = ZIP64_MARKER;
            extra.local_header_offset = Some(self.info.header_offset as u64);
        }
        if !extra.is_empty() {
            header.version_made_by = VERSION_NEEDED_ZIP64;
            header.version_needed = VERSION_NEEDED_ZIP64;
            header.extra = extra.encode();
        }
        header
    }
}

impl Entry for ZipEntry {
    fn info(&self) -> &FileInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut FileInfo {
        &mut self.info
    }

    fn init(&mut self, info: &FileInfo, input: &mut dyn ByteStream) -> Result<()> {
        if info.identity.is_empty() || info.identity.len() > u16::MAX as usize {
            return Err(PkgError::InvalidParam(format!(
                "bad zip entry name of {} bytes",
                info.identity.len()
            )));
        }
        self.method = match info.pack_method {
            PackMethod::None => METHOD_STORED,
            PackMethod::Zip => METHOD_DEFLATED,
            other => {
                return Err(PkgError::InvalidParam(format!(
                    "pack method {:?} cannot be stored in a zip archive",
                    other
                )))
            }
        };

        self.info = info.clone();
        self.info.digest_method = DigestMethod::Crc;
        if self.info.unpacked_size == 0 {
            self.info.unpacked_size = input.len();
        }
        if self.info.modified_time == 0 {
            self.info.modified_time = super::now_unix();
        }
        let params = info.zip_params();
        self.flags = if params.data_descriptor { FLAG_DATA_DESCRIPTOR } else { 0 };
        self.info.params = FormatParams::Zip(params);
        let (dos_time, dos_date) = unix_to_dos(self.info.modified_time);
        self.dos_time = dos_time;
        self.dos_date = dos_date;
        Ok(())
    }

    fn encode_header(&mut self, pkg: &mut dyn ByteStream, start: usize) -> Result<usize> {
        let mut record = Vec::new();
        let size = self.central_header().write_to(&mut record)?;
        pkg.write(&record, start)?;
        Ok(size)
    }

    fn pack(
        &mut self,
        input: &mut dyn ByteStream,
        pkg: &mut dyn ByteStream,
        start: usize,
    ) -> Result<usize> {
        self.info.header_offset = start;
        let header_size = self.local_header(false).header_size();
        let data_start = start + header_size;
        pad_stream(pkg, data_start)?;

        let codec = codec_for(&self.info)?;
        let mut ctx = CodecContext::new(0, data_start, 0, self.info.unpacked_size, self.info.digest_method);
        codec.pack(input, pkg, &mut ctx)?;
        self.crc = ctx.crc;
        self.info.packed_size = ctx.packed_size;
        self.info.data_offset = data_start;

        let mut header = Vec::new();
        self.local_header(true).write_to(&mut header)?;
        pkg.write(&header, start)?;

        let mut written = header_size + ctx.packed_size;
        if self.has_descriptor() {
            let descriptor = DataDescriptor {
                crc32: self.crc,
                compressed_size: self.info.packed_size as u64,
                uncompressed_size: self.info.unpacked_size as u64,
            };
            let mut record = Vec::new();
            written += descriptor.write_to(&mut record, self.zip64())?;
            pkg.write(&record, ctx.dest_offset)?;
        }
        debug!(
            "Zip entry {}: {} -> {} bytes, crc {:08x}",
            self.info.identity, self.info.unpacked_size, self.info.packed_size, self.crc
        );
        Ok(written)
    }

    fn decode_header(
        &mut self,
        pkg: &mut dyn ByteStream,
        buffer: &[u8],
        header_offset: usize,
        _data_offset: usize,
    ) -> Result<usize> {
        let central = CentralDirectoryHeader::read_from(buffer)?;
        let zip64 = Zip64Extra::parse(
            &central.extra,
            central.uncompressed_size == ZIP64_MARKER,
            central.compressed_size == ZIP64_MARKER,
            central.local_header_offset == ZIP64_MARKER,
        )?;
        let packed_size = archive_usize(
            zip64.compressed_size.unwrap_or(central.compressed_size as u64),
            "compressed size",
        )?;
        let unpacked_size = archive_usize(
            zip64.uncompressed_size.unwrap_or(central.uncompressed_size as u64),
            "uncompressed size",
        )?;
        let local_offset = archive_usize(
            zip64.local_header_offset.unwrap_or(central.local_header_offset as u64),
            "local header offset",
        )?;

        let file_len = pkg.len();
        if past_end(local_offset, LOCAL_HEADER_SIZE, file_len) {
            return Err(PkgError::InvalidPkgFormat(format!(
                "local header offset {} outside archive",
                local_offset
            )));
        }
        let mut fixed = [0u8; LOCAL_HEADER_SIZE];
        read_exact_at(pkg, local_offset, &mut fixed)?;
        let variable = read_le16(&fixed, 26) as usize + read_le16(&fixed, 28) as usize;
        let mut local_bytes = vec![0u8; LOCAL_HEADER_SIZE + variable];
        read_exact_at(pkg, local_offset, &mut local_bytes)?;
        let local = LocalFileHeader::read_from(&local_bytes[..])?;

        let name = truncate_name(&central.name);
        if truncate_name(&local.name) != name {
            return Err(PkgError::InvalidPkgFormat(format!(
                "local header name does not match central entry {}",
                String::from_utf8_lossy(name)
            )));
        }

        let data_offset = local_offset + local.header_size();
        if past_end(data_offset, packed_size, file_len) {
            return Err(PkgError::InvalidPkgFormat(format!(
                "entry {} data runs past the end of the archive",
                String::from_utf8_lossy(name)
            )));
        }

        self.method = central.method;
        self.crc = central.crc32;
        self.flags = central.flags;
        self.dos_time = central.dos_time;
        self.dos_date = central.dos_date;
        self.info = FileInfo {
            identity: String::from_utf8_lossy(name).into_owned(),
            digest_method: DigestMethod::Crc,
            pack_method: match central.method {
                METHOD_DEFLATED => PackMethod::Zip,
                _ => PackMethod::None,
            },
            modified_time: dos_to_unix(central.dos_time, central.dos_date),
            packed_size,
            unpacked_size,
            header_offset: local_offset,
            data_offset,
            params: FormatParams::Zip(crate::info::ZipParams {
                data_descriptor: self.has_descriptor(),
                ..Default::default()
            }),
            ..FileInfo::default()
        };

        if self.has_descriptor() {
            let mut record = [0u8; 24];
            let available = (file_len - (data_offset + packed_size)).min(record.len());
            read_exact_at(pkg, data_offset + packed_size, &mut record[..available])?;
            let descriptor = DataDescriptor::read_from(&record[..available], self.zip64())?;
            if descriptor.crc32 != self.crc
                || descriptor.compressed_size as usize != packed_size
                || descriptor.uncompressed_size as usize != unpacked_size
            {
                return Err(PkgError::InvalidPkgFormat(format!(
                    "data descriptor of {} disagrees with central directory",
                    self.info.identity
                )));
            }
        } else {
            if local.crc32 != 0 && local.crc32 != self.crc {
                return Err(PkgError::InvalidPkgFormat(format!(
                    "local header crc of {} disagrees with central directory",
                    self.info.identity
                )));
            }
            // Zero and the ZIP64 marker leave the size to the central record
            let sizes_differ = [
                (local.compressed_size, packed_size),
                (local.uncompressed_size, unpacked_size),
            ]
            .into_iter()
            .any(|(local_size, central_size)| {
                local_size != 0 && local_size != ZIP64_MARKER && local_size as usize != central_size
            });
            if sizes_differ {
                return Err(PkgError::InvalidPkgFormat(format!(
                    "local header sizes of {} disagree with central directory",
                    self.info.identity
                )));
            }
        }

        debug!(
            "Zip entry {} at {} (central record at {})",
            self.info.identity, local_offset, header_offset
        );
        Ok(central.header_size())
    }

    fn unpack(&mut self, pkg: &mut dyn ByteStream, output: &mut dyn ByteStream) -> Result<()> {
        if self.method != METHOD_STORED && self.method != METHOD_DEFLATED {
            return Err(PkgError::NotExistAlgorithm(format!(
                "zip compression method {} for {}",
                self.method, self.info.identity
            )));
        }
        let codec = codec_for(&self.info)?;
        let mut ctx = CodecContext::new(
            self.info.data_offset,
            0,
            self.info.packed_size,
            0,
            DigestMethod::Crc,
        );
        ctx.crc = self.crc;
        codec.unpack(pkg, output, &mut ctx)?;

        if ctx.unpacked_size != self.info.unpacked_size {
            return Err(PkgError::InvalidPkgFormat(format!(
                "{} unpacked to {} bytes, expected {}",
                self.info.identity, ctx.unpacked_size, self.info.unpacked_size
            )));
        }
        output.flush(ctx.unpacked_size)
    }
}

/// True when `len` bytes at `offset` do not fit below `limit`
fn past_end(offset: usize, len: usize, limit: usize) -> bool {
    offset.checked_add(len).map_or(true, |end| end > limit)
}

fn archive_usize(value: u64, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| PkgError::InvalidPkgFormat(format!("{} {} out of range", what, value)))
}

/// Keep at most [`MAX_NAME_LEN`] bytes of a stored name
fn truncate_name(name: &[u8]) -> &[u8] {
    &name[..name.len().min(MAX_NAME_LEN)]
}

/// Unix seconds to local DOS time and date
fn unix_to_dos(seconds: u64) -> (u16, u16) {
    let local = match Local.timestamp_opt(seconds as i64, 0).single() {
        Some(time) if time.year() >= 1980 => time,
        _ => return (0, (1 << 5) | 1),
    };
    let time = ((local.hour() as u16) << 11)
        | ((local.minute() as u16) << 5)
        | (local.second() as u16 / 2);
    let date = (((local.year() - 1980) as u16) << 9)
        | ((local.month() as u16) << 5)
        | local.day() as u16;
    (time, date)
}

/// Local DOS time and date to unix seconds, zero when invalid
fn dos_to_unix(time: u16, date: u16) -> u64 {
    let second = (time & 0x1f) as u32 * 2;
    // Minute bits are masked with 0x2f
    let minute = ((time >> 5) & 0x2f) as u32;
    let hour = (time >> 11) as u32;
    let day = (date & 0x1f) as u32;
    let month = ((date >> 5) & 0x0f) as u32;
    let year = (date >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|day| day.and_hms_opt(hour, minute, second))
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .map(|local| local.timestamp().max(0) as u64)
        .unwrap_or(0)
}

/// Where the end record sits and whether a signature area follows it
struct ArchiveEnd {
    record_offset: usize,
    signed: bool,
}

/// ZIP (`.zip`) package
pub struct ZipPackage {
    base: PackageBase<ZipEntry>,
}

impl ZipPackage {
    pub fn new(stream: SharedStream, info: PackageInfo) -> Self {
        Self {
            base: PackageBase::new(stream, info),
        }
    }

    fn find_end(pkg: &mut dyn ByteStream) -> Result<ArchiveEnd> {
        let file_len = pkg.len();
        let mut word = [0u8; 4];
        for (signed, tail) in [(false, END_RECORD_SIZE), (true, END_RECORD_SIZE + SIGN_TOTAL_LEN)] {
            if file_len < tail {
                continue;
            }
            read_exact_at(pkg, file_len - tail, &mut word)?;
            if u32::from_le_bytes(word) == super::zip_records::END_RECORD_SIGNATURE {
                return Ok(ArchiveEnd {
                    record_offset: file_len - tail,
                    signed,
                });
            }
        }
        Err(PkgError::InvalidPkgFormat(
            "end of central directory not found".to_string(),
        ))
    }

    /// Central directory offset, size and entry count
    fn read_directory_bounds(pkg: &mut dyn ByteStream, end: &ArchiveEnd) -> Result<(usize, usize, usize)> {
        let mut record = [0u8; END_RECORD_SIZE];
        read_exact_at(pkg, end.record_offset, &mut record)?;
        let eocd = EndOfCentralDirectory::read_from(&record[..])?;
        if eocd.disk_number != 0 || eocd.cd_start_disk != 0 || eocd.entries_this_disk != eocd.total_entries {
            return Err(PkgError::InvalidPkgFormat(
                "multi-disk archives are not supported".to_string(),
            ));
        }

        let needs_zip64 = eocd.total_entries == u16::MAX
            || eocd.cd_size == ZIP64_MARKER
            || eocd.cd_offset == ZIP64_MARKER;
        let (cd_offset, cd_size, count, cd_limit) = if needs_zip64 {
            if end.record_offset < ZIP64_LOCATOR_SIZE {
                return Err(PkgError::InvalidPkgFormat("zip64 locator missing".to_string()));
            }
            let locator_offset = end.record_offset - ZIP64_LOCATOR_SIZE;
            let mut locator = [0u8; ZIP64_LOCATOR_SIZE];
            read_exact_at(pkg, locator_offset, &mut locator)?;
            let locator = Zip64Locator::read_from(&locator[..])?;
            let record_offset = archive_usize(locator.record_offset, "zip64 end record offset")?;
            if past_end(record_offset, ZIP64_END_RECORD_SIZE, locator_offset) {
                return Err(PkgError::InvalidPkgFormat(
                    "zip64 end record out of range".to_string(),
                ));
            }
            let mut record = [0u8; ZIP64_END_RECORD_SIZE];
            read_exact_at(pkg, record_offset, &mut record)?;
            let zip64 = Zip64EndRecord::read_from(&record[..])?;
            (
                archive_usize(zip64.cd_offset, "central directory offset")?,
                archive_usize(zip64.cd_size, "central directory size")?,
                archive_usize(zip64.total_entries, "entry count")?,
                record_offset,
            )
        } else {
            (
                eocd.cd_offset as usize,
                eocd.cd_size as usize,
                eocd.total_entries as usize,
                end.record_offset,
            )
        };

        if past_end(cd_offset, cd_size, cd_limit) {
            return Err(PkgError::InvalidPkgFormat(format!(
                "central directory at {} ({} bytes) overlaps the end records",
                cd_offset, cd_size
            )));
        }
        Ok((cd_offset, cd_size, count))
    }

    /// Digest method of a signed archive, from whichever slot is filled
    fn signed_digest_method(pkg: &mut dyn ByteStream, sign_start: usize) -> Result<DigestMethod> {
        let mut area = vec![0u8; SIGN_TOTAL_LEN];
        read_exact_at(pkg, sign_start, &mut area)?;
        if area[SIGN_SHA256_LEN..].iter().any(|&b| b != 0) {
            Ok(DigestMethod::Sha384)
        } else {
            Ok(DigestMethod::Sha256)
        }
    }

    fn read_package(&mut self, verifier: &PkgVerifier) -> Result<Vec<String>> {
        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let pkg = &mut *pkg;

        let end = Self::find_end(pkg)?;
        let (cd_offset, cd_size, count) = Self::read_directory_bounds(pkg, &end)?;
        self.base.info.package_type = PackageType::Zip;

        if end.signed {
            let sign_start = end.record_offset + END_RECORD_SIZE;
            let method = Self::signed_digest_method(pkg, sign_start)?;
            let slot = sign_start + method.signature_slot();
            let mut signature = vec![0u8; method.signature_len()];
            read_exact_at(pkg, slot, &mut signature)?;
            let digest = digest_stream(
                pkg,
                method,
                Some(sign_start..sign_start + SIGN_TOTAL_LEN),
                DIGEST_BUFFER_SIZE,
            )?;
            self.base.info.digest_method = method;
            verifier(&self.base.info, &digest, &signature).map_err(signature_error)?;
        }

        let mut directory = vec![0u8; cd_size];
        read_exact_at(pkg, cd_offset, &mut directory)?;
        let mut pos = 0;
        for _ in 0..count {
            if pos >= directory.len() {
                return Err(PkgError::InvalidPkgFormat(format!(
                    "central directory ends before {} entries",
                    count
                )));
            }
            let mut entry = ZipEntry::default();
            pos += entry.decode_header(pkg, &directory[pos..], cd_offset + pos, 0)?;
            if self.base.entries.get(&entry.info().identity).is_some() {
                warn!("Skipping duplicate zip entry {}", entry.info().identity);
                continue;
            }
            self.base.entries.insert(entry)?;
        }
        self.base.info.entry_count = self.base.entries.len() as u32;
        self.base.cursor = cd_offset;

        info!(
            "Loaded zip package {} with {} entries{}",
            pkg.name(),
            count,
            if end.signed { " (signed)" } else { "" }
        );
        Ok(self.base.entries.names())
    }
}

impl super::Container for ZipPackage {
    fn package_type(&self) -> PackageType {
        PackageType::Zip
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
        self.base.check_state(
            &[ContainerState::Idle, ContainerState::Working],
            ContainerState::Working,
        )?;
        if self.base.entries.get(&info.identity).is_some() {
            return Err(PkgError::InvalidParam(format!(
                "duplicate entry {}",
                info.identity
            )));
        }
        info!("Add file {} to zip package", info.identity);

        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let mut entry = ZipEntry::default();
        entry.init(info, input)?;
        let written = entry.pack(input, &mut *pkg, self.base.cursor)?;
        self.base.cursor += written;
        self.base.entries.insert(entry)?;
        self.base.info.entry_count = self.base.entries.len() as u32;
        Ok(())
    }

    fn save_package(&mut self) -> Result<usize> {
        self.base.check_state(&[ContainerState::Working], ContainerState::Closed)?;
        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let pkg = &mut *pkg;

        let cd_offset = self.base.cursor;
        let mut offset = cd_offset;
        for entry in self.base.entries.iter_mut() {
            offset += entry.encode_header(pkg, offset)?;
        }
        let cd_size = offset - cd_offset;
        let count = self.base.entries.len();

        let zip64 = count >= u16::MAX as usize
            || cd_offset as u64 >= ZIP64_MARKER as u64
            || cd_size as u64 >= ZIP64_MARKER as u64;
        let mut tail = Vec::new();
        if zip64 {
            let record = Zip64EndRecord {
                version_made_by: VERSION_NEEDED_ZIP64,
                version_needed: VERSION_NEEDED_ZIP64,
                entries_this_disk: count as u64,
                total_entries: count as u64,
                cd_size: cd_size as u64,
                cd_offset: cd_offset as u64,
                ..Zip64EndRecord::default()
            };
            record.write_to(&mut tail)?;
            Zip64Locator {
                record_disk: 0,
                record_offset: offset as u64,
                total_disks: 1,
            }
            .write_to(&mut tail)?;
        }
        let clamp16 = |value: usize| value.min(u16::MAX as usize) as u16;
        let clamp32 = |value: usize| value.min(ZIP64_MARKER as usize) as u32;
        EndOfCentralDirectory {
            entries_this_disk: clamp16(count),
            total_entries: clamp16(count),
            cd_size: clamp32(cd_size),
            cd_offset: clamp32(cd_offset),
            ..EndOfCentralDirectory::default()
        }
        .write_to(&mut tail)?;
        pkg.write(&tail, offset)?;
        offset += tail.len();

        let sign_offset = self.base.append_sign_area(pkg, offset)?;
        pkg.flush(self.base.cursor)?;
        info!(
            "Saved zip package {} with {} entries ({} bytes)",
            pkg.name(),
            count,
            self.base.cursor
        );
        Ok(sign_offset)
    }

    fn load_package(&mut self, verifier: &PkgVerifier) -> Result<Vec<String>> {
        self.base.require_state(&[ContainerState::Idle])?;
        let info = self.base.info.clone();
        let loaded = self.read_package(verifier);
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
    use crate::info::ZipParams;
    use crate::package::{accept_all, Container};
    use crate::stream::MemoryStream;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn build(info: PackageInfo, files: &[(&str, PackMethod, &[u8])], descriptor: bool) -> Vec<u8> {
        let memory = Rc::new(RefCell::new(MemoryStream::growable("test.zip")));
        let stream: SharedStream = memory.clone();
        let mut package = ZipPackage::new(stream, info);
        for (name, method, data) in files {
            let mut input = MemoryStream::borrowed(*name, data);
            let file = FileInfo::new(*name, *method).with_params(FormatParams::Zip(ZipParams {
                data_descriptor: descriptor,
                ..ZipParams::default()
            }));
            package.add_entry(&file, &mut input).unwrap();
        }
        package.save_package().unwrap();
        drop(package);
        let bytes = memory.borrow().as_slice().to_vec();
        bytes
    }

    fn load(bytes: Vec<u8>, verifier: &PkgVerifier) -> Result<ZipPackage> {
        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::from_vec("test.zip", bytes)));
        let mut package = ZipPackage::new(stream, PackageInfo::default());
        package.load_package(verifier)?;
        Ok(package)
    }

    /// Re-encode the central record of a single-entry archive after `edit`
    fn rewrite_central(bytes: &[u8], edit: impl FnOnce(&mut CentralDirectoryHeader)) -> Vec<u8> {
        let end_offset = bytes.len() - END_RECORD_SIZE;
        let mut end = EndOfCentralDirectory::read_from(&bytes[end_offset..]).unwrap();
        let cd_offset = end.cd_offset as usize;
        let mut central = CentralDirectoryHeader::read_from(&bytes[cd_offset..end_offset]).unwrap();
        edit(&mut central);
        let mut out = bytes[..cd_offset].to_vec();
        central.write_to(&mut out).unwrap();
        end.cd_size = (out.len() - cd_offset) as u32;
        end.write_to(&mut out).unwrap();
        out
    }

    fn extract(package: &mut ZipPackage, name: &str) -> Result<Vec<u8>> {
        let mut out = MemoryStream::growable(name);
        package.extract_file(name, &mut out)?;
        Ok(out.into_bytes())
    }

    #[test]
    fn test_roundtrip_stored_and_deflated() {
        let notes = text(20_000);
        let blob = noise(5_000, 3);
        let bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("notes.txt", PackMethod::Zip, &notes), ("blob.bin", PackMethod::None, &blob)],
            false,
        );
        assert_eq!(&bytes[..4], b"PK\x03\x04");

        let mut package = load(bytes, &accept_all()).unwrap();
        assert_eq!(package.entry_names(), vec!["notes.txt", "blob.bin"]);
        let info = package.file_info("notes.txt").unwrap();
        assert_eq!(info.pack_method, PackMethod::Zip);
        assert_eq!(info.unpacked_size, notes.len());
        assert!(info.packed_size < notes.len());

        assert_eq!(extract(&mut package, "notes.txt").unwrap(), notes);
        assert_eq!(extract(&mut package, "blob.bin").unwrap(), blob);
    }

    #[test]
    fn test_data_descriptor_roundtrip() {
        let notes = text(4_000);
        let bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("notes.txt", PackMethod::Zip, &notes)],
            true,
        );
        // Local header carries no crc when a descriptor follows
        assert_eq!(&bytes[14..18], &[0, 0, 0, 0]);

        let mut package = load(bytes, &accept_all()).unwrap();
        assert_eq!(extract(&mut package, "notes.txt").unwrap(), notes);
    }

    #[test]
    fn test_crc_mismatch_on_extract() {
        let blob = noise(2_000, 9);
        let mut bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("blob.bin", PackMethod::None, &blob)],
            false,
        );
        bytes[LOCAL_HEADER_SIZE + "blob.bin".len() + 100] ^= 0x01;

        let mut package = load(bytes, &accept_all()).unwrap();
        let err = extract(&mut package, "blob.bin").unwrap_err();
        assert!(matches!(err, PkgError::CrcMismatch { .. }));
    }

    #[test]
    fn test_unknown_method_rejected_on_extract() {
        let blob = b"bzip2 pretender".to_vec();
        let mut bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("x.bin", PackMethod::None, &blob)],
            false,
        );
        // Method 12 in both local and central headers
        bytes[8] = 12;
        let central = bytes.len() - END_RECORD_SIZE - (46 + "x.bin".len());
        bytes[central + 10] = 12;

        let mut package = load(bytes, &accept_all()).unwrap();
        let err = extract(&mut package, "x.bin").unwrap_err();
        assert!(matches!(err, PkgError::NotExistAlgorithm(_)));
    }

    #[test]
    fn test_signed_archive_verifier_sees_slot() {
        let info = PackageInfo::new(PackageType::Zip)
            .with_signing(SignMethod::Rsa, DigestMethod::Sha256);
        let mut bytes = build(info, &[("a.txt", PackMethod::Zip, b"hello")], false);
        let sign_start = bytes.len() - SIGN_TOTAL_LEN;
        assert!(bytes[sign_start..].iter().all(|&b| b == 0));
        bytes[sign_start] = 0x5A;

        let verifier: PkgVerifier = Box::new(|info, digest, signature| {
            assert_eq!(info.digest_method, DigestMethod::Sha256);
            assert_eq!(digest.len(), 32);
            assert_eq!(signature.len(), SIGN_SHA256_LEN);
            assert_eq!(signature[0], 0x5A);
            Ok(())
        });
        load(bytes.clone(), &verifier).unwrap();

        let reject: PkgVerifier =
            Box::new(|_, _, _| Err(PkgError::VerifyFailed("bad signature".to_string())));
        let err = load(bytes, &reject).err().unwrap();
        assert!(matches!(err, PkgError::InvalidSignature(_)));
    }

    #[test]
    fn test_missing_end_record() {
        let bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("a.txt", PackMethod::Zip, b"hello")],
            false,
        );
        let truncated = bytes[..bytes.len() - 5].to_vec();
        let err = load(truncated, &accept_all()).err().unwrap();
        assert!(err.to_string().contains("end of central directory"));
    }

    #[test]
    fn test_zip64_extra_values_past_end() {
        let bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("a.txt", PackMethod::None, b"hello")],
            false,
        );

        let huge_size = rewrite_central(&bytes, |central| {
            central.compressed_size = ZIP64_MARKER;
            central.extra = Zip64Extra {
                compressed_size: Some(u64::MAX),
                ..Zip64Extra::default()
            }
            .encode();
        });
        let err = load(huge_size, &accept_all()).err().unwrap();
        assert!(matches!(err, PkgError::InvalidPkgFormat(_)), "{}", err);

        let huge_offset = rewrite_central(&bytes, |central| {
            central.local_header_offset = ZIP64_MARKER;
            central.extra = Zip64Extra {
                local_header_offset: Some(u64::MAX),
                ..Zip64Extra::default()
            }
            .encode();
        });
        let err = load(huge_offset, &accept_all()).err().unwrap();
        assert!(matches!(err, PkgError::InvalidPkgFormat(_)), "{}", err);
    }

    #[test]
    fn test_zip64_locator_offset_past_end() {
        let bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("a.txt", PackMethod::None, b"hello")],
            false,
        );
        let end_offset = bytes.len() - END_RECORD_SIZE;
        let mut end = EndOfCentralDirectory::read_from(&bytes[end_offset..]).unwrap();
        end.cd_offset = ZIP64_MARKER;

        let mut forged = bytes[..end_offset].to_vec();
        Zip64Locator {
            record_offset: u64::MAX,
            ..Zip64Locator::default()
        }
        .write_to(&mut forged)
        .unwrap();
        end.write_to(&mut forged).unwrap();

        let err = load(forged, &accept_all()).err().unwrap();
        assert!(err.to_string().contains("zip64 end record"), "{}", err);
    }

    #[test]
    fn test_failed_load_can_be_retried() {
        let bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("a.txt", PackMethod::None, b"hello")],
            false,
        );
        let overrun = rewrite_central(&bytes, |central| central.compressed_size = 10_000);

        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::from_vec("test.zip", overrun)));
        let mut package = ZipPackage::new(stream, PackageInfo::default());
        let err = package.load_package(&accept_all()).unwrap_err();
        assert!(err.to_string().contains("runs past the end"), "{}", err);
        assert_eq!(package.state(), ContainerState::Idle);
        assert!(package.entry_names().is_empty());

        let retry = package.load_package(&accept_all()).unwrap_err();
        assert!(matches!(retry, PkgError::InvalidPkgFormat(_)), "{}", retry);
        let mut out = MemoryStream::growable("a.txt");
        let err = package.extract_file("a.txt", &mut out).unwrap_err();
        assert!(matches!(err, PkgError::InvalidState(_)));
    }

    #[test]
    fn test_local_sizes_checked_against_central() {
        let mut bytes = build(
            PackageInfo::new(PackageType::Zip),
            &[("a.txt", PackMethod::None, b"hello")],
            false,
        );
        assert_eq!(bytes[18], 5);
        bytes[18] = 4;
        let err = load(bytes.clone(), &accept_all()).err().unwrap();
        assert!(err.to_string().contains("local header sizes"), "{}", err);

        bytes[18] = 5;
        bytes[22] = 9;
        let err = load(bytes, &accept_all()).err().unwrap();
        assert!(err.to_string().contains("local header sizes"), "{}", err);
    }

    #[test]
    fn test_dos_time_conversion() {
        // 2024-03-05 10:08:30 local
        let seconds = Local
            .with_ymd_and_hms(2024, 3, 5, 10, 8, 30)
            .single()
            .unwrap()
            .timestamp() as u64;
        let (time, date) = unix_to_dos(seconds);
        assert_eq!(date >> 9, 44);
        assert_eq!((date >> 5) & 0x0f, 3);
        assert_eq!(date & 0x1f, 5);
        assert_eq!(time >> 11, 10);
        assert_eq!(dos_to_unix(time, date), seconds);
    }
}
