//! Upgrade package: a TLV header, fixed-size component records, a reserved
//! and signature area, then the component data.
//!
//! ```text
//! TLV(0x0001 | 0x0011, 136)  pkg_info_length u32, update_file_version u32,
//!                            product_update_id [64], software_version [64]
//! TLV(0x0002, 32)            date [16], time [16]
//! TLV(0x0005, n * 71)        component records
//! reserved [16]
//! signature area [640]
//! component data
//! ```

use super::{pad_stream, signature_error, ContainerState, Entry, PackageBase, PkgVerifier};
use crate::algorithm::digest_algorithm;
use crate::codec::{codec_for, CodecContext};
use crate::error::{PkgError, Result};
use crate::format::{
    read_fixed_str, read_le16, read_le32, write_fixed_str, write_le16, write_le32, DigestMethod,
    PackMethod, PackageType, SignMethod, DIGEST_MAX_LEN, SIGN_TOTAL_LEN,
};
use crate::info::{ComponentParams, FileInfo, FormatParams, PackageInfo};
use crate::stream::{read_data, read_exact_at, ByteStream, SharedStream};
use tracing::{debug, info};

const TLV_LEN: usize = 4;
const HEADER_BODY_LEN: usize = 136;
const TIME_BODY_LEN: usize = 32;

/// Three TLV headers, the package header and the time record
pub const UPGRADE_FILE_HEADER_LEN: usize = 3 * TLV_LEN + HEADER_BODY_LEN + TIME_BODY_LEN;

/// Size of one component record
pub const COMPONENT_INFO_LEN: usize = 71;

/// Reserved bytes between the component records and the signature area
pub const UPGRADE_RESERVE_LEN: usize = 16;

const TLV_TYPE_SHA256: u16 = 0x0001;
const TLV_TYPE_SHA384: u16 = 0x0011;
const TLV_TYPE_TIME: u16 = 0x0002;
const TLV_TYPE_COMPONENTS: u16 = 0x0005;

// Package header field offsets
const PKG_INFO_LENGTH_OFFSET: usize = 0;
const UPDATE_FILE_VERSION_OFFSET: usize = 4;
const PRODUCT_UPDATE_ID_OFFSET: usize = 8;
const SOFTWARE_VERSION_OFFSET: usize = 72;
const ID_FIELD_LEN: usize = 64;
const TIME_FIELD_LEN: usize = 16;

// Component record field offsets
const COMP_IDENTITY: usize = 0;
const COMP_IDENTITY_LEN: usize = 16;
const COMP_ID: usize = 16;
const COMP_RES_TYPE: usize = 18;
const COMP_FLAGS: usize = 19;
const COMP_TYPE: usize = 20;
const COMP_VERSION: usize = 21;
const COMP_VERSION_LEN: usize = 10;
const COMP_SIZE: usize = 31;
const COMP_ORIGINAL_SIZE: usize = 35;
const COMP_DIGEST: usize = 39;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One component of an upgrade package
#[derive(Debug, Clone, Default)]
pub struct UpgradeEntry {
    info: FileInfo,
    component: ComponentParams,
}

impl UpgradeEntry {
    pub fn component(&self) -> &ComponentParams {
        &self.component
    }

    fn sync_params(&mut self) {
        self.info.params = FormatParams::Component(self.component.clone());
    }

    fn encode_record(&self) -> Result<[u8; COMPONENT_INFO_LEN]> {
        let mut record = [0u8; COMPONENT_INFO_LEN];
        write_fixed_str(&mut record, COMP_IDENTITY, COMP_IDENTITY_LEN, &self.info.identity);
        write_le16(&mut record, COMP_ID, self.component.id);
        record[COMP_RES_TYPE] = self.component.res_type;
        record[COMP_FLAGS] = self.component.flags;
        record[COMP_TYPE] = self.component.comp_type;
        write_fixed_str(&mut record, COMP_VERSION, COMP_VERSION_LEN, &self.component.version);
        write_le32(&mut record, COMP_SIZE, field_u32(self.info.packed_size, "component size")?);
        write_le32(
            &mut record,
            COMP_ORIGINAL_SIZE,
            field_u32(self.info.unpacked_size, "component original size")?,
        );
        let digest_len = self.component.digest.len().min(DIGEST_MAX_LEN);
        record[COMP_DIGEST..COMP_DIGEST + digest_len]
            .copy_from_slice(&self.component.digest[..digest_len]);
        Ok(record)
    }
}

impl Entry for UpgradeEntry {
    fn info(&self) -> &FileInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut FileInfo {
        &mut self.info
    }

    fn init(&mut self, info: &FileInfo, input: &mut dyn ByteStream) -> Result<()> {
        if info.identity.is_empty() {
            return Err(PkgError::InvalidParam("component without identity".to_string()));
        }
        if info.identity.len() > COMP_IDENTITY_LEN {
            return Err(PkgError::InvalidParam(format!(
                "component identity {} longer than {} bytes",
                info.identity, COMP_IDENTITY_LEN
            )));
        }

        self.info = info.clone();
        // Components are stored as is and digested with SHA-256
        self.info.pack_method = PackMethod::None;
        self.info.digest_method = DigestMethod::Sha256;
        if self.info.unpacked_size == 0 {
            self.info.unpacked_size = input.len();
        }
        if self.info.modified_time == 0 {
            self.info.modified_time = super::now_unix();
        }
        self.component = info.component().cloned().unwrap_or_default();
        self.component.original_size = self.info.unpacked_size;
        self.sync_params();
        Ok(())
    }

    fn encode_header(&mut self, pkg: &mut dyn ByteStream, start: usize) -> Result<usize> {
        pkg.write(&self.encode_record()?, start)?;
        self.info.header_offset = start;
        debug!(
            "Component {} header at {} data at {} ({} bytes)",
            self.info.identity, start, self.info.data_offset, self.info.packed_size
        );
        Ok(COMPONENT_INFO_LEN)
    }

    fn pack(
        &mut self,
        input: &mut dyn ByteStream,
        pkg: &mut dyn ByteStream,
        start: usize,
    ) -> Result<usize> {
        let codec = codec_for(&self.info)?;
        let mut ctx = CodecContext::new(0, start, 0, self.info.unpacked_size, self.info.digest_method);
        codec.pack(input, pkg, &mut ctx)?;

        self.component.digest = ctx.digest;
        self.info.packed_size = ctx.packed_size;
        self.info.data_offset = start;
        self.sync_params();
        Ok(self.info.packed_size)
    }

    fn decode_header(
        &mut self,
        _pkg: &mut dyn ByteStream,
        buffer: &[u8],
        header_offset: usize,
        data_offset: usize,
    ) -> Result<usize> {
        if buffer.len() < COMPONENT_INFO_LEN {
            return Err(PkgError::InvalidPkgFormat(format!(
                "component record needs {} bytes, have {}",
                COMPONENT_INFO_LEN,
                buffer.len()
            )));
        }

        self.info = FileInfo {
            identity: read_fixed_str(buffer, COMP_IDENTITY, COMP_IDENTITY_LEN),
            pack_method: PackMethod::None,
            digest_method: DigestMethod::Sha256,
            packed_size: read_le32(buffer, COMP_SIZE) as usize,
            unpacked_size: read_le32(buffer, COMP_ORIGINAL_SIZE) as usize,
            header_offset,
            data_offset,
            ..FileInfo::default()
        };
        self.component = ComponentParams {
            id: read_le16(buffer, COMP_ID),
            res_type: buffer[COMP_RES_TYPE],
            flags: buffer[COMP_FLAGS],
            comp_type: buffer[COMP_TYPE],
            version: read_fixed_str(buffer, COMP_VERSION, COMP_VERSION_LEN),
            original_size: self.info.unpacked_size,
            digest: buffer[COMP_DIGEST..COMP_DIGEST + DIGEST_MAX_LEN].to_vec(),
        };
        self.sync_params();
        Ok(COMPONENT_INFO_LEN)
    }

    fn unpack(&mut self, pkg: &mut dyn ByteStream, output: &mut dyn ByteStream) -> Result<()> {
        let codec = codec_for(&self.info)?;
        let mut ctx = CodecContext::new(
            self.info.data_offset,
            0,
            self.info.packed_size,
            0,
            self.info.digest_method,
        );
        ctx.digest = self.component.digest.clone();
        codec.unpack(pkg, output, &mut ctx)?;

        if ctx.unpacked_size != self.info.unpacked_size {
            return Err(PkgError::InvalidPkgFormat(format!(
                "component {} unpacked to {} bytes, expected {}",
                self.info.identity, ctx.unpacked_size, self.info.unpacked_size
            )));
        }
        output.flush(ctx.unpacked_size)
    }
}

/// Upgrade (`.bin`) package
pub struct UpgradePackage {
    base: PackageBase<UpgradeEntry>,
}

impl UpgradePackage {
    pub fn new(stream: SharedStream, info: PackageInfo) -> Self {
        Self {
            base: PackageBase::new(stream, info),
        }
    }

    fn entry_count(&self) -> usize {
        self.base.info.entry_count as usize
    }

    fn signature_area_offset(&self) -> usize {
        UPGRADE_FILE_HEADER_LEN + self.entry_count() * COMPONENT_INFO_LEN + UPGRADE_RESERVE_LEN
    }

    fn header_tlv_type(&self) -> u16 {
        match self.base.info.digest_method {
            DigestMethod::Sha384 => TLV_TYPE_SHA384,
            _ => TLV_TYPE_SHA256,
        }
    }

    fn encode_package_header(&self) -> Result<Vec<u8>> {
        let info = &self.base.info;
        let components_len = self.entry_count() * COMPONENT_INFO_LEN;
        let mut header = vec![0u8; UPGRADE_FILE_HEADER_LEN];

        write_le16(&mut header, 0, self.header_tlv_type());
        write_le16(&mut header, 2, HEADER_BODY_LEN as u16);
        let body = TLV_LEN;
        let pkg_info_length = UPGRADE_FILE_HEADER_LEN + components_len + UPGRADE_RESERVE_LEN;
        write_le32(
            &mut header,
            body + PKG_INFO_LENGTH_OFFSET,
            field_u32(pkg_info_length, "package info length")?,
        );
        write_le32(&mut header, body + UPDATE_FILE_VERSION_OFFSET, info.update_file_version);
        write_fixed_str(&mut header, body + PRODUCT_UPDATE_ID_OFFSET, ID_FIELD_LEN, &info.product_update_id);
        write_fixed_str(&mut header, body + SOFTWARE_VERSION_OFFSET, ID_FIELD_LEN, &info.software_version);

        let time_tlv = TLV_LEN + HEADER_BODY_LEN;
        write_le16(&mut header, time_tlv, TLV_TYPE_TIME);
        write_le16(&mut header, time_tlv + 2, TIME_BODY_LEN as u16);
        let (date, time) = timestamp_fields(info);
        write_fixed_str(&mut header, time_tlv + TLV_LEN, TIME_FIELD_LEN, &date);
        write_fixed_str(&mut header, time_tlv + TLV_LEN + TIME_FIELD_LEN, TIME_FIELD_LEN, &time);

        let comp_tlv = time_tlv + TLV_LEN + TIME_BODY_LEN;
        write_le16(&mut header, comp_tlv, TLV_TYPE_COMPONENTS);
        let components_len = u16::try_from(components_len).map_err(|_| {
            PkgError::InvalidParam(format!(
                "{} components do not fit the component table",
                self.entry_count()
            ))
        })?;
        write_le16(&mut header, comp_tlv + 2, components_len);
        Ok(header)
    }

    fn read_package(&mut self, verifier: &PkgVerifier) -> Result<Vec<String>> {
        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        let pkg = &mut *pkg;

        let file_len = pkg.len();
        let min_len = UPGRADE_FILE_HEADER_LEN + COMPONENT_INFO_LEN + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN;
        if file_len < min_len {
            return Err(PkgError::InvalidFile(format!(
                "upgrade package of {} bytes is shorter than {}",
                file_len, min_len
            )));
        }

        // Package header
        let mut header = vec![0u8; UPGRADE_FILE_HEADER_LEN];
        read_exact_at(pkg, 0, &mut header)?;
        let digest_method = match read_le16(&header, 0) {
            TLV_TYPE_SHA256 => DigestMethod::Sha256,
            TLV_TYPE_SHA384 => DigestMethod::Sha384,
            other => {
                return Err(PkgError::InvalidFile(format!(
                    "unknown package header type {:04x}",
                    other
                )))
            }
        };
        if read_le16(&header, 2) as usize != HEADER_BODY_LEN {
            return Err(PkgError::InvalidFile(format!(
                "package header length {} is not {}",
                read_le16(&header, 2),
                HEADER_BODY_LEN
            )));
        }
        let body = TLV_LEN;
        let info = &mut self.base.info;
        info.package_type = PackageType::Upgrade;
        info.digest_method = digest_method;
        info.sign_method = SignMethod::Rsa;
        info.update_file_version = read_le32(&header, body + UPDATE_FILE_VERSION_OFFSET);
        info.product_update_id = read_fixed_str(&header, body + PRODUCT_UPDATE_ID_OFFSET, ID_FIELD_LEN);
        info.software_version = read_fixed_str(&header, body + SOFTWARE_VERSION_OFFSET, ID_FIELD_LEN);

        let time_tlv = TLV_LEN + HEADER_BODY_LEN;
        check_tlv(&header, time_tlv, file_len, TLV_TYPE_TIME, TIME_BODY_LEN)?;
        info.date = read_fixed_str(&header, time_tlv + TLV_LEN, TIME_FIELD_LEN);
        info.time = read_fixed_str(&header, time_tlv + TLV_LEN + TIME_FIELD_LEN, TIME_FIELD_LEN);

        let comp_tlv = time_tlv + TLV_LEN + TIME_BODY_LEN;
        let components_len = check_tlv(&header, comp_tlv, file_len, TLV_TYPE_COMPONENTS, COMPONENT_INFO_LEN)?;
        if components_len % COMPONENT_INFO_LEN != 0 {
            return Err(PkgError::InvalidPkgFormat(format!(
                "component table of {} bytes is not a multiple of {}",
                components_len, COMPONENT_INFO_LEN
            )));
        }
        let count = components_len / COMPONENT_INFO_LEN;
        info.entry_count = count as u32;

        let parsed_len = UPGRADE_FILE_HEADER_LEN + components_len;
        if parsed_len + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN >= file_len {
            return Err(PkgError::InvalidFile(format!(
                "no component data after {} bytes of headers",
                parsed_len
            )));
        }

        // Component records
        let mut components = vec![0u8; components_len];
        read_exact_at(pkg, UPGRADE_FILE_HEADER_LEN, &mut components)?;
        let mut data_offset = parsed_len + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN;
        for index in 0..count {
            let record = &components[index * COMPONENT_INFO_LEN..(index + 1) * COMPONENT_INFO_LEN];
            let mut entry = UpgradeEntry::default();
            entry.decode_header(pkg, record, UPGRADE_FILE_HEADER_LEN + index * COMPONENT_INFO_LEN, data_offset)?;
            data_offset += entry.info().packed_size;
            if data_offset > file_len {
                return Err(PkgError::InvalidPkgFormat(format!(
                    "component {} runs past the end of the package",
                    entry.info().identity
                )));
            }
            self.base.entries.insert(entry)?;
        }

        // Package digest: headers, a zeroed reserve and signature area, then the data
        let mut algorithm = digest_algorithm(digest_method)?;
        algorithm.init();
        algorithm.update(&header);
        algorithm.update(&components);
        algorithm.update(&[0u8; UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN]);

        let mut signature = vec![0u8; digest_method.signature_len()];
        read_exact_at(
            pkg,
            parsed_len + UPGRADE_RESERVE_LEN + digest_method.signature_slot(),
            &mut signature,
        )?;

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut offset = parsed_len + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN;
        let mut remaining = file_len - offset;
        while remaining > 0 {
            let read = read_data(pkg, offset, &mut buffer, &mut remaining)?;
            algorithm.update(&buffer[..read]);
            offset += read;
        }
        let digest = algorithm.finish();

        verifier(&self.base.info, &digest, &signature).map_err(signature_error)?;
        info!(
            "Loaded upgrade package {} with {} components",
            pkg.name(),
            count
        );
        Ok(self.base.entries.names())
    }
}

/// A size as a 32-bit header field
fn field_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| PkgError::InvalidParam(format!("{} {} does not fit 32 bits", what, value)))
}

/// Header date and time, defaulting to the local clock
fn timestamp_fields(info: &PackageInfo) -> (String, String) {
    let now = chrono::Local::now();
    let date = if info.date.is_empty() {
        now.format("%Y.%m.%d").to_string()
    } else {
        info.date.clone()
    };
    let time = if info.time.is_empty() {
        now.format("%H:%M:%S").to_string()
    } else {
        info.time.clone()
    };
    (date, time)
}

/// Parse and validate a TLV header at `offset`
///
/// Rejects lengths below `min_len`, lengths that do not fit the file, and
/// unexpected types.
fn check_tlv(
    buffer: &[u8],
    offset: usize,
    file_len: usize,
    expected_type: u16,
    min_len: usize,
) -> Result<usize> {
    let tlv_type = read_le16(buffer, offset);
    let length = read_le16(buffer, offset + 2) as usize;
    if length >= file_len || length < min_len || tlv_type != expected_type || length + TLV_LEN >= file_len {
        return Err(PkgError::InvalidFile(format!(
            "bad tlv at {}: type {:04x} length {}",
            offset, tlv_type, length
        )));
    }
    Ok(length)
}

impl super::Container for UpgradePackage {
    fn package_type(&self) -> PackageType {
        PackageType::Upgrade
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
        if self.base.entries.len() >= self.entry_count() {
            return Err(PkgError::InvalidParam(format!(
                "package declares {} components, cannot add {}",
                self.entry_count(),
                info.identity
            )));
        }
        info!("Add file {} to package", info.identity);

        let packed_so_far: usize = self.base.entries.iter().map(|e| e.info().packed_size).sum();
        let data_offset = self.signature_area_offset() + SIGN_TOTAL_LEN + packed_so_far;
        let header_offset = UPGRADE_FILE_HEADER_LEN + self.base.entries.len() * COMPONENT_INFO_LEN;

        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        pad_stream(&mut *pkg, data_offset)?;
        let mut entry = UpgradeEntry::default();
        entry.init(info, input)?;
        let packed = entry.pack(input, &mut *pkg, data_offset)?;
        entry.encode_header(&mut *pkg, header_offset)?;
        self.base.cursor = data_offset + packed;
        self.base.entries.insert(entry)?;
        Ok(())
    }

    fn save_package(&mut self) -> Result<usize> {
        self.base.check_state(&[ContainerState::Working], ContainerState::Closed)?;
        if self.base.entries.len() != self.entry_count() {
            return Err(PkgError::InvalidParam(format!(
                "package declares {} components, {} added",
                self.entry_count(),
                self.base.entries.len()
            )));
        }

        let stream = self.base.stream.clone();
        let mut pkg = crate::stream::borrow_stream(&stream)?;
        pkg.write(&self.encode_package_header()?, 0)?;

        let area = self.signature_area_offset() - UPGRADE_RESERVE_LEN;
        pkg.write(&[0u8; UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN], area)?;
        let end = self.base.cursor.max(area + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN);
        pkg.flush(end)?;

        let sign_offset = self.signature_area_offset() + self.base.info.digest_method.signature_slot();
        info!("Saved upgrade package {} ({} bytes)", pkg.name(), end);
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
    use crate::package::{accept_all, Container};
    use crate::stream::MemoryStream;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn header(count: u32) -> PackageInfo {
        PackageInfo {
            entry_count: count,
            update_file_version: 7,
            product_update_id: "demo-product".to_string(),
            software_version: "1.2.3".to_string(),
            date: "2026.10.19".to_string(),
            time: "12:00:00".to_string(),
            ..PackageInfo::new(PackageType::Upgrade)
                .with_signing(SignMethod::Rsa, DigestMethod::Sha256)
        }
    }

    fn component(name: &str, id: u16) -> FileInfo {
        FileInfo::new(name, PackMethod::Zip).with_params(FormatParams::Component(
            ComponentParams {
                id,
                version: "1.0".to_string(),
                ..ComponentParams::default()
            },
        ))
    }

    fn build(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let memory = Rc::new(RefCell::new(MemoryStream::growable("update.bin")));
        let stream: SharedStream = memory.clone();
        let mut package = UpgradePackage::new(stream, header(parts.len() as u32));
        for (index, (name, data)) in parts.iter().enumerate() {
            let mut input = MemoryStream::borrowed(*name, data);
            package
                .add_entry(&component(name, index as u16 + 1), &mut input)
                .unwrap();
        }
        let sign_offset = package.save_package().unwrap();
        assert_eq!(
            sign_offset,
            UPGRADE_FILE_HEADER_LEN + parts.len() * COMPONENT_INFO_LEN + UPGRADE_RESERVE_LEN
        );
        drop(package);
        let bytes = memory.borrow().as_slice().to_vec();
        bytes
    }

    fn load(bytes: Vec<u8>) -> Result<UpgradePackage> {
        let stream: SharedStream =
            Rc::new(RefCell::new(MemoryStream::from_vec("update.bin", bytes)));
        let mut package = UpgradePackage::new(stream, PackageInfo::default());
        package.load_package(&accept_all())?;
        Ok(package)
    }

    #[test]
    fn test_layout_and_reload() {
        let kernel = vec![0xAB; 1000];
        let rootfs = b"root filesystem image".to_vec();
        let bytes = build(&[("kernel", &kernel), ("rootfs", &rootfs)]);

        let headers = UPGRADE_FILE_HEADER_LEN + 2 * COMPONENT_INFO_LEN;
        assert_eq!(bytes.len(), headers + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN + 1000 + rootfs.len());
        assert_eq!(read_le16(&bytes, 0), TLV_TYPE_SHA256);
        assert_eq!(
            read_le32(&bytes, TLV_LEN) as usize,
            headers + UPGRADE_RESERVE_LEN
        );

        let mut package = load(bytes).unwrap();
        assert_eq!(package.info().entry_count, 2);
        assert_eq!(package.info().software_version, "1.2.3");
        assert_eq!(package.info().date, "2026.10.19");
        assert_eq!(package.entry_names(), vec!["kernel", "rootfs"]);

        let info = package.file_info("kernel").unwrap();
        assert_eq!(info.pack_method, PackMethod::None);
        assert_eq!(info.packed_size, 1000);
        assert_eq!(info.data_offset, headers + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN);
        assert_eq!(info.component().unwrap().id, 1);

        let mut out = MemoryStream::growable("rootfs");
        package.extract_file("rootfs", &mut out).unwrap();
        assert_eq!(out.as_slice(), &rootfs[..]);
    }

    #[test]
    fn test_component_digest_checked_on_extract() {
        let data = vec![0x11; 64];
        let mut bytes = build(&[("app", &data)]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let mut package = load(bytes).unwrap();
        let mut out = MemoryStream::growable("app");
        let err = package.extract_file("app", &mut out).unwrap_err();
        assert!(matches!(err, PkgError::InvalidDigest(_)));
    }

    #[test]
    fn test_too_many_components() {
        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::growable("update.bin")));
        let mut package = UpgradePackage::new(stream, header(1));
        let data = b"payload".to_vec();
        let mut input = MemoryStream::borrowed("a", &data);
        package.add_entry(&component("a", 1), &mut input).unwrap();
        let err = package
            .add_entry(&component("b", 2), &mut input)
            .unwrap_err();
        assert!(err.to_string().contains("declares 1 components"));
    }

    #[test]
    fn test_component_table_overflow_rejected() {
        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::growable("update.bin")));
        let package = UpgradePackage::new(stream, header(1000));
        let err = package.encode_package_header().unwrap_err();
        assert!(matches!(err, PkgError::InvalidParam(_)));
        assert!(err.to_string().contains("1000 components"));

        let stream: SharedStream = Rc::new(RefCell::new(MemoryStream::growable("update.bin")));
        let package = UpgradePackage::new(stream, header(900));
        let encoded = package.encode_package_header().unwrap();
        let comp_tlv = TLV_LEN + HEADER_BODY_LEN + TLV_LEN + TIME_BODY_LEN;
        assert_eq!(read_le16(&encoded, comp_tlv + 2) as usize, 900 * COMPONENT_INFO_LEN);
    }

    #[test]
    fn test_oversized_component_rejected() {
        let mut entry = UpgradeEntry::default();
        entry.info_mut().identity = "rootfs".to_string();
        entry.info_mut().packed_size = u32::MAX as usize + 1;
        let err = entry.encode_record().unwrap_err();
        assert!(err.to_string().contains("component size"));

        entry.info_mut().packed_size = 16;
        entry.info_mut().unpacked_size = u32::MAX as usize + 1;
        let err = entry.encode_record().unwrap_err();
        assert!(matches!(err, PkgError::InvalidParam(_)));

        entry.info_mut().unpacked_size = 16;
        let record = entry.encode_record().unwrap();
        assert_eq!(read_le32(&record, COMP_SIZE), 16);
    }

    #[test]
    fn test_bad_component_tlv() {
        let mut bytes = build(&[("app", b"data bytes")]);
        let comp_tlv = TLV_LEN + HEADER_BODY_LEN + TLV_LEN + TIME_BODY_LEN;
        write_le16(&mut bytes, comp_tlv + 2, (COMPONENT_INFO_LEN + 1) as u16);
        assert!(load(bytes).is_err());
    }

    #[test]
    fn test_short_file_rejected() {
        let bytes = build(&[("app", b"data bytes")]);
        let short = bytes[..UPGRADE_FILE_HEADER_LEN].to_vec();
        assert!(matches!(load(short), Err(PkgError::InvalidFile(_))));
    }

    #[test]
    fn test_sha384_header_type() {
        let memory = Rc::new(RefCell::new(MemoryStream::growable("update.bin")));
        let stream: SharedStream = memory.clone();
        let info = PackageInfo {
            digest_method: DigestMethod::Sha384,
            ..header(1)
        };
        let mut package = UpgradePackage::new(stream, info);
        let data = b"payload".to_vec();
        let mut input = MemoryStream::borrowed("a", &data);
        package.add_entry(&component("a", 1), &mut input).unwrap();
        let sign_offset = package.save_package().unwrap();
        assert_eq!(
            sign_offset,
            UPGRADE_FILE_HEADER_LEN + COMPONENT_INFO_LEN + UPGRADE_RESERVE_LEN + 256
        );
        drop(package);
        assert_eq!(read_le16(memory.borrow().as_slice(), 0), TLV_TYPE_SHA384);
    }
}
