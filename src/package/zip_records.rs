use crate::error::{PkgError, Result};
use std::io::{self, Read, Write};

/// Local file header signature "PK\x03\x04"
pub const LOCAL_HEADER_SIGNATURE: u32 = 0x04034b50;

/// Central directory header signature "PK\x01\x02"
pub const CENTRAL_HEADER_SIGNATURE: u32 = 0x02014b50;

/// End of central directory signature "PK\x05\x06"
pub const END_RECORD_SIGNATURE: u32 = 0x06054b50;

/// Data descriptor signature "PK\x07\x08"
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;

/// ZIP64 end of central directory record signature "PK\x06\x06"
pub const ZIP64_END_RECORD_SIGNATURE: u32 = 0x06064b50;

/// ZIP64 end of central directory locator signature "PK\x06\x07"
pub const ZIP64_LOCATOR_SIGNATURE: u32 = 0x07064b50;

pub const LOCAL_HEADER_SIZE: usize = 30;
pub const CENTRAL_HEADER_SIZE: usize = 46;
pub const END_RECORD_SIZE: usize = 22;
pub const ZIP64_END_RECORD_SIZE: usize = 56;
pub const ZIP64_LOCATOR_SIZE: usize = 20;

/// General purpose flag: sizes and CRC follow the data in a descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// ZIP64 extended information extra field id
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Marker stored in 32-bit fields whose value lives in the ZIP64 extra field
pub const ZIP64_MARKER: u32 = 0xFFFF_FFFF;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

/// Version needed to extract (2.0, deflate)
pub const VERSION_NEEDED: u16 = 20;

/// Version needed for ZIP64 records (4.5)
pub const VERSION_NEEDED_ZIP64: u16 = 45;

/// Local File Header
///
/// Structure (variable length):
/// - Signature: 0x04034b50 (4 bytes)
/// - Version Needed: uint16 (2 bytes)
/// - Flags: uint16 (2 bytes)
/// - Compression Method: uint16 (2 bytes)
/// - DOS Time: uint16 (2 bytes)
/// - DOS Date: uint16 (2 bytes)
/// - CRC32: uint32 (4 bytes)
/// - Compressed Size: uint32 (4 bytes)
/// - Uncompressed Size: uint32 (4 bytes)
/// - Name Length: uint16 (2 bytes)
/// - Extra Length: uint16 (2 bytes)
/// - Name, Extra: variable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
}

impl LocalFileHeader {
    /// Write local header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&LOCAL_HEADER_SIGNATURE.to_le_bytes())?;
        writer.write_all(&self.version_needed.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.method.to_le_bytes())?;
        writer.write_all(&self.dos_time.to_le_bytes())?;
        writer.write_all(&self.dos_date.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&(self.name.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.extra.len() as u16).to_le_bytes())?;
        writer.write_all(&self.name)?;
        writer.write_all(&self.extra)?;

        Ok(self.header_size())
    }

    /// Read local header from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let signature = read_u32(&mut reader)?;
        if signature != LOCAL_HEADER_SIGNATURE {
            return Err(PkgError::InvalidPkgFormat(format!(
                "Invalid local header signature {:08x}",
                signature
            )));
        }

        let version_needed = read_u16(&mut reader)?;
        let flags = read_u16(&mut reader)?;
        let method = read_u16(&mut reader)?;
        let dos_time = read_u16(&mut reader)?;
        let dos_date = read_u16(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let compressed_size = read_u32(&mut reader)?;
        let uncompressed_size = read_u32(&mut reader)?;
        let name_len = read_u16(&mut reader)? as usize;
        let extra_len = read_u16(&mut reader)? as usize;
        let name = read_vec(&mut reader, name_len)?;
        let extra = read_vec(&mut reader, extra_len)?;

        Ok(Self {
            version_needed,
            flags,
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size,
            uncompressed_size,
            name,
            extra,
        })
    }

    pub fn header_size(&self) -> usize {
        LOCAL_HEADER_SIZE + self.name.len() + self.extra.len()
    }
}

/// Central Directory Header
///
/// Structure (variable length):
/// - Signature: 0x02014b50 (4 bytes)
/// - Version Made By, Version Needed: uint16 each
/// - Flags, Method, DOS Time, DOS Date: uint16 each
/// - CRC32, Compressed Size, Uncompressed Size: uint32 each
/// - Name, Extra, Comment Lengths: uint16 each
/// - Disk Start, Internal Attributes: uint16 each
/// - External Attributes, Local Header Offset: uint32 each
/// - Name, Extra, Comment: variable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub local_header_offset: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    /// Write central directory header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&CENTRAL_HEADER_SIGNATURE.to_le_bytes())?;
        writer.write_all(&self.version_made_by.to_le_bytes())?;
        writer.write_all(&self.version_needed.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.method.to_le_bytes())?;
        writer.write_all(&self.dos_time.to_le_bytes())?;
        writer.write_all(&self.dos_date.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&(self.name.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.extra.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.comment.len() as u16).to_le_bytes())?;
        writer.write_all(&self.disk_start.to_le_bytes())?;
        writer.write_all(&self.internal_attrs.to_le_bytes())?;
        writer.write_all(&self.external_attrs.to_le_bytes())?;
        writer.write_all(&self.local_header_offset.to_le_bytes())?;
        writer.write_all(&self.name)?;
        writer.write_all(&self.extra)?;
        writer.write_all(&self.comment)?;

        Ok(self.header_size())
    }

    /// Read central directory header from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let signature = read_u32(&mut reader)?;
        if signature != CENTRAL_HEADER_SIGNATURE {
            return Err(PkgError::InvalidPkgFormat(format!(
                "Invalid central header signature {:08x}",
                signature
            )));
        }

        let version_made_by = read_u16(&mut reader)?;
        let version_needed = read_u16(&mut reader)?;
        let flags = read_u16(&mut reader)?;
        let method = read_u16(&mut reader)?;
        let dos_time = read_u16(&mut reader)?;
        let dos_date = read_u16(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let compressed_size = read_u32(&mut reader)?;
        let uncompressed_size = read_u32(&mut reader)?;
        let name_len = read_u16(&mut reader)? as usize;
        let extra_len = read_u16(&mut reader)? as usize;
        let comment_len = read_u16(&mut reader)? as usize;
        let disk_start = read_u16(&mut reader)?;
        let internal_attrs = read_u16(&mut reader)?;
        let external_attrs = read_u32(&mut reader)?;
        let local_header_offset = read_u32(&mut reader)?;
        let name = read_vec(&mut reader, name_len)?;
        let extra = read_vec(&mut reader, extra_len)?;
        let comment = read_vec(&mut reader, comment_len)?;

        Ok(Self {
            version_made_by,
            version_needed,
            flags,
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_start,
            internal_attrs,
            external_attrs,
            local_header_offset,
            name,
            extra,
            comment,
        })
    }

    pub fn header_size(&self) -> usize {
        CENTRAL_HEADER_SIZE + self.name.len() + self.extra.len() + self.comment.len()
    }
}

/// End of Central Directory Record
///
/// Structure (22 bytes plus comment):
/// - Signature: 0x06054b50 (4 bytes)
/// - Disk Number, Central Directory Disk: uint16 each
/// - Entries On This Disk, Total Entries: uint16 each
/// - Central Directory Size, Central Directory Offset: uint32 each
/// - Comment Length: uint16 (2 bytes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_start_disk: u16,
    pub entries_this_disk: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&END_RECORD_SIGNATURE.to_le_bytes())?;
        writer.write_all(&self.disk_number.to_le_bytes())?;
        writer.write_all(&self.cd_start_disk.to_le_bytes())?;
        writer.write_all(&self.entries_this_disk.to_le_bytes())?;
        writer.write_all(&self.total_entries.to_le_bytes())?;
        writer.write_all(&self.cd_size.to_le_bytes())?;
        writer.write_all(&self.cd_offset.to_le_bytes())?;
        writer.write_all(&(self.comment.len() as u16).to_le_bytes())?;
        writer.write_all(&self.comment)?;

        Ok(END_RECORD_SIZE + self.comment.len())
    }

    /// Read the fixed part of the record; the comment is not read
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let signature = read_u32(&mut reader)?;
        if signature != END_RECORD_SIGNATURE {
            return Err(PkgError::InvalidPkgFormat(format!(
                "Invalid end record signature {:08x}",
                signature
            )));
        }

        let disk_number = read_u16(&mut reader)?;
        let cd_start_disk = read_u16(&mut reader)?;
        let entries_this_disk = read_u16(&mut reader)?;
        let total_entries = read_u16(&mut reader)?;
        let cd_size = read_u32(&mut reader)?;
        let cd_offset = read_u32(&mut reader)?;
        let _comment_len = read_u16(&mut reader)?;

        Ok(Self {
            disk_number,
            cd_start_disk,
            entries_this_disk,
            total_entries,
            cd_size,
            cd_offset,
            comment: Vec::new(),
        })
    }
}

/// ZIP64 End of Central Directory Record (56 bytes, no extensible data)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Zip64EndRecord {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub cd_start_disk: u32,
    pub entries_this_disk: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EndRecord {
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&ZIP64_END_RECORD_SIGNATURE.to_le_bytes())?;
        // Size of the remaining record
        writer.write_all(&((ZIP64_END_RECORD_SIZE - 12) as u64).to_le_bytes())?;
        writer.write_all(&self.version_made_by.to_le_bytes())?;
        writer.write_all(&self.version_needed.to_le_bytes())?;
        writer.write_all(&self.disk_number.to_le_bytes())?;
        writer.write_all(&self.cd_start_disk.to_le_bytes())?;
        writer.write_all(&self.entries_this_disk.to_le_bytes())?;
        writer.write_all(&self.total_entries.to_le_bytes())?;
        writer.write_all(&self.cd_size.to_le_bytes())?;
        writer.write_all(&self.cd_offset.to_le_bytes())?;

        Ok(ZIP64_END_RECORD_SIZE)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let signature = read_u32(&mut reader)?;
        if signature != ZIP64_END_RECORD_SIGNATURE {
            return Err(PkgError::InvalidPkgFormat(format!(
                "Invalid zip64 end record signature {:08x}",
                signature
            )));
        }
        let _record_size = read_u64(&mut reader)?;

        Ok(Self {
            version_made_by: read_u16(&mut reader)?,
            version_needed: read_u16(&mut reader)?,
            disk_number: read_u32(&mut reader)?,
            cd_start_disk: read_u32(&mut reader)?,
            entries_this_disk: read_u64(&mut reader)?,
            total_entries: read_u64(&mut reader)?,
            cd_size: read_u64(&mut reader)?,
            cd_offset: read_u64(&mut reader)?,
        })
    }
}

/// ZIP64 End of Central Directory Locator (20 bytes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Zip64Locator {
    pub record_disk: u32,
    pub record_offset: u64,
    pub total_disks: u32,
}

impl Zip64Locator {
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&ZIP64_LOCATOR_SIGNATURE.to_le_bytes())?;
        writer.write_all(&self.record_disk.to_le_bytes())?;
        writer.write_all(&self.record_offset.to_le_bytes())?;
        writer.write_all(&self.total_disks.to_le_bytes())?;

        Ok(ZIP64_LOCATOR_SIZE)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let signature = read_u32(&mut reader)?;
        if signature != ZIP64_LOCATOR_SIGNATURE {
            return Err(PkgError::InvalidPkgFormat(format!(
                "Invalid zip64 locator signature {:08x}",
                signature
            )));
        }

        Ok(Self {
            record_disk: read_u32(&mut reader)?,
            record_offset: read_u64(&mut reader)?,
            total_disks: read_u32(&mut reader)?,
        })
    }
}

/// Data descriptor following entry data when [`FLAG_DATA_DESCRIPTOR`] is set
///
/// Sizes are 8 bytes wide for ZIP64 entries, 4 bytes otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    pub fn write_to<W: Write>(&self, mut writer: W, zip64: bool) -> Result<usize> {
        writer.write_all(&DATA_DESCRIPTOR_SIGNATURE.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        if zip64 {
            writer.write_all(&self.compressed_size.to_le_bytes())?;
            writer.write_all(&self.uncompressed_size.to_le_bytes())?;
            Ok(24)
        } else {
            writer.write_all(&(self.compressed_size as u32).to_le_bytes())?;
            writer.write_all(&(self.uncompressed_size as u32).to_le_bytes())?;
            Ok(16)
        }
    }

    /// Read a descriptor; the leading signature is optional
    pub fn read_from<R: Read>(mut reader: R, zip64: bool) -> Result<Self> {
        let mut crc32 = read_u32(&mut reader)?;
        if crc32 == DATA_DESCRIPTOR_SIGNATURE {
            crc32 = read_u32(&mut reader)?;
        }
        let (compressed_size, uncompressed_size) = if zip64 {
            (read_u64(&mut reader)?, read_u64(&mut reader)?)
        } else {
            (
                read_u32(&mut reader)? as u64,
                read_u32(&mut reader)? as u64,
            )
        };

        Ok(Self {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }
}

/// ZIP64 extended information extra field
///
/// Only the values whose 32-bit counterparts are saturated are present, in
/// the order uncompressed size, compressed size, local header offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Zip64Extra {
    pub uncompressed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub local_header_offset: Option<u64>,
}

impl Zip64Extra {
    pub fn is_empty(&self) -> bool {
        self.uncompressed_size.is_none()
            && self.compressed_size.is_none()
            && self.local_header_offset.is_none()
    }

    /// Encode as a complete extra field (id, length, values)
    pub fn encode(&self) -> Vec<u8> {
        let values: Vec<u64> = [
            self.uncompressed_size,
            self.compressed_size,
            self.local_header_offset,
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut out = Vec::with_capacity(4 + values.len() * 8);
        out.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        out.extend_from_slice(&((values.len() * 8) as u16).to_le_bytes());
        for value in values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Find and decode the ZIP64 field in an extra block
    pub fn parse(
        extra: &[u8],
        need_uncompressed: bool,
        need_compressed: bool,
        need_offset: bool,
    ) -> Result<Self> {
        let mut pos = 0;
        while pos + 4 <= extra.len() {
            let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
            let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
            let body_start = pos + 4;
            if body_start + len > extra.len() {
                break;
            }
            if id == ZIP64_EXTRA_ID {
                let mut body = &extra[body_start..body_start + len];
                let mut field = Self::default();
                if need_uncompressed {
                    field.uncompressed_size = Some(read_u64(&mut body)?);
                }
                if need_compressed {
                    field.compressed_size = Some(read_u64(&mut body)?);
                }
                if need_offset {
                    field.local_header_offset = Some(read_u64(&mut body)?);
                }
                return Ok(field);
            }
            pos = body_start + len;
        }

        if need_uncompressed || need_compressed || need_offset {
            return Err(PkgError::InvalidPkgFormat(
                "zip64 extra field missing".to_string(),
            ));
        }
        Ok(Self::default())
    }
}

// Helper functions for reading primitive types
fn read_exact<R: Read>(mut reader: R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            PkgError::InvalidPkgFormat("truncated zip record".to_string())
        } else {
            PkgError::Io(e)
        }
    })
}

fn read_u16<R: Read>(reader: R) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_vec<R: Read>(reader: R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact(reader, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_header_roundtrip() {
        let header = LocalFileHeader {
            version_needed: VERSION_NEEDED,
            method: METHOD_DEFLATED,
            crc32: 0x12345678,
            compressed_size: 5000,
            uncompressed_size: 10000,
            name: b"boot/kernel.img".to_vec(),
            ..LocalFileHeader::default()
        };

        let mut buf = Vec::new();
        let written = header.write_to(&mut buf).unwrap();
        assert_eq!(written, header.header_size());
        assert_eq!(buf.len(), LOCAL_HEADER_SIZE + 15);

        let parsed = LocalFileHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_signature_validation() {
        let mut buf = vec![0xFF, 0xFF, 0xFF, 0xFF];
        buf.extend_from_slice(&[0u8; 60]);

        let result = CentralDirectoryHeader::read_from(&buf[..]);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid central header signature"));
    }

    #[test]
    fn test_truncated_record() {
        let header = CentralDirectoryHeader {
            name: b"a.txt".to_vec(),
            ..CentralDirectoryHeader::default()
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        let result = CentralDirectoryHeader::read_from(&buf[..]);
        assert!(matches!(result, Err(PkgError::InvalidPkgFormat(_))));
    }

    #[test]
    fn test_zip64_extra_selects_fields() {
        let extra = Zip64Extra {
            uncompressed_size: Some(0x1_0000_0000),
            compressed_size: None,
            local_header_offset: Some(0x2_0000_0000),
        };
        let mut block = vec![0x55, 0x54, 0x01, 0x00, 0x00];
        block.extend_from_slice(&extra.encode());

        let parsed = Zip64Extra::parse(&block, true, false, true).unwrap();
        assert_eq!(parsed, extra);

        assert!(Zip64Extra::parse(&[], true, false, false).is_err());
        assert!(Zip64Extra::parse(&[], false, false, false).unwrap().is_empty());
    }

    #[test]
    fn test_descriptor_widths() {
        let descriptor = DataDescriptor {
            crc32: 0xCAFEBABE,
            compressed_size: 10,
            uncompressed_size: 20,
        };
        let mut narrow = Vec::new();
        assert_eq!(descriptor.write_to(&mut narrow, false).unwrap(), 16);
        assert_eq!(DataDescriptor::read_from(&narrow[..], false).unwrap(), descriptor);

        let mut wide = Vec::new();
        assert_eq!(descriptor.write_to(&mut wide, true).unwrap(), 24);
        assert_eq!(DataDescriptor::read_from(&wide[4..], true).unwrap(), descriptor);
    }
}
