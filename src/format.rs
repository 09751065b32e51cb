use crate::error::{PkgError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// SHA-256 signature slot length in bytes
pub const SIGN_SHA256_LEN: usize = 256;

/// SHA-384 signature slot length in bytes
pub const SIGN_SHA384_LEN: usize = 384;

/// Total signature area appended to (or embedded in) a package
pub const SIGN_TOTAL_LEN: usize = SIGN_SHA256_LEN + SIGN_SHA384_LEN;

/// Digest field width stored per upgrade component
pub const DIGEST_MAX_LEN: usize = 32;

/// Digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DigestMethod {
    #[default]
    None = 0,
    Crc = 1,
    Sha256 = 2,
    Sha384 = 3,
}

impl DigestMethod {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Crc),
            2 => Ok(Self::Sha256),
            3 => Ok(Self::Sha384),
            _ => Err(PkgError::NotExistAlgorithm(format!(
                "unknown digest method {}",
                value
            ))),
        }
    }

    /// Length of the digest this method produces
    pub fn digest_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc => 4,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }

    /// Length of the signature slot reserved for this method
    pub fn signature_len(self) -> usize {
        match self {
            Self::None | Self::Crc => 0,
            Self::Sha256 => SIGN_SHA256_LEN,
            Self::Sha384 => SIGN_SHA384_LEN,
        }
    }

    /// Offset of this method's slot inside the signature area
    pub fn signature_slot(self) -> usize {
        match self {
            Self::Sha384 => SIGN_SHA256_LEN,
            _ => 0,
        }
    }

    /// Digest method named by a version string
    ///
    /// Strings mentioning sha384 select SHA-384; everything else is SHA-256.
    pub fn from_version(version: &str) -> Self {
        if version.to_ascii_lowercase().contains("sha384") {
            Self::Sha384
        } else {
            Self::Sha256
        }
    }
}

/// Signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SignMethod {
    #[default]
    None = 0,
    Rsa = 1,
    Ecdsa = 2,
}

impl SignMethod {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Rsa),
            2 => Ok(Self::Ecdsa),
            _ => Err(PkgError::NotExistAlgorithm(format!(
                "unknown sign method {}",
                value
            ))),
        }
    }
}

/// Compression methods applied to an entry's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PackMethod {
    #[default]
    None = 0,
    Zip = 1,
    Lz4 = 2,
    Gzip = 3,
    Lz4Block = 4,
}

impl PackMethod {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Zip),
            2 => Ok(Self::Lz4),
            3 => Ok(Self::Gzip),
            4 => Ok(Self::Lz4Block),
            _ => Err(PkgError::NotExistAlgorithm(format!(
                "unknown pack method {}",
                value
            ))),
        }
    }
}

/// Container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PackageType {
    #[default]
    None = 0,
    Upgrade = 1,
    Zip = 2,
    Lz4 = 3,
    Gzip = 4,
}

impl PackageType {
    /// Container type implied by a file extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("bin") => Self::Upgrade,
            Some("zip") => Self::Zip,
            Some("lz4") => Self::Lz4,
            Some("gz") => Self::Gzip,
            _ => Self::None,
        }
    }
}

// Little-endian accessors over already bounds-checked buffers
pub(crate) fn read_le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_le32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_le64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_le16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_le32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Copy `text` into a fixed, zero-padded field, truncating if needed
pub(crate) fn write_fixed_str(buf: &mut [u8], offset: usize, width: usize, text: &str) {
    let field = &mut buf[offset..offset + width];
    field.fill(0);
    let bytes = text.as_bytes();
    let count = bytes.len().min(width);
    field[..count].copy_from_slice(&bytes[..count]);
}

/// Read a zero-padded string field
pub(crate) fn read_fixed_str(buf: &[u8], offset: usize, width: usize) -> String {
    let field = &buf[offset..offset + width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&field[..end]).into_owned()
}
