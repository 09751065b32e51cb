//! Entry and package metadata shared by codecs, containers and the manager

use crate::format::{DigestMethod, PackMethod, PackageType, SignMethod};
use serde::{Deserialize, Serialize};

/// Best-compression deflate level
pub const DEFAULT_ZIP_LEVEL: u32 = 9;

/// LZ4 level used when none (or an invalid one) is given
pub const DEFAULT_LZ4_LEVEL: i32 = 2;

/// Default LZ4 block size id (64 KiB)
pub const DEFAULT_LZ4_BLOCK_ID: u8 = 4;

fn default_zip_level() -> u32 {
    DEFAULT_ZIP_LEVEL
}

fn default_lz4_level() -> i32 {
    DEFAULT_LZ4_LEVEL
}

fn default_lz4_block_id() -> u8 {
    DEFAULT_LZ4_BLOCK_ID
}

fn default_true() -> bool {
    true
}

/// Deflate parameters for ZIP and GZIP entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipParams {
    /// Compression level, 0..=9
    #[serde(default = "default_zip_level")]
    pub level: u32,

    /// Write sizes and CRC in a trailing data descriptor instead of the local header
    #[serde(default)]
    pub data_descriptor: bool,
}

impl Default for ZipParams {
    fn default() -> Self {
        Self {
            level: DEFAULT_ZIP_LEVEL,
            data_descriptor: false,
        }
    }
}

/// LZ4 frame and block parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lz4Params {
    #[serde(default = "default_lz4_level")]
    pub level: i32,

    /// Block size id: 4 = 64 KiB, 5 = 256 KiB, 6 = 1 MiB, 7 = 4 MiB
    #[serde(default = "default_lz4_block_id")]
    pub block_size_id: u8,

    #[serde(default = "default_true")]
    pub independent_blocks: bool,

    #[serde(default)]
    pub content_checksum: bool,

    #[serde(default)]
    pub block_checksum: bool,
}

impl Default for Lz4Params {
    fn default() -> Self {
        Self {
            level: DEFAULT_LZ4_LEVEL,
            block_size_id: DEFAULT_LZ4_BLOCK_ID,
            independent_blocks: true,
            content_checksum: false,
            block_checksum: false,
        }
    }
}

impl Lz4Params {
    /// Level clamped to the supported range; values below 1 select the default
    pub fn normalized_level(&self) -> i32 {
        if self.level < 1 {
            DEFAULT_LZ4_LEVEL
        } else {
            self.level.min(12)
        }
    }

    /// Whether the level asks for the high-compression path
    pub fn high_compression(&self) -> bool {
        self.normalized_level() >= 3
    }
}

/// Upgrade component record fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentParams {
    pub id: u16,
    #[serde(default)]
    pub res_type: u8,
    #[serde(default)]
    pub flags: u8,
    #[serde(default)]
    pub comp_type: u8,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub original_size: usize,
    /// SHA-256 of the component data
    #[serde(default)]
    pub digest: Vec<u8>,
}

/// Format-specific entry parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum FormatParams {
    #[default]
    None,
    Zip(ZipParams),
    Component(ComponentParams),
    Lz4(Lz4Params),
}

/// Metadata of one package entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub identity: String,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub digest_method: DigestMethod,
    #[serde(default)]
    pub pack_method: PackMethod,
    /// Unix seconds
    #[serde(default)]
    pub modified_time: u64,
    #[serde(default)]
    pub packed_size: usize,
    #[serde(default)]
    pub unpacked_size: usize,
    #[serde(default)]
    pub header_offset: usize,
    #[serde(default)]
    pub data_offset: usize,
    #[serde(default)]
    pub params: FormatParams,
}

impl FileInfo {
    pub fn new(identity: impl Into<String>, pack_method: PackMethod) -> Self {
        Self {
            identity: identity.into(),
            pack_method,
            ..Self::default()
        }
    }

    pub fn with_digest(mut self, digest_method: DigestMethod) -> Self {
        self.digest_method = digest_method;
        self
    }

    pub fn with_params(mut self, params: FormatParams) -> Self {
        self.params = params;
        self
    }

    pub fn zip_params(&self) -> ZipParams {
        match &self.params {
            FormatParams::Zip(params) => params.clone(),
            _ => ZipParams::default(),
        }
    }

    pub fn lz4_params(&self) -> Lz4Params {
        match &self.params {
            FormatParams::Lz4(params) => params.clone(),
            _ => Lz4Params::default(),
        }
    }

    pub fn component(&self) -> Option<&ComponentParams> {
        match &self.params {
            FormatParams::Component(params) => Some(params),
            _ => None,
        }
    }
}

/// Package-level header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(default)]
    pub entry_count: u32,
    #[serde(default)]
    pub sign_method: SignMethod,
    #[serde(default)]
    pub digest_method: DigestMethod,
    #[serde(default)]
    pub package_type: PackageType,
    #[serde(default)]
    pub package_flags: u32,

    // Upgrade header fields
    #[serde(default)]
    pub update_file_version: u32,
    #[serde(default)]
    pub product_update_id: String,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
}

impl PackageInfo {
    pub fn new(package_type: PackageType) -> Self {
        Self {
            package_type,
            ..Self::default()
        }
    }

    pub fn with_signing(mut self, sign_method: SignMethod, digest_method: DigestMethod) -> Self {
        self.sign_method = sign_method;
        self.digest_method = digest_method;
        self
    }
}
