//! Package containers and their entries
//!
//! A [`Container`] owns the package stream and a set of [`Entry`] values.
//! Containers move through a small state machine:
//!
//! ```text
//! Idle --add_entry / load_package--> Working --save_package--> Closed
//! ```
//!
//! `add_entry` is legal while Idle or Working, `save_package` and
//! `extract_file` only while Working, and `load_package` only while Idle.

mod gzip;
mod lz4;
mod upgrade;
mod zip;
pub mod zip_records;

pub use gzip::{GzipEntry, GzipPackage};
pub use lz4::{Lz4Entry, Lz4Package};
pub use upgrade::{
    UpgradeEntry, UpgradePackage, COMPONENT_INFO_LEN, UPGRADE_FILE_HEADER_LEN,
    UPGRADE_RESERVE_LEN,
};
pub use zip::{ZipEntry, ZipPackage};

use crate::error::{PkgError, Result};
use crate::format::{PackageType, SIGN_TOTAL_LEN};
use crate::info::{FileInfo, PackageInfo};
use crate::stream::{borrow_stream, ByteStream, SharedStream};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Checks a package digest and signature during load
///
/// Receives the package header, the computed digest and the signature bytes.
pub type PkgVerifier = Box<dyn Fn(&PackageInfo, &[u8], &[u8]) -> Result<()>>;

/// Verifier that accepts every package
pub fn accept_all() -> PkgVerifier {
    Box::new(|_, _, _| Ok(()))
}

/// Lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Idle,
    Working,
    Closed,
}

/// One file inside a package
pub trait Entry {
    fn info(&self) -> &FileInfo;

    fn info_mut(&mut self) -> &mut FileInfo;

    /// Copy caller metadata; zero sizes and times take defaults from `input`
    fn init(&mut self, info: &FileInfo, input: &mut dyn ByteStream) -> Result<()>;

    /// Write this entry's header at `start`, returning its length
    fn encode_header(&mut self, pkg: &mut dyn ByteStream, start: usize) -> Result<usize>;

    /// Encode `input` into the package at `start`, returning the bytes written
    fn pack(
        &mut self,
        input: &mut dyn ByteStream,
        pkg: &mut dyn ByteStream,
        start: usize,
    ) -> Result<usize>;

    /// Parse this entry's header from `buffer`, returning the bytes consumed
    fn decode_header(
        &mut self,
        pkg: &mut dyn ByteStream,
        buffer: &[u8],
        header_offset: usize,
        data_offset: usize,
    ) -> Result<usize>;

    /// Decode the entry's data into `output`
    fn unpack(&mut self, pkg: &mut dyn ByteStream, output: &mut dyn ByteStream) -> Result<()>;
}

/// A package file in one of the supported formats
pub trait Container {
    fn package_type(&self) -> PackageType;

    fn state(&self) -> ContainerState;

    fn info(&self) -> &PackageInfo;

    fn stream(&self) -> &SharedStream;

    /// Name of the package stream
    fn name(&self) -> String;

    fn add_entry(&mut self, info: &FileInfo, input: &mut dyn ByteStream) -> Result<()>;

    /// Finish the package, returning the offset of its signature slot
    fn save_package(&mut self) -> Result<usize>;

    /// Parse the package, returning the identities of its entries
    fn load_package(&mut self, verifier: &PkgVerifier) -> Result<Vec<String>>;

    fn extract_file(&mut self, name: &str, output: &mut dyn ByteStream) -> Result<()>;

    fn file_info(&self, name: &str) -> Option<&FileInfo>;

    fn entry_names(&self) -> Vec<String>;
}

/// Create an empty container of `package_type` over `stream`
pub fn new_container(
    package_type: PackageType,
    stream: SharedStream,
    info: PackageInfo,
) -> Result<Box<dyn Container>> {
    Ok(match package_type {
        PackageType::Upgrade => Box::new(UpgradePackage::new(stream, info)),
        PackageType::Zip => Box::new(ZipPackage::new(stream, info)),
        PackageType::Gzip => Box::new(GzipPackage::new(stream, info)),
        PackageType::Lz4 => Box::new(Lz4Package::new(stream, info)),
        PackageType::None => {
            return Err(PkgError::InvalidParam(
                "no container for package type none".to_string(),
            ))
        }
    })
}

/// Entries keyed by a stable id, with a name index
pub struct EntryMap<E> {
    entries: BTreeMap<u32, E>,
    names: HashMap<String, u32>,
    next_id: u32,
}

impl<E: Entry> EntryMap<E> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            names: HashMap::new(),
            next_id: 0,
        }
    }

    /// Insert an entry under its identity, returning its id
    pub fn insert(&mut self, entry: E) -> Result<u32> {
        let name = entry.info().identity.clone();
        if self.names.contains_key(&name) {
            return Err(PkgError::InvalidParam(format!(
                "duplicate entry {}",
                name
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(name, id);
        self.entries.insert(id, entry);
        Ok(id)
    }

    pub fn get(&self, name: &str) -> Option<&E> {
        self.names.get(name).and_then(|id| self.entries.get(id))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut E> {
        match self.names.get(name) {
            Some(id) => self.entries.get_mut(id),
            None => None,
        }
    }

    pub fn by_id(&self, id: u32) -> Option<&E> {
        self.entries.get(&id)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.entries.values_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|entry| entry.info().identity.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E: Entry> Default for EntryMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every container
pub struct PackageBase<E> {
    pub stream: SharedStream,
    pub info: PackageInfo,
    pub state: ContainerState,
    pub entries: EntryMap<E>,
    /// Next write position while building a package
    pub cursor: usize,
}

impl<E: Entry> PackageBase<E> {
    pub fn new(stream: SharedStream, info: PackageInfo) -> Self {
        Self {
            stream,
            info,
            state: ContainerState::Idle,
            entries: EntryMap::new(),
            cursor: 0,
        }
    }

    /// Fail unless the current state is one of `allowed`, then move to `next`
    pub fn check_state(&mut self, allowed: &[ContainerState], next: ContainerState) -> Result<()> {
        self.require_state(allowed)?;
        self.state = next;
        Ok(())
    }

    pub fn require_state(&self, allowed: &[ContainerState]) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(PkgError::InvalidState(format!(
                "operation not allowed in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Enter Working once a load has parsed and verified
    ///
    /// A failed load drops any entries it decoded and restores `info`, leaving
    /// the container Idle so the load can be retried.
    pub fn finish_load(&mut self, loaded: Result<Vec<String>>, info: PackageInfo) -> Result<Vec<String>> {
        match loaded {
            Ok(names) => {
                self.state = ContainerState::Working;
                Ok(names)
            }
            Err(err) => {
                self.entries = EntryMap::new();
                self.info = info;
                self.cursor = 0;
                Err(err)
            }
        }
    }

    pub fn name(&self) -> String {
        match self.stream.try_borrow() {
            Ok(stream) => stream.name().to_string(),
            Err(_) => String::new(),
        }
    }

    /// Append the zeroed signature area at `offset` when the package is digested
    ///
    /// Returns the offset of this package's signature slot.
    pub fn append_sign_area(&mut self, pkg: &mut dyn ByteStream, offset: usize) -> Result<usize> {
        let method = self.info.digest_method;
        if method.signature_len() == 0 {
            self.cursor = offset;
            return Ok(offset);
        }
        pkg.write(&[0u8; SIGN_TOTAL_LEN], offset)?;
        self.cursor = offset + SIGN_TOTAL_LEN;
        debug!("Reserved signature area at {}", offset);
        Ok(offset + method.signature_slot())
    }

    pub fn extract(&mut self, name: &str, output: &mut dyn ByteStream) -> Result<()> {
        if self.state != ContainerState::Working {
            return Err(PkgError::InvalidState(format!(
                "cannot extract in state {:?}",
                self.state
            )));
        }
        let stream = self.stream.clone();
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| PkgError::InvalidParam(format!("no entry named {}", name)))?;
        let mut pkg = borrow_stream(&stream)?;
        entry.unpack(&mut *pkg, output)
    }
}

/// Map any verifier failure onto a signature error
pub(crate) fn signature_error(err: PkgError) -> PkgError {
    match err {
        PkgError::InvalidSignature(_) => err,
        other => PkgError::InvalidSignature(other.to_string()),
    }
}

/// Zero-fill `pkg` up to `offset` so later writes land inside the stream
pub(crate) fn pad_stream(pkg: &mut dyn ByteStream, offset: usize) -> Result<()> {
    let len = pkg.len();
    if len < offset {
        pkg.write(&vec![0u8; offset - len], len)?;
    }
    Ok(())
}

/// Current time as unix seconds
pub(crate) fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
