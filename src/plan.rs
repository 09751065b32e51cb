//! Declarative package plans
//!
//! A plan names the package header and the files to put in it. Plans are
//! written in TOML or JSON:
//!
//! ```toml
//! [header]
//! package_type = "upgrade"
//! sign_method = "rsa"
//! digest_method = "sha256"
//! software_version = "2.1.0"
//!
//! [[files]]
//! source = "images/kernel.img"
//! identity = "kernel"
//! params = { format = "component", id = 1, version = "5.10" }
//! ```
//!
//! Relative sources resolve against the directory of the plan file.

use crate::error::{PkgError, Result};
use crate::format::{DigestMethod, PackMethod, PackageType};
use crate::info::{FileInfo, FormatParams, PackageInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Component identities are stored in a 16 byte field
const UPGRADE_IDENTITY_LEN: usize = 16;

/// ZIP names carry a 16-bit length
const ZIP_IDENTITY_LEN: usize = u16::MAX as usize;

/// One file to add to a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    /// Path of the input file
    pub source: PathBuf,

    /// Name inside the package; the source file name when empty
    #[serde(default)]
    pub identity: String,

    #[serde(default)]
    pub pack_method: PackMethod,

    #[serde(default)]
    pub digest_method: DigestMethod,

    #[serde(default)]
    pub params: FormatParams,

    /// Expected SHA-256 of the source, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl PlanFile {
    pub fn new(source: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            identity: identity.into(),
            pack_method: PackMethod::None,
            digest_method: DigestMethod::None,
            params: FormatParams::None,
            sha256: None,
        }
    }

    /// Identity, falling back to the source file name
    pub fn resolved_identity(&self) -> String {
        if !self.identity.is_empty() {
            return self.identity.clone();
        }
        self.source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Decoded `sha256`, if one was given
    pub fn expected_digest(&self) -> Result<Option<Vec<u8>>> {
        let Some(text) = &self.sha256 else {
            return Ok(None);
        };
        let digest = hex::decode(text.trim()).map_err(|e| {
            PkgError::InvalidParam(format!("bad sha256 for {}: {}", self.source.display(), e))
        })?;
        if digest.len() != DigestMethod::Sha256.digest_len() {
            return Err(PkgError::InvalidParam(format!(
                "sha256 for {} has {} bytes",
                self.source.display(),
                digest.len()
            )));
        }
        Ok(Some(digest))
    }
}

/// A package to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePlan {
    pub header: PackageInfo,

    #[serde(default)]
    pub files: Vec<PlanFile>,

    /// Directory that relative sources resolve against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl PackagePlan {
    pub fn new(header: PackageInfo) -> Self {
        Self {
            header,
            files: Vec::new(),
            base_dir: None,
        }
    }

    pub fn add_file(&mut self, file: PlanFile) {
        self.files.push(file);
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(PkgError::from)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(PkgError::from)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Load a plan file; `.json` files are JSON, anything else TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            PkgError::InvalidFile(format!("cannot read plan {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let mut plan = if is_json {
            Self::from_json(&data)?
        } else {
            Self::from_toml_str(&String::from_utf8_lossy(&data))?
        };
        plan.base_dir = path.parent().map(Path::to_path_buf);
        Ok(plan)
    }

    /// Check the plan can be built
    pub fn validate(&self) -> Result<()> {
        let package_type = self.header.package_type;
        if package_type == PackageType::None {
            return Err(PkgError::InvalidParam(
                "plan does not name a package type".to_string(),
            ));
        }
        if self.files.is_empty() {
            return Err(PkgError::InvalidParam("plan has no files".to_string()));
        }
        if matches!(package_type, PackageType::Lz4 | PackageType::Gzip) && self.files.len() != 1 {
            return Err(PkgError::InvalidParam(format!(
                "{:?} packages hold exactly one file, plan has {}",
                package_type,
                self.files.len()
            )));
        }
        if package_type == PackageType::Upgrade
            && self.header.entry_count != 0
            && self.header.entry_count as usize != self.files.len()
        {
            return Err(PkgError::InvalidParam(format!(
                "header declares {} components, plan has {}",
                self.header.entry_count,
                self.files.len()
            )));
        }

        let limit = max_identity_len(package_type);
        let mut seen = HashSet::new();
        for file in &self.files {
            let identity = file.resolved_identity();
            if identity.is_empty() {
                return Err(PkgError::InvalidParam(format!(
                    "no identity for {}",
                    file.source.display()
                )));
            }
            if identity.len() > limit {
                return Err(PkgError::InvalidParam(format!(
                    "identity {} is longer than {} bytes",
                    identity, limit
                )));
            }
            if !seen.insert(identity.clone()) {
                return Err(PkgError::InvalidParam(format!(
                    "duplicate identity {}",
                    identity
                )));
            }
            file.expected_digest()?;
        }
        Ok(())
    }

    /// Header with the entry count filled in
    pub fn header(&self) -> PackageInfo {
        let mut header = self.header.clone();
        if header.package_type == PackageType::Upgrade && header.entry_count == 0 {
            header.entry_count = self.files.len() as u32;
        }
        header
    }

    /// Source paths and entry metadata, in plan order
    pub fn file_infos(&self) -> Vec<(PathBuf, FileInfo)> {
        self.files
            .iter()
            .map(|file| {
                let source = match &self.base_dir {
                    Some(dir) if file.source.is_relative() => dir.join(&file.source),
                    _ => file.source.clone(),
                };
                let info = FileInfo::new(file.resolved_identity(), file.pack_method)
                    .with_digest(file.digest_method)
                    .with_params(file.params.clone());
                (source, info)
            })
            .collect()
    }
}

/// Longest identity a package type can store
pub fn max_identity_len(package_type: PackageType) -> usize {
    match package_type {
        PackageType::Upgrade => UPGRADE_IDENTITY_LEN,
        PackageType::Zip => ZIP_IDENTITY_LEN,
        PackageType::Gzip | PackageType::Lz4 | PackageType::None => usize::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SignMethod;
    use crate::info::ComponentParams;

    const UPGRADE_PLAN: &str = r#"
[header]
package_type = "upgrade"
sign_method = "rsa"
digest_method = "sha256"
software_version = "2.1.0"

[[files]]
source = "images/kernel.img"
identity = "kernel"
params = { format = "component", id = 1, version = "5.10" }

[[files]]
source = "images/rootfs.img"
sha256 = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
"#;

    #[test]
    fn test_parse_toml_plan() {
        let plan = PackagePlan::from_toml_str(UPGRADE_PLAN).unwrap();
        plan.validate().unwrap();
        assert_eq!(plan.header.package_type, PackageType::Upgrade);
        assert_eq!(plan.header.sign_method, SignMethod::Rsa);
        assert_eq!(plan.header().entry_count, 2);

        let infos = plan.file_infos();
        assert_eq!(infos[0].1.identity, "kernel");
        assert_eq!(infos[1].1.identity, "rootfs.img");
        assert_eq!(
            infos[0].1.component(),
            Some(&ComponentParams {
                id: 1,
                version: "5.10".to_string(),
                ..ComponentParams::default()
            })
        );
        assert_eq!(plan.files[1].expected_digest().unwrap().unwrap().len(), 32);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut plan = PackagePlan::new(PackageInfo::new(PackageType::Zip));
        plan.add_file(PlanFile {
            pack_method: PackMethod::Zip,
            ..PlanFile::new("notes.txt", "docs/notes.txt")
        });
        let json = plan.to_json().unwrap();
        assert_eq!(PackagePlan::from_json(&json).unwrap(), plan);
    }

    #[test]
    fn test_validation_errors() {
        let empty = PackagePlan::new(PackageInfo::new(PackageType::Zip));
        assert!(empty.validate().unwrap_err().to_string().contains("no files"));

        let mut duplicate = PackagePlan::new(PackageInfo::new(PackageType::Zip));
        duplicate.add_file(PlanFile::new("a/x.txt", ""));
        duplicate.add_file(PlanFile::new("b/x.txt", ""));
        assert!(duplicate
            .validate()
            .unwrap_err()
            .to_string()
            .contains("duplicate identity x.txt"));

        let mut long = PackagePlan::new(PackageInfo::new(PackageType::Upgrade));
        long.add_file(PlanFile::new("k.img", "a-very-long-component-name"));
        assert!(long.validate().is_err());

        let mut gzip = PackagePlan::new(PackageInfo::new(PackageType::Gzip));
        gzip.add_file(PlanFile::new("a", "a"));
        gzip.add_file(PlanFile::new("b", "b"));
        assert!(gzip.validate().is_err());

        let mut bad_hex = PackagePlan::new(PackageInfo::new(PackageType::Zip));
        bad_hex.add_file(PlanFile {
            sha256: Some("abcd".to_string()),
            ..PlanFile::new("a", "a")
        });
        assert!(matches!(bad_hex.validate(), Err(PkgError::InvalidParam(_))));
    }

    #[test]
    fn test_relative_sources_resolve_against_plan_dir() {
        let mut plan = PackagePlan::from_toml_str(UPGRADE_PLAN).unwrap();
        plan.base_dir = Some(PathBuf::from("/srv/build"));
        let infos = plan.file_infos();
        assert_eq!(infos[0].0, PathBuf::from("/srv/build/images/kernel.img"));
    }
}
