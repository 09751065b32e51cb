//! Package signing and verification
//!
//! Signs packages with the RSA-2048 and ECDSA P-256 fixture keys, verifies
//! them against the matching certificates and checks that tampering and weak
//! certificates are rejected.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use update_pkg::algorithm::{sign_algorithm, verify_algorithm, Sha256Digest};
use update_pkg::{
    CertVerifier, DigestAlgorithm, DigestMethod, FileInfo, PackMethod, PackageInfo,
    PackageManager, PackageType, PkgError, SignAlgorithm, SignMethod, SIGN_TOTAL_LEN,
};

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

fn fixture(name: &str) -> PathBuf {
    Path::new(FIXTURES).join(name)
}

/// Helper: Corrupt bytes at specific offset
fn corrupt_byte_at(path: &Path, offset: u64) {
    let data = fs::read(path).unwrap();
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[data[offset as usize] ^ 0xff]).unwrap();
}

/// Helper: Build a signed one-file zip package
fn signed_zip(dir: &TempDir, sign_method: SignMethod, key: &str) -> PathBuf {
    let source = dir.path().join("a.txt");
    fs::write(&source, b"hello").unwrap();
    let output = dir.path().join("signed.zip");
    let header = PackageInfo::new(PackageType::Zip).with_signing(sign_method, DigestMethod::Sha256);

    let mut manager = PackageManager::default();
    manager
        .create_package(
            &output,
            Some(fixture(key).as_path()),
            &header,
            &[(source, FileInfo::new("a.txt", PackMethod::None))],
        )
        .unwrap();
    output
}

/// Helper: Build a signed one-component upgrade package
fn signed_upgrade(dir: &TempDir, digest_method: DigestMethod) -> PathBuf {
    let source = dir.path().join("kernel.img");
    fs::write(&source, vec![0x5a; 4096]).unwrap();
    let output = dir.path().join("update.bin");
    let header = PackageInfo::new(PackageType::Upgrade).with_signing(SignMethod::Rsa, digest_method);

    let mut manager = PackageManager::default();
    manager
        .create_package(
            &output,
            Some(fixture("rsa2048_key.pem").as_path()),
            &header,
            &[(source, FileInfo::new("kernel", PackMethod::None))],
        )
        .unwrap();
    output
}

#[test]
fn test_rsa_sign_and_verify_digest() {
    let digest = Sha256Digest::default().calculate(b"fixed digest input");
    let signer = sign_algorithm(fixture("rsa2048_key.pem"), SignMethod::Rsa, DigestMethod::Sha256).unwrap();
    let mut signature = signer.sign(&digest).unwrap();
    assert_eq!(signature.len(), 256);

    let verifier = verify_algorithm(fixture("rsa2048_cert.pem"), DigestMethod::Sha256).unwrap();
    verifier.verify(&digest, &signature).unwrap();

    signature[17] ^= 0x01;
    let err = verifier.verify(&digest, &signature).unwrap_err();
    assert!(matches!(err, PkgError::InvalidSignature(_)));

    signature[17] ^= 0x01;
    let mut other = digest.clone();
    other[0] ^= 0x80;
    assert!(verifier.verify(&other, &signature).is_err());
}

#[test]
fn test_ecdsa_signature_carries_length_prefix() {
    let digest = Sha256Digest::default().calculate(b"abc");
    let signer = sign_algorithm(fixture("ec256_key.pem"), SignMethod::Ecdsa, DigestMethod::Sha256).unwrap();
    let signature = signer.sign(&digest).unwrap();

    let prefix = u32::from_le_bytes([signature[0], signature[1], signature[2], signature[3]]) as usize;
    assert_eq!(prefix + 4, signature.len());
    assert_eq!(signature[4], 0x30);

    let verifier = verify_algorithm(fixture("ec256_cert.pem"), DigestMethod::Sha256).unwrap();
    verifier.verify(&digest, &signature).unwrap();
}

#[test]
fn test_weak_certificates_rejected() {
    for cert in ["rsa1024_cert.pem", "ec384_cert.pem"] {
        let err = CertVerifier::from_pem_file(fixture(cert), DigestMethod::Sha256)
            .err()
            .unwrap();
        assert!(
            matches!(err, PkgError::InvalidSignature(_)),
            "{} should be rejected, got {:?}",
            cert,
            err
        );
    }
    CertVerifier::from_pem_file(fixture("rsa2048_cert.pem"), DigestMethod::Sha256).unwrap();
    CertVerifier::from_pem_file(fixture("ec256_cert.pem"), DigestMethod::Sha256).unwrap();
}

#[test]
fn test_signed_zip_loads_with_certificate() {
    let dir = TempDir::new().unwrap();
    for (method, key, cert) in [
        (SignMethod::Rsa, "rsa2048_key.pem", "rsa2048_cert.pem"),
        (SignMethod::Ecdsa, "ec256_key.pem", "ec256_cert.pem"),
    ] {
        let output = signed_zip(&dir, method, key);
        let mut manager = PackageManager::default();
        let ids = manager.load_package(&output, Some(fixture(cert).as_path())).unwrap();
        assert_eq!(ids, vec!["a.txt"]);
    }
}

#[test]
fn test_signed_zip_with_wrong_certificate() {
    let dir = TempDir::new().unwrap();
    let output = signed_zip(&dir, SignMethod::Rsa, "rsa2048_key.pem");

    let mut manager = PackageManager::default();
    let err = manager
        .load_package(&output, Some(fixture("ec256_cert.pem").as_path()))
        .unwrap_err();
    assert!(matches!(err, PkgError::InvalidSignature(_)));

    let err = manager
        .load_package(&output, Some(fixture("rsa1024_cert.pem").as_path()))
        .unwrap_err();
    assert!(matches!(err, PkgError::InvalidSignature(_)));
}

#[test]
fn test_tampered_zip_payload_rejected() {
    let dir = TempDir::new().unwrap();
    let output = signed_zip(&dir, SignMethod::Rsa, "rsa2048_key.pem");

    // Stored data follows the 30 byte local header and the name
    corrupt_byte_at(&output, 30 + "a.txt".len() as u64);

    let mut manager = PackageManager::default();
    let err = manager
        .load_package(&output, Some(fixture("rsa2048_cert.pem").as_path()))
        .unwrap_err();
    assert!(matches!(err, PkgError::InvalidSignature(_)));
    assert!(manager.loaded_packages().is_empty());
}

#[test]
fn test_tampered_zip_signature_rejected() {
    let dir = TempDir::new().unwrap();
    let output = signed_zip(&dir, SignMethod::Rsa, "rsa2048_key.pem");
    let len = fs::metadata(&output).unwrap().len();
    corrupt_byte_at(&output, len - SIGN_TOTAL_LEN as u64 + 10);

    let mut manager = PackageManager::default();
    assert!(manager
        .load_package(&output, Some(fixture("rsa2048_cert.pem").as_path()))
        .is_err());
}

#[test]
fn test_signed_upgrade_roundtrip() {
    let dir = TempDir::new().unwrap();
    for method in [DigestMethod::Sha256, DigestMethod::Sha384] {
        let output = signed_upgrade(&dir, method);
        let mut manager = PackageManager::default();
        let ids = manager
            .load_package(&output, Some(fixture("rsa2048_cert.pem").as_path()))
            .unwrap();
        assert_eq!(ids, vec!["kernel"]);
        assert_eq!(manager.package_info(&output).unwrap().digest_method, method);
    }
}

#[test]
fn test_tampered_upgrade_rejected() {
    let dir = TempDir::new().unwrap();
    let output = signed_upgrade(&dir, DigestMethod::Sha256);
    let len = fs::metadata(&output).unwrap().len();
    corrupt_byte_at(&output, len - 1);

    let mut manager = PackageManager::default();
    let err = manager
        .load_package(&output, Some(fixture("rsa2048_cert.pem").as_path()))
        .unwrap_err();
    assert!(matches!(err, PkgError::InvalidSignature(_)));
}

#[test]
fn test_upgrade_load_requires_certificate() {
    let dir = TempDir::new().unwrap();
    let output = signed_upgrade(&dir, DigestMethod::Sha256);

    let mut manager = PackageManager::default();
    let err = manager.load_package(&output, None).unwrap_err();
    assert!(matches!(err, PkgError::InvalidParam(_)));
}

#[test]
fn test_verify_signed_zip_reports_progress() {
    let dir = TempDir::new().unwrap();
    let output = signed_zip(&dir, SignMethod::Rsa, "rsa2048_key.pem");
    let expected = Sha256Digest::default().calculate(&fs::read(&output).unwrap());

    let mut events = Vec::new();
    let mut manager = PackageManager::default();
    manager
        .verify_package(
            &output,
            &fixture("rsa2048_cert.pem"),
            "1.0",
            Some(&expected),
            &mut |result: Result<(), &PkgError>, percent: u32| events.push((result.is_ok(), percent)),
        )
        .unwrap();
    assert_eq!(events, vec![(true, 50), (true, 100)]);
}

#[test]
fn test_verify_reports_failure() {
    let dir = TempDir::new().unwrap();
    let output = signed_zip(&dir, SignMethod::Rsa, "rsa2048_key.pem");
    let wrong = vec![0u8; 32];

    let mut events = Vec::new();
    let mut manager = PackageManager::default();
    let err = manager
        .verify_package(
            &output,
            &fixture("rsa2048_cert.pem"),
            "1.0",
            Some(&wrong),
            &mut |result: Result<(), &PkgError>, percent: u32| events.push((result.is_ok(), percent)),
        )
        .unwrap_err();
    assert!(matches!(err, PkgError::InvalidSignature(_)));
    assert_eq!(events, vec![(false, 100)]);

    // A digest of the wrong width is a caller error
    events.clear();
    let err = manager
        .verify_package(
            &output,
            &fixture("rsa2048_cert.pem"),
            "sha384",
            Some(&wrong),
            &mut |result: Result<(), &PkgError>, percent: u32| events.push((result.is_ok(), percent)),
        )
        .unwrap_err();
    assert!(matches!(err, PkgError::InvalidParam(_)));
}

#[test]
fn test_verify_upgrade_digest_only() {
    let dir = TempDir::new().unwrap();
    let output = signed_upgrade(&dir, DigestMethod::Sha256);
    let expected = Sha256Digest::default().calculate(&fs::read(&output).unwrap());

    let mut events = Vec::new();
    let mut manager = PackageManager::default();
    manager
        .verify_package(
            &output,
            &fixture("rsa2048_cert.pem"),
            "",
            Some(&expected),
            &mut |result: Result<(), &PkgError>, percent: u32| events.push((result.is_ok(), percent)),
        )
        .unwrap();
    assert_eq!(events, vec![(true, 100)]);
}

#[test]
fn test_create_package_digest() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("kernel.img");
    fs::write(&source, b"kernel bytes").unwrap();
    let output = dir.path().join("digest.bin");

    let mut manager = PackageManager::default();
    let digest = manager
        .create_package_digest(
            &output,
            &PackageInfo::new(PackageType::Upgrade),
            &[(source, FileInfo::new("kernel", PackMethod::None))],
        )
        .unwrap();
    let expected = Sha256Digest::default().calculate(&fs::read(&output).unwrap());
    assert_eq!(digest, hex::encode(expected));
}
