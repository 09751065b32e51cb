use crate::error::{PkgError, Result};
use crate::format::{DigestMethod, SignMethod};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha384};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_PRIME256V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");

/// Required RSA modulus size
const RSA_KEY_BITS: usize = 2048;

/// Length prefix in front of a DER ECDSA signature
const ECC_LEN_PREFIX: usize = 4;

/// Signs digests and verifies signatures over digests
pub trait SignAlgorithm {
    fn sign(&self, _digest: &[u8]) -> Result<Vec<u8>> {
        Err(PkgError::NotExistAlgorithm(
            "algorithm can only verify".to_string(),
        ))
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()>;
}

fn pkcs1_scheme(method: DigestMethod) -> Result<Pkcs1v15Sign> {
    match method {
        DigestMethod::Sha256 => Ok(Pkcs1v15Sign::new::<Sha256>()),
        DigestMethod::Sha384 => Ok(Pkcs1v15Sign::new::<Sha384>()),
        other => Err(PkgError::NotExistAlgorithm(format!(
            "rsa signatures need sha256 or sha384, got {:?}",
            other
        ))),
    }
}

fn read_pem<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .map_err(|e| PkgError::InvalidFile(format!("cannot read key {}: {}", path.display(), e)))
}

fn rsa_verify(key: &RsaPublicKey, method: DigestMethod, digest: &[u8], signature: &[u8]) -> Result<()> {
    // The signature slot may be wider than the modulus
    let signature = &signature[..signature.len().min(key.size())];
    key.verify(pkcs1_scheme(method)?, digest, signature)
        .map_err(|e| PkgError::InvalidSignature(format!("rsa verification failed: {}", e)))
}

fn ecc_verify(key: &VerifyingKey, digest: &[u8], signature: &[u8]) -> Result<()> {
    if signature.len() < ECC_LEN_PREFIX {
        return Err(PkgError::InvalidSignature(
            "ecdsa signature shorter than its length prefix".to_string(),
        ));
    }
    let mut prefix = [0u8; ECC_LEN_PREFIX];
    prefix.copy_from_slice(&signature[..ECC_LEN_PREFIX]);
    let der_len = u32::from_le_bytes(prefix) as usize;
    if der_len == 0 || der_len > signature.len() - ECC_LEN_PREFIX {
        return Err(PkgError::InvalidSignature(format!(
            "ecdsa signature length {} out of range",
            der_len
        )));
    }

    let der = &signature[ECC_LEN_PREFIX..ECC_LEN_PREFIX + der_len];
    let signature = Signature::from_der(der)?;
    key.verify_prehash(digest, &signature)
        .map_err(|e| PkgError::InvalidSignature(format!("ecdsa verification failed: {}", e)))
}

/// RSA PKCS#1 v1.5 signer
pub struct RsaSigner {
    key: RsaPrivateKey,
    digest_method: DigestMethod,
}

impl RsaSigner {
    /// Load a PEM private key, PKCS#8 or PKCS#1
    pub fn from_pem(pem: &str, digest_method: DigestMethod) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| PkgError::InvalidParam(format!("invalid rsa private key: {}", e)))?;
        pkcs1_scheme(digest_method)?;
        Ok(Self { key, digest_method })
    }

    pub fn from_pem_file<P: AsRef<Path>>(path: P, digest_method: DigestMethod) -> Result<Self> {
        Self::from_pem(&read_pem(path)?, digest_method)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }
}

impl SignAlgorithm for RsaSigner {
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let scheme = pkcs1_scheme(self.digest_method)?;
        let signature = self.key.sign_with_rng(&mut rand::thread_rng(), scheme, digest)?;
        debug!("RSA signature of {} bytes", signature.len());
        Ok(signature)
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        rsa_verify(&self.public_key(), self.digest_method, digest, signature)
    }
}

/// ECDSA P-256 signer
///
/// Signatures are stored as `[u32 LE length][DER signature]`.
pub struct EccSigner {
    key: SigningKey,
}

impl EccSigner {
    /// Load a PEM private key, PKCS#8 or SEC1
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = match SigningKey::from_pkcs8_pem(pem) {
            Ok(key) => key,
            Err(_) => {
                let secret = p256::SecretKey::from_sec1_pem(pem).map_err(|e| {
                    PkgError::InvalidParam(format!("invalid ecdsa private key: {}", e))
                })?;
                SigningKey::from(secret)
            }
        };
        Ok(Self { key })
    }

    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_pem(&read_pem(path)?)
    }
}

impl SignAlgorithm for EccSigner {
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self.key.sign_prehash(digest)?;
        let der = signature.to_der();
        let der = der.as_bytes();

        let mut out = Vec::with_capacity(ECC_LEN_PREFIX + der.len());
        out.extend_from_slice(&(der.len() as u32).to_le_bytes());
        out.extend_from_slice(der);
        Ok(out)
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        ecc_verify(self.key.verifying_key(), digest, signature)
    }
}

enum PublicKey {
    Rsa(RsaPublicKey),
    Ecdsa(VerifyingKey),
}

/// Verifies signatures with the public key of an X.509 certificate
///
/// Only strong keys are trusted: RSA moduli of exactly 2048 bits with a
/// public exponent of 3 or 65537, and EC keys on prime256v1.
pub struct CertVerifier {
    key: PublicKey,
    digest_method: DigestMethod,
}

impl CertVerifier {
    /// Load a PEM certificate and check its key against the strength policy
    pub fn from_pem(pem: &[u8], digest_method: DigestMethod) -> Result<Self> {
        let cert = Certificate::from_pem(pem)
            .map_err(|e| PkgError::InvalidSignature(format!("invalid certificate: {}", e)))?;
        let spki = &cert.tbs_certificate.subject_public_key_info;
        let spki_der = spki.to_der()?;

        let key = if spki.algorithm.oid == OID_RSA_ENCRYPTION {
            let key = RsaPublicKey::from_public_key_der(&spki_der)
                .map_err(|e| PkgError::InvalidSignature(format!("invalid rsa key: {}", e)))?;
            check_rsa_strength(&key)?;
            PublicKey::Rsa(key)
        } else if spki.algorithm.oid == OID_EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|params| params.decode_as::<ObjectIdentifier>().ok());
            if curve != Some(OID_PRIME256V1) {
                warn!("Rejecting certificate key on curve {:?}", curve);
                return Err(PkgError::InvalidSignature(
                    "ec key must use a 256-bit curve".to_string(),
                ));
            }
            let key = VerifyingKey::from_public_key_der(&spki_der)
                .map_err(|e| PkgError::InvalidSignature(format!("invalid ec key: {}", e)))?;
            PublicKey::Ecdsa(key)
        } else {
            return Err(PkgError::InvalidSignature(format!(
                "unsupported key algorithm {}",
                spki.algorithm.oid
            )));
        };

        Ok(Self { key, digest_method })
    }

    pub fn from_pem_file<P: AsRef<Path>>(path: P, digest_method: DigestMethod) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read(path).map_err(|e| {
            PkgError::InvalidFile(format!("cannot read certificate {}: {}", path.display(), e))
        })?;
        Self::from_pem(&pem, digest_method)
    }
}

fn check_rsa_strength(key: &RsaPublicKey) -> Result<()> {
    let bits = key.n().bits();
    if bits != RSA_KEY_BITS {
        warn!("Rejecting {}-bit rsa key", bits);
        return Err(PkgError::InvalidSignature(format!(
            "rsa key must be {} bits, got {}",
            RSA_KEY_BITS, bits
        )));
    }
    let exponent = key.e();
    if *exponent != BigUint::from(3u32) && *exponent != BigUint::from(65537u32) {
        return Err(PkgError::InvalidSignature(format!(
            "unsupported rsa public exponent {}",
            exponent
        )));
    }
    Ok(())
}

impl SignAlgorithm for CertVerifier {
    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        match &self.key {
            PublicKey::Rsa(key) => rsa_verify(key, self.digest_method, digest, signature),
            PublicKey::Ecdsa(key) => ecc_verify(key, digest, signature),
        }
    }
}

/// Signer for a private key file
pub fn sign_algorithm<P: AsRef<Path>>(
    key_path: P,
    sign_method: SignMethod,
    digest_method: DigestMethod,
) -> Result<Box<dyn SignAlgorithm>> {
    match sign_method {
        SignMethod::Rsa => Ok(Box::new(RsaSigner::from_pem_file(key_path, digest_method)?)),
        SignMethod::Ecdsa => Ok(Box::new(EccSigner::from_pem_file(key_path)?)),
        SignMethod::None => Err(PkgError::NotExistAlgorithm(
            "no signer for sign method none".to_string(),
        )),
    }
}

/// Verifier for a certificate file
pub fn verify_algorithm<P: AsRef<Path>>(
    cert_path: P,
    digest_method: DigestMethod,
) -> Result<Box<dyn SignAlgorithm>> {
    Ok(Box::new(CertVerifier::from_pem_file(cert_path, digest_method)?))
}
