//! Digest and signature algorithms

mod digest;
mod sign;

pub use digest::{
    digest_algorithm, digest_stream, Crc32Digest, DigestAlgorithm, Sha256Digest, Sha384Digest,
};
pub use sign::{
    sign_algorithm, verify_algorithm, CertVerifier, EccSigner, RsaSigner, SignAlgorithm,
};
