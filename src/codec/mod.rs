//! Streaming compression codecs
//!
//! Every codec moves bytes between two [`ByteStream`]s under a
//! [`CodecContext`]. Pack reads `unpacked_size` bytes at `src_offset` and
//! writes the encoded form at `dest_offset`; unpack does the reverse,
//! reading at most `packed_size` bytes. On success the offsets and sizes in
//! the context describe exactly what was consumed and produced, and the CRC
//! (plus the digest, when the method asks for one) covers the original data.

mod deflate;
mod lz4;
mod store;

pub use deflate::DeflateCodec;
pub(crate) use lz4::walk_block_chain;
pub use lz4::{
    block_size, decode_frame_params, Lz4BlockCodec, Lz4FrameCodec, LZ4B_MAGIC, LZ4_FRAME_MAGIC,
};
pub use store::StoreCodec;

use crate::algorithm::{digest_algorithm, DigestAlgorithm};
use crate::error::{PkgError, Result};
use crate::format::{DigestMethod, PackMethod};
use crate::info::FileInfo;
use crate::stream::ByteStream;

/// Offsets, sizes and integrity values for one pack or unpack pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecContext {
    pub src_offset: usize,
    pub dest_offset: usize,
    pub packed_size: usize,
    pub unpacked_size: usize,
    /// Expected CRC on unpack (zero skips the check); computed CRC afterwards
    pub crc: u32,
    pub digest_method: DigestMethod,
    /// Expected digest on unpack (empty skips the check); computed digest afterwards
    pub digest: Vec<u8>,
}

impl CodecContext {
    pub fn new(
        src_offset: usize,
        dest_offset: usize,
        packed_size: usize,
        unpacked_size: usize,
        digest_method: DigestMethod,
    ) -> Self {
        Self {
            src_offset,
            dest_offset,
            packed_size,
            unpacked_size,
            crc: 0,
            digest_method,
            digest: Vec::new(),
        }
    }
}

/// A compression engine
pub trait Codec {
    fn pack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()>;

    fn unpack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()>;
}

/// Codec for an entry's pack method
pub fn codec_for(info: &FileInfo) -> Result<Box<dyn Codec>> {
    Ok(match info.pack_method {
        PackMethod::None => Box::new(StoreCodec),
        PackMethod::Zip | PackMethod::Gzip => Box::new(DeflateCodec::new(info.zip_params().level)),
        PackMethod::Lz4 => Box::new(Lz4FrameCodec::new(info.lz4_params())),
        PackMethod::Lz4Block => Box::new(Lz4BlockCodec::new(info.lz4_params())),
    })
}

/// Running CRC32 and optional digest over the original bytes
pub(crate) struct Integrity {
    crc: crc32fast::Hasher,
    digest: Option<Box<dyn DigestAlgorithm>>,
}

impl Integrity {
    pub(crate) fn new(method: DigestMethod) -> Result<Self> {
        let digest = match method {
            DigestMethod::Sha256 | DigestMethod::Sha384 => {
                let mut algorithm = digest_algorithm(method)?;
                algorithm.init();
                Some(algorithm)
            }
            DigestMethod::None | DigestMethod::Crc => None,
        };
        Ok(Self {
            crc: crc32fast::Hasher::new(),
            digest,
        })
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        self.crc.update(data);
        if let Some(digest) = self.digest.as_mut() {
            digest.update(data);
        }
    }

    /// Record the computed values after pack
    pub(crate) fn finish_pack(self, ctx: &mut CodecContext) {
        ctx.crc = self.crc.finalize();
        if let Some(mut digest) = self.digest {
            ctx.digest = digest.finish();
        }
    }

    /// Check the computed values against the expectation in `ctx`, then record them
    pub(crate) fn finish_unpack(self, ctx: &mut CodecContext) -> Result<()> {
        let actual = self.crc.finalize();
        if ctx.crc != 0 && ctx.crc != actual {
            return Err(PkgError::CrcMismatch {
                expected: ctx.crc,
                actual,
            });
        }
        ctx.crc = actual;

        if let Some(mut digest) = self.digest {
            let computed = digest.finish();
            let expected_set = ctx.digest.iter().any(|&b| b != 0);
            if expected_set && ctx.digest != computed {
                return Err(PkgError::InvalidDigest(format!(
                    "expected {}, got {}",
                    hex::encode(&ctx.digest),
                    hex::encode(&computed)
                )));
            }
            ctx.digest = computed;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Deterministic, poorly compressible bytes
    pub fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    /// Repetitive text that compresses well
    pub fn text(len: usize) -> Vec<u8> {
        b"update package payload line\n"
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{FormatParams, Lz4Params};

    #[test]
    fn test_codec_factory() {
        for method in [
            PackMethod::None,
            PackMethod::Zip,
            PackMethod::Gzip,
            PackMethod::Lz4,
            PackMethod::Lz4Block,
        ] {
            let info = FileInfo::new("x", method)
                .with_params(FormatParams::Lz4(Lz4Params::default()));
            assert!(codec_for(&info).is_ok());
        }
    }

    #[test]
    fn test_integrity_detects_crc_mismatch() {
        let mut integrity = Integrity::new(DigestMethod::None).unwrap();
        integrity.update(b"payload");
        let mut ctx = CodecContext {
            crc: 0xDEADBEEF,
            ..CodecContext::default()
        };
        let err = integrity.finish_unpack(&mut ctx).unwrap_err();
        assert!(matches!(err, PkgError::CrcMismatch { expected: 0xDEADBEEF, .. }));
    }

    #[test]
    fn test_integrity_zero_digest_is_unchecked() {
        let mut integrity = Integrity::new(DigestMethod::Sha256).unwrap();
        integrity.update(b"abc");
        let mut ctx = CodecContext {
            digest: vec![0u8; 32],
            digest_method: DigestMethod::Sha256,
            ..CodecContext::default()
        };
        integrity.finish_unpack(&mut ctx).unwrap();
        assert_eq!(
            hex::encode(&ctx.digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
