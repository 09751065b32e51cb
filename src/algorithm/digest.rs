use crate::error::{PkgError, Result};
use crate::format::DigestMethod;
use crate::stream::{read_data, ByteStream};
use sha2::{Digest, Sha256, Sha384};
use std::ops::Range;

/// Incremental digest with an Init/Update/Final lifecycle
pub trait DigestAlgorithm {
    fn method(&self) -> DigestMethod;

    /// Reset to the initial state
    fn init(&mut self);

    fn update(&mut self, data: &[u8]);

    /// Produce the digest and reset
    fn finish(&mut self) -> Vec<u8>;

    /// One-shot digest of `data`
    fn calculate(&mut self, data: &[u8]) -> Vec<u8> {
        self.init();
        self.update(data);
        self.finish()
    }
}

/// CRC32; the digest is the little-endian checksum
#[derive(Default)]
pub struct Crc32Digest {
    hasher: crc32fast::Hasher,
}

impl DigestAlgorithm for Crc32Digest {
    fn method(&self) -> DigestMethod {
        DigestMethod::Crc
    }

    fn init(&mut self) {
        self.hasher = crc32fast::Hasher::new();
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.hasher)
            .finalize()
            .to_le_bytes()
            .to_vec()
    }
}

#[derive(Default)]
pub struct Sha256Digest {
    hasher: Sha256,
}

impl DigestAlgorithm for Sha256Digest {
    fn method(&self) -> DigestMethod {
        DigestMethod::Sha256
    }

    fn init(&mut self) {
        self.hasher = Sha256::new();
    }

    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.hasher, data);
    }

    fn finish(&mut self) -> Vec<u8> {
        self.hasher.finalize_reset().to_vec()
    }
}

#[derive(Default)]
pub struct Sha384Digest {
    hasher: Sha384,
}

impl DigestAlgorithm for Sha384Digest {
    fn method(&self) -> DigestMethod {
        DigestMethod::Sha384
    }

    fn init(&mut self) {
        self.hasher = Sha384::new();
    }

    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.hasher, data);
    }

    fn finish(&mut self) -> Vec<u8> {
        self.hasher.finalize_reset().to_vec()
    }
}

/// Digest algorithm for a method
pub fn digest_algorithm(method: DigestMethod) -> Result<Box<dyn DigestAlgorithm>> {
    match method {
        DigestMethod::Crc => Ok(Box::new(Crc32Digest::default())),
        DigestMethod::Sha256 => Ok(Box::new(Sha256Digest::default())),
        DigestMethod::Sha384 => Ok(Box::new(Sha384Digest::default())),
        DigestMethod::None => Err(PkgError::NotExistAlgorithm(
            "no digest algorithm for method none".to_string(),
        )),
    }
}

/// Digest a whole stream, hashing `zeroed` as if it were all zero bytes
///
/// Used to compute package digests with the signature area blanked.
pub fn digest_stream(
    stream: &mut dyn ByteStream,
    method: DigestMethod,
    zeroed: Option<Range<usize>>,
    buffer_size: usize,
) -> Result<Vec<u8>> {
    let mut algorithm = digest_algorithm(method)?;
    algorithm.init();

    let length = stream.len();
    let zeroed = zeroed.unwrap_or(length..length);
    if zeroed.start > zeroed.end || zeroed.end > length {
        return Err(PkgError::InvalidParam(format!(
            "zeroed range {:?} outside stream of {} bytes",
            zeroed, length
        )));
    }

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut offset = 0;
    while offset < length {
        let chunk_end = if offset < zeroed.start {
            zeroed.start
        } else if offset < zeroed.end {
            zeroed.end
        } else {
            length
        };
        let mut remaining = chunk_end - offset;
        if offset >= zeroed.start && offset < zeroed.end {
            let zeros = [0u8; 1024];
            while remaining > 0 {
                let count = remaining.min(zeros.len());
                algorithm.update(&zeros[..count]);
                remaining -= count;
                offset += count;
            }
            continue;
        }
        while remaining > 0 {
            let read = read_data(stream, offset, &mut buffer, &mut remaining)?;
            algorithm.update(&buffer[..read]);
            offset += read;
        }
    }

    Ok(algorithm.finish())
}
