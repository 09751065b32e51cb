use super::{Codec, CodecContext, Integrity};
use crate::error::Result;
use crate::stream::{read_data, ByteStream};

const STORE_BUFFER_SIZE: usize = 64 * 1024;

/// Uncompressed copy
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCodec;

impl StoreCodec {
    fn copy(
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
        size: usize,
    ) -> Result<Integrity> {
        let mut integrity = Integrity::new(ctx.digest_method)?;
        let mut buffer = vec![0u8; STORE_BUFFER_SIZE.min(size.max(1))];
        let mut remaining = size;
        while remaining > 0 {
            let read = read_data(input, ctx.src_offset, &mut buffer, &mut remaining)?;
            integrity.update(&buffer[..read]);
            output.write(&buffer[..read], ctx.dest_offset)?;
            ctx.src_offset += read;
            ctx.dest_offset += read;
        }
        Ok(integrity)
    }
}

impl Codec for StoreCodec {
    fn pack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()> {
        let size = ctx.unpacked_size;
        let integrity = Self::copy(input, output, ctx, size)?;
        ctx.packed_size = size;
        integrity.finish_pack(ctx);
        Ok(())
    }

    fn unpack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()> {
        let size = ctx.packed_size;
        let integrity = Self::copy(input, output, ctx, size)?;
        ctx.unpacked_size = size;
        integrity.finish_unpack(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::noise;
    use crate::error::PkgError;
    use crate::format::DigestMethod;
    use crate::stream::MemoryStream;

    #[test]
    fn test_store_roundtrip_with_digest() {
        let data = noise(150_000, 7);
        let mut input = MemoryStream::borrowed("in", &data);
        let mut packed = MemoryStream::growable("packed");
        let mut ctx = CodecContext::new(0, 16, 0, data.len(), DigestMethod::Sha256);
        packed.write(&[0u8; 16], 0).unwrap();

        StoreCodec.pack(&mut input, &mut packed, &mut ctx).unwrap();
        assert_eq!(ctx.packed_size, data.len());
        assert_eq!(ctx.src_offset, data.len());
        assert_eq!(ctx.dest_offset, 16 + data.len());
        assert_eq!(ctx.crc, crc32fast::hash(&data));
        assert_eq!(ctx.digest.len(), 32);

        let mut output = MemoryStream::growable("out");
        let mut unpack_ctx = CodecContext::new(16, 0, data.len(), 0, DigestMethod::Sha256);
        unpack_ctx.crc = ctx.crc;
        unpack_ctx.digest = ctx.digest.clone();
        StoreCodec.unpack(&mut packed, &mut output, &mut unpack_ctx).unwrap();
        assert_eq!(output.as_slice(), &data[..]);
        assert_eq!(unpack_ctx.unpacked_size, data.len());
    }

    #[test]
    fn test_store_digest_mismatch() {
        let data = b"component data".to_vec();
        let mut input = MemoryStream::borrowed("in", &data);
        let mut output = MemoryStream::growable("out");
        let mut ctx = CodecContext::new(0, 0, data.len(), 0, DigestMethod::Sha256);
        ctx.digest = vec![0x11; 32];

        let err = StoreCodec.unpack(&mut input, &mut output, &mut ctx).unwrap_err();
        assert!(matches!(err, PkgError::InvalidDigest(_)));
    }

    #[test]
    fn test_store_short_input() {
        let data = b"short".to_vec();
        let mut input = MemoryStream::borrowed("in", &data);
        let mut output = MemoryStream::growable("out");
        let mut ctx = CodecContext::new(0, 0, 0, 10, DigestMethod::None);

        let err = StoreCodec.pack(&mut input, &mut output, &mut ctx).unwrap_err();
        assert!(matches!(err, PkgError::InvalidStream(_)));
    }
}
