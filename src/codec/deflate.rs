use super::{Codec, CodecContext, Integrity};
use crate::error::{PkgError, Result};
use crate::stream::{read_data, ByteStream};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::debug;

const INPUT_BUFFER_SIZE: usize = 32 * 1024;
const OUTPUT_BUFFER_SIZE: usize = 4 * 1024;

/// Inflate calls in a row that may make no progress before the stream is declared malformed
const MAX_STALLED_CALLS: usize = 5;

/// Raw deflate, as used inside ZIP and GZIP
#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: u32,
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Codec for DeflateCodec {
    fn pack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()> {
        let mut integrity = Integrity::new(ctx.digest_method)?;
        let mut engine = Compress::new(Compression::new(self.level), false);
        let mut in_buf = vec![0u8; INPUT_BUFFER_SIZE];
        let mut out_buf = vec![0u8; OUTPUT_BUFFER_SIZE];
        let start = ctx.dest_offset;
        let mut remaining = ctx.unpacked_size;

        while remaining > 0 {
            let read = read_data(input, ctx.src_offset, &mut in_buf, &mut remaining)?;
            ctx.src_offset += read;
            integrity.update(&in_buf[..read]);

            let mut consumed = 0;
            while consumed < read {
                let before_in = engine.total_in();
                let before_out = engine.total_out();
                engine
                    .compress(&in_buf[consumed..read], &mut out_buf, FlushCompress::None)
                    .map_err(|e| PkgError::InvalidStream(format!("deflate failed: {}", e)))?;
                consumed += (engine.total_in() - before_in) as usize;
                let produced = (engine.total_out() - before_out) as usize;
                if produced > 0 {
                    output.write(&out_buf[..produced], ctx.dest_offset)?;
                    ctx.dest_offset += produced;
                }
            }
        }

        loop {
            let before_out = engine.total_out();
            let status = engine
                .compress(&[], &mut out_buf, FlushCompress::Finish)
                .map_err(|e| PkgError::InvalidStream(format!("deflate failed: {}", e)))?;
            let produced = (engine.total_out() - before_out) as usize;
            if produced > 0 {
                output.write(&out_buf[..produced], ctx.dest_offset)?;
                ctx.dest_offset += produced;
            }
            if status == Status::StreamEnd {
                break;
            }
        }

        ctx.packed_size = ctx.dest_offset - start;
        debug!(
            "Deflated {} bytes to {} (level {})",
            ctx.unpacked_size, ctx.packed_size, self.level
        );
        integrity.finish_pack(ctx);
        Ok(())
    }

    fn unpack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()> {
        let mut integrity = Integrity::new(ctx.digest_method)?;
        let mut engine = Decompress::new(false);
        let mut in_buf = vec![0u8; INPUT_BUFFER_SIZE];
        let mut out_buf = vec![0u8; OUTPUT_BUFFER_SIZE];
        let src_start = ctx.src_offset;
        let dest_start = ctx.dest_offset;
        let mut read_offset = ctx.src_offset;
        let mut remaining = ctx.packed_size;
        let mut in_pos = 0;
        let mut in_len = 0;
        let mut stalled = 0;

        loop {
            if in_pos == in_len && remaining > 0 {
                in_len = read_data(input, read_offset, &mut in_buf, &mut remaining)?;
                read_offset += in_len;
                in_pos = 0;
            }

            let before_in = engine.total_in();
            let before_out = engine.total_out();
            let status = engine
                .decompress(&in_buf[in_pos..in_len], &mut out_buf, FlushDecompress::None)
                .map_err(|e| PkgError::InvalidPkgFormat(format!("inflate failed: {}", e)))?;
            let consumed = (engine.total_in() - before_in) as usize;
            let produced = (engine.total_out() - before_out) as usize;
            in_pos += consumed;

            if produced > 0 {
                integrity.update(&out_buf[..produced]);
                output.write(&out_buf[..produced], ctx.dest_offset)?;
                ctx.dest_offset += produced;
            }
            if status == Status::StreamEnd {
                break;
            }

            if consumed == 0 && produced == 0 {
                stalled += 1;
                if stalled >= MAX_STALLED_CALLS {
                    return Err(PkgError::InvalidPkgFormat(format!(
                        "deflate stream ended early after {} bytes",
                        engine.total_in()
                    )));
                }
            } else {
                stalled = 0;
            }
        }

        ctx.packed_size = engine.total_in() as usize;
        ctx.src_offset = src_start + ctx.packed_size;
        ctx.unpacked_size = ctx.dest_offset - dest_start;
        integrity.finish_unpack(ctx)
    }
}
