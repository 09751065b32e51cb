use super::{Codec, CodecContext, Integrity};
use crate::error::{PkgError, Result};
use crate::info::{Lz4Params, DEFAULT_LZ4_BLOCK_ID};
use crate::stream::{read_data, read_exact_at, ByteStream, StreamReader, StreamWriter};
use lz4_flex::block::{compress_into, decompress_into, get_maximum_output_size};
use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use std::io::{Read, Write};
use tracing::debug;

/// LZ4 frame magic
pub const LZ4_FRAME_MAGIC: u32 = 0x184D2204;

/// Magic of the block container: `[magic][u32 len][block]...`
pub const LZ4B_MAGIC: u32 = 0x184C2102;

/// Largest block produced or accepted by the block container
const LZ4B_MAX_BLOCK: usize = 4 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Uncompressed size of a block size id; id 0 selects the default
pub fn block_size(id: u8) -> Result<usize> {
    match id {
        0 => Ok(1usize << (8 + 2 * DEFAULT_LZ4_BLOCK_ID as usize)),
        4..=7 => Ok(1usize << (8 + 2 * id as usize)),
        other => Err(PkgError::InvalidParam(format!(
            "unsupported lz4 block size id {}",
            other
        ))),
    }
}

/// Worst-case compressed size of `n` input bytes
fn compress_bound(n: usize) -> usize {
    n + n / 255 + 16
}

fn frame_block_size(id: u8) -> Result<BlockSize> {
    match id {
        0 | 4 => Ok(BlockSize::Max64KB),
        5 => Ok(BlockSize::Max256KB),
        6 => Ok(BlockSize::Max1MB),
        7 => Ok(BlockSize::Max4MB),
        other => Err(PkgError::InvalidParam(format!(
            "unsupported lz4 block size id {}",
            other
        ))),
    }
}

fn lz4_io_error(err: impl std::fmt::Display) -> PkgError {
    PkgError::InvalidLz4(err.to_string())
}

/// Read the frame descriptor flags that follow the magic
///
/// `header` must hold at least the magic, FLG and BD bytes.
pub fn decode_frame_params(header: &[u8], level: i32) -> Result<Lz4Params> {
    if header.len() < 6 {
        return Err(PkgError::InvalidLz4("frame header too short".to_string()));
    }
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != LZ4_FRAME_MAGIC {
        return Err(PkgError::InvalidLz4(format!(
            "bad frame magic {:08x}",
            magic
        )));
    }

    let flg = header[4];
    let bd = header[5];
    if flg >> 6 != 0x01 {
        return Err(PkgError::InvalidLz4(format!(
            "unsupported frame version in flags {:02x}",
            flg
        )));
    }
    let block_size_id = (bd >> 4) & 0x07;
    if !(4..=7).contains(&block_size_id) {
        return Err(PkgError::InvalidLz4(format!(
            "invalid block size id {}",
            block_size_id
        )));
    }

    Ok(Lz4Params {
        level,
        block_size_id,
        independent_blocks: flg & 0x20 != 0,
        block_checksum: flg & 0x10 != 0,
        content_checksum: flg & 0x04 != 0,
    })
}

/// Offset just past the frame starting at `start`
///
/// Walks the descriptor and block sizes up to the end mark and optional
/// content checksum, so trailing bytes never reach the frame decoder.
fn frame_end(stream: &mut dyn ByteStream, start: usize, limit: usize) -> Result<usize> {
    let mut header = [0u8; 6];
    if limit < start + header.len() {
        return Err(PkgError::InvalidLz4("frame header too short".to_string()));
    }
    read_exact_at(stream, start, &mut header)?;
    let params = decode_frame_params(&header, 0)?;
    let flg = header[4];

    let mut offset = start + header.len() + 1;
    if flg & 0x08 != 0 {
        offset += 8;
    }
    if flg & 0x01 != 0 {
        offset += 4;
    }

    let mut word = [0u8; 4];
    loop {
        if offset + 4 > limit {
            return Err(PkgError::InvalidLz4(format!(
                "frame truncated before end mark at {}",
                offset
            )));
        }
        read_exact_at(stream, offset, &mut word)?;
        offset += 4;
        let block_len = (u32::from_le_bytes(word) & 0x7FFF_FFFF) as usize;
        if block_len == 0 {
            break;
        }
        offset += block_len;
        if params.block_checksum {
            offset += 4;
        }
    }
    if params.content_checksum {
        offset += 4;
    }
    if offset > limit {
        return Err(PkgError::InvalidLz4(format!(
            "frame runs past {} bytes",
            limit - start
        )));
    }
    Ok(offset)
}

/// Standard LZ4 frame
#[derive(Debug, Clone)]
pub struct Lz4FrameCodec {
    params: Lz4Params,
}

impl Lz4FrameCodec {
    pub fn new(params: Lz4Params) -> Self {
        Self { params }
    }

    fn frame_info(&self) -> Result<FrameInfo> {
        let block_mode = if self.params.independent_blocks {
            BlockMode::Independent
        } else {
            BlockMode::Linked
        };
        Ok(FrameInfo::new()
            .block_size(frame_block_size(self.params.block_size_id)?)
            .block_mode(block_mode)
            .block_checksums(self.params.block_checksum)
            .content_checksum(self.params.content_checksum))
    }
}

impl Codec for Lz4FrameCodec {
    fn pack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()> {
        let mut integrity = Integrity::new(ctx.digest_method)?;
        let start = ctx.dest_offset;
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut remaining = ctx.unpacked_size;
        let mut src = ctx.src_offset;

        let mut encoder =
            FrameEncoder::with_frame_info(self.frame_info()?, StreamWriter::new(output, start));
        while remaining > 0 {
            let read = read_data(input, src, &mut buffer, &mut remaining)?;
            src += read;
            integrity.update(&buffer[..read]);
            encoder.write_all(&buffer[..read]).map_err(lz4_io_error)?;
        }
        let writer = encoder.finish().map_err(lz4_io_error)?;

        ctx.src_offset = src;
        ctx.dest_offset = writer.position();
        ctx.packed_size = ctx.dest_offset - start;
        debug!(
            "LZ4 frame: {} bytes to {} (level {})",
            ctx.unpacked_size,
            ctx.packed_size,
            self.params.normalized_level()
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
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let dest_start = ctx.dest_offset;
        let src_start = ctx.src_offset;
        let end = frame_end(input, src_start, src_start + ctx.packed_size)?;

        let mut decoder = FrameDecoder::new(StreamReader::new(input, src_start, end));
        loop {
            let read = decoder.read(&mut buffer).map_err(lz4_io_error)?;
            if read == 0 {
                break;
            }
            integrity.update(&buffer[..read]);
            output.write(&buffer[..read], ctx.dest_offset)?;
            ctx.dest_offset += read;
        }
        let consumed = decoder.into_inner().position() - src_start;
        if consumed == 0 {
            return Err(PkgError::InvalidLz4("empty lz4 frame".to_string()));
        }

        ctx.src_offset = src_start + consumed;
        ctx.packed_size = consumed;
        ctx.unpacked_size = ctx.dest_offset - dest_start;
        integrity.finish_unpack(ctx)
    }
}

/// Block container: the magic, then length-prefixed independent LZ4 blocks
#[derive(Debug, Clone)]
pub struct Lz4BlockCodec {
    params: Lz4Params,
}

impl Lz4BlockCodec {
    pub fn new(params: Lz4Params) -> Self {
        Self { params }
    }

    fn input_block_size(&self) -> Result<usize> {
        Ok(block_size(self.params.block_size_id)?.min(LZ4B_MAX_BLOCK))
    }
}

impl Codec for Lz4BlockCodec {
    fn pack(
        &self,
        input: &mut dyn ByteStream,
        output: &mut dyn ByteStream,
        ctx: &mut CodecContext,
    ) -> Result<()> {
        let mut integrity = Integrity::new(ctx.digest_method)?;
        let chunk = self.input_block_size()?;
        let mut in_buf = vec![0u8; chunk];
        let mut out_buf = vec![0u8; get_maximum_output_size(chunk)];
        let start = ctx.dest_offset;
        let mut remaining = ctx.unpacked_size;

        output.write(&LZ4B_MAGIC.to_le_bytes(), ctx.dest_offset)?;
        ctx.dest_offset += 4;

        while remaining > 0 {
            let read = read_data(input, ctx.src_offset, &mut in_buf, &mut remaining)?;
            ctx.src_offset += read;
            integrity.update(&in_buf[..read]);

            let compressed = compress_into(&in_buf[..read], &mut out_buf)
                .map_err(|e| PkgError::InvalidLz4(format!("block compression failed: {}", e)))?;
            output.write(&(compressed as u32).to_le_bytes(), ctx.dest_offset)?;
            output.write(&out_buf[..compressed], ctx.dest_offset + 4)?;
            ctx.dest_offset += 4 + compressed;
        }

        ctx.packed_size = ctx.dest_offset - start;
        debug!(
            "LZ4 blocks: {} bytes to {} (level {}{})",
            ctx.unpacked_size,
            ctx.packed_size,
            self.params.normalized_level(),
            if self.params.high_compression() { ", hc" } else { "" }
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
        let bound = compress_bound(LZ4B_MAX_BLOCK);
        let mut in_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut out_buf = vec![0u8; LZ4B_MAX_BLOCK];
        let dest_start = ctx.dest_offset;
        let src_start = ctx.src_offset;

        if ctx.packed_size < 4 {
            return Err(PkgError::InvalidLz4("lz4 block data too short".to_string()));
        }
        let mut word = [0u8; 4];
        read_exact_at(input, ctx.src_offset, &mut word)?;
        if u32::from_le_bytes(word) != LZ4B_MAGIC {
            return Err(PkgError::InvalidLz4(format!(
                "bad block magic {:08x}",
                u32::from_le_bytes(word)
            )));
        }
        let mut offset = src_start + 4;
        let end = src_start + ctx.packed_size;

        while offset < end {
            if end - offset < 4 {
                return Err(PkgError::InvalidLz4(format!(
                    "truncated block header at {}",
                    offset
                )));
            }
            read_exact_at(input, offset, &mut word)?;
            let block_len = u32::from_le_bytes(word) as usize;
            offset += 4;
            if block_len > bound || block_len > end - offset {
                return Err(PkgError::InvalidLz4(format!(
                    "block length {} at {} out of range",
                    block_len,
                    offset - 4
                )));
            }

            if in_buf.len() < block_len {
                in_buf.resize(block_len, 0);
            }
            read_exact_at(input, offset, &mut in_buf[..block_len])?;
            offset += block_len;

            let produced = decompress_into(&in_buf[..block_len], &mut out_buf)
                .map_err(|e| PkgError::InvalidLz4(format!("block decompression failed: {}", e)))?;
            integrity.update(&out_buf[..produced]);
            output.write(&out_buf[..produced], ctx.dest_offset)?;
            ctx.dest_offset += produced;
        }

        ctx.src_offset = offset;
        ctx.packed_size = offset - src_start;
        ctx.unpacked_size = ctx.dest_offset - dest_start;
        integrity.finish_unpack(ctx)
    }
}

/// Walk a block chain starting at the magic and return where it ends
///
/// The walk stops at `limit`, at a zero length, or at the first length field
/// that would run past `limit`.
pub(crate) fn walk_block_chain(
    stream: &mut dyn ByteStream,
    start: usize,
    limit: usize,
) -> Result<usize> {
    let bound = compress_bound(LZ4B_MAX_BLOCK);
    let mut word = [0u8; 4];
    let mut offset = start + 4;
    while offset + 4 <= limit {
        read_exact_at(stream, offset, &mut word)?;
        let block_len = u32::from_le_bytes(word) as usize;
        if block_len == 0 || block_len > bound || offset + 4 + block_len > limit {
            break;
        }
        offset += 4 + block_len;
    }
    Ok(offset)
}
