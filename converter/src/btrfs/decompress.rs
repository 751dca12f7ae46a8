// Transparent decode of compressed btrfs extents.
//
// ZLIB extents are raw deflate streams (no zlib/gzip header). LZO
// extents use the btrfs framing: a leading 32-bit total length followed
// by `{32-bit segment length, LZO1X data}` per page. ZSTD extents are a
// single standard frame. Output is padded with zeroes up to a block
// boundary.

use flate2::{Decompress, FlushDecompress};

use fsmorph_core::{BlockDevice, ConvertError};

use crate::model::{Compression, FileExtent};

/// Largest on-disk compressed extent accepted.
pub const MAX_DISK_BYTES: u64 = 512 << 20;
/// Largest uncompressed extent accepted.
pub const MAX_RAM_BYTES: u64 = 4 << 30;

/// Scratch buffers reused across calls. One context per caller; the
/// engine is single-threaded, so no hidden globals are needed.
#[derive(Default)]
pub struct DecompressCtx {
    compressed: Vec<u8>,
    output: Vec<u8>,
}

impl DecompressCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decompress `extent`, whose data lives at `physical` on
    /// `device`, into a buffer rounded up to `block_size`. The
    /// returned slice borrows the context and is valid until the next
    /// call.
    pub fn decompress(
        &mut self,
        device: &dyn BlockDevice,
        extent: &FileExtent,
        physical: u64,
        block_size: u32,
    ) -> Result<&[u8], ConvertError> {
        check_bounds(extent)?;
        self.compressed.resize(extent.disk_num_bytes as usize, 0);
        device.read_at(physical, &mut self.compressed)?;
        let ram = extent.ram_bytes as usize;
        decode_buffer(extent.compression, &self.compressed, ram, &mut self.output)?;
        pad_to_block(&mut self.output, block_size);
        Ok(&self.output)
    }

    /// Decompress an inline extent payload.
    pub fn decompress_inline(
        &mut self,
        extent: &FileExtent,
        block_size: u32,
    ) -> Result<&[u8], ConvertError> {
        let payload = extent
            .inline_data
            .as_deref()
            .ok_or_else(|| ConvertError::invariant("inline extent without payload"))?;
        let ram = extent.ram_bytes as usize;
        if extent.compression == Compression::None {
            self.output.clear();
            self.output.extend_from_slice(payload);
        } else {
            decode_buffer(extent.compression, payload, ram, &mut self.output)?;
        }
        pad_to_block(&mut self.output, block_size);
        Ok(&self.output)
    }
}

fn check_bounds(extent: &FileExtent) -> Result<(), ConvertError> {
    if extent.compression == Compression::None {
        return Err(ConvertError::invariant(
            "decompress called on an uncompressed extent",
        ));
    }
    if extent.disk_num_bytes == 0 || extent.disk_num_bytes > MAX_DISK_BYTES {
        return Err(ConvertError::corruption(format!(
            "compressed extent disk size {}",
            extent.disk_num_bytes
        )));
    }
    if extent.ram_bytes == 0 || extent.ram_bytes > MAX_RAM_BYTES {
        return Err(ConvertError::corruption(format!(
            "compressed extent uncompressed size {}",
            extent.ram_bytes
        )));
    }
    // Decompression-bomb guard.
    if extent.ram_bytes > 2 * extent.num_bytes {
        return Err(ConvertError::corruption(
            "compressed extent expands past twice its file range",
        ));
    }
    if extent.disk_num_bytes > extent.ram_bytes {
        return Err(ConvertError::corruption(
            "compressed extent larger than its uncompressed size",
        ));
    }
    Ok(())
}

fn pad_to_block(buf: &mut Vec<u8>, block_size: u32) {
    let bs = block_size as usize;
    let padded = buf.len().div_ceil(bs) * bs;
    buf.resize(padded, 0);
}

/// Decode `input` into `out`, which is cleared first. `expected` is the
/// exact uncompressed size.
pub fn decode_buffer(
    compression: Compression,
    input: &[u8],
    expected: usize,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    out.clear();
    match compression {
        Compression::None => {
            out.extend_from_slice(input);
        }
        Compression::Zlib => {
            out.reserve(expected);
            let mut inflater = Decompress::new(false);
            inflater
                .decompress_vec(input, out, FlushDecompress::Finish)
                .map_err(|e| ConvertError::corruption(format!("deflate stream: {}", e)))?;
        }
        Compression::Lzo => {
            decode_lzo_framed(input, expected, out)?;
        }
        Compression::Zstd => {
            *out = zstd::bulk::decompress(input, expected)
                .map_err(|e| ConvertError::corruption(format!("zstd frame: {}", e)))?;
        }
    }
    if out.len() != expected {
        return Err(ConvertError::corruption(format!(
            "decompressed {} bytes where {} were expected",
            out.len(),
            expected
        )));
    }
    Ok(())
}

/// Btrfs LZO framing: `u32 total_len` then per-segment
/// `{u32 seg_len, lzo1x data}`.
fn decode_lzo_framed(input: &[u8], expected: usize, out: &mut Vec<u8>) -> Result<(), ConvertError> {
    if input.len() < 4 {
        return Err(ConvertError::corruption("lzo extent shorter than header"));
    }
    let total = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
    if total > input.len() {
        return Err(ConvertError::corruption("lzo total length past extent"));
    }
    let mut off = 4usize;
    while off + 4 <= total && out.len() < expected {
        let seg_len =
            u32::from_le_bytes([input[off], input[off + 1], input[off + 2], input[off + 3]])
                as usize;
        off += 4;
        if seg_len == 0 || off + seg_len > total {
            return Err(ConvertError::corruption("lzo segment length out of range"));
        }
        lzo1x_decompress(&input[off..off + seg_len], out, expected)?;
        off += seg_len;
    }
    Ok(())
}

fn lzo_err(msg: &str) -> ConvertError {
    ConvertError::corruption(format!("lzo1x stream: {}", msg))
}

/// Safe LZO1X decompression of one segment, appended to `out`.
///
/// Control-byte grammar, with `state` tracking what the previous
/// control implied for a following byte below 16:
///   state 0    - next low byte starts a literal run of length t+3
///   state 1..3 - that many literals trail the previous match; a low
///                byte after them is a 2-byte near match
///   state 4    - a long literal run just ended; a low byte is a
///                3-byte match with the 0x800 distance bias
/// Matches never reach back past the start of the current segment.
fn lzo1x_decompress(input: &[u8], out: &mut Vec<u8>, max_out: usize) -> Result<(), ConvertError> {
    let base = out.len();
    let mut ip = 0usize;

    fn take(input: &[u8], ip: &mut usize) -> Result<usize, ConvertError> {
        let b = *input.get(*ip).ok_or_else(|| lzo_err("truncated"))?;
        *ip += 1;
        Ok(b as usize)
    }

    fn take_le16(input: &[u8], ip: &mut usize) -> Result<usize, ConvertError> {
        if *ip + 2 > input.len() {
            return Err(lzo_err("truncated offset"));
        }
        let v = input[*ip] as usize | ((input[*ip + 1] as usize) << 8);
        *ip += 2;
        Ok(v)
    }

    /// Length extension: a run of zero bytes adds 255 each, the first
    /// non-zero byte plus `bias` finishes the length.
    fn take_len(input: &[u8], ip: &mut usize, bias: usize) -> Result<usize, ConvertError> {
        let mut len = 0usize;
        loop {
            let b = take(input, ip)?;
            if b != 0 {
                return Ok(len + bias + b);
            }
            len += 255;
            if len > MAX_RAM_BYTES as usize {
                return Err(lzo_err("runaway length"));
            }
        }
    }

    fn literals(
        input: &[u8],
        ip: &mut usize,
        out: &mut Vec<u8>,
        len: usize,
        max_out: usize,
    ) -> Result<(), ConvertError> {
        if *ip + len > input.len() {
            return Err(lzo_err("literal run past input"));
        }
        if out.len() + len > max_out {
            return Err(lzo_err("output overrun"));
        }
        out.extend_from_slice(&input[*ip..*ip + len]);
        *ip += len;
        Ok(())
    }

    // Matches may overlap their own output, so copy byte by byte.
    fn copy_match(
        out: &mut Vec<u8>,
        base: usize,
        dist: usize,
        len: usize,
        max_out: usize,
    ) -> Result<(), ConvertError> {
        if dist == 0 || dist > out.len() - base {
            return Err(lzo_err("match distance before segment start"));
        }
        if out.len() + len > max_out {
            return Err(lzo_err("output overrun"));
        }
        let mut src = out.len() - dist;
        for _ in 0..len {
            let b = out[src];
            out.push(b);
            src += 1;
        }
        Ok(())
    }

    let mut state;
    let mut t = take(input, &mut ip)?;
    if t > 17 {
        let lit = t - 17;
        literals(input, &mut ip, out, lit, max_out)?;
        state = if lit < 4 { lit } else { 4 };
        t = take(input, &mut ip)?;
    } else {
        state = 0;
    }

    loop {
        if t < 16 {
            match state {
                0 => {
                    let run = if t == 0 {
                        take_len(input, &mut ip, 15)? + 3
                    } else {
                        t + 3
                    };
                    literals(input, &mut ip, out, run, max_out)?;
                    state = 4;
                    t = take(input, &mut ip)?;
                    continue;
                }
                4 => {
                    // 3-byte match biased past the near window.
                    let dist = 1 + 0x800 + (t >> 2) + (take(input, &mut ip)? << 2);
                    copy_match(out, base, dist, 3, max_out)?;
                    state = t & 3;
                }
                _ => {
                    // 2-byte near match.
                    let dist = 1 + (t >> 2) + (take(input, &mut ip)? << 2);
                    copy_match(out, base, dist, 2, max_out)?;
                    state = t & 3;
                }
            }
        } else if t >= 64 {
            // M2: length 3..8, distance up to 0x800.
            let len = (t >> 5) + 1;
            let dist = 1 + ((t >> 2) & 7) + (take(input, &mut ip)? << 3);
            copy_match(out, base, dist, len, max_out)?;
            state = t & 3;
        } else if t >= 32 {
            // M3: distance up to 0x4000.
            let len = if t & 31 == 0 {
                take_len(input, &mut ip, 31)?
            } else {
                t & 31
            } + 2;
            let d = take_le16(input, &mut ip)?;
            copy_match(out, base, 1 + (d >> 2), len, max_out)?;
            state = d & 3;
        } else {
            // M4: far match; doubles as the end-of-stream marker.
            let len = if t & 7 == 0 {
                take_len(input, &mut ip, 7)?
            } else {
                t & 7
            } + 2;
            let d = take_le16(input, &mut ip)?;
            let near = ((t & 8) << 11) + (d >> 2);
            if near == 0 {
                if ip != input.len() {
                    return Err(lzo_err("trailing bytes after end marker"));
                }
                return Ok(());
            }
            copy_match(out, base, 0x4000 + near, len, max_out)?;
            state = d & 3;
        }
        // Up to three literals ride in the low bits of every match.
        if state > 0 && state < 4 {
            literals(input, &mut ip, out, state, max_out)?;
        }
        t = take(input, &mut ip)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtentKind;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    fn extent(compression: Compression, disk: u64, ram: u64, num: u64) -> FileExtent {
        FileExtent {
            file_offset: 0,
            disk_bytenr: 0,
            disk_num_bytes: disk,
            num_bytes: num,
            ram_bytes: ram,
            extent_offset: 0,
            compression,
            kind: ExtentKind::Regular,
            inline_data: None,
        }
    }

    #[test]
    fn bounds_reject_bombs() {
        // ram_bytes way past num_bytes.
        let e = extent(Compression::Zlib, 4096, 1 << 20, 4096);
        assert!(check_bounds(&e).is_err());
        // disk bigger than ram.
        let e = extent(Compression::Zlib, 8192, 4096, 4096);
        assert!(check_bounds(&e).is_err());
        // zero disk bytes.
        let e = extent(Compression::Zlib, 0, 4096, 4096);
        assert!(check_bounds(&e).is_err());
    }

    #[test]
    fn raw_deflate_roundtrip() {
        let payload = vec![7u8; 10000];
        let mut enc = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();

        let mut out = Vec::new();
        decode_buffer(Compression::Zlib, &compressed, payload.len(), &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn zstd_roundtrip() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let compressed = zstd::bulk::compress(&payload, 3).unwrap();
        let mut out = Vec::new();
        decode_buffer(Compression::Zstd, &compressed, payload.len(), &mut out).unwrap();
        assert_eq!(out, payload);
    }

    fn frame_segments(segments: &[&[u8]]) -> Vec<u8> {
        let total = 4 + segments.iter().map(|s| 4 + s.len()).sum::<usize>();
        let mut framed = Vec::new();
        framed.extend_from_slice(&(total as u32).to_le_bytes());
        for seg in segments {
            framed.extend_from_slice(&(seg.len() as u32).to_le_bytes());
            framed.extend_from_slice(seg);
        }
        framed
    }

    /// Hand-assembled segment: one literal run plus the end marker.
    fn literal_segment(payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() >= 4 && payload.len() <= 238);
        let mut seg = Vec::new();
        seg.push(17 + payload.len() as u8);
        seg.extend_from_slice(payload);
        seg.extend_from_slice(&[0x11, 0x00, 0x00]);
        seg
    }

    #[test]
    fn lzo_literal_only_stream_decodes() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let framed = frame_segments(&[&literal_segment(payload)]);
        let mut out = Vec::new();
        decode_buffer(Compression::Lzo, &framed, payload.len(), &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn lzo_match_copy_decodes() {
        // 8 literals "abcdabcd", then an M2 match: ctrl 0x7C has
        // length (0x7C>>5)+1 = 4, distance 1 + ((0x7C>>2)&7) + (0<<3)
        // = 8, and clear state bits so the end marker follows directly.
        let mut seg = Vec::new();
        seg.push(17 + 8);
        seg.extend_from_slice(b"abcdabcd");
        seg.push(0x7C);
        seg.push(0x00);
        seg.extend_from_slice(&[0x11, 0x00, 0x00]);
        let framed = frame_segments(&[&seg]);
        let mut out = Vec::new();
        decode_buffer(Compression::Lzo, &framed, 12, &mut out).unwrap();
        assert_eq!(&out, b"abcdabcdabcd");
    }

    #[test]
    fn lzo_multi_segment_stream_decodes() {
        let a = b"first segment bytes!";
        let b = b"and a second helping";
        let framed = frame_segments(&[&literal_segment(a), &literal_segment(b)]);
        let mut out = Vec::new();
        decode_buffer(Compression::Lzo, &framed, a.len() + b.len(), &mut out).unwrap();
        assert_eq!(&out[..a.len()], a);
        assert_eq!(&out[a.len()..], b);
    }

    #[test]
    fn lzo_rejects_truncated_frame() {
        let payload = b"some payload bytes";
        let mut framed = frame_segments(&[&literal_segment(payload)]);
        framed.truncate(framed.len() - 4);
        let mut out = Vec::new();
        assert!(decode_buffer(Compression::Lzo, &framed, payload.len(), &mut out).is_err());
    }

    #[test]
    fn lzo_match_cannot_escape_segment() {
        // A match control with distance 8 but only 4 bytes of output.
        let mut seg = Vec::new();
        seg.push(17 + 4);
        seg.extend_from_slice(b"abcd");
        seg.push(0x7C);
        seg.push(0x00);
        seg.extend_from_slice(&[0x11, 0x00, 0x00]);
        let framed = frame_segments(&[&seg]);
        let mut out = Vec::new();
        assert!(decode_buffer(Compression::Lzo, &framed, 8, &mut out).is_err());
    }

    #[test]
    fn inline_decompression_pads_to_block() {
        let mut e = extent(Compression::None, 0, 11, 11);
        e.kind = ExtentKind::Inline;
        e.inline_data = Some(b"hello world".to_vec());
        let mut ctx = DecompressCtx::new();
        let out = ctx.decompress_inline(&e, 4096).unwrap();
        assert_eq!(out.len(), 4096);
        assert_eq!(&out[..11], b"hello world");
        assert!(out[11..].iter().all(|&b| b == 0));
    }
}
