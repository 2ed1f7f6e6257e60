//! VNC ZRLE and ZYWRLE encodings.
//!
//! A rectangle is one zlib chunk on a connection-wide stream. Inflated, it is a
//! sequence of 64x64 tiles in row-major order, each introduced by a
//! subencoding byte: raw, solid, packed palette, plain RLE or palette RLE.
//! Colours are CPIXELs, which drop the unused byte of 32 bpp formats whose
//! channels fit in three bytes.
//!
//! ZYWRLE reuses the tile format. When the wavelet level is non-zero, a raw
//! tile byte is followed by a nested ZRLE tile holding coefficients, which are
//! turned back into pixels by [`zywrle::synthesize`].

use std::io::Read;
use std::marker::PhantomData;

use byteorder::ReadBytesExt;
use flate2::Decompress;
use log::{debug, trace};

use super::common::{deflate_bound, inflate_all, read_length_prefixed, rect_bytes};
use super::zywrle::{self, Packing};
use super::{Decoder, DecoderState, Pixel};
use crate::vnc::error::{Result, RfbError};
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::{PixelFormat, RectHeader, ZRLE_TILE_SIZE};

/// How a compressed pixel maps onto a client pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CPixel {
    /// Same as the pixel.
    Full,
    /// Three bytes that form the low-addressed bytes of the pixel.
    Leading,
    /// Three bytes that form the high-addressed bytes of the pixel.
    Trailing,
}

impl CPixel {
    fn for_format(format: &PixelFormat) -> Self {
        if format.bits_per_pixel != 32 || format.depth > 24 || !format.true_colour {
            return CPixel::Full;
        }
        let max = format.max_colour();
        let low_clear = max & 0x0000_00FF == 0;
        let high_clear = max & 0xFF00_0000 == 0;
        match (format.big_endian, low_clear, high_clear) {
            (true, true, _) | (false, _, true) => CPixel::Leading,
            (false, true, _) | (true, _, true) => CPixel::Trailing,
            _ => CPixel::Full,
        }
    }

    fn read<P: Pixel>(self, data: &mut &[u8], big_endian: bool) -> Result<u32> {
        let mut bytes = [0u8; 4];
        match self {
            CPixel::Full => data.read_exact(&mut bytes[..P::BYTES])?,
            CPixel::Leading => data.read_exact(&mut bytes[..3])?,
            CPixel::Trailing => data.read_exact(&mut bytes[1..])?,
        }
        Ok(P::from_slice(&bytes, big_endian).to_u32())
    }
}

/// Reads an RLE run length: 1 plus a sum of bytes ending at the first byte that is not 255.
fn read_run(data: &mut &[u8]) -> Result<usize> {
    let mut len = 1usize;
    loop {
        let b = data.read_u8()?;
        len += usize::from(b);
        if b != 255 {
            return Ok(len);
        }
    }
}

/// Per-rectangle decoding parameters.
struct TileContext {
    cpixel: CPixel,
    big_endian: bool,
    level: u32,
    packing: Option<Packing>,
}

/// Decoder for the "ZRLE" and "ZYWRLE" encodings.
pub struct ZrleDecoder<P: Pixel> {
    zywrle: bool,
    _pixel: PhantomData<P>,
}

impl<P: Pixel> ZrleDecoder<P> {
    /// Creates a ZRLE decoder, or a ZYWRLE decoder when `zywrle` is set.
    pub fn new(zywrle: bool) -> Self {
        Self { zywrle, _pixel: PhantomData }
    }

    fn decode_tile(
        ctx: &TileContext,
        level: u32,
        data: &mut &[u8],
        tile: &mut Vec<u32>,
        coeffs: &mut Vec<[i8; 3]>,
        tw: usize,
        th: usize,
    ) -> Result<()> {
        let n = tw * th;
        tile.clear();
        tile.resize(n, 0);
        let kind = data.read_u8()?;

        match kind {
            0 if level > 0 => {
                Self::decode_tile(ctx, 0, data, tile, coeffs, tw, th)?;
                if let Some(packing) = ctx.packing {
                    zywrle::synthesize(tile, tw, th, level, packing, coeffs);
                }
            }
            0 => {
                for p in tile.iter_mut() {
                    *p = ctx.cpixel.read::<P>(data, ctx.big_endian)?;
                }
            }
            1 => {
                let colour = ctx.cpixel.read::<P>(data, ctx.big_endian)?;
                tile.fill(colour);
            }
            2..=127 => {
                let palette = read_palette::<P>(ctx, data, usize::from(kind))?;
                let bits = match kind {
                    2 => 1,
                    3..=4 => 2,
                    5..=16 => 4,
                    _ => 8,
                };
                let mask = (1u16 << bits) - 1;
                for row in tile.chunks_exact_mut(tw) {
                    let mut byte = 0u8;
                    let mut left = 0u32;
                    for p in row.iter_mut() {
                        if left == 0 {
                            byte = data.read_u8()?;
                            left = 8;
                        }
                        left -= bits;
                        let index = usize::from((u16::from(byte) >> left) & mask);
                        *p = *palette.get(index).ok_or_else(|| {
                            RfbError::violation(format!("zrle palette index {} of {}", index, palette.len()))
                        })?;
                    }
                }
            }
            128 => {
                let mut i = 0;
                while i < n {
                    let colour = ctx.cpixel.read::<P>(data, ctx.big_endian)?;
                    let len = read_run(data)?;
                    fill_run(tile, i, len, colour)?;
                    i += len;
                }
            }
            129 => return Err(RfbError::violation("zrle subencoding 129")),
            _ => {
                let palette = read_palette::<P>(ctx, data, usize::from(kind - 128))?;
                let mut i = 0;
                while i < n {
                    let b = data.read_u8()?;
                    let index = usize::from(b & 0x7F);
                    let colour = *palette.get(index).ok_or_else(|| {
                        RfbError::violation(format!("zrle palette index {} of {}", index, palette.len()))
                    })?;
                    let len = if b & 0x80 != 0 { read_run(data)? } else { 1 };
                    fill_run(tile, i, len, colour)?;
                    i += len;
                }
            }
        }
        Ok(())
    }
}

fn read_palette<P: Pixel>(ctx: &TileContext, data: &mut &[u8], size: usize) -> Result<Vec<u32>> {
    (0..size).map(|_| ctx.cpixel.read::<P>(data, ctx.big_endian)).collect()
}

fn fill_run(tile: &mut [u32], start: usize, len: usize, colour: u32) -> Result<()> {
    let total = tile.len();
    let run = tile.get_mut(start..start + len).ok_or_else(|| {
        RfbError::violation(format!("zrle run of {} at {} overruns a {}-pixel tile", len, start, total))
    })?;
    run.fill(colour);
    Ok(())
}

impl<P: Pixel> Decoder for ZrleDecoder<P> {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        fb.check_bounds(rect.x, rect.y, rect.width, rect.height)?;
        let format = *fb.format();
        let tiles = usize::from(rect.width).div_ceil(usize::from(ZRLE_TILE_SIZE))
            * usize::from(rect.height).div_ceil(usize::from(ZRLE_TILE_SIZE));
        let limit = (rect_bytes(rect.width, rect.height, P::BYTES) * 2 + tiles * 1024).max(1024);
        let len = read_length_prefixed(input, &mut state.compressed, deflate_bound(limit))?;

        let stream = state.zrle_stream.get_or_insert_with(|| Decompress::new(true));
        inflate_all(stream, &state.compressed, &mut state.raw, limit)?;

        let packing = if self.zywrle { Packing::for_format(&format) } else { None };
        let ctx = TileContext {
            cpixel: CPixel::for_format(&format),
            big_endian: format.big_endian,
            level: packing.map_or(0, |_| zywrle::level_for_quality(state.zywrle_quality)),
            packing,
        };
        trace!(
            "zrle rect {}x{}: {} -> {} bytes, cpixel {:?}, wavelet level {}",
            rect.width,
            rect.height,
            len,
            state.raw.len(),
            ctx.cpixel,
            ctx.level
        );

        let DecoderState { raw, tile, zywrle_coeffs, pixels, .. } = state;
        let mut data: &[u8] = raw;
        for ty in (rect.y..rect.y + rect.height).step_by(usize::from(ZRLE_TILE_SIZE)) {
            let th = ZRLE_TILE_SIZE.min(rect.y + rect.height - ty);
            for tx in (rect.x..rect.x + rect.width).step_by(usize::from(ZRLE_TILE_SIZE)) {
                let tw = ZRLE_TILE_SIZE.min(rect.x + rect.width - tx);
                Self::decode_tile(&ctx, ctx.level, &mut data, tile, zywrle_coeffs, usize::from(tw), usize::from(th))
                    .map_err(|e| match e {
                        // The inflated buffer ran out, not the connection.
                        RfbError::TransportClosed => RfbError::violation(format!("zrle data ends inside tile at {tx},{ty}")),
                        e => e,
                    })?;

                pixels.clear();
                pixels.resize(tile.len() * P::BYTES, 0);
                for (&v, dst) in tile.iter().zip(pixels.chunks_exact_mut(P::BYTES)) {
                    P::from_u32(v).put(dst, format.big_endian);
                }
                fb.put_rect(tx, ty, tw, th, pixels)?;
            }
        }
        if !data.is_empty() {
            debug!("zrle rect left {} trailing bytes", data.len());
        }
        Ok(())
    }
}
