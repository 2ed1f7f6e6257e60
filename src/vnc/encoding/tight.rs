//! VNC Tight encoding.
//!
//! The first byte of every rectangle is a compression-control byte: its low
//! nibble resets any of the four persistent zlib streams, its high nibble picks
//! a solid fill, a JPEG image or "basic" compression. Basic rectangles run
//! through one of three filters (copy, palette, gradient); payloads shorter
//! than 12 bytes are sent uncompressed, longer ones are deflated on the
//! selected stream.
//!
//! In the 32 bpp depth-24 format colours travel as three bytes (R, G, B)
//! instead of four.

use std::io::Read;
use std::marker::PhantomData;

use byteorder::ReadBytesExt;
use flate2::Decompress;
use image::ImageFormat;
use log::trace;

use super::common::{inflate_exact, read_compact_length, read_into};
use super::{Decoder, DecoderState, Pixel};
use crate::vnc::error::{Result, RfbError};
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::{
    PixelFormat, RectHeader, TIGHT_EXPLICIT_FILTER, TIGHT_FILL, TIGHT_FILTER_COPY, TIGHT_FILTER_GRADIENT,
    TIGHT_FILTER_PALETTE, TIGHT_JPEG, TIGHT_MAX_SUBENCODING, TIGHT_MIN_TO_COMPRESS,
};

/// Decoder for the "Tight" encoding.
pub struct TightDecoder<P: Pixel>(PhantomData<P>);

impl<P: Pixel> TightDecoder<P> {
    /// Creates the decoder.
    pub fn new() -> Self {
        Self(PhantomData)
    }

    /// Whether colours of this format are sent as packed 24-bit RGB.
    fn cut_zeros(format: &PixelFormat) -> bool {
        P::BITS == 32 && format.is_rgb24_in_32()
    }

    fn read_colour(input: &mut dyn Read, format: &PixelFormat) -> Result<u32> {
        if Self::cut_zeros(format) {
            let mut rgb = [0u8; 3];
            input.read_exact(&mut rgb)?;
            Ok(format.rgb24_to_pixel32(rgb[0], rgb[1], rgb[2]))
        } else {
            Ok(P::read(input, format.big_endian)?.to_u32())
        }
    }

    fn decode_jpeg(
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        let format = *fb.format();
        let len = read_compact_length(input)?;
        read_into(input, &mut state.compressed, len)?;

        let img = image::load_from_memory_with_format(&state.compressed, ImageFormat::Jpeg)
            .map_err(|e| RfbError::violation(format!("tight jpeg: {e}")))?
            .to_rgb8();
        if img.width() != u32::from(rect.width) || img.height() != u32::from(rect.height) {
            return Err(RfbError::violation(format!(
                "tight jpeg is {}x{}, rect is {}x{}",
                img.width(),
                img.height(),
                rect.width,
                rect.height
            )));
        }

        state.pixels.clear();
        state.pixels.resize(img.as_raw().len() / 3 * P::BYTES, 0);
        for (rgb, dst) in img.pixels().zip(state.pixels.chunks_exact_mut(P::BYTES)) {
            P::from_u32(format.rgb24_to_pixel(rgb[0], rgb[1], rgb[2])).put(dst, format.big_endian);
        }
        trace!("tight jpeg rect {}x{}: {} bytes", rect.width, rect.height, len);
        fb.put_rect(rect.x, rect.y, rect.width, rect.height, &state.pixels)
    }

    fn decode_basic(
        ctl: u8,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        let format = *fb.format();
        let cut_zeros = Self::cut_zeros(&format);
        let stream_id = usize::from(ctl & 0x03);
        let filter = if ctl & TIGHT_EXPLICIT_FILTER != 0 { input.read_u8()? } else { TIGHT_FILTER_COPY };
        let width = usize::from(rect.width);
        let height = usize::from(rect.height);

        let pixel_bits = if cut_zeros { 24 } else { usize::from(P::BITS) };
        let bits = match filter {
            TIGHT_FILTER_COPY | TIGHT_FILTER_GRADIENT => pixel_bits,
            TIGHT_FILTER_PALETTE => {
                let colours = usize::from(input.read_u8()?) + 1;
                if colours < 2 {
                    return Err(RfbError::violation("tight palette with a single colour"));
                }
                state.tight_palette.clear();
                for _ in 0..colours {
                    let c = Self::read_colour(input, &format)?;
                    state.tight_palette.push(c);
                }
                if colours == 2 {
                    1
                } else {
                    8
                }
            }
            other => return Err(RfbError::violation(format!("unknown tight filter {other}"))),
        };

        let row_size = (width * bits + 7) / 8;
        let data_len = height * row_size;
        if data_len < TIGHT_MIN_TO_COMPRESS {
            read_into(input, &mut state.raw, data_len)?;
        } else {
            let len = read_compact_length(input)?;
            if len == 0 {
                return Err(RfbError::violation("tight rect with empty compressed payload"));
            }
            read_into(input, &mut state.compressed, len)?;
            let stream = state.tight_streams[stream_id].get_or_insert_with(|| Decompress::new(true));
            inflate_exact(stream, &state.compressed, &mut state.raw, data_len)?;
        }

        state.pixels.clear();
        state.pixels.resize(width * height * P::BYTES, 0);
        match filter {
            TIGHT_FILTER_PALETTE => {
                palette_filter::<P>(&state.raw, &mut state.pixels, width, bits, &state.tight_palette, &format)?
            }
            TIGHT_FILTER_GRADIENT => gradient_filter::<P>(
                &state.raw,
                &mut state.pixels,
                width,
                &mut state.tight_prev_row,
                &format,
                cut_zeros,
            ),
            _ => copy_filter::<P>(&state.raw, &mut state.pixels, &format, cut_zeros),
        }
        fb.put_rect(rect.x, rect.y, rect.width, rect.height, &state.pixels)
    }
}

impl<P: Pixel> Decoder for TightDecoder<P> {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        fb.check_bounds(rect.x, rect.y, rect.width, rect.height)?;
        let mut ctl = input.read_u8()?;
        for id in 0..4 {
            if ctl & 1 != 0 {
                trace!("tight stream {} reset", id);
                state.reset_tight_stream(id);
            }
            ctl >>= 1;
        }

        match ctl {
            TIGHT_FILL => {
                let colour = Self::read_colour(input, fb.format())?;
                fb.fill_rect(rect.x, rect.y, rect.width, rect.height, colour)
            }
            TIGHT_JPEG => {
                if P::BITS == 8 {
                    return Err(RfbError::violation("tight jpeg at 8 bits per pixel"));
                }
                Self::decode_jpeg(rect, input, fb, state)
            }
            c if c > TIGHT_MAX_SUBENCODING => {
                Err(RfbError::violation(format!("tight compression control {c:#x}")))
            }
            c => Self::decode_basic(c, rect, input, fb, state),
        }
    }
}

fn copy_filter<P: Pixel>(data: &[u8], out: &mut [u8], format: &PixelFormat, cut_zeros: bool) {
    if cut_zeros {
        for (rgb, dst) in data.chunks_exact(3).zip(out.chunks_exact_mut(P::BYTES)) {
            P::from_u32(format.rgb24_to_pixel32(rgb[0], rgb[1], rgb[2])).put(dst, format.big_endian);
        }
    } else {
        out.copy_from_slice(&data[..out.len()]);
    }
}

fn palette_filter<P: Pixel>(
    data: &[u8],
    out: &mut [u8],
    width: usize,
    bits: usize,
    palette: &[u32],
    format: &PixelFormat,
) -> Result<()> {
    if width == 0 {
        return Ok(());
    }
    let row_size = (width * bits + 7) / 8;
    for (row, dst_row) in data.chunks_exact(row_size).zip(out.chunks_exact_mut(width * P::BYTES)) {
        for (x, dst) in dst_row.chunks_exact_mut(P::BYTES).enumerate() {
            let index = if bits == 1 {
                usize::from((row[x / 8] >> (7 - x % 8)) & 1)
            } else {
                usize::from(row[x])
            };
            let colour = *palette.get(index).ok_or_else(|| {
                RfbError::violation(format!("tight palette index {} of {}", index, palette.len()))
            })?;
            P::from_u32(colour).put(dst, format.big_endian);
        }
    }
    Ok(())
}

/// Each channel is predicted as `above + left - above_left`, clamped to the channel
/// range, and the transmitted value is added modulo the channel range.
fn gradient_filter<P: Pixel>(
    data: &[u8],
    out: &mut [u8],
    width: usize,
    rows: &mut Vec<u16>,
    format: &PixelFormat,
    cut_zeros: bool,
) {
    rows.clear();
    rows.resize(width * 6, 0);
    let (prev, this) = rows.split_at_mut(width * 3);

    let (max, shift, src_bytes) = if cut_zeros {
        ([0xFFu32; 3], [0u8; 3], 3)
    } else {
        (
            [u32::from(format.red_max), u32::from(format.green_max), u32::from(format.blue_max)],
            [format.red_shift, format.green_shift, format.blue_shift],
            P::BYTES,
        )
    };
    if width == 0 {
        return;
    }

    for (src_row, dst_row) in data.chunks_exact(width * src_bytes).zip(out.chunks_exact_mut(width * P::BYTES)) {
        for (x, (src, dst)) in src_row.chunks_exact(src_bytes).zip(dst_row.chunks_exact_mut(P::BYTES)).enumerate() {
            let raw = if cut_zeros {
                [u32::from(src[0]), u32::from(src[1]), u32::from(src[2])]
            } else {
                let v = P::from_slice(src, format.big_endian).to_u32();
                [v >> shift[0], v >> shift[1], v >> shift[2]]
            };
            let mut pix = [0u32; 3];
            for c in 0..3 {
                let i = x * 3 + c;
                let predicted = if x == 0 {
                    u32::from(prev[i])
                } else {
                    let est = i32::from(prev[i]) + i32::from(this[i - 3]) - i32::from(prev[i - 3]);
                    est.clamp(0, max[c] as i32) as u32
                };
                pix[c] = raw[c].wrapping_add(predicted) & max[c];
                this[i] = pix[c] as u16;
            }
            let value = if cut_zeros {
                format.rgb24_to_pixel32(pix[0] as u8, pix[1] as u8, pix[2] as u8)
            } else {
                format.rgb_to_pixel(pix[0], pix[1], pix[2])
            };
            P::from_u32(value).put(dst, format.big_endian);
        }
        prev.copy_from_slice(this);
    }
}
