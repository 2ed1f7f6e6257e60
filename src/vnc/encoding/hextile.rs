//! VNC Hextile encoding.
//!
//! The rectangle is cut into 16x16 tiles (clipped at the right and bottom
//! edges). Each tile starts with a subencoding mask; background and foreground
//! colours carry over from the previous tile when a tile does not respecify them.

use std::io::Read;
use std::marker::PhantomData;

use byteorder::ReadBytesExt;

use super::{Decoder, DecoderState, Pixel};
use crate::vnc::error::{Result, RfbError};
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::{
    RectHeader, HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED, HEXTILE_FOREGROUND_SPECIFIED, HEXTILE_RAW,
    HEXTILE_SUBRECTS_COLOURED,
};

const TILE_SIZE: u16 = 16;

/// Decoder for the "Hextile" encoding.
pub struct HextileDecoder<P: Pixel>(PhantomData<P>);

impl<P: Pixel> HextileDecoder<P> {
    /// Creates the decoder.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P: Pixel> Decoder for HextileDecoder<P> {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        fb.check_bounds(rect.x, rect.y, rect.width, rect.height)?;
        let big_endian = fb.format().big_endian;
        let mut background = P::default();
        let mut foreground = P::default();

        for ty in (rect.y..rect.y + rect.height).step_by(usize::from(TILE_SIZE)) {
            let th = TILE_SIZE.min(rect.y + rect.height - ty);
            for tx in (rect.x..rect.x + rect.width).step_by(usize::from(TILE_SIZE)) {
                let tw = TILE_SIZE.min(rect.x + rect.width - tx);
                let mask = input.read_u8()?;

                if mask & HEXTILE_RAW != 0 {
                    let len = usize::from(tw) * usize::from(th) * P::BYTES;
                    state.raw.clear();
                    state.raw.resize(len, 0);
                    input.read_exact(&mut state.raw)?;
                    fb.put_rect(tx, ty, tw, th, &state.raw)?;
                    continue;
                }

                if mask & HEXTILE_BACKGROUND_SPECIFIED != 0 {
                    background = P::read(input, big_endian)?;
                }
                fb.fill_rect(tx, ty, tw, th, background.to_u32())?;

                if mask & HEXTILE_FOREGROUND_SPECIFIED != 0 {
                    foreground = P::read(input, big_endian)?;
                }
                if mask & HEXTILE_ANY_SUBRECTS == 0 {
                    continue;
                }

                let count = input.read_u8()?;
                for _ in 0..count {
                    let colour = if mask & HEXTILE_SUBRECTS_COLOURED != 0 {
                        P::read(input, big_endian)?
                    } else {
                        foreground
                    };
                    let xy = input.read_u8()?;
                    let wh = input.read_u8()?;
                    let (sx, sy) = (u16::from(xy >> 4), u16::from(xy & 0x0F));
                    let (sw, sh) = (u16::from(wh >> 4) + 1, u16::from(wh & 0x0F) + 1);
                    if sx + sw > tw || sy + sh > th {
                        return Err(RfbError::violation(format!(
                            "hextile subrect {}x{}+{}+{} outside {}x{} tile",
                            sw, sh, sx, sy, tw, th
                        )));
                    }
                    fb.fill_rect(tx + sx, ty + sy, sw, sh, colour.to_u32())?;
                }
            }
        }
        Ok(())
    }
}
