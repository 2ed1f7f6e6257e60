//! VNC RRE (Rise-and-Run-length) encoding.
//!
//! A background colour for the whole rectangle followed by solid subrectangles
//! with 16-bit coordinates relative to the rectangle.

use std::io::Read;
use std::marker::PhantomData;

use byteorder::{BigEndian, ReadBytesExt};

use super::{Decoder, DecoderState, Pixel};
use crate::vnc::error::{Result, RfbError};
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::RectHeader;

/// Decoder for the "RRE" encoding.
pub struct RreDecoder<P: Pixel>(PhantomData<P>);

impl<P: Pixel> RreDecoder<P> {
    /// Creates the decoder.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

/// Paints one subrectangle after checking it lies inside its parent.
pub(super) fn fill_subrect(
    fb: &mut Framebuffer,
    rect: &RectHeader,
    (sx, sy, sw, sh): (u16, u16, u16, u16),
    colour: u32,
) -> Result<()> {
    if u32::from(sx) + u32::from(sw) > u32::from(rect.width) || u32::from(sy) + u32::from(sh) > u32::from(rect.height) {
        return Err(RfbError::violation(format!(
            "subrect {}x{}+{}+{} outside {}x{} rectangle",
            sw, sh, sx, sy, rect.width, rect.height
        )));
    }
    fb.fill_rect(rect.x + sx, rect.y + sy, sw, sh, colour)
}

impl<P: Pixel> Decoder for RreDecoder<P> {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        _state: &mut DecoderState,
    ) -> Result<()> {
        let big_endian = fb.format().big_endian;
        let count = input.read_u32::<BigEndian>()?;
        let background = P::read(input, big_endian)?;
        fb.fill_rect(rect.x, rect.y, rect.width, rect.height, background.to_u32())?;

        for _ in 0..count {
            let colour = P::read(input, big_endian)?;
            let sx = input.read_u16::<BigEndian>()?;
            let sy = input.read_u16::<BigEndian>()?;
            let sw = input.read_u16::<BigEndian>()?;
            let sh = input.read_u16::<BigEndian>()?;
            fill_subrect(fb, rect, (sx, sy, sw, sh), colour.to_u32())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnc::protocol::{PixelFormat, ENCODING_RRE};

    #[test]
    fn background_then_subrects() {
        let mut fb = Framebuffer::new(10, 10, PixelFormat::rgb565());
        let rect = RectHeader { x: 2, y: 2, width: 6, height: 6, encoding: ENCODING_RRE };
        let mut payload = vec![0, 0, 0, 1, 0x11, 0x11];
        payload.extend_from_slice(&[0x22, 0x22, 0, 1, 0, 1, 0, 2, 0, 3]);
        RreDecoder::<u16>::new()
            .decode(&rect, &mut payload.as_slice(), &mut fb, &mut DecoderState::default())
            .unwrap();
        assert_eq!(fb.pixel(2, 2).unwrap(), 0x1111);
        assert_eq!(fb.pixel(3, 3).unwrap(), 0x2222);
        assert_eq!(fb.pixel(4, 5).unwrap(), 0x2222);
        assert_eq!(fb.pixel(5, 3).unwrap(), 0x1111);
        assert_eq!(fb.pixel(1, 1).unwrap(), 0);
    }

    #[test]
    fn subrect_escaping_parent_is_rejected() {
        let mut fb = Framebuffer::new(10, 10, PixelFormat::bgr233());
        let rect = RectHeader { x: 0, y: 0, width: 4, height: 4, encoding: ENCODING_RRE };
        let payload = [0, 0, 0, 1, 0, 9, 0, 3, 0, 0, 0, 2, 0, 1];
        assert!(RreDecoder::<u8>::new()
            .decode(&rect, &mut &payload[..], &mut fb, &mut DecoderState::default())
            .is_err());
    }
}
