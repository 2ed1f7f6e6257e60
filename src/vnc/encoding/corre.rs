//! VNC CoRRE encoding: RRE with 8-bit subrectangle geometry.

use std::io::Read;
use std::marker::PhantomData;

use byteorder::{BigEndian, ReadBytesExt};

use super::rre::fill_subrect;
use super::{Decoder, DecoderState, Pixel};
use crate::vnc::error::Result;
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::RectHeader;

/// Decoder for the "CoRRE" encoding.
pub struct CoRreDecoder<P: Pixel>(PhantomData<P>);

impl<P: Pixel> CoRreDecoder<P> {
    /// Creates the decoder.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P: Pixel> Decoder for CoRreDecoder<P> {
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
            let mut geom = [0u8; 4];
            input.read_exact(&mut geom)?;
            let [sx, sy, sw, sh] = geom.map(u16::from);
            fill_subrect(fb, rect, (sx, sy, sw, sh), colour.to_u32())?;
        }
        Ok(())
    }
}
