//! VNC CopyRect encoding: the rectangle is a copy of another region of the framebuffer.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};

use super::{Decoder, DecoderState};
use crate::vnc::error::Result;
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::RectHeader;

/// Decoder for the "CopyRect" encoding. Depth-independent.
pub struct CopyRectDecoder;

impl Decoder for CopyRectDecoder {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        _state: &mut DecoderState,
    ) -> Result<()> {
        let src_x = input.read_u16::<BigEndian>()?;
        let src_y = input.read_u16::<BigEndian>()?;
        fb.copy_rect(src_x, src_y, rect.width, rect.height, rect.x, rect.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnc::protocol::{PixelFormat, ENCODING_COPYRECT};

    #[test]
    fn copies_from_current_buffer() {
        let mut fb = Framebuffer::new(8, 8, PixelFormat::rgb888());
        fb.fill_rect(0, 0, 2, 2, 0xABCDEF).unwrap();
        let rect = RectHeader { x: 5, y: 4, width: 2, height: 2, encoding: ENCODING_COPYRECT };
        CopyRectDecoder
            .decode(&rect, &mut &[0u8, 0, 0, 0][..], &mut fb, &mut DecoderState::default())
            .unwrap();
        assert_eq!(fb.pixel(6, 5).unwrap(), 0xABCDEF);
        assert_eq!(fb.pixel(4, 4).unwrap(), 0);
    }

    #[test]
    fn source_outside_buffer_is_rejected() {
        let mut fb = Framebuffer::new(8, 8, PixelFormat::rgb888());
        let rect = RectHeader { x: 0, y: 0, width: 4, height: 4, encoding: ENCODING_COPYRECT };
        assert!(CopyRectDecoder
            .decode(&rect, &mut &[0u8, 6, 0, 0][..], &mut fb, &mut DecoderState::default())
            .is_err());
    }
}
