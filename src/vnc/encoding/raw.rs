//! VNC Raw encoding.
//!
//! Pixels arrive row-major in the client format and are copied straight into
//! the framebuffer, a band of rows at a time.

use std::io::Read;

use super::{Decoder, DecoderState};
use crate::vnc::error::Result;
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::RectHeader;
use crate::vnc::stream::READ_BUFFER_SIZE;

/// Decoder for the "Raw" encoding. Depth-independent.
pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        fb.check_bounds(rect.x, rect.y, rect.width, rect.height)?;
        let row_len = usize::from(rect.width) * fb.format().bytes_per_pixel();
        if row_len == 0 || rect.height == 0 {
            return Ok(());
        }
        let rows_per_band = (READ_BUFFER_SIZE / row_len).clamp(1, usize::from(rect.height));
        let mut y = 0usize;
        while y < usize::from(rect.height) {
            let rows = rows_per_band.min(usize::from(rect.height) - y);
            state.raw.clear();
            state.raw.resize(rows * row_len, 0);
            input.read_exact(&mut state.raw)?;
            fb.put_rect(rect.x, rect.y + y as u16, rect.width, rows as u16, &state.raw)?;
            y += rows;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnc::error::RfbError;
    use crate::vnc::protocol::{PixelFormat, ENCODING_RAW};

    fn rect(x: u16, y: u16, width: u16, height: u16) -> RectHeader {
        RectHeader { x, y, width, height, encoding: ENCODING_RAW }
    }

    #[test]
    fn copies_pixels_verbatim() {
        let mut fb = Framebuffer::new(4, 4, PixelFormat::rgb565());
        let payload: Vec<u8> = (0..12).collect();
        RawDecoder
            .decode(&rect(1, 1, 3, 2), &mut payload.as_slice(), &mut fb, &mut DecoderState::default())
            .unwrap();
        assert_eq!(fb.pixel(1, 1).unwrap(), 0x0100);
        assert_eq!(fb.pixel(3, 2).unwrap(), 0x0B0A);
        assert_eq!(fb.pixel(0, 1).unwrap(), 0);
    }

    #[test]
    fn large_rect_spans_several_bands() {
        let (w, h) = (300u16, 40u16);
        let mut fb = Framebuffer::new(w, h, PixelFormat::rgb888());
        let payload: Vec<u8> = (0..usize::from(w) * usize::from(h) * 4).map(|i| (i / 4 % 251) as u8).collect();
        RawDecoder
            .decode(&rect(0, 0, w, h), &mut payload.as_slice(), &mut fb, &mut DecoderState::default())
            .unwrap();
        assert_eq!(fb.data(), payload.as_slice());
    }

    #[test]
    fn short_payload_is_closed_transport() {
        let mut fb = Framebuffer::new(4, 4, PixelFormat::bgr233());
        let err = RawDecoder
            .decode(&rect(0, 0, 4, 4), &mut &[1u8, 2, 3][..], &mut fb, &mut DecoderState::default())
            .unwrap_err();
        assert!(matches!(err, RfbError::TransportClosed));
    }
}
