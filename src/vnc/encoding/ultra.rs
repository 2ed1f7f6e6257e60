//! UltraVNC "Ultra" and "UltraZip" encodings, both LZO1X compressed.
//!
//! Ultra carries one rectangle of Raw pixels. UltraZip batches many small
//! rectangles into one compressed block; its header fields are reused: `x`
//! holds the sub-rectangle count and `y + width * 65535` bounds the
//! decompressed size.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use super::common::{read_length_prefixed, rect_bytes};
use super::lzo::{self, compressed_bound};
use super::{Decoder, DecoderState};
use crate::vnc::error::{Result, RfbError};
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::{RectHeader, ENCODING_RAW};

/// Sub-rectangle header inside an UltraZip block: x, y, w, h (u16) and encoding (u32).
const SUBRECT_HEADER_LEN: usize = 12;

/// Slack UltraVNC servers are allowed beyond the advertised size.
const ULTRAZIP_SLACK: usize = 500;

/// Decoder for the "Ultra" encoding. Depth-independent.
pub struct UltraDecoder;

impl Decoder for UltraDecoder {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        let expected = rect_bytes(rect.width, rect.height, fb.format().bytes_per_pixel());
        let len = read_length_prefixed(input, &mut state.compressed, compressed_bound(expected))?;
        if len == 0 {
            return Ok(());
        }
        fb.check_bounds(rect.x, rect.y, rect.width, rect.height)?;
        if expected == 0 {
            return Err(RfbError::violation("ultra rect carries data but has no pixels"));
        }

        let raw = lzo::decompress(&state.compressed, expected)?;
        if raw.len() != expected {
            return Err(RfbError::violation(format!(
                "ultra rect decompressed to {} bytes, expected {}",
                raw.len(),
                expected
            )));
        }
        trace!("ultra rect {}x{}: {} -> {} bytes", rect.width, rect.height, len, expected);
        fb.put_rect(rect.x, rect.y, rect.width, rect.height, &raw)
    }
}

/// Decoder for the "UltraZip" encoding. Depth-independent.
pub struct UltraZipDecoder;

impl Decoder for UltraZipDecoder {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        state.ultrazip_region = None;
        let count = usize::from(rect.x);
        let limit = usize::from(rect.y) + usize::from(rect.width) * 65535;
        let len = read_length_prefixed(input, &mut state.compressed, compressed_bound(limit + ULTRAZIP_SLACK))?;
        if len == 0 {
            return Ok(());
        }
        if limit == 0 {
            return Err(RfbError::violation("ultrazip block advertises no decompressed size"));
        }

        let raw = lzo::decompress(&state.compressed, limit + ULTRAZIP_SLACK)?;
        debug!("ultrazip block: {} sub-rects, {} -> {} bytes", count, len, raw.len());

        let bpp = fb.format().bytes_per_pixel();
        let mut pos = 0usize;
        for i in 0..count {
            let header = raw
                .get(pos..pos + SUBRECT_HEADER_LEN)
                .ok_or_else(|| RfbError::violation(format!("ultrazip sub-rect {i} header truncated")))?;
            let sx = BigEndian::read_u16(&header[0..2]);
            let sy = BigEndian::read_u16(&header[2..4]);
            let sw = BigEndian::read_u16(&header[4..6]);
            let sh = BigEndian::read_u16(&header[6..8]);
            let encoding = BigEndian::read_i32(&header[8..12]);
            pos += SUBRECT_HEADER_LEN;

            if encoding != ENCODING_RAW {
                return Err(RfbError::violation(format!(
                    "ultrazip sub-rect {i} uses encoding {encoding}, only raw is supported"
                )));
            }
            let size = rect_bytes(sw, sh, bpp);
            let pixels = raw
                .get(pos..pos + size)
                .ok_or_else(|| RfbError::violation(format!("ultrazip sub-rect {i} pixels truncated")))?;
            fb.put_rect(sx, sy, sw, sh, pixels)?;
            if sw > 0 && sh > 0 {
                state.ultrazip_region = Some(grow(state.ultrazip_region, sx, sy, sw, sh));
            }
            pos += size;
        }
        Ok(())
    }
}

/// Smallest (x, y, w, h) covering `region` and the given rectangle.
fn grow(region: Option<(u16, u16, u16, u16)>, x: u16, y: u16, w: u16, h: u16) -> (u16, u16, u16, u16) {
    let (right, bottom) = (u32::from(x) + u32::from(w), u32::from(y) + u32::from(h));
    let Some((rx, ry, rw, rh)) = region else {
        return (x, y, w, h);
    };
    let left = rx.min(x);
    let top = ry.min(y);
    let right = right.max(u32::from(rx) + u32::from(rw));
    let bottom = bottom.max(u32::from(ry) + u32::from(rh));
    (left, top, (right - u32::from(left)) as u16, (bottom - u32::from(top)) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnc::protocol::{PixelFormat, ENCODING_ULTRA, ENCODING_ULTRAZIP};

    /// Wraps bytes in an LZO1X block made of one literal run.
    fn literal_block(data: &[u8]) -> Vec<u8> {
        assert!(!data.is_empty() && data.len() <= 238);
        let mut block = vec![data.len() as u8 + 17];
        block.extend_from_slice(data);
        block.extend_from_slice(&[0x11, 0, 0]);
        block
    }

    fn framed(block: &[u8]) -> Vec<u8> {
        let mut out = (block.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(block);
        out
    }

    #[test]
    fn ultra_paints_rect() {
        let mut fb = Framebuffer::new(4, 4, PixelFormat::bgr233());
        let payload = framed(&literal_block(&[1, 2, 3, 4, 5, 6]));
        let rect = RectHeader { x: 1, y: 1, width: 3, height: 2, encoding: ENCODING_ULTRA };
        UltraDecoder.decode(&rect, &mut payload.as_slice(), &mut fb, &mut DecoderState::default()).unwrap();
        assert_eq!(fb.pixel(1, 1).unwrap(), 1);
        assert_eq!(fb.pixel(3, 2).unwrap(), 6);
    }

    #[test]
    fn ultra_size_mismatch_and_empty() {
        let mut fb = Framebuffer::new(4, 4, PixelFormat::bgr233());
        let rect = RectHeader { x: 0, y: 0, width: 2, height: 2, encoding: ENCODING_ULTRA };
        let short = framed(&literal_block(&[1, 2, 3]));
        assert!(matches!(
            UltraDecoder.decode(&rect, &mut short.as_slice(), &mut fb, &mut DecoderState::default()),
            Err(RfbError::ProtocolViolation(_))
        ));
        UltraDecoder
            .decode(&rect, &mut &[0u8, 0, 0, 0][..], &mut fb, &mut DecoderState::default())
            .unwrap();
    }

    #[test]
    fn ultrazip_paints_sub_rects() {
        let mut fb = Framebuffer::new(8, 8, PixelFormat::bgr233());
        let mut data = Vec::new();
        for (x, y, v) in [(0u16, 0u16, 7u8), (6, 6, 9)] {
            data.extend_from_slice(&x.to_be_bytes());
            data.extend_from_slice(&y.to_be_bytes());
            data.extend_from_slice(&2u16.to_be_bytes());
            data.extend_from_slice(&1u16.to_be_bytes());
            data.extend_from_slice(&ENCODING_RAW.to_be_bytes());
            data.extend_from_slice(&[v, v]);
        }
        let payload = framed(&literal_block(&data));
        let rect = RectHeader { x: 2, y: data.len() as u16, width: 0, height: 0, encoding: ENCODING_ULTRAZIP };
        let mut state = DecoderState::default();
        UltraZipDecoder.decode(&rect, &mut payload.as_slice(), &mut fb, &mut state).unwrap();
        assert_eq!(fb.pixel(1, 0).unwrap(), 7);
        assert_eq!(fb.pixel(7, 6).unwrap(), 9);
        assert_eq!(fb.pixel(2, 0).unwrap(), 0);
        assert_eq!(state.take_ultrazip_region(), Some((0, 0, 8, 7)));
        assert_eq!(state.take_ultrazip_region(), None);
    }

    #[test]
    fn painted_region_covers_only_sub_rects() {
        assert_eq!(grow(None, 3, 4, 2, 1), (3, 4, 2, 1));
        assert_eq!(grow(Some((3, 4, 2, 1)), 10, 1, 1, 1), (3, 1, 8, 4));
        assert_eq!(grow(Some((0, 0, 8, 8)), 2, 2, 1, 1), (0, 0, 8, 8));

        let mut state = DecoderState { ultrazip_region: Some((0, 0, 1, 1)), ..Default::default() };
        let mut fb = Framebuffer::new(8, 8, PixelFormat::bgr233());
        let rect = RectHeader { x: 0, y: 0, width: 0, height: 0, encoding: ENCODING_ULTRAZIP };
        UltraZipDecoder.decode(&rect, &mut &[0u8, 0, 0, 0][..], &mut fb, &mut state).unwrap();
        assert_eq!(state.take_ultrazip_region(), None);
    }

    #[test]
    fn oversized_length_fails_before_reading() {
        let mut fb = Framebuffer::new(8, 8, PixelFormat::bgr233());
        let mut payload = 0xFFFF_FFF0u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0x78, 0x9c]);

        let mut state = DecoderState::default();
        let rect = RectHeader { x: 0, y: 0, width: 8, height: 8, encoding: ENCODING_ULTRA };
        let err = UltraDecoder.decode(&rect, &mut payload.as_slice(), &mut fb, &mut state).unwrap_err();
        assert!(matches!(err, RfbError::ProtocolViolation(_)), "{err}");
        assert!(state.compressed.capacity() < 4096);

        let rect = RectHeader { x: 4, y: 100, width: 1, height: 0, encoding: ENCODING_ULTRAZIP };
        let err = UltraZipDecoder.decode(&rect, &mut payload.as_slice(), &mut fb, &mut state).unwrap_err();
        assert!(matches!(err, RfbError::ProtocolViolation(_)), "{err}");
        assert!(state.compressed.capacity() < 4096);
    }

    #[test]
    fn ultrazip_rejects_encoded_sub_rects() {
        let mut fb = Framebuffer::new(8, 8, PixelFormat::bgr233());
        let mut data = vec![0, 0, 0, 0, 0, 1, 0, 1];
        data.extend_from_slice(&5i32.to_be_bytes());
        data.push(1);
        let payload = framed(&literal_block(&data));
        let rect = RectHeader { x: 1, y: 64, width: 0, height: 0, encoding: ENCODING_ULTRAZIP };
        assert!(UltraZipDecoder
            .decode(&rect, &mut payload.as_slice(), &mut fb, &mut DecoderState::default())
            .is_err());
    }
}
