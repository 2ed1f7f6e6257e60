//! VNC Zlib encoding.
//!
//! A u32 length followed by that many bytes of zlib data which inflate to a
//! Raw rectangle. One inflate stream lives for the whole connection.

use std::io::Read;

use flate2::Decompress;
use log::trace;

use super::common::{deflate_bound, inflate_exact, read_length_prefixed, rect_bytes};
use super::{Decoder, DecoderState};
use crate::vnc::error::Result;
use crate::vnc::framebuffer::Framebuffer;
use crate::vnc::protocol::RectHeader;

/// Decoder for the "Zlib" encoding. Depth-independent.
pub struct ZlibDecoder;

impl Decoder for ZlibDecoder {
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()> {
        fb.check_bounds(rect.x, rect.y, rect.width, rect.height)?;
        let expected = rect_bytes(rect.width, rect.height, fb.format().bytes_per_pixel());
        let len = read_length_prefixed(input, &mut state.compressed, deflate_bound(expected))?;
        trace!("zlib rect {}x{}: {} -> {} bytes", rect.width, rect.height, len, expected);

        let stream = state.zlib_stream.get_or_insert_with(|| Decompress::new(true));
        inflate_exact(stream, &state.compressed, &mut state.raw, expected)?;
        fb.put_rect(rect.x, rect.y, rect.width, rect.height, &state.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnc::error::RfbError;
    use crate::vnc::protocol::{PixelFormat, ENCODING_ZLIB};
    use flate2::{Compress, Compression, FlushCompress};

    fn message(c: &mut Compress, pixels: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(pixels.len() + 64);
        c.compress_vec(pixels, &mut body, FlushCompress::Sync).unwrap();
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn stream_persists_between_rects() {
        let mut fb = Framebuffer::new(4, 2, PixelFormat::bgr233());
        let mut state = DecoderState::default();
        let mut c = Compress::new(Compression::default(), true);
        let rect = RectHeader { x: 0, y: 0, width: 4, height: 1, encoding: ENCODING_ZLIB };

        let first = message(&mut c, &[1, 2, 3, 4]);
        ZlibDecoder.decode(&rect, &mut first.as_slice(), &mut fb, &mut state).unwrap();
        let second = message(&mut c, &[5, 6, 7, 8]);
        let rect2 = RectHeader { y: 1, ..rect };
        ZlibDecoder.decode(&rect2, &mut second.as_slice(), &mut fb, &mut state).unwrap();

        assert_eq!(fb.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn short_output_is_a_violation() {
        let mut fb = Framebuffer::new(4, 4, PixelFormat::bgr233());
        let mut c = Compress::new(Compression::default(), true);
        let payload = message(&mut c, &[1, 2, 3]);
        let rect = RectHeader { x: 0, y: 0, width: 2, height: 2, encoding: ENCODING_ZLIB };
        assert!(ZlibDecoder
            .decode(&rect, &mut payload.as_slice(), &mut fb, &mut DecoderState::default())
            .is_err());
    }

    #[test]
    fn oversized_length_fails_before_reading() {
        let mut fb = Framebuffer::new(4, 4, PixelFormat::bgr233());
        let mut state = DecoderState::default();
        let mut payload = 0xFFFF_FFF0u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0x78, 0x9c]);
        let rect = RectHeader { x: 0, y: 0, width: 4, height: 4, encoding: ENCODING_ZLIB };
        let err = ZlibDecoder.decode(&rect, &mut payload.as_slice(), &mut fb, &mut state).unwrap_err();
        assert!(matches!(err, RfbError::ProtocolViolation(_)), "{err}");
        assert!(state.compressed.capacity() < 4096);
    }
}
