//! Rectangle decoders.
//!
//! One [`Decoder`] per (encoding, bits-per-pixel) pair, looked up through a
//! static table built on first use. Pixel-generic decoders are instantiated
//! once for each of `u8`, `u16` and `u32` so the per-pixel loops are
//! monomorphized rather than branching on depth.
//!
//! Decoders read exactly the bytes their rectangle declares from the input and
//! write through the bounds-checked [`Framebuffer`] primitives. State that must
//! survive between rectangles (inflate streams, the Tight palette and gradient
//! row) lives in [`DecoderState`], owned by the connection.

use std::collections::HashMap;
use std::io::Read;

use flate2::Decompress;
use once_cell::sync::Lazy;

use super::error::Result;
use super::framebuffer::Framebuffer;
use super::protocol::{
    RectHeader, ENCODING_COPYRECT, ENCODING_CORRE, ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE, ENCODING_TIGHT,
    ENCODING_ULTRA, ENCODING_ULTRAZIP, ENCODING_ZLIB, ENCODING_ZRLE, ENCODING_ZYWRLE,
};

pub mod common;
pub mod copyrect;
pub mod corre;
pub mod cursor;
pub mod hextile;
pub mod lzo;
pub mod raw;
pub mod rre;
pub mod tight;
pub mod ultra;
pub mod zlib;
pub mod zrle;
pub mod zywrle;

pub use common::Pixel;
pub use cursor::CursorShape;

/// Decodes one rectangle of a particular encoding into the framebuffer.
pub trait Decoder: Send + Sync {
    /// Consumes the rectangle payload from `input` and paints it.
    ///
    /// # Arguments
    ///
    /// * `rect` - The rectangle header as received.
    /// * `input` - The byte stream positioned at the start of the payload.
    /// * `fb` - The framebuffer to paint into.
    /// * `state` - Per-connection decoder state.
    fn decode(
        &self,
        rect: &RectHeader,
        input: &mut dyn Read,
        fb: &mut Framebuffer,
        state: &mut DecoderState,
    ) -> Result<()>;
}

/// Decoder state that persists across rectangles of one connection.
#[derive(Debug, Default)]
pub struct DecoderState {
    pub(crate) zlib_stream: Option<Decompress>,
    pub(crate) zrle_stream: Option<Decompress>,
    pub(crate) tight_streams: [Option<Decompress>; 4],
    pub(crate) tight_palette: Vec<u32>,
    pub(crate) tight_prev_row: Vec<u16>,
    /// Quality level in effect for ZYWRLE (0-9).
    pub(crate) zywrle_quality: u8,
    /// Compressed bytes of the current rectangle.
    pub(crate) compressed: Vec<u8>,
    /// Decompressed bytes of the current rectangle.
    pub(crate) raw: Vec<u8>,
    /// Client-format pixels produced from `raw` by a filter.
    pub(crate) pixels: Vec<u8>,
    /// Pixel values of the ZRLE tile being decoded.
    pub(crate) tile: Vec<u32>,
    pub(crate) zywrle_coeffs: Vec<[i8; 3]>,
    /// Bounding box (x, y, w, h) of what the last UltraZip block painted.
    pub(crate) ultrazip_region: Option<(u16, u16, u16, u16)>,
}

impl DecoderState {
    /// Creates state for a connection that negotiated `zywrle_quality`.
    pub fn new(zywrle_quality: u8) -> Self {
        Self { zywrle_quality, ..Default::default() }
    }

    /// Drops Tight stream `id` so the next rectangle using it starts a fresh inflate context.
    pub fn reset_tight_stream(&mut self, id: usize) {
        if let Some(slot) = self.tight_streams.get_mut(id) {
            *slot = None;
        }
    }

    /// Whether Tight stream `id` currently holds an inflate context.
    pub fn tight_stream_active(&self, id: usize) -> bool {
        self.tight_streams.get(id).is_some_and(Option::is_some)
    }

    /// Takes the area painted by the last UltraZip block, if it painted anything.
    pub fn take_ultrazip_region(&mut self) -> Option<(u16, u16, u16, u16)> {
        self.ultrazip_region.take()
    }

    /// Sets the quality level ZYWRLE uses to derive its wavelet depth.
    pub fn set_zywrle_quality(&mut self, quality: u8) {
        self.zywrle_quality = quality;
    }
}

type DecoderTable = HashMap<(i32, u8), Box<dyn Decoder>>;

static DECODERS: Lazy<DecoderTable> = Lazy::new(|| {
    let mut table = DecoderTable::new();
    register::<u8>(&mut table);
    register::<u16>(&mut table);
    register::<u32>(&mut table);
    table
});

fn register<P: Pixel>(table: &mut DecoderTable) {
    let bits = P::BITS;
    table.insert((ENCODING_RAW, bits), Box::new(raw::RawDecoder));
    table.insert((ENCODING_COPYRECT, bits), Box::new(copyrect::CopyRectDecoder));
    table.insert((ENCODING_RRE, bits), Box::new(rre::RreDecoder::<P>::new()));
    table.insert((ENCODING_CORRE, bits), Box::new(corre::CoRreDecoder::<P>::new()));
    table.insert((ENCODING_HEXTILE, bits), Box::new(hextile::HextileDecoder::<P>::new()));
    table.insert((ENCODING_ZLIB, bits), Box::new(zlib::ZlibDecoder));
    table.insert((ENCODING_TIGHT, bits), Box::new(tight::TightDecoder::<P>::new()));
    table.insert((ENCODING_ULTRA, bits), Box::new(ultra::UltraDecoder));
    table.insert((ENCODING_ULTRAZIP, bits), Box::new(ultra::UltraZipDecoder));
    table.insert((ENCODING_ZRLE, bits), Box::new(zrle::ZrleDecoder::<P>::new(false)));
    table.insert((ENCODING_ZYWRLE, bits), Box::new(zrle::ZrleDecoder::<P>::new(true)));
}

/// Returns the decoder for `encoding` at `bits_per_pixel`, if one exists.
pub fn decoder_for(encoding: i32, bits_per_pixel: u8) -> Option<&'static dyn Decoder> {
    DECODERS.get(&(encoding, bits_per_pixel)).map(|d| d.as_ref())
}
