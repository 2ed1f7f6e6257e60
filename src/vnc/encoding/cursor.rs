//! Cursor shape pseudo-encodings.
//!
//! XCursor sends two colours and a 1-bit source bitmap; RichCursor sends a
//! full block of client-format pixels. Both end with a 1-bit transparency mask
//! whose rows are padded to whole bytes. The rectangle position is the hotspot.

use std::io::Read;

use crate::vnc::error::{Result, RfbError};
use crate::vnc::protocol::{PixelFormat, RectHeader, ENCODING_RICH_CURSOR, ENCODING_XCURSOR};

/// A cursor image announced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    /// Hotspot X within the image.
    pub hot_x: u16,
    /// Hotspot Y within the image.
    pub hot_y: u16,
    /// Image width.
    pub width: u16,
    /// Image height.
    pub height: u16,
    /// Pixels in the client pixel format, row-major.
    pub pixels: Vec<u8>,
    /// One byte per pixel: 1 where the cursor is opaque.
    pub mask: Vec<u8>,
}

fn bitmap_len(width: u16, height: u16) -> usize {
    usize::from(width).div_ceil(8) * usize::from(height)
}

fn read_bitmap(input: &mut dyn Read, width: u16, height: u16) -> Result<Vec<u8>> {
    let mut packed = vec![0u8; bitmap_len(width, height)];
    input.read_exact(&mut packed)?;
    let row_bytes = usize::from(width).div_ceil(8);
    let mut bits = Vec::with_capacity(usize::from(width) * usize::from(height));
    for row in packed.chunks_exact(row_bytes.max(1)) {
        bits.extend((0..usize::from(width)).map(|x| (row[x / 8] >> (7 - x % 8)) & 1));
    }
    Ok(bits)
}

/// Reads an XCursor or RichCursor payload. A zero-sized cursor carries no data and yields `None`.
pub fn decode_cursor(rect: &RectHeader, input: &mut dyn Read, format: &PixelFormat) -> Result<Option<CursorShape>> {
    if rect.width == 0 || rect.height == 0 {
        return Ok(None);
    }
    let bpp = format.bytes_per_pixel();
    let count = usize::from(rect.width) * usize::from(rect.height);

    let pixels = match rect.encoding {
        ENCODING_XCURSOR => {
            let mut colours = [0u8; 6];
            input.read_exact(&mut colours)?;
            let mut fore = [0u8; 4];
            let mut back = [0u8; 4];
            format.write_pixel(format.rgb24_to_pixel(colours[0], colours[1], colours[2]), &mut fore[..bpp]);
            format.write_pixel(format.rgb24_to_pixel(colours[3], colours[4], colours[5]), &mut back[..bpp]);

            let source = read_bitmap(input, rect.width, rect.height)?;
            let mut pixels = Vec::with_capacity(count * bpp);
            for bit in source {
                pixels.extend_from_slice(if bit != 0 { &fore[..bpp] } else { &back[..bpp] });
            }
            pixels
        }
        ENCODING_RICH_CURSOR => {
            let mut pixels = vec![0u8; count * bpp];
            input.read_exact(&mut pixels)?;
            pixels
        }
        other => return Err(RfbError::violation(format!("encoding {other} is not a cursor shape"))),
    };
    let mask = read_bitmap(input, rect.width, rect.height)?;

    Ok(Some(CursorShape { hot_x: rect.x, hot_y: rect.y, width: rect.width, height: rect.height, pixels, mask }))
}
