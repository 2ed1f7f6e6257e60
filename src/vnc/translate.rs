//! Conversion from the client pixel format to RGBA8 for export.

use super::encoding::CursorShape;
use super::framebuffer::Framebuffer;
use super::protocol::PixelFormat;

/// Expands one channel to 0-255.
fn scale(value: u32, max: u16) -> u8 {
    match max {
        0 => 0,
        255 => value as u8,
        m => ((value * 255 + u32::from(m) / 2) / u32::from(m)) as u8,
    }
}

/// Splits a pixel value into 8-bit red, green and blue.
pub fn pixel_to_rgb(format: &PixelFormat, pixel: u32) -> [u8; 3] {
    let channel = |shift: u8, max: u16| scale((pixel >> shift) & u32::from(max), max);
    [
        channel(format.red_shift, format.red_max),
        channel(format.green_shift, format.green_max),
        channel(format.blue_shift, format.blue_max),
    ]
}

fn append_rgba(format: &PixelFormat, pixels: &[u8], out: &mut Vec<u8>) {
    let bpp = format.bytes_per_pixel();
    for chunk in pixels.chunks_exact(bpp) {
        let [r, g, b] = pixel_to_rgb(format, format.read_pixel(chunk));
        out.extend_from_slice(&[r, g, b, 0xFF]);
    }
}

/// Converts the whole framebuffer to RGBA8, row-major, fully opaque.
pub fn to_rgba(fb: &Framebuffer) -> Vec<u8> {
    let mut out = Vec::with_capacity(usize::from(fb.width()) * usize::from(fb.height()) * 4);
    append_rgba(fb.format(), fb.data(), &mut out);
    out
}

/// Converts a cursor shape to RGBA8 with its mask applied as alpha.
pub fn cursor_to_rgba(shape: &CursorShape, format: &PixelFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(shape.mask.len() * 4);
    append_rgba(format, &shape.pixels, &mut out);
    for (px, &opaque) in out.chunks_exact_mut(4).zip(&shape.mask) {
        px[3] = if opaque != 0 { 0xFF } else { 0 };
    }
    out
}
