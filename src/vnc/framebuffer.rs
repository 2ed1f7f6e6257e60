//! Client-side framebuffer.
//!
//! Pixels are stored row-major in the negotiated client pixel format, so the
//! bytes of a Raw rectangle can be copied in without conversion. Every write
//! is bounds-checked first; a rectangle that does not fit is rejected before
//! any pixel changes.

use log::debug;

use super::error::{Result, RfbError};
use super::protocol::PixelFormat;

/// Pixel storage mirroring the server's screen.
#[derive(Debug, Clone)]
pub struct Framebuffer {
    width: u16,
    height: u16,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Framebuffer {
    /// Allocates a zeroed framebuffer.
    pub fn new(width: u16, height: u16, format: PixelFormat) -> Self {
        let len = usize::from(width) * usize::from(height) * format.bytes_per_pixel();
        Self { width, height, format, data: vec![0; len] }
    }

    /// Reallocates for a new size. Existing contents are discarded.
    pub fn resize(&mut self, width: u16, height: u16) {
        debug!("framebuffer resized {}x{} -> {}x{}", self.width, self.height, width, height);
        *self = Self::new(width, height, self.format);
    }

    /// Width in pixels.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Pixel format of the stored bytes.
    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    /// Raw pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        usize::from(self.width) * self.format.bytes_per_pixel()
    }

    /// Fails with a protocol violation unless the rectangle lies inside the buffer.
    pub fn check_bounds(&self, x: u16, y: u16, w: u16, h: u16) -> Result<()> {
        if u32::from(x) + u32::from(w) > u32::from(self.width) || u32::from(y) + u32::from(h) > u32::from(self.height)
        {
            return Err(RfbError::violation(format!(
                "rect {}x{}+{}+{} exceeds framebuffer {}x{}",
                w, h, x, y, self.width, self.height
            )));
        }
        Ok(())
    }

    fn offset(&self, x: u16, y: u16) -> usize {
        usize::from(y) * self.stride() + usize::from(x) * self.format.bytes_per_pixel()
    }

    /// Reads the pixel value at (x, y).
    pub fn pixel(&self, x: u16, y: u16) -> Result<u32> {
        self.check_bounds(x, y, 1, 1)?;
        let off = self.offset(x, y);
        Ok(self.format.read_pixel(&self.data[off..off + self.format.bytes_per_pixel()]))
    }

    /// Fills a rectangle with one pixel value.
    pub fn fill_rect(&mut self, x: u16, y: u16, w: u16, h: u16, pixel: u32) -> Result<()> {
        self.check_bounds(x, y, w, h)?;
        if w == 0 || h == 0 {
            return Ok(());
        }
        let bpp = self.format.bytes_per_pixel();
        let mut encoded = [0u8; 4];
        self.format.write_pixel(pixel, &mut encoded[..bpp]);

        let stride = self.stride();
        let row_len = usize::from(w) * bpp;
        let first = self.offset(x, y);
        for px in self.data[first..first + row_len].chunks_exact_mut(bpp) {
            px.copy_from_slice(&encoded[..bpp]);
        }
        for row in 1..usize::from(h) {
            let dst = first + row * stride;
            self.data.copy_within(first..first + row_len, dst);
        }
        Ok(())
    }

    /// Copies a row-major block of client-format pixels into the rectangle.
    pub fn put_rect(&mut self, x: u16, y: u16, w: u16, h: u16, src: &[u8]) -> Result<()> {
        self.check_bounds(x, y, w, h)?;
        let row_len = usize::from(w) * self.format.bytes_per_pixel();
        if src.len() < row_len * usize::from(h) {
            return Err(RfbError::violation(format!(
                "pixel block of {} bytes too short for {}x{}",
                src.len(),
                w,
                h
            )));
        }
        if row_len == 0 {
            return Ok(());
        }
        let stride = self.stride();
        let first = self.offset(x, y);
        for (row, line) in src.chunks_exact(row_len).take(usize::from(h)).enumerate() {
            let dst = first + row * stride;
            self.data[dst..dst + row_len].copy_from_slice(line);
        }
        Ok(())
    }

    /// Copies a rectangle within the buffer. Source and destination may overlap.
    pub fn copy_rect(&mut self, src_x: u16, src_y: u16, w: u16, h: u16, dst_x: u16, dst_y: u16) -> Result<()> {
        self.check_bounds(src_x, src_y, w, h)?;
        self.check_bounds(dst_x, dst_y, w, h)?;
        let row_len = usize::from(w) * self.format.bytes_per_pixel();
        if row_len == 0 || h == 0 {
            return Ok(());
        }
        let stride = self.stride();
        let src = self.offset(src_x, src_y);
        let dst = self.offset(dst_x, dst_y);
        // Walk rows away from the destination so unread source rows are never overwritten;
        // copy_within handles overlap inside a row.
        let mut copy_row = |row: usize| {
            let s = src + row * stride;
            self.data.copy_within(s..s + row_len, dst + row * stride);
        };
        if dst_y <= src_y {
            (0..usize::from(h)).for_each(&mut copy_row);
        } else {
            (0..usize::from(h)).rev().for_each(&mut copy_row);
        }
        Ok(())
    }
}
