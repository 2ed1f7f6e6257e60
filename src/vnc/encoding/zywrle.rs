//! ZYWRLE wavelet reconstruction.
//!
//! A ZYWRLE rectangle is a ZRLE rectangle whose tile pixels carry
//! piecewise-linear Haar coefficients instead of colours. The part of the tile
//! aligned to `1 << level` holds the coefficient bands, highest frequency
//! first; the leftover right and bottom strips are sent as plain pixels after
//! them. Synthesis undoes the packing, runs the inverse transform and converts
//! from the reversible YUV colour transform back to RGB.

use crate::vnc::protocol::PixelFormat;

/// Channel layout the coefficients are packed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// 8 bits per channel in a 32-bit pixel.
    Rgb888,
    /// 5-6-5 in a 16-bit pixel.
    Rgb565,
    /// 5-5-5 in a 16-bit pixel.
    Rgb555,
}

impl Packing {
    /// Packing used for a client pixel format, `None` at 8 bpp where ZYWRLE is plain ZRLE.
    pub fn for_format(format: &PixelFormat) -> Option<Self> {
        match format.bits_per_pixel {
            32 => Some(Packing::Rgb888),
            16 if format.green_max <= 31 => Some(Packing::Rgb555),
            16 => Some(Packing::Rgb565),
            _ => None,
        }
    }

    /// Extracts R, G and B, each left-aligned in a byte.
    fn load(self, p: u32) -> [i32; 3] {
        let p = p as i32;
        match self {
            Packing::Rgb888 => [(p >> 16) & 0xFF, (p >> 8) & 0xFF, p & 0xFF],
            Packing::Rgb565 => [(p >> 8) & 0xF8, (p >> 3) & 0xFC, (p << 3) & 0xF8],
            Packing::Rgb555 => [(p >> 7) & 0xF8, (p >> 2) & 0xF8, (p << 3) & 0xF8],
        }
    }

    /// Stores R, G and B into `p`. Bits outside the channels survive in the 32-bit layout.
    fn save(self, p: u32, [r, g, b]: [i32; 3]) -> u32 {
        let (r, g, b) = (r as u32, g as u32, b as u32);
        match self {
            Packing::Rgb888 => (p & 0xFF00_0000) | ((r & 0xFF) << 16) | ((g & 0xFF) << 8) | (b & 0xFF),
            Packing::Rgb565 => ((r & 0xF8) << 8) | ((g & 0xFC) << 3) | ((b & 0xF8) >> 3),
            Packing::Rgb555 => ((r & 0xF8) << 7) | ((g & 0xF8) << 2) | ((b & 0xF8) >> 3),
        }
    }
}

/// Wavelet depth for a JPEG quality level: 3 at low quality down to 0 (plain ZRLE) at 9.
/// Bit 7 set disables the transform.
pub fn level_for_quality(quality: u8) -> u32 {
    if quality & 0x80 != 0 {
        0
    } else {
        u32::from(3u8.saturating_sub(quality / 3))
    }
}

/// One coefficient triple: byte 0 is U, byte 1 is Y, byte 2 is V.
type Coeff = [i8; 3];

fn aligned(tw: usize, th: usize, level: u32) -> (usize, usize) {
    let mask = !((1usize << level) - 1);
    (tw & mask, th & mask)
}

/// Visits the coefficient indices of band `r` (0 = low pass, 1..=3 = details) at level `l`
/// in the order they are transmitted.
fn for_each_in_band(w: usize, h: usize, l: u32, r: u32, mut f: impl FnMut(usize)) {
    let s = 2usize << l;
    let mut offset = 0;
    if r & 1 != 0 {
        offset += s >> 1;
    }
    if r & 2 != 0 {
        offset += (s >> 1) * w;
    }
    for by in 0..h / s {
        for bx in 0..w / s {
            f(offset + by * s * w + bx * s);
        }
    }
}

/// Bands in transmission order: for each level the three detail bands, and the
/// low pass band after the deepest level.
fn bands(level: u32) -> impl Iterator<Item = (u32, u32)> {
    (0..level).flat_map(move |l| {
        [3, 2, 1, 0]
            .into_iter()
            .filter(move |&r| r != 0 || l == level - 1)
            .map(move |r| (l, r))
    })
}

/// Visits the unaligned pixels: the right strip, the bottom strip, then the corner.
fn for_each_unaligned(tw: usize, th: usize, w: usize, h: usize, mut f: impl FnMut(usize)) {
    for y in 0..h {
        (w..tw).for_each(|x| f(y * tw + x));
    }
    for y in h..th {
        (0..w).for_each(|x| f(y * tw + x));
    }
    for y in h..th {
        (w..tw).for_each(|x| f(y * tw + x));
    }
}

/// Piecewise-linear Haar step. It is its own inverse.
fn harr(c: &mut [Coeff], i0: usize, i1: usize, ch: usize) {
    let mut x0 = i32::from(c[i0][ch]);
    let mut x1 = i32::from(c[i1][ch]);
    let (org0, org1) = (x0, x1);
    if (x0 ^ x1) & 0x80 != 0 {
        x1 += x0;
        if (x1 ^ org1) & 0x80 == 0 {
            x0 -= x1;
        }
    } else {
        x0 -= x1;
        if (x0 ^ org0) & 0x80 == 0 {
            x1 += x0;
        }
    }
    c[i0][ch] = x1 as i8;
    c[i1][ch] = x0 as i8;
}

fn wavelet_level(c: &mut [Coeff], base: usize, size: usize, l: u32, skip: usize) {
    let step = (2usize << l) * skip;
    let ofs = (1usize << l) * skip;
    for k in 0..size >> (l + 1) {
        let i0 = base + k * step;
        for ch in 0..3 {
            harr(c, i0, i0 + ofs, ch);
        }
    }
}

fn inverse_wavelet(c: &mut [Coeff], w: usize, h: usize, level: u32) {
    for l in (0..level).rev() {
        for col in (0..w).step_by(1 << l) {
            wavelet_level(c, col, h, l, w);
        }
        for row in (0..h * w).step_by(w << l) {
            wavelet_level(c, row, w, l, 1);
        }
    }
}

fn clamp_channel(v: i32) -> i32 {
    v.clamp(0, 255)
}

/// Reconstructs a `tw` x `th` tile of pixel values in place.
///
/// `scratch` is reused between tiles to hold the coefficients.
pub fn synthesize(tile: &mut [u32], tw: usize, th: usize, level: u32, packing: Packing, scratch: &mut Vec<Coeff>) {
    let (w, h) = aligned(tw, th, level);
    if level == 0 || w == 0 || h == 0 {
        return;
    }
    scratch.clear();
    scratch.resize(w * h, [0; 3]);

    let mut pos = 0;
    for (l, r) in bands(level) {
        for_each_in_band(w, h, l, r, |i| {
            let [red, green, blue] = packing.load(tile[pos]);
            scratch[i] = [blue as i8, green as i8, red as i8];
            pos += 1;
        });
    }
    let unaligned = tile[pos..tw * th].to_vec();

    inverse_wavelet(scratch, w, h, level);

    for y in 0..h {
        for x in 0..w {
            let [u, luma, v] = scratch[y * w + x];
            let luma = i32::from(luma) + 128;
            let u = i32::from(u) << 1;
            let v = i32::from(v) << 1;
            let g = luma - ((u + v) >> 2);
            let rgb = [clamp_channel(v + g), clamp_channel(g), clamp_channel(u + g)];
            let at = y * tw + x;
            tile[at] = packing.save(tile[at], rgb);
        }
    }

    let mut rest = unaligned.into_iter();
    for_each_unaligned(tw, th, w, h, |i| {
        if let Some(p) = rest.next() {
            tile[i] = p;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masks(packing: Packing) -> (i32, i32) {
        match packing {
            Packing::Rgb888 => (!0, !0),
            Packing::Rgb565 => (!3, !7),
            Packing::Rgb555 => (!7, !7),
        }
    }

    fn forward_wavelet(c: &mut [Coeff], w: usize, h: usize, level: u32) {
        for l in 0..level {
            for row in (0..h * w).step_by(w << l) {
                wavelet_level(c, row, w, l, 1);
            }
            for col in (0..w).step_by(1 << l) {
                wavelet_level(c, col, h, l, w);
            }
        }
    }

    /// Encoder side: produces the tile as a ZYWRLE server would transmit it.
    fn analyze(src: &[u32], tw: usize, th: usize, level: u32, packing: Packing) -> Vec<u32> {
        let (w, h) = aligned(tw, th, level);
        let (ymask, uvmask) = masks(packing);
        let fix = |v: i32, mask: i32| if v == -128 { v + mask.wrapping_neg() } else { v };

        let mut c = vec![[0i8; 3]; w * h];
        for y in 0..h {
            for x in 0..w {
                let [r, g, b] = packing.load(src[y * tw + x]);
                let luma = fix((((r + (g << 1) + b) >> 2) - 128) & ymask, ymask);
                let u = fix(((b - g) >> 1) & uvmask, uvmask);
                let v = fix(((r - g) >> 1) & uvmask, uvmask);
                c[y * w + x] = [u as i8, luma as i8, v as i8];
            }
        }
        forward_wavelet(&mut c, w, h, level);

        let mut out = Vec::with_capacity(tw * th);
        for (l, r) in bands(level) {
            for_each_in_band(w, h, l, r, |i| {
                let [b, g, r] = c[i];
                out.push(packing.save(0, [i32::from(r), i32::from(g), i32::from(b)]));
            });
        }
        for_each_unaligned(tw, th, w, h, |i| out.push(src[i]));
        out
    }

    #[test]
    fn level_from_quality() {
        assert_eq!(level_for_quality(0), 3);
        assert_eq!(level_for_quality(4), 2);
        assert_eq!(level_for_quality(8), 1);
        assert_eq!(level_for_quality(9), 0);
        assert_eq!(level_for_quality(0x80 | 2), 0);
    }

    #[test]
    fn packing_follows_green_depth() {
        assert_eq!(Packing::for_format(&PixelFormat::rgb888()), Some(Packing::Rgb888));
        assert_eq!(Packing::for_format(&PixelFormat::rgb565()), Some(Packing::Rgb565));
        assert_eq!(Packing::for_format(&PixelFormat::rgb555()), Some(Packing::Rgb555));
        assert_eq!(Packing::for_format(&PixelFormat::bgr233()), None);
    }

    #[test]
    fn bands_cover_the_aligned_area_once() {
        let (w, h, level) = (16, 8, 3);
        let mut seen = vec![0u8; w * h];
        for (l, r) in bands(level) {
            for_each_in_band(w, h, l, r, |i| seen[i] += 1);
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn smooth_tile_round_trips_at_32_bpp() {
        let (tw, th, level) = (19, 21, 3);
        let src: Vec<u32> = (0..tw * th)
            .map(|i| {
                let (x, y) = ((i % tw) as u32, (i / tw) as u32);
                ((60 + 4 * x) << 16) | ((90 + 3 * y) << 8) | (120 + x + y)
            })
            .collect();
        let mut tile = analyze(&src, tw, th, level, Packing::Rgb888);
        synthesize(&mut tile, tw, th, level, Packing::Rgb888, &mut Vec::new());

        for (i, (&got, &want)) in tile.iter().zip(&src).enumerate() {
            let (x, y) = (i % tw, i / tw);
            if x >= 16 || y >= 16 {
                assert_eq!(got, want, "unaligned pixel ({x},{y})");
                continue;
            }
            for shift in [16, 8, 0] {
                let (a, b) = ((got >> shift) & 0xFF, (want >> shift) & 0xFF);
                assert!(a.abs_diff(b) <= 6, "({x},{y}) channel {shift}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn grey_tile_is_exact_at_16_bpp() {
        let (tw, th, level) = (10, 9, 2);
        let grey = Packing::Rgb565.save(0, [128, 128, 128]);
        let src: Vec<u32> = (0..tw * th)
            .map(|i| if i % tw >= 8 || i / tw >= 8 { 0x1234 } else { grey })
            .collect();
        let mut tile = analyze(&src, tw, th, level, Packing::Rgb565);
        synthesize(&mut tile, tw, th, level, Packing::Rgb565, &mut Vec::new());
        assert_eq!(tile, src);
    }

    #[test]
    fn level_zero_and_tiny_tiles_are_untouched() {
        let mut tile = vec![7u32; 9];
        synthesize(&mut tile, 3, 3, 0, Packing::Rgb888, &mut Vec::new());
        synthesize(&mut tile, 3, 3, 2, Packing::Rgb888, &mut Vec::new());
        assert!(tile.iter().all(|&p| p == 7));
    }
}
