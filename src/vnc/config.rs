//! Client configuration and the encoding list it advertises.

use std::time::Duration;

use log::warn;

use super::error::{Result, RfbError};
use super::protocol::{
    PixelFormat, ENCODING_COMPRESS_LEVEL_0, ENCODING_COPYRECT, ENCODING_CORRE, ENCODING_HEXTILE,
    ENCODING_KEYBOARD_LED_STATE, ENCODING_LAST_RECT, ENCODING_NEW_FB_SIZE, ENCODING_POINTER_POS,
    ENCODING_QUALITY_LEVEL_0, ENCODING_RAW, ENCODING_RICH_CURSOR, ENCODING_RRE, ENCODING_SERVER_IDENTITY,
    ENCODING_SUPPORTED_ENCODINGS, ENCODING_SUPPORTED_MESSAGES, ENCODING_TIGHT, ENCODING_ULTRA, ENCODING_ULTRAZIP,
    ENCODING_XCURSOR, ENCODING_ZLIB, ENCODING_ZRLE, ENCODING_ZYWRLE,
};

/// Highest compress and quality level.
pub const MAX_LEVEL: u8 = 9;

/// Quality level used when the configured one is out of range.
const FALLBACK_QUALITY: u8 = 5;

/// Encodings of the richer presets, best first.
const RICH_ENCODINGS: &str = "tight zrle ultra copyrect hextile zlib corre rre raw";

/// Bandwidth/quality trade-offs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreset {
    /// Cheap encodings only.
    Poor,
    /// Moderate compression, good JPEG quality.
    Medium,
    /// Balanced.
    Good,
    /// Maximum compression, lowest JPEG quality.
    Best,
}

impl QualityPreset {
    /// Space-separated encoding names.
    pub fn encodings(self) -> &'static str {
        match self {
            QualityPreset::Poor => "copyrect hextile raw",
            _ => RICH_ENCODINGS,
        }
    }

    /// Compress level (0-9).
    pub fn compress_level(self) -> u8 {
        match self {
            QualityPreset::Poor => 0,
            QualityPreset::Medium => 3,
            QualityPreset::Good => 5,
            QualityPreset::Best => 9,
        }
    }

    /// JPEG quality level (0-9).
    pub fn quality_level(self) -> u8 {
        match self {
            QualityPreset::Poor => 9,
            QualityPreset::Medium => 7,
            QualityPreset::Good => 5,
            QualityPreset::Best => 0,
        }
    }
}

/// Standard client pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorDepth {
    /// 32 bpp, 8 bits per channel.
    True32,
    /// 16 bpp, 5-6-5.
    High16,
    /// 16 bpp, 5-5-5.
    High15,
    /// 8 bpp, 3-3-2 (BGR233).
    Low8,
}

impl ColorDepth {
    /// The pixel format for this depth.
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            ColorDepth::True32 => PixelFormat::rgb888(),
            ColorDepth::High16 => PixelFormat::rgb565(),
            ColorDepth::High15 => PixelFormat::rgb555(),
            ColorDepth::Low8 => PixelFormat::bgr233(),
        }
    }

    /// Maps a colour depth in bits (32, 24, 16, 15 or 8) to a preset.
    pub fn from_depth(depth: u8) -> Option<Self> {
        match depth {
            24 | 32 => Some(ColorDepth::True32),
            16 => Some(ColorDepth::High16),
            15 => Some(ColorDepth::High15),
            8 => Some(ColorDepth::Low8),
            _ => None,
        }
    }
}

/// The part of the framebuffer the client asks updates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

/// Settings for one connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ask the server to keep other viewers connected.
    pub shared: bool,
    /// Pixel format requested from the server.
    pub pixel_format: PixelFormat,
    /// Space-separated encoding names in preference order; `None` uses the built-in order.
    pub encodings: Option<String>,
    /// Compress level to request; `None` requests level 1 with the default order.
    pub compress_level: Option<u8>,
    /// JPEG quality level; also sets the ZYWRLE wavelet depth.
    pub quality_level: u8,
    /// Request JPEG in Tight rectangles.
    pub enable_jpeg: bool,
    /// Ask the server to send the cursor shape instead of drawing it.
    pub use_remote_cursor: bool,
    /// Restrict updates to this rectangle; `None` means the whole screen.
    pub update_rect: Option<UpdateRect>,
    /// Deadline for any single read; `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// Poll interval used while waiting for data.
    pub poll_interval: Duration,
    /// Attempts allowed for a TLS handshake that keeps reporting would-block.
    pub tls_handshake_retries: u32,
    /// Pause between those attempts.
    pub tls_retry_delay: Duration,
    /// Name used for SNI and X.509 name checks.
    pub tls_server_name: String,
    /// Never send key or pointer events.
    pub view_only: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shared: true,
            pixel_format: PixelFormat::rgb888(),
            encodings: None,
            compress_level: None,
            quality_level: FALLBACK_QUALITY,
            enable_jpeg: true,
            use_remote_cursor: false,
            update_rect: None,
            read_timeout: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(100),
            tls_handshake_retries: 15,
            tls_retry_delay: Duration::from_secs(1),
            tls_server_name: "localhost".to_string(),
            view_only: false,
        }
    }
}

impl ClientConfig {
    /// Applies a quality preset's encodings, compress level and quality level.
    pub fn with_quality(mut self, preset: QualityPreset) -> Self {
        self.encodings = Some(preset.encodings().to_string());
        self.compress_level = Some(preset.compress_level());
        self.quality_level = preset.quality_level();
        self
    }

    /// Applies a colour depth preset.
    pub fn with_color_depth(mut self, depth: ColorDepth) -> Self {
        self.pixel_format = depth.pixel_format();
        self
    }

    /// Checks the settings before any bytes are exchanged.
    pub fn validate(&self) -> Result<()> {
        self.pixel_format.validate()?;
        if let Some(level) = self.compress_level.filter(|&l| l > MAX_LEVEL) {
            return Err(RfbError::violation(format!("compress level {level} out of range 0-{MAX_LEVEL}")));
        }
        if self.poll_interval.is_zero() {
            return Err(RfbError::violation("poll interval must be non-zero"));
        }
        Ok(())
    }

    /// Quality level actually requested; out-of-range values fall back to 5.
    pub fn effective_quality(&self) -> u8 {
        if self.quality_level > MAX_LEVEL {
            FALLBACK_QUALITY
        } else {
            self.quality_level
        }
    }

    /// The SetEncodings list: real encodings first, then pseudo-encodings.
    pub fn encoding_list(&self) -> Vec<i32> {
        let quality = self.effective_quality();
        let compress = self.compress_level.filter(|&l| l <= MAX_LEVEL);
        let mut list = Vec::with_capacity(24);
        let mut want_last_rect = false;

        match self.encodings.as_deref() {
            Some(names) => {
                let mut want_compress = false;
                let mut want_quality = false;
                for name in names.split_whitespace() {
                    match name.to_ascii_lowercase().as_str() {
                        "raw" => list.push(ENCODING_RAW),
                        "copyrect" => list.push(ENCODING_COPYRECT),
                        "tight" => {
                            list.push(ENCODING_TIGHT);
                            want_last_rect = true;
                            want_compress |= compress.is_some();
                            want_quality |= self.enable_jpeg;
                        }
                        "hextile" => list.push(ENCODING_HEXTILE),
                        "zlib" => {
                            list.push(ENCODING_ZLIB);
                            want_compress |= compress.is_some();
                        }
                        "zrle" => list.push(ENCODING_ZRLE),
                        "zywrle" => {
                            list.push(ENCODING_ZYWRLE);
                            want_quality = true;
                        }
                        "ultra" | "ultrazip" => {
                            list.push(ENCODING_ULTRA);
                            list.push(ENCODING_ULTRAZIP);
                        }
                        "corre" => list.push(ENCODING_CORRE),
                        "rre" => list.push(ENCODING_RRE),
                        other => warn!("unknown encoding '{}' ignored", other),
                    }
                }
                if !list.contains(&ENCODING_RAW) {
                    list.push(ENCODING_RAW);
                }
                if let (true, Some(level)) = (want_compress, compress) {
                    list.push(ENCODING_COMPRESS_LEVEL_0 + i32::from(level));
                }
                if want_quality {
                    list.push(ENCODING_QUALITY_LEVEL_0 + i32::from(quality));
                }
            }
            None => {
                list.extend_from_slice(&[
                    ENCODING_COPYRECT,
                    ENCODING_TIGHT,
                    ENCODING_HEXTILE,
                    ENCODING_ZLIB,
                    ENCODING_ZRLE,
                    ENCODING_ZYWRLE,
                    ENCODING_ULTRA,
                    ENCODING_ULTRAZIP,
                    ENCODING_CORRE,
                    ENCODING_RRE,
                    ENCODING_RAW,
                ]);
                want_last_rect = true;
                list.push(ENCODING_COMPRESS_LEVEL_0 + i32::from(compress.unwrap_or(1)));
                if self.enable_jpeg {
                    list.push(ENCODING_QUALITY_LEVEL_0 + i32::from(quality));
                }
            }
        }

        if self.use_remote_cursor {
            list.extend_from_slice(&[ENCODING_XCURSOR, ENCODING_RICH_CURSOR, ENCODING_POINTER_POS]);
        }
        list.push(ENCODING_KEYBOARD_LED_STATE);
        list.push(ENCODING_NEW_FB_SIZE);
        if want_last_rect {
            list.push(ENCODING_LAST_RECT);
        }
        list.extend_from_slice(&[ENCODING_SUPPORTED_MESSAGES, ENCODING_SUPPORTED_ENCODINGS, ENCODING_SERVER_IDENTITY]);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_list_order() {
        let list = ClientConfig::default().encoding_list();
        assert_eq!(&list[..3], &[ENCODING_COPYRECT, ENCODING_TIGHT, ENCODING_HEXTILE]);
        assert_eq!(list[10], ENCODING_RAW);
        assert_eq!(list[11], ENCODING_COMPRESS_LEVEL_0 + 1);
        assert_eq!(list[12], ENCODING_QUALITY_LEVEL_0 + 5);
        assert!(list.contains(&ENCODING_LAST_RECT));
        assert!(!list.contains(&ENCODING_XCURSOR));
        assert_eq!(*list.last().unwrap(), ENCODING_SERVER_IDENTITY);
    }

    #[test]
    fn named_list_requests_levels_only_when_used() {
        let config = ClientConfig { encodings: Some("hextile RAW".into()), compress_level: Some(6), ..Default::default() };
        let list = config.encoding_list();
        assert_eq!(&list[..2], &[ENCODING_HEXTILE, ENCODING_RAW]);
        assert!(!list.contains(&(ENCODING_COMPRESS_LEVEL_0 + 6)));
        assert!(!list.contains(&ENCODING_LAST_RECT));

        let config = ClientConfig { encodings: Some("tight bogus zlib".into()), compress_level: Some(6), ..config };
        let list = config.encoding_list();
        assert_eq!(&list[..3], &[ENCODING_TIGHT, ENCODING_ZLIB, ENCODING_RAW]);
        assert!(list.contains(&(ENCODING_COMPRESS_LEVEL_0 + 6)));
        assert!(list.contains(&(ENCODING_QUALITY_LEVEL_0 + 5)));
        assert!(list.contains(&ENCODING_LAST_RECT));
    }

    #[test]
    fn ultra_adds_both_encodings() {
        let config = ClientConfig { encodings: Some("ultra".into()), ..Default::default() };
        assert_eq!(&config.encoding_list()[..3], &[ENCODING_ULTRA, ENCODING_ULTRAZIP, ENCODING_RAW]);
    }

    #[test]
    fn presets() {
        let poor = ClientConfig::default().with_quality(QualityPreset::Poor);
        assert_eq!(poor.encodings.as_deref(), Some("copyrect hextile raw"));
        assert_eq!((poor.compress_level, poor.quality_level), (Some(0), 9));
        let best = ClientConfig::default().with_quality(QualityPreset::Best);
        assert_eq!((best.compress_level, best.quality_level), (Some(9), 0));
        assert_eq!(ColorDepth::from_depth(15).map(ColorDepth::pixel_format), Some(PixelFormat::rgb555()));
        assert_eq!(ColorDepth::from_depth(12), None);
    }

    #[test]
    fn remote_cursor_and_quality_fallback() {
        let config = ClientConfig { use_remote_cursor: true, quality_level: 42, ..Default::default() };
        let list = config.encoding_list();
        assert!(list.contains(&ENCODING_RICH_CURSOR));
        assert!(list.contains(&(ENCODING_QUALITY_LEVEL_0 + 5)));
    }

    #[test]
    fn validation() {
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ClientConfig { compress_level: Some(10), ..Default::default() }.validate().is_err());
        let bad = PixelFormat { bits_per_pixel: 24, ..PixelFormat::rgb888() };
        assert!(ClientConfig { pixel_format: bad, ..Default::default() }.validate().is_err());
    }
}
