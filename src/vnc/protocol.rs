//! RFB protocol constants, wire structures and client message serialization.
//!
//! All multi-byte integers on the wire are big-endian. Pixel payloads are the one
//! exception: they use the byte order of the negotiated client [`PixelFormat`].
//!
//! # Protocol Overview
//!
//! A session moves through the following phases:
//! 1. **Protocol Version** - the client echoes the lower of the two versions
//! 2. **Security Handshake** - type selection and the scheme's challenge/response
//! 3. **Initialization** - ClientInit / ServerInit, then SetPixelFormat and SetEncodings
//! 4. **Normal Operation** - framebuffer updates in, input and clipboard out

use bytes::{BufMut, BytesMut};

use super::error::{Result, RfbError};

/// Length of the `"RFB xxx.yyy\n"` version message.
pub const PROTOCOL_VERSION_LEN: usize = 12;

/// Highest protocol version this client speaks.
pub const MAX_MAJOR_VERSION: u16 = 3;
/// Highest minor version this client speaks.
pub const MAX_MINOR_VERSION: u16 = 8;

/// Size of the VNC authentication challenge.
pub const CHALLENGE_SIZE: usize = 16;

// Security Types

/// Security type: connection failed, a reason string follows.
pub const SECURITY_TYPE_INVALID: u32 = 0;
/// Security type: no authentication.
pub const SECURITY_TYPE_NONE: u32 = 1;
/// Security type: DES challenge/response with a password.
pub const SECURITY_TYPE_VNC_AUTH: u32 = 2;
/// Security type: anonymous TLS followed by a nested security negotiation.
pub const SECURITY_TYPE_TLS: u32 = 18;
/// Security type: VeNCrypt.
pub const SECURITY_TYPE_VENCRYPT: u32 = 19;
/// Security type: UltraVNC MS-Logon II (Diffie-Hellman obfuscated credentials).
pub const SECURITY_TYPE_MS_LOGON: u32 = 0xffff_fffa;

/// VeNCrypt sub-type: anonymous TLS, no further authentication.
pub const VENCRYPT_TLS_NONE: u32 = 257;
/// VeNCrypt sub-type: anonymous TLS, then VNC authentication.
pub const VENCRYPT_TLS_VNC: u32 = 258;
/// VeNCrypt sub-type: anonymous TLS, then plain username/password.
pub const VENCRYPT_TLS_PLAIN: u32 = 259;
/// VeNCrypt sub-type: certificate TLS, no further authentication.
pub const VENCRYPT_X509_NONE: u32 = 260;
/// VeNCrypt sub-type: certificate TLS, then VNC authentication.
pub const VENCRYPT_X509_VNC: u32 = 261;
/// VeNCrypt sub-type: certificate TLS, then plain username/password.
pub const VENCRYPT_X509_PLAIN: u32 = 262;

// Security Results

/// Security result: authentication succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;
/// Security result: authentication failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;
/// Security result: too many failed attempts.
pub const SECURITY_RESULT_TOO_MANY: u32 = 2;

// Client-to-Server Message Types

/// Message type: SetPixelFormat.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
/// Message type: SetEncodings.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
/// Message type: FramebufferUpdateRequest.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
/// Message type: KeyEvent.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
/// Message type: PointerEvent.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
/// Message type: ClientCutText.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;
/// Message type: FileTransfer (UltraVNC, never sent).
pub const CLIENT_MSG_FILE_TRANSFER: u8 = 7;
/// Message type: SetScale (UltraVNC).
pub const CLIENT_MSG_SET_SCALE: u8 = 8;
/// Message type: SetServerInput (UltraVNC).
pub const CLIENT_MSG_SET_SERVER_INPUT: u8 = 9;
/// Message type: SetSW (UltraVNC, never sent).
pub const CLIENT_MSG_SET_SW: u8 = 10;
/// Message type: TextChat (UltraVNC).
pub const CLIENT_MSG_TEXT_CHAT: u8 = 11;
/// Message type: PalmVNC SetScaleFactor.
pub const CLIENT_MSG_PALM_SET_SCALE_FACTOR: u8 = 0xF;

// Server-to-Client Message Types

/// Message type: FramebufferUpdate.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
/// Message type: SetColourMapEntries.
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;
/// Message type: Bell.
pub const SERVER_MSG_BELL: u8 = 2;
/// Message type: ServerCutText.
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;
/// Message type: ResizeFrameBuffer (UltraVNC).
pub const SERVER_MSG_RESIZE_FRAMEBUFFER: u8 = 4;
/// Message type: FileTransfer (UltraVNC).
pub const SERVER_MSG_FILE_TRANSFER: u8 = 7;
/// Message type: TextChat (UltraVNC).
pub const SERVER_MSG_TEXT_CHAT: u8 = 11;
/// Message type: PalmVNC ReSizeFrameBuffer.
pub const SERVER_MSG_PALM_RESIZE_FRAMEBUFFER: u8 = 0xF;

// Encoding Types

/// Encoding type: Raw.
pub const ENCODING_RAW: i32 = 0;
/// Encoding type: CopyRect.
pub const ENCODING_COPYRECT: i32 = 1;
/// Encoding type: RRE.
pub const ENCODING_RRE: i32 = 2;
/// Encoding type: CoRRE.
pub const ENCODING_CORRE: i32 = 4;
/// Encoding type: Hextile.
pub const ENCODING_HEXTILE: i32 = 5;
/// Encoding type: Zlib.
pub const ENCODING_ZLIB: i32 = 6;
/// Encoding type: Tight.
pub const ENCODING_TIGHT: i32 = 7;
/// Encoding type: ZlibHex. Recognized by name only.
pub const ENCODING_ZLIBHEX: i32 = 8;
/// Encoding type: Ultra (LZO).
pub const ENCODING_ULTRA: i32 = 9;
/// Encoding type: ZRLE.
pub const ENCODING_ZRLE: i32 = 16;
/// Encoding type: ZYWRLE.
pub const ENCODING_ZYWRLE: i32 = 17;
/// Encoding type: UltraZip, a batch of raw subrectangles in one LZO blob.
pub const ENCODING_ULTRAZIP: i32 = 0xFFFF_0009_u32 as i32;

// Pseudo-encodings

/// Pseudo-encoding: compression level 0. Levels 1..9 follow consecutively.
pub const ENCODING_COMPRESS_LEVEL_0: i32 = 0xFFFF_FF00_u32 as i32;
/// Pseudo-encoding: JPEG quality level 0. Levels 1..9 follow consecutively.
pub const ENCODING_QUALITY_LEVEL_0: i32 = 0xFFFF_FFE0_u32 as i32;
/// Pseudo-encoding: X cursor shape (two colours plus bitmap).
pub const ENCODING_XCURSOR: i32 = 0xFFFF_FF10_u32 as i32;
/// Pseudo-encoding: rich cursor shape (pixels in client format).
pub const ENCODING_RICH_CURSOR: i32 = 0xFFFF_FF11_u32 as i32;
/// Pseudo-encoding: pointer position.
pub const ENCODING_POINTER_POS: i32 = 0xFFFF_FF18_u32 as i32;
/// Pseudo-encoding: last rectangle of the update.
pub const ENCODING_LAST_RECT: i32 = 0xFFFF_FF20_u32 as i32;
/// Pseudo-encoding: new framebuffer size.
pub const ENCODING_NEW_FB_SIZE: i32 = 0xFFFF_FF21_u32 as i32;
/// Pseudo-encoding: keyboard LED state.
pub const ENCODING_KEYBOARD_LED_STATE: i32 = 0xFFFE_0000_u32 as i32;
/// Pseudo-encoding: bitmap of supported messages.
pub const ENCODING_SUPPORTED_MESSAGES: i32 = 0xFFFE_0001_u32 as i32;
/// Pseudo-encoding: list of supported encodings.
pub const ENCODING_SUPPORTED_ENCODINGS: i32 = 0xFFFE_0002_u32 as i32;
/// Pseudo-encoding: server identity string.
pub const ENCODING_SERVER_IDENTITY: i32 = 0xFFFE_0003_u32 as i32;

// Hextile subencoding flags

/// Hextile: tile is raw pixels.
pub const HEXTILE_RAW: u8 = 1;
/// Hextile: background colour follows.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 2;
/// Hextile: foreground colour follows.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 4;
/// Hextile: subrectangles follow.
pub const HEXTILE_ANY_SUBRECTS: u8 = 8;
/// Hextile: each subrectangle carries its own colour.
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 16;

// Tight control values (after the four stream-reset bits are shifted out)

/// Tight: solid fill.
pub const TIGHT_FILL: u8 = 0x08;
/// Tight: JPEG payload.
pub const TIGHT_JPEG: u8 = 0x09;
/// Tight: highest valid subencoding.
pub const TIGHT_MAX_SUBENCODING: u8 = 0x09;
/// Tight: an explicit filter id follows.
pub const TIGHT_EXPLICIT_FILTER: u8 = 0x04;
/// Tight filter: copy.
pub const TIGHT_FILTER_COPY: u8 = 0x00;
/// Tight filter: palette.
pub const TIGHT_FILTER_PALETTE: u8 = 0x01;
/// Tight filter: gradient.
pub const TIGHT_FILTER_GRADIENT: u8 = 0x02;
/// Tight: payloads shorter than this are sent uncompressed.
pub const TIGHT_MIN_TO_COMPRESS: usize = 12;

/// ZRLE tile edge length.
pub const ZRLE_TILE_SIZE: u16 = 64;

/// TextChat length marker: chat window opened.
pub const TEXT_CHAT_OPEN: u32 = 0xFFFF_FFFF;
/// TextChat length marker: chat window closed.
pub const TEXT_CHAT_CLOSE: u32 = 0xFFFF_FFFE;
/// TextChat length marker: chat finished.
pub const TEXT_CHAT_FINISHED: u32 = 0xFFFF_FFFD;

/// Returns a printable name for an encoding id.
pub fn encoding_name(encoding: i32) -> &'static str {
    match encoding {
        ENCODING_RAW => "Raw",
        ENCODING_COPYRECT => "CopyRect",
        ENCODING_RRE => "RRE",
        ENCODING_CORRE => "CoRRE",
        ENCODING_HEXTILE => "Hextile",
        ENCODING_ZLIB => "Zlib",
        ENCODING_TIGHT => "Tight",
        ENCODING_ZLIBHEX => "ZlibHex",
        ENCODING_ULTRA => "Ultra",
        ENCODING_ZRLE => "ZRLE",
        ENCODING_ZYWRLE => "ZYWRLE",
        ENCODING_ULTRAZIP => "UltraZip",
        ENCODING_XCURSOR => "XCursor",
        ENCODING_RICH_CURSOR => "RichCursor",
        ENCODING_POINTER_POS => "PointerPos",
        ENCODING_LAST_RECT => "LastRect",
        ENCODING_NEW_FB_SIZE => "NewFBSize",
        ENCODING_KEYBOARD_LED_STATE => "KeyboardLedState",
        ENCODING_SUPPORTED_MESSAGES => "SupportedMessages",
        ENCODING_SUPPORTED_ENCODINGS => "SupportedEncodings",
        ENCODING_SERVER_IDENTITY => "ServerIdentity",
        e if (ENCODING_COMPRESS_LEVEL_0..=ENCODING_COMPRESS_LEVEL_0 + 9).contains(&e) => "CompressLevel",
        e if (ENCODING_QUALITY_LEVEL_0..=ENCODING_QUALITY_LEVEL_0 + 9).contains(&e) => "QualityLevel",
        _ => "Unknown",
    }
}

/// A negotiated RFB protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version number (always 3 for servers we talk to).
    pub major: u16,
    /// Minor version number.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Parses the 12-byte `"RFB xxx.yyy\n"` message.
    pub fn parse(msg: &[u8; PROTOCOL_VERSION_LEN]) -> Result<Self> {
        let bad = || RfbError::violation(format!("not a valid VNC server ({:?})", String::from_utf8_lossy(msg)));
        if &msg[0..4] != b"RFB " || msg[7] != b'.' || msg[11] != b'\n' {
            return Err(bad());
        }
        let num = |digits: &[u8]| -> Option<u16> {
            if !digits.iter().all(u8::is_ascii_digit) {
                return None;
            }
            std::str::from_utf8(digits).ok()?.parse().ok()
        };
        let major = num(&msg[4..7]).ok_or_else(bad)?;
        let minor = num(&msg[8..11]).ok_or_else(bad)?;
        Ok(Self { major, minor })
    }

    /// Clamps a server version to the highest one this client speaks.
    pub fn clamp_to_supported(self) -> Self {
        if self.major > MAX_MAJOR_VERSION || (self.major == MAX_MAJOR_VERSION && self.minor > MAX_MINOR_VERSION) {
            Self { major: MAX_MAJOR_VERSION, minor: MAX_MINOR_VERSION }
        } else {
            self
        }
    }

    /// Serializes back into the 12-byte wire form.
    pub fn to_bytes(self) -> [u8; PROTOCOL_VERSION_LEN] {
        let text = format!("RFB {:03}.{:03}\n", self.major % 1000, self.minor % 1000);
        let mut out = [0u8; PROTOCOL_VERSION_LEN];
        out.copy_from_slice(text.as_bytes());
        out
    }

    /// True when the server sends a list of security types (3.7 and later).
    pub fn has_security_list(self) -> bool {
        self.major > 3 || (self.major == 3 && self.minor > 6)
    }

    /// True when a SecurityResult follows the None security type (3.8 and later).
    pub fn has_result_for_none(self) -> bool {
        self.major > 3 || (self.major == 3 && self.minor > 7)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Pixel layout negotiated between client and server.
///
/// The framebuffer and every decoder operate in the client's chosen format,
/// which may differ from the server's native one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel: 8, 16 or 32.
    pub bits_per_pixel: u8,
    /// Number of significant bits.
    pub depth: u8,
    /// Pixel byte order on the wire and in the framebuffer.
    pub big_endian: bool,
    /// True colour (channel masks) rather than a colour map.
    pub true_colour: bool,
    /// Maximum red value.
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Bit position of red.
    pub red_shift: u8,
    /// Bit position of green.
    pub green_shift: u8,
    /// Bit position of blue.
    pub blue_shift: u8,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::rgb888()
    }
}

impl PixelFormat {
    /// 32 bpp, depth 24, little-endian, 8 bits per channel at shifts 16/8/0.
    pub fn rgb888() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// 16 bpp RGB565.
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// 16 bpp RGB555.
    pub fn rgb555() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 15,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 31,
            blue_max: 31,
            red_shift: 10,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// 8 bpp BGR233.
    pub fn bgr233() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: false,
            true_colour: true,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    /// Parses the 16-byte wire representation (the last three bytes are padding).
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: bytes[0],
            depth: bytes[1],
            big_endian: bytes[2] != 0,
            true_colour: bytes[3] != 0,
            red_max: u16::from_be_bytes([bytes[4], bytes[5]]),
            green_max: u16::from_be_bytes([bytes[6], bytes[7]]),
            blue_max: u16::from_be_bytes([bytes[8], bytes[9]]),
            red_shift: bytes[10],
            green_shift: bytes[11],
            blue_shift: bytes[12],
        }
    }

    /// Writes the 16-byte wire representation.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(u8::from(self.big_endian));
        buf.put_u8(u8::from(self.true_colour));
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    /// Bytes per pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel / 8)
    }

    /// Checks the structural invariants of a client pixel format.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return Err(RfbError::violation(format!("unsupported bits per pixel {}", self.bits_per_pixel)));
        }
        if self.depth > self.bits_per_pixel {
            return Err(RfbError::violation(format!(
                "depth {} exceeds bits per pixel {}",
                self.depth, self.bits_per_pixel
            )));
        }
        if !self.true_colour {
            return Err(RfbError::violation("colour-map pixel formats are not supported"));
        }
        for (max, shift) in [
            (self.red_max, self.red_shift),
            (self.green_max, self.green_shift),
            (self.blue_max, self.blue_shift),
        ] {
            let bits = 16 - max.leading_zeros() as u8;
            if u32::from(bits) + u32::from(shift) > u32::from(self.bits_per_pixel) {
                return Err(RfbError::violation(format!(
                    "channel max {max} at shift {shift} does not fit in {} bits",
                    self.bits_per_pixel
                )));
            }
        }
        Ok(())
    }

    /// True for the 32 bpp depth-24 layout where Tight and cursor colours travel as 3 bytes.
    pub fn is_rgb24_in_32(&self) -> bool {
        self.bits_per_pixel == 32
            && self.depth == 24
            && self.red_max == 0xFF
            && self.green_max == 0xFF
            && self.blue_max == 0xFF
    }

    /// All channel bits set, as a pixel value.
    pub fn max_colour(&self) -> u32 {
        (u32::from(self.red_max) << self.red_shift)
            | (u32::from(self.green_max) << self.green_shift)
            | (u32::from(self.blue_max) << self.blue_shift)
    }

    /// Reads one pixel value from `bytes` (exactly `bytes_per_pixel` long).
    pub fn read_pixel(&self, bytes: &[u8]) -> u32 {
        match (self.bits_per_pixel, self.big_endian) {
            (8, _) => u32::from(bytes[0]),
            (16, true) => u32::from(u16::from_be_bytes([bytes[0], bytes[1]])),
            (16, false) => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            (_, true) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (_, false) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Writes one pixel value into `out` (exactly `bytes_per_pixel` long).
    pub fn write_pixel(&self, pixel: u32, out: &mut [u8]) {
        match (self.bits_per_pixel, self.big_endian) {
            (8, _) => out[0] = pixel as u8,
            (16, true) => out.copy_from_slice(&(pixel as u16).to_be_bytes()),
            (16, false) => out.copy_from_slice(&(pixel as u16).to_le_bytes()),
            (_, true) => out.copy_from_slice(&pixel.to_be_bytes()),
            (_, false) => out.copy_from_slice(&pixel.to_le_bytes()),
        }
    }

    /// Packs 8-bit RGB into a pixel, scaling each channel to its maximum.
    pub fn rgb24_to_pixel(&self, r: u8, g: u8, b: u8) -> u32 {
        let scale = |c: u8, max: u16| (u32::from(c) * u32::from(max) + 127) / 255;
        (scale(r, self.red_max) << self.red_shift)
            | (scale(g, self.green_max) << self.green_shift)
            | (scale(b, self.blue_max) << self.blue_shift)
    }

    /// Packs 8-bit RGB into a 32 bpp depth-24 pixel without scaling.
    pub fn rgb24_to_pixel32(&self, r: u8, g: u8, b: u8) -> u32 {
        (u32::from(r) << self.red_shift) | (u32::from(g) << self.green_shift) | (u32::from(b) << self.blue_shift)
    }

    /// Packs already-scaled channel values (each `<= max`) into a pixel.
    pub fn rgb_to_pixel(&self, r: u32, g: u32, b: u32) -> u32 {
        ((r & u32::from(self.red_max)) << self.red_shift)
            | ((g & u32::from(self.green_max)) << self.green_shift)
            | ((b & u32::from(self.blue_max)) << self.blue_shift)
    }
}

/// The ServerInit message.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name.
    pub name: String,
}

/// Header of one rectangle inside a FramebufferUpdate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectHeader {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Encoding id (may be a pseudo-encoding).
    pub encoding: i32,
}

impl RectHeader {
    /// Parses the 12-byte header.
    pub fn from_bytes(b: &[u8; 12]) -> Self {
        Self {
            x: u16::from_be_bytes([b[0], b[1]]),
            y: u16::from_be_bytes([b[2], b[3]]),
            width: u16::from_be_bytes([b[4], b[5]]),
            height: u16::from_be_bytes([b[6], b[7]]),
            encoding: i32::from_be_bytes([b[8], b[9], b[10], b[11]]),
        }
    }
}

/// Bitmaps of the message types each side understands.
///
/// Starts from the RFB 3.3 base set and is widened for UltraVNC/TightVNC servers
/// or replaced outright when the server sends a SupportedMessages rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedMessages {
    /// Client-to-server message bitmap.
    pub client2server: [u8; 32],
    /// Server-to-client message bitmap.
    pub server2client: [u8; 32],
}

impl Default for SupportedMessages {
    fn default() -> Self {
        let mut msgs = Self { client2server: [0; 32], server2client: [0; 32] };
        for t in [
            CLIENT_MSG_SET_PIXEL_FORMAT,
            CLIENT_MSG_SET_ENCODINGS,
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST,
            CLIENT_MSG_KEY_EVENT,
            CLIENT_MSG_POINTER_EVENT,
            CLIENT_MSG_CLIENT_CUT_TEXT,
        ] {
            msgs.set_client2server(t);
        }
        for t in [
            SERVER_MSG_FRAMEBUFFER_UPDATE,
            SERVER_MSG_SET_COLOUR_MAP_ENTRIES,
            SERVER_MSG_BELL,
            SERVER_MSG_SERVER_CUT_TEXT,
        ] {
            msgs.set_server2client(t);
        }
        msgs
    }
}

impl SupportedMessages {
    /// Message set advertised by UltraVNC servers (minor version 4 or 6).
    pub fn ultravnc() -> Self {
        let mut msgs = Self::default();
        for t in [
            CLIENT_MSG_FILE_TRANSFER,
            CLIENT_MSG_SET_SCALE,
            CLIENT_MSG_SET_SERVER_INPUT,
            CLIENT_MSG_SET_SW,
            CLIENT_MSG_TEXT_CHAT,
            CLIENT_MSG_PALM_SET_SCALE_FACTOR,
        ] {
            msgs.set_client2server(t);
        }
        for t in [
            SERVER_MSG_RESIZE_FRAMEBUFFER,
            SERVER_MSG_PALM_RESIZE_FRAMEBUFFER,
            SERVER_MSG_FILE_TRANSFER,
            SERVER_MSG_TEXT_CHAT,
        ] {
            msgs.set_server2client(t);
        }
        msgs
    }

    /// Message set advertised by TightVNC servers (minor version 5).
    pub fn tightvnc() -> Self {
        let mut msgs = Self::default();
        for t in [CLIENT_MSG_FILE_TRANSFER, CLIENT_MSG_SET_SERVER_INPUT, CLIENT_MSG_SET_SW] {
            msgs.set_client2server(t);
        }
        for t in [SERVER_MSG_FILE_TRANSFER, SERVER_MSG_TEXT_CHAT] {
            msgs.set_server2client(t);
        }
        msgs
    }

    /// Parses the 64-byte SupportedMessages payload.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut msgs = Self { client2server: [0; 32], server2client: [0; 32] };
        msgs.client2server.copy_from_slice(&bytes[..32]);
        msgs.server2client.copy_from_slice(&bytes[32..]);
        msgs
    }

    fn set_client2server(&mut self, t: u8) {
        self.client2server[usize::from(t / 8)] |= 1 << (t % 8);
    }

    fn set_server2client(&mut self, t: u8) {
        self.server2client[usize::from(t / 8)] |= 1 << (t % 8);
    }

    /// Whether the server accepts client message type `t`.
    pub fn supports_client2server(&self, t: u8) -> bool {
        self.client2server[usize::from(t / 8)] & (1 << (t % 8)) != 0
    }

    /// Whether the server may send message type `t`.
    pub fn supports_server2client(&self, t: u8) -> bool {
        self.server2client[usize::from(t / 8)] & (1 << (t % 8)) != 0
    }
}

/// Messages the client sends to the server.
#[derive(Debug, Clone)]
pub enum ClientMessage<'a> {
    /// Client requests a specific pixel format for framebuffer updates.
    SetPixelFormat(PixelFormat),

    /// Client lists the encodings it supports, in preference order.
    SetEncodings(&'a [i32]),

    /// Client requests a framebuffer update for a region.
    FramebufferUpdateRequest {
        /// Only send changes since the last update.
        incremental: bool,
        /// X coordinate of the region.
        x: u16,
        /// Y coordinate of the region.
        y: u16,
        /// Width of the region.
        width: u16,
        /// Height of the region.
        height: u16,
    },

    /// Keyboard key event.
    KeyEvent {
        /// True if pressed.
        down: bool,
        /// X11 keysym.
        key: u32,
    },

    /// Pointer event.
    PointerEvent {
        /// Bitmask of pressed buttons.
        button_mask: u8,
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
    },

    /// Clipboard text (Latin-1 per RFB).
    ClientCutText(&'a [u8]),

    /// UltraVNC SetScale or PalmVNC SetScaleFactor; the first field is the message type.
    SetScale(u8, u8),

    /// UltraVNC SetServerInput; `true` disables the server's local input.
    SetServerInput(bool),

    /// UltraVNC TextChat with either a control marker or text.
    TextChat(TextChatPayload<'a>),
}

/// Body of an outgoing TextChat message.
#[derive(Debug, Clone, Copy)]
pub enum TextChatPayload<'a> {
    /// Chat text.
    Text(&'a [u8]),
    /// One of the `TEXT_CHAT_*` length markers.
    Control(u32),
}

impl ClientMessage<'_> {
    /// Serializes the message onto `buf`.
    #[allow(clippy::cast_possible_truncation)] // list and text lengths are bounded by the protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        match *self {
            ClientMessage::SetPixelFormat(ref pf) => {
                buf.put_u8(CLIENT_MSG_SET_PIXEL_FORMAT);
                buf.put_bytes(0, 3);
                pf.write_to(buf);
            }
            ClientMessage::SetEncodings(encodings) => {
                buf.put_u8(CLIENT_MSG_SET_ENCODINGS);
                buf.put_u8(0);
                buf.put_u16(encodings.len() as u16);
                for &enc in encodings {
                    buf.put_i32(enc);
                }
            }
            ClientMessage::FramebufferUpdateRequest { incremental, x, y, width, height } => {
                buf.put_u8(CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST);
                buf.put_u8(u8::from(incremental));
                buf.put_u16(x);
                buf.put_u16(y);
                buf.put_u16(width);
                buf.put_u16(height);
            }
            ClientMessage::KeyEvent { down, key } => {
                buf.put_u8(CLIENT_MSG_KEY_EVENT);
                buf.put_u8(u8::from(down));
                buf.put_u16(0);
                buf.put_u32(key);
            }
            ClientMessage::PointerEvent { button_mask, x, y } => {
                buf.put_u8(CLIENT_MSG_POINTER_EVENT);
                buf.put_u8(button_mask);
                buf.put_u16(x);
                buf.put_u16(y);
            }
            ClientMessage::ClientCutText(text) => {
                buf.put_u8(CLIENT_MSG_CLIENT_CUT_TEXT);
                buf.put_bytes(0, 3);
                buf.put_u32(text.len() as u32);
                buf.put_slice(text);
            }
            ClientMessage::SetScale(msg_type, scale) => {
                buf.put_u8(msg_type);
                buf.put_u8(scale);
                buf.put_u16(0);
            }
            ClientMessage::SetServerInput(disable_local) => {
                buf.put_u8(CLIENT_MSG_SET_SERVER_INPUT);
                buf.put_u8(u8::from(disable_local));
                buf.put_u16(0);
            }
            ClientMessage::TextChat(payload) => {
                buf.put_u8(CLIENT_MSG_TEXT_CHAT);
                buf.put_u8(0);
                buf.put_u16(0);
                match payload {
                    TextChatPayload::Text(text) => {
                        buf.put_u32(text.len() as u32);
                        buf.put_slice(text);
                    }
                    TextChatPayload::Control(marker) => buf.put_u32(marker),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse_and_clamp() {
        let v = ProtocolVersion::parse(b"RFB 003.889\n").unwrap();
        assert_eq!(v, ProtocolVersion { major: 3, minor: 889 });
        let v = v.clamp_to_supported();
        assert_eq!(&v.to_bytes(), b"RFB 003.008\n");

        let v = ProtocolVersion::parse(b"RFB 003.003\n").unwrap().clamp_to_supported();
        assert_eq!(v.minor, 3);
        assert!(!v.has_security_list());

        assert!(ProtocolVersion::parse(b"HTTP/1.1 200").is_err());
        assert!(ProtocolVersion::parse(b"RFB 00x.008\n").is_err());
    }

    #[test]
    fn pixel_format_wire_layout() {
        let pf = PixelFormat::rgb565();
        let mut buf = BytesMut::new();
        pf.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&buf);
        assert_eq!(PixelFormat::from_bytes(&raw), pf);
    }

    #[test]
    fn pixel_format_validation() {
        assert!(PixelFormat::rgb888().validate().is_ok());
        assert!(PixelFormat::bgr233().validate().is_ok());
        let mut pf = PixelFormat::rgb565();
        pf.red_shift = 12;
        assert!(pf.validate().is_err());
        let mut pf = PixelFormat::rgb888();
        pf.bits_per_pixel = 24;
        assert!(pf.validate().is_err());
    }

    #[test]
    fn pixel_byte_order() {
        let mut pf = PixelFormat::rgb888();
        let mut out = [0u8; 4];
        pf.write_pixel(0x00AB_CDEF, &mut out);
        assert_eq!(out, [0xEF, 0xCD, 0xAB, 0x00]);
        pf.big_endian = true;
        pf.write_pixel(0x00AB_CDEF, &mut out);
        assert_eq!(out, [0x00, 0xAB, 0xCD, 0xEF]);
        assert_eq!(pf.read_pixel(&out), 0x00AB_CDEF);
    }

    #[test]
    fn rgb24_scaling() {
        let pf = PixelFormat::rgb565();
        assert_eq!(pf.rgb24_to_pixel(255, 255, 255), 0xFFFF);
        assert_eq!(pf.rgb24_to_pixel(0, 0, 0), 0);
        assert_eq!(pf.rgb24_to_pixel(255, 0, 0), 0xF800);
    }

    #[test]
    fn client_messages_serialize() {
        let mut buf = BytesMut::new();
        ClientMessage::FramebufferUpdateRequest { incremental: true, x: 1, y: 2, width: 800, height: 600 }
            .write_to(&mut buf);
        assert_eq!(&buf[..], &[3, 1, 0, 1, 0, 2, 0x03, 0x20, 0x02, 0x58]);

        buf.clear();
        ClientMessage::SetEncodings(&[ENCODING_RAW, ENCODING_LAST_RECT]).write_to(&mut buf);
        assert_eq!(&buf[..], &[2, 0, 0, 2, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0x20]);

        buf.clear();
        ClientMessage::KeyEvent { down: true, key: 0xff0d }.write_to(&mut buf);
        assert_eq!(&buf[..], &[4, 1, 0, 0, 0, 0, 0xff, 0x0d]);

        buf.clear();
        ClientMessage::TextChat(TextChatPayload::Control(TEXT_CHAT_CLOSE)).write_to(&mut buf);
        assert_eq!(&buf[..], &[11, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn supported_message_sets() {
        let base = SupportedMessages::default();
        assert!(base.supports_client2server(CLIENT_MSG_KEY_EVENT));
        assert!(!base.supports_client2server(CLIENT_MSG_TEXT_CHAT));
        let ultra = SupportedMessages::ultravnc();
        assert!(ultra.supports_client2server(CLIENT_MSG_TEXT_CHAT));
        assert!(ultra.supports_server2client(SERVER_MSG_PALM_RESIZE_FRAMEBUFFER));
        let tight = SupportedMessages::tightvnc();
        assert!(tight.supports_client2server(CLIENT_MSG_SET_SERVER_INPUT));
        assert!(!tight.supports_client2server(CLIENT_MSG_SET_SCALE));
    }

    #[test]
    fn encoding_names() {
        assert_eq!(encoding_name(ENCODING_ULTRAZIP), "UltraZip");
        assert_eq!(encoding_name(ENCODING_COMPRESS_LEVEL_0 + 3), "CompressLevel");
        assert_eq!(encoding_name(-1000), "Unknown");
    }
}
