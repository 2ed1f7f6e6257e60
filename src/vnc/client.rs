//! One RFB client connection.
//!
//! [`RfbClient`] owns the transport, the framebuffer and all per-connection
//! decoder state. It is driven synchronously by the caller:
//!
//! 1. [`RfbClient::init`] runs the version exchange, security negotiation,
//!    ClientInit/ServerInit and sends the pixel format, encodings and the
//!    first (non-incremental) update request.
//! 2. [`RfbClient::handle_server_message`] reads and processes exactly one
//!    server message. A cooperative event loop can poll with
//!    [`RfbClient::wait_for_message`] first.
//!
//! Events flow back through the [`ClientHandler`] callbacks. Every error is
//! terminal for the connection.

use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, error, info, warn};

use super::auth::{
    self, plain_auth, read_reason, read_security_result, security_type_name, select_security_type,
    vencrypt_negotiate, vnc_auth, Credential, CredentialKind, X509Credential,
};
use super::config::{ClientConfig, UpdateRect};
use super::encoding::cursor::decode_cursor;
use super::encoding::{decoder_for, CursorShape, DecoderState};
use super::error::{Result, RfbError};
use super::framebuffer::Framebuffer;
use super::protocol::{
    encoding_name, ClientMessage, PixelFormat, ProtocolVersion, RectHeader, ServerInit, SupportedMessages,
    TextChatPayload, CLIENT_MSG_CLIENT_CUT_TEXT, CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, CLIENT_MSG_KEY_EVENT,
    CLIENT_MSG_PALM_SET_SCALE_FACTOR, CLIENT_MSG_POINTER_EVENT, CLIENT_MSG_SET_ENCODINGS, CLIENT_MSG_SET_PIXEL_FORMAT,
    CLIENT_MSG_SET_SCALE, CLIENT_MSG_SET_SERVER_INPUT, CLIENT_MSG_TEXT_CHAT, ENCODING_KEYBOARD_LED_STATE,
    ENCODING_LAST_RECT, ENCODING_NEW_FB_SIZE, ENCODING_POINTER_POS, ENCODING_RICH_CURSOR, ENCODING_SERVER_IDENTITY,
    ENCODING_SUPPORTED_ENCODINGS, ENCODING_SUPPORTED_MESSAGES, ENCODING_ULTRAZIP, ENCODING_XCURSOR,
    PROTOCOL_VERSION_LEN, SECURITY_TYPE_INVALID, SECURITY_TYPE_MS_LOGON, SECURITY_TYPE_NONE, SECURITY_TYPE_TLS,
    SECURITY_TYPE_VENCRYPT, SECURITY_TYPE_VNC_AUTH, SERVER_MSG_BELL, SERVER_MSG_FRAMEBUFFER_UPDATE,
    SERVER_MSG_PALM_RESIZE_FRAMEBUFFER, SERVER_MSG_RESIZE_FRAMEBUFFER, SERVER_MSG_SERVER_CUT_TEXT,
    SERVER_MSG_SET_COLOUR_MAP_ENTRIES, SERVER_MSG_TEXT_CHAT, TEXT_CHAT_CLOSE, TEXT_CHAT_FINISHED, TEXT_CHAT_OPEN,
    VENCRYPT_TLS_NONE, VENCRYPT_TLS_PLAIN, VENCRYPT_TLS_VNC, VENCRYPT_X509_NONE, VENCRYPT_X509_PLAIN,
    VENCRYPT_X509_VNC,
};
use super::stream::{RfbStream, Transport};
use super::tls::{TlsChannel, TlsMode, TlsParams};

/// Largest clipboard or chat payload accepted from the server.
pub const MAX_CUT_TEXT: usize = 10 * 1024 * 1024;

/// Largest desktop name accepted in ServerInit.
pub const MAX_NAME_LENGTH: usize = 64 * 1024;

/// Size of the SupportedMessages payload.
const SUPPORTED_MESSAGES_LEN: usize = 64;

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the server's version string.
    VersionExchange,
    /// Choosing a security type.
    SecurityTypeSelect,
    /// Running the chosen scheme's exchange.
    Authenticate,
    /// Waiting for the SecurityResult.
    SecurityResult,
    /// Choosing a security type inside the TLS tunnel.
    SubSecurityTypeSelect,
    /// Running the nested scheme's exchange.
    SubAuthenticate,
    /// Waiting for the nested SecurityResult.
    SubSecurityResult,
    /// ClientInit sent, waiting for ServerInit.
    ServerInit,
    /// Ready for normal operation.
    Initialized,
}

/// A TextChat message from an UltraVNC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextChatEvent {
    /// The server opened the chat window.
    Open,
    /// The server closed the chat window.
    Close,
    /// The chat session is over.
    Finished,
    /// Chat text.
    Text(String),
}

/// Callbacks from the protocol engine to the embedding application.
///
/// Every method has a no-op default so implementors only override what they need.
#[allow(unused_variables)]
pub trait ClientHandler {
    /// Password for VNC authentication. `None` aborts the handshake.
    fn get_password(&mut self) -> Option<String> {
        None
    }

    /// Username/password or X.509 material for the schemes that need them.
    fn get_credential(&mut self, kind: CredentialKind) -> Option<Credential> {
        None
    }

    /// A rectangle of the framebuffer has been repainted.
    fn got_update(&mut self, fb: &Framebuffer, x: u16, y: u16, width: u16, height: u16) {}

    /// Every rectangle of a FramebufferUpdate has been processed.
    fn finished_update(&mut self, fb: &Framebuffer) {}

    /// The server's clipboard changed. The text is Latin-1.
    fn got_cut_text(&mut self, text: &[u8]) {}

    /// The server rang the bell.
    fn bell(&mut self) {}

    /// The server sent a new cursor image.
    fn got_cursor_shape(&mut self, shape: &CursorShape) {}

    /// The server moved the pointer.
    fn got_cursor_pos(&mut self, x: u16, y: u16) {}

    /// Keyboard LED state (bit 0 scroll lock, bit 1 num lock, bit 2 caps lock).
    fn keyboard_led_state(&mut self, state: u16) {}

    /// The framebuffer was reallocated at a new size.
    fn resized(&mut self, width: u16, height: u16) {}

    /// UltraVNC text chat.
    fn text_chat(&mut self, event: TextChatEvent) {}

    /// Final say on the server certificate. `valid` is the built-in verdict.
    fn verify_certificate(&mut self, der: &[u8], valid: bool) -> bool {
        valid
    }
}

/// Overwrites a secret before it is dropped.
fn scrub(secret: String) {
    let mut bytes = secret.into_bytes();
    bytes.fill(0);
}

fn log_pixel_format(what: &str, pf: &PixelFormat) {
    debug!(
        "{}: {} bpp, depth {}{}, {} endian, max rgb {}/{}/{}, shift rgb {}/{}/{}",
        what,
        pf.bits_per_pixel,
        pf.depth,
        if pf.true_colour { " true colour" } else { " colour map" },
        if pf.big_endian { "big" } else { "little" },
        pf.red_max,
        pf.green_max,
        pf.blue_max,
        pf.red_shift,
        pf.green_shift,
        pf.blue_shift
    );
}

/// A client connection to an RFB server.
pub struct RfbClient<S: Transport, H: ClientHandler> {
    stream: RfbStream<S>,
    config: ClientConfig,
    handler: H,
    state: HandshakeState,
    version: ProtocolVersion,
    security_type: Option<u32>,
    sub_security_type: Option<u32>,
    server_format: PixelFormat,
    desktop_name: String,
    framebuffer: Framebuffer,
    decoders: DecoderState,
    supported_messages: SupportedMessages,
    supported_encodings: Vec<i32>,
    server_identity: Option<String>,
    keyboard_led_state: Option<u16>,
}

impl<S: Transport, H: ClientHandler> RfbClient<S, H> {
    /// Wraps an established transport. Nothing is exchanged until [`init`](Self::init).
    pub fn new(transport: S, config: ClientConfig, handler: H) -> Self {
        let stream = RfbStream::new(transport, config.read_timeout, config.poll_interval);
        let framebuffer = Framebuffer::new(0, 0, config.pixel_format);
        let decoders = DecoderState::new(config.effective_quality());
        Self {
            stream,
            config,
            handler,
            state: HandshakeState::VersionExchange,
            version: ProtocolVersion { major: 0, minor: 0 },
            security_type: None,
            sub_security_type: None,
            server_format: PixelFormat::default(),
            desktop_name: String::new(),
            framebuffer,
            decoders,
            supported_messages: SupportedMessages::default(),
            supported_encodings: Vec::new(),
            server_identity: None,
            keyboard_led_state: None,
        }
    }

    /// Runs the handshake and session negotiation, then requests the first full update.
    pub fn init(&mut self) -> Result<()> {
        if self.state != HandshakeState::VersionExchange {
            return Err(RfbError::violation("connection already initialised"));
        }
        self.config.validate()?;

        self.exchange_version()?;
        self.negotiate_security()?;
        self.read_server_init()?;
        self.state = HandshakeState::Initialized;

        self.set_format_and_encodings()?;
        let rect = self.update_rect();
        self.send_framebuffer_update_request(rect.x, rect.y, rect.width, rect.height, false)
    }

    fn exchange_version(&mut self) -> Result<()> {
        let mut msg = [0u8; PROTOCOL_VERSION_LEN];
        self.stream.read_bytes(&mut msg)?;
        let server = ProtocolVersion::parse(&msg)?;

        self.supported_messages = match (server.major, server.minor) {
            (3, 4) | (3, 6) => {
                info!("UltraVNC server detected, enabling UltraVNC specific messages");
                SupportedMessages::ultravnc()
            }
            (3, 5) => {
                info!("TightVNC server detected, enabling TightVNC specific messages");
                SupportedMessages::tightvnc()
            }
            _ => SupportedMessages::default(),
        };

        self.version = server.clamp_to_supported();
        info!("VNC server supports protocol version {} (using {})", server, self.version);
        self.stream.write_bytes(&self.version.to_bytes())?;
        self.state = HandshakeState::SecurityTypeSelect;
        Ok(())
    }

    /// Reads the offered security types and answers with our choice.
    fn read_security_type(&mut self, nested: bool) -> Result<u32> {
        if !nested && !self.version.has_security_list() {
            // 3.3: the server dictates a single type.
            let t = self.stream.read_u32::<BigEndian>()?;
            if t == SECURITY_TYPE_INVALID {
                let reason = read_reason(&mut self.stream)?;
                error!("VNC connection failed: {}", reason);
                return Err(RfbError::UnsupportedServerCapability(format!("connection refused: {reason}")));
            }
            return Ok(t);
        }

        let count = self.stream.read_u8()?;
        if count == 0 {
            let reason = read_reason(&mut self.stream)?;
            error!("server offered no security types: {}", reason);
            return Err(RfbError::UnsupportedServerCapability(format!("connection refused: {reason}")));
        }
        let offered = self.stream.read_vec(usize::from(count))?;
        debug!("server offers security types {:?}", offered);
        let chosen = select_security_type(&offered, nested).ok_or_else(|| {
            RfbError::UnsupportedServerCapability(format!("no supported security type among {offered:?}"))
        })?;
        // MS-Logon travels as its low byte.
        self.stream.write_bytes(&[chosen as u8])?;
        Ok(chosen)
    }

    fn negotiate_security(&mut self) -> Result<()> {
        let scheme = self.read_security_type(false)?;
        info!("selected security scheme {} ({})", scheme, security_type_name(scheme));
        self.security_type = Some(scheme);
        self.state = HandshakeState::Authenticate;

        match scheme {
            SECURITY_TYPE_NONE => {
                info!("no authentication needed");
                if self.version.has_result_for_none() {
                    self.finish_security(false, true)?;
                }
            }
            SECURITY_TYPE_VNC_AUTH => {
                self.run_vnc_auth()?;
                self.finish_security(false, true)?;
            }
            SECURITY_TYPE_MS_LOGON => {
                let (username, password) = self.user_credential()?;
                let outcome = auth::ms_logon_auth(&mut self.stream, &username, &password);
                scrub(password);
                outcome?;
                self.finish_security(false, true)?;
            }
            SECURITY_TYPE_TLS => {
                self.start_tls(TlsMode::Anonymous)?;
                self.state = HandshakeState::SubSecurityTypeSelect;
                let sub = self.read_security_type(true)?;
                info!("selected sub-security scheme {} ({})", sub, security_type_name(sub));
                self.sub_security_type = Some(sub);
                self.state = HandshakeState::SubAuthenticate;
                match sub {
                    SECURITY_TYPE_NONE => {
                        info!("no sub authentication needed");
                        self.finish_security(true, self.version.has_result_for_none())?;
                    }
                    SECURITY_TYPE_VNC_AUTH => {
                        self.run_vnc_auth()?;
                        self.finish_security(true, true)?;
                    }
                    other => {
                        return Err(RfbError::UnsupportedServerCapability(format!(
                            "sub-security type {other} inside TLS"
                        )))
                    }
                }
            }
            SECURITY_TYPE_VENCRYPT => {
                let sub = vencrypt_negotiate(&mut self.stream)?;
                self.sub_security_type = Some(sub);
                let mode = if sub >= VENCRYPT_X509_NONE {
                    TlsMode::X509(self.x509_credential())
                } else {
                    TlsMode::Anonymous
                };
                self.start_tls(mode)?;
                self.state = HandshakeState::SubAuthenticate;
                match sub {
                    VENCRYPT_TLS_NONE | VENCRYPT_X509_NONE => {
                        info!("no sub authentication needed");
                    }
                    VENCRYPT_TLS_VNC | VENCRYPT_X509_VNC => self.run_vnc_auth()?,
                    VENCRYPT_TLS_PLAIN | VENCRYPT_X509_PLAIN => {
                        let (username, password) = self.user_credential()?;
                        let outcome = plain_auth(&mut self.stream, &username, &password);
                        scrub(password);
                        outcome?;
                    }
                    other => {
                        return Err(RfbError::UnsupportedServerCapability(format!("VeNCrypt sub-type {other}")));
                    }
                }
                self.finish_security(true, true)?;
            }
            other => {
                return Err(RfbError::UnsupportedServerCapability(format!(
                    "unknown authentication scheme {other} from VNC server"
                )))
            }
        }
        Ok(())
    }

    /// Reads the SecurityResult for the outer or nested scheme when one is expected.
    fn finish_security(&mut self, nested: bool, expect_result: bool) -> Result<()> {
        if !expect_result {
            return Ok(());
        }
        self.state = if nested { HandshakeState::SubSecurityResult } else { HandshakeState::SecurityResult };
        read_security_result(&mut self.stream, self.version)
    }

    fn run_vnc_auth(&mut self) -> Result<()> {
        let password = self.handler.get_password();
        vnc_auth(&mut self.stream, password)
    }

    fn user_credential(&mut self) -> Result<(String, String)> {
        match self.handler.get_credential(CredentialKind::User) {
            Some(Credential::User { username, password }) => Ok((username, password)),
            _ => {
                warn!("no username/password supplied");
                Err(RfbError::AuthenticationFailed(Some("no username/password supplied".into())))
            }
        }
    }

    fn x509_credential(&mut self) -> X509Credential {
        match self.handler.get_credential(CredentialKind::X509) {
            Some(Credential::X509(cred)) => cred,
            _ => {
                warn!("no X.509 credential supplied, the server certificate cannot be validated");
                X509Credential::default()
            }
        }
    }

    fn start_tls(&mut self, mode: TlsMode) -> Result<()> {
        let params = TlsParams {
            server_name: self.config.tls_server_name.clone(),
            handshake_retries: self.config.tls_handshake_retries,
            retry_delay: self.config.tls_retry_delay,
        };
        let handler = &mut self.handler;
        self.stream.start_tls(|sock| {
            TlsChannel::connect(sock, &mode, &params, |der, valid| handler.verify_certificate(der, valid))
        })
    }

    fn read_server_init(&mut self) -> Result<()> {
        self.state = HandshakeState::ServerInit;
        self.stream.write_bytes(&[u8::from(self.config.shared)])?;

        let width = self.stream.read_u16::<BigEndian>()?;
        let height = self.stream.read_u16::<BigEndian>()?;
        let mut format = [0u8; 16];
        self.stream.read_bytes(&mut format)?;
        let name_len = self.stream.read_u32::<BigEndian>()? as usize;
        if name_len > MAX_NAME_LENGTH {
            return Err(RfbError::violation(format!("desktop name of {name_len} bytes")));
        }
        let name = self.stream.read_vec(name_len)?;
        let init = ServerInit {
            framebuffer_width: width,
            framebuffer_height: height,
            pixel_format: PixelFormat::from_bytes(&format),
            name: String::from_utf8_lossy(&name).into_owned(),
        };

        info!("desktop name \"{}\"", init.name);
        info!("connected to VNC server, using protocol version {}", self.version);
        log_pixel_format("VNC server default format", &init.pixel_format);

        self.server_format = init.pixel_format;
        self.desktop_name = init.name;
        self.framebuffer = Framebuffer::new(init.framebuffer_width, init.framebuffer_height, self.config.pixel_format);
        info!("framebuffer {}x{}", width, height);
        Ok(())
    }

    /// Sends SetPixelFormat and SetEncodings from the current configuration.
    ///
    /// The pixel format is fixed for the lifetime of the connection; only the
    /// encoding preferences may change between calls.
    pub fn set_format_and_encodings(&mut self) -> Result<()> {
        if self.config.pixel_format != *self.framebuffer.format() {
            return Err(RfbError::violation("pixel format cannot change during a session"));
        }
        if !self.supported_messages.supports_client2server(CLIENT_MSG_SET_PIXEL_FORMAT) {
            return Ok(());
        }
        log_pixel_format("requesting pixel format", &self.config.pixel_format);
        self.stream.send(&ClientMessage::SetPixelFormat(self.config.pixel_format))?;

        if !self.supported_messages.supports_client2server(CLIENT_MSG_SET_ENCODINGS) {
            return Ok(());
        }
        let encodings = self.config.encoding_list();
        debug!(
            "requesting encodings {:?}",
            encodings.iter().map(|&e| encoding_name(e)).collect::<Vec<_>>()
        );
        self.decoders.set_zywrle_quality(self.config.effective_quality());
        self.stream.send(&ClientMessage::SetEncodings(&encodings))
    }

    /// Waits up to `timeout` for the next server message. Returns `true` when one is ready.
    pub fn wait_for_message(&mut self, timeout: Duration) -> Result<bool> {
        self.stream.wait_for_data(timeout)
    }

    /// Reads and processes exactly one server message.
    pub fn handle_server_message(&mut self) -> Result<()> {
        if self.state != HandshakeState::Initialized {
            return Err(RfbError::violation("connection is not initialised"));
        }
        let msg_type = self.stream.read_u8()?;
        match msg_type {
            SERVER_MSG_FRAMEBUFFER_UPDATE => self.handle_framebuffer_update(),
            SERVER_MSG_SET_COLOUR_MAP_ENTRIES => {
                self.stream.skip(1)?;
                let first = self.stream.read_u16::<BigEndian>()?;
                let count = self.stream.read_u16::<BigEndian>()?;
                debug!("ignoring {} colour map entries from {}", count, first);
                self.stream.skip(usize::from(count) * 6)
            }
            SERVER_MSG_BELL => {
                self.handler.bell();
                Ok(())
            }
            SERVER_MSG_SERVER_CUT_TEXT => {
                self.stream.skip(3)?;
                let text = self.read_text()?;
                self.handler.got_cut_text(&text);
                Ok(())
            }
            SERVER_MSG_TEXT_CHAT => self.handle_text_chat(),
            SERVER_MSG_RESIZE_FRAMEBUFFER => {
                self.stream.skip(1)?;
                let width = self.stream.read_u16::<BigEndian>()?;
                let height = self.stream.read_u16::<BigEndian>()?;
                self.resize_framebuffer(width, height)
            }
            SERVER_MSG_PALM_RESIZE_FRAMEBUFFER => {
                self.stream.skip(1)?;
                let desktop_w = self.stream.read_u16::<BigEndian>()?;
                let desktop_h = self.stream.read_u16::<BigEndian>()?;
                let width = self.stream.read_u16::<BigEndian>()?;
                let height = self.stream.read_u16::<BigEndian>()?;
                self.stream.skip(2)?;
                debug!("PalmVNC desktop {}x{}", desktop_w, desktop_h);
                self.resize_framebuffer(width, height)
            }
            other => {
                error!("unknown message type {} from VNC server", other);
                Err(RfbError::violation(format!("unknown server message type {other}")))
            }
        }
    }

    /// Reads a u32 length and that many bytes, bounded by [`MAX_CUT_TEXT`].
    fn read_text(&mut self) -> Result<Vec<u8>> {
        let len = self.stream.read_u32::<BigEndian>()? as usize;
        if len > MAX_CUT_TEXT {
            return Err(RfbError::violation(format!("text of {len} bytes (max {MAX_CUT_TEXT})")));
        }
        self.stream.read_vec(len)
    }

    fn handle_text_chat(&mut self) -> Result<()> {
        self.stream.skip(3)?;
        let event = match self.stream.read_u32::<BigEndian>()? {
            TEXT_CHAT_OPEN => TextChatEvent::Open,
            TEXT_CHAT_CLOSE => TextChatEvent::Close,
            TEXT_CHAT_FINISHED => TextChatEvent::Finished,
            len => {
                let len = len as usize;
                if len > MAX_CUT_TEXT {
                    return Err(RfbError::violation(format!("chat text of {len} bytes")));
                }
                let text = self.stream.read_vec(len)?;
                TextChatEvent::Text(String::from_utf8_lossy(&text).into_owned())
            }
        };
        debug!("received TextChat {:?}", event);
        self.handler.text_chat(event);
        Ok(())
    }

    fn handle_framebuffer_update(&mut self) -> Result<()> {
        self.stream.skip(1)?;
        let count = self.stream.read_u16::<BigEndian>()?;

        for _ in 0..count {
            let mut header = [0u8; 12];
            self.stream.read_bytes(&mut header)?;
            let rect = RectHeader::from_bytes(&header);
            if rect.encoding == ENCODING_LAST_RECT {
                break;
            }
            if self.handle_pseudo_rect(&rect)? {
                continue;
            }

            // UltraZip's header carries a subrect count, not pixel coordinates.
            if rect.encoding != ENCODING_ULTRAZIP {
                if let Err(err) = self.framebuffer.check_bounds(rect.x, rect.y, rect.width, rect.height) {
                    error!("rect too large: {}x{} at ({}, {})", rect.width, rect.height, rect.x, rect.y);
                    return Err(err);
                }
            }

            let bpp = self.framebuffer.format().bits_per_pixel;
            let decoder = decoder_for(rect.encoding, bpp).ok_or_else(|| {
                RfbError::violation(format!("unknown rect encoding {} at {} bpp", rect.encoding, bpp))
            })?;
            decoder.decode(&rect, &mut self.stream, &mut self.framebuffer, &mut self.decoders)?;

            if rect.encoding == ENCODING_ULTRAZIP {
                if let Some((x, y, w, h)) = self.decoders.take_ultrazip_region() {
                    self.handler.got_update(&self.framebuffer, x, y, w, h);
                }
            } else {
                self.handler.got_update(&self.framebuffer, rect.x, rect.y, rect.width, rect.height);
            }
        }

        self.send_incremental_update_request()?;
        self.handler.finished_update(&self.framebuffer);
        Ok(())
    }

    /// Handles rectangles that carry no pixels. Returns `false` for real encodings.
    fn handle_pseudo_rect(&mut self, rect: &RectHeader) -> Result<bool> {
        match rect.encoding {
            ENCODING_XCURSOR | ENCODING_RICH_CURSOR => {
                let format = *self.framebuffer.format();
                if let Some(shape) = decode_cursor(rect, &mut self.stream, &format)? {
                    self.handler.got_cursor_shape(&shape);
                }
            }
            ENCODING_POINTER_POS => self.handler.got_cursor_pos(rect.x, rect.y),
            ENCODING_KEYBOARD_LED_STATE => {
                self.keyboard_led_state = Some(rect.x);
                self.handler.keyboard_led_state(rect.x);
            }
            ENCODING_NEW_FB_SIZE => self.resize_framebuffer(rect.width, rect.height)?,
            ENCODING_SUPPORTED_MESSAGES => {
                let mut bitmap = [0u8; SUPPORTED_MESSAGES_LEN];
                self.stream.read_bytes(&mut bitmap)?;
                self.supported_messages = SupportedMessages::from_bytes(&bitmap);
                debug!("client2server supported messages {:02x?}", self.supported_messages.client2server);
                debug!("server2client supported messages {:02x?}", self.supported_messages.server2client);
            }
            ENCODING_SUPPORTED_ENCODINGS => {
                let bytes = self.stream.read_vec(usize::from(rect.width))?;
                self.supported_encodings = bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                debug!("server supports {} encodings", self.supported_encodings.len());
            }
            ENCODING_SERVER_IDENTITY => {
                let bytes = self.stream.read_vec(usize::from(rect.width))?;
                let identity = String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string();
                info!("connected to server \"{}\"", identity);
                self.server_identity = Some(identity);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn resize_framebuffer(&mut self, width: u16, height: u16) -> Result<()> {
        self.framebuffer.resize(width, height);
        info!("got new framebuffer size: {}x{}", width, height);
        self.handler.resized(width, height);
        self.send_framebuffer_update_request(0, 0, width, height, false)
    }

    /// The configured update rectangle clipped to the framebuffer, or the whole screen.
    pub fn update_rect(&self) -> UpdateRect {
        let (fb_w, fb_h) = (self.framebuffer.width(), self.framebuffer.height());
        match self.config.update_rect {
            Some(r) => {
                let x = r.x.min(fb_w);
                let y = r.y.min(fb_h);
                UpdateRect { x, y, width: r.width.min(fb_w - x), height: r.height.min(fb_h - y) }
            }
            None => UpdateRect { x: 0, y: 0, width: fb_w, height: fb_h },
        }
    }

    fn supports(&self, msg_type: u8) -> bool {
        self.supported_messages.supports_client2server(msg_type)
    }

    /// Requests an update of a region.
    pub fn send_framebuffer_update_request(
        &mut self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        incremental: bool,
    ) -> Result<()> {
        if !self.supports(CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST) {
            return Ok(());
        }
        self.stream.send(&ClientMessage::FramebufferUpdateRequest { incremental, x, y, width, height })
    }

    /// Requests changes to the update rectangle since the last update.
    pub fn send_incremental_update_request(&mut self) -> Result<()> {
        let r = self.update_rect();
        self.send_framebuffer_update_request(r.x, r.y, r.width, r.height, true)
    }

    /// Sends a key press or release. Ignored in view-only mode.
    pub fn send_key_event(&mut self, key: u32, down: bool) -> Result<()> {
        if self.config.view_only || !self.supports(CLIENT_MSG_KEY_EVENT) {
            return Ok(());
        }
        self.stream.send(&ClientMessage::KeyEvent { down, key })
    }

    /// Sends the pointer position and button mask. Negative coordinates are clamped to 0.
    /// Ignored in view-only mode.
    pub fn send_pointer_event(&mut self, x: i32, y: i32, button_mask: u8) -> Result<()> {
        if self.config.view_only || !self.supports(CLIENT_MSG_POINTER_EVENT) {
            return Ok(());
        }
        let clamp = |v: i32| v.clamp(0, i32::from(u16::MAX)) as u16;
        self.stream.send(&ClientMessage::PointerEvent { button_mask, x: clamp(x), y: clamp(y) })
    }

    /// Sends clipboard text (Latin-1).
    pub fn send_client_cut_text(&mut self, text: &[u8]) -> Result<()> {
        if !self.supports(CLIENT_MSG_CLIENT_CUT_TEXT) {
            return Ok(());
        }
        self.stream.send(&ClientMessage::ClientCutText(text))
    }

    /// Asks the server to scale its output by 1/`scale`. Sent as UltraVNC
    /// SetScale and/or PalmVNC SetScaleFactor, whichever the server accepts.
    pub fn send_scale_setting(&mut self, scale: u8) -> Result<()> {
        for msg_type in [CLIENT_MSG_SET_SCALE, CLIENT_MSG_PALM_SET_SCALE_FACTOR] {
            if self.supports(msg_type) {
                self.stream.send(&ClientMessage::SetScale(msg_type, scale))?;
            }
        }
        Ok(())
    }

    /// UltraVNC: `true` disables the server's local keyboard and mouse.
    pub fn permit_server_input(&mut self, disable_local: bool) -> Result<()> {
        if !self.supports(CLIENT_MSG_SET_SERVER_INPUT) {
            return Ok(());
        }
        self.stream.send(&ClientMessage::SetServerInput(disable_local))
    }

    fn send_text_chat(&mut self, payload: TextChatPayload<'_>) -> Result<()> {
        if !self.supports(CLIENT_MSG_TEXT_CHAT) {
            return Ok(());
        }
        self.stream.send(&ClientMessage::TextChat(payload))
    }

    /// Sends chat text.
    pub fn text_chat_send(&mut self, text: &str) -> Result<()> {
        self.send_text_chat(TextChatPayload::Text(text.as_bytes()))
    }

    /// Opens the chat window on the server.
    pub fn text_chat_open(&mut self) -> Result<()> {
        self.send_text_chat(TextChatPayload::Control(TEXT_CHAT_OPEN))
    }

    /// Closes the chat window on the server.
    pub fn text_chat_close(&mut self) -> Result<()> {
        self.send_text_chat(TextChatPayload::Control(TEXT_CHAT_CLOSE))
    }

    /// Ends the chat session.
    pub fn text_chat_finish(&mut self) -> Result<()> {
        self.send_text_chat(TextChatPayload::Control(TEXT_CHAT_FINISHED))
    }

    /// Current step of the handshake; `Initialized` once ServerInit was read.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The local copy of the remote desktop, in the client pixel format.
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    /// Framebuffer width in pixels.
    pub fn width(&self) -> u16 {
        self.framebuffer.width()
    }

    /// Framebuffer height in pixels.
    pub fn height(&self) -> u16 {
        self.framebuffer.height()
    }

    /// Desktop name from ServerInit, lossily decoded as UTF-8.
    pub fn desktop_name(&self) -> &str {
        &self.desktop_name
    }

    /// The version both sides agreed on.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// The security type the handshake settled on, if it got that far.
    pub fn security_type(&self) -> Option<u32> {
        self.security_type
    }

    /// The nested scheme for TLS, or the VeNCrypt sub-type.
    pub fn sub_security_type(&self) -> Option<u32> {
        self.sub_security_type
    }

    /// The client pixel format all decoders write in.
    pub fn pixel_format(&self) -> &PixelFormat {
        self.framebuffer.format()
    }

    /// The server's native format from ServerInit.
    pub fn server_pixel_format(&self) -> &PixelFormat {
        &self.server_format
    }

    /// Server name and version from a ServerIdentity rectangle.
    pub fn server_identity(&self) -> Option<&str> {
        self.server_identity.as_deref()
    }

    /// Last LED bitmask the server reported.
    pub fn keyboard_led_state(&self) -> Option<u16> {
        self.keyboard_led_state
    }

    /// Client and server message types the server announced.
    pub fn supported_messages(&self) -> &SupportedMessages {
        &self.supported_messages
    }

    /// Encodings listed in the server's SupportedEncodings rectangle.
    pub fn supported_encodings(&self) -> &[i32] {
        &self.supported_encodings
    }

    /// The settings this connection was created with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Mutable access for changing encoding preferences before
    /// [`set_format_and_encodings`](Self::set_format_and_encodings).
    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// The callback handler passed to [`new`](Self::new).
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable access to the callback handler.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// True once the transport runs over TLS.
    pub fn is_encrypted(&self) -> bool {
        self.stream.is_tls()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnc::protocol::{ENCODING_RAW, SERVER_MSG_FILE_TRANSFER};
    use std::io::{self, Cursor, Read, Write};
    use std::sync::{Arc, Mutex};

    struct Script {
        input: Cursor<Vec<u8>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Script {
        fn wait_for_data(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct Events {
        cut_text: Vec<Vec<u8>>,
        chat: Vec<TextChatEvent>,
        resized: Vec<(u16, u16)>,
        bells: usize,
    }

    impl ClientHandler for Events {
        fn got_cut_text(&mut self, text: &[u8]) {
            self.cut_text.push(text.to_vec());
        }
        fn text_chat(&mut self, event: TextChatEvent) {
            self.chat.push(event);
        }
        fn resized(&mut self, width: u16, height: u16) {
            self.resized.push((width, height));
        }
        fn bell(&mut self) {
            self.bells += 1;
        }
    }

    /// Version 3.3 handshake with no authentication and a 4x2 desktop, then `tail`.
    fn server_33(tail: &[u8]) -> Vec<u8> {
        let mut s = b"RFB 003.003\n".to_vec();
        s.extend_from_slice(&SECURITY_TYPE_NONE.to_be_bytes());
        s.extend_from_slice(&[0, 4, 0, 2]);
        let mut pf = bytes::BytesMut::new();
        PixelFormat::rgb888().write_to(&mut pf);
        s.extend_from_slice(&pf);
        s.extend_from_slice(&[0, 0, 0, 3]);
        s.extend_from_slice(b"box");
        s.extend_from_slice(tail);
        s
    }

    fn client(input: Vec<u8>, config: ClientConfig) -> (RfbClient<Script, Events>, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let script = Script { input: Cursor::new(input), output: output.clone() };
        (RfbClient::new(script, config, Events::default()), output)
    }

    #[test]
    fn handshake_33_without_security_list() {
        let (mut c, out) = client(server_33(&[]), ClientConfig::default());
        c.init().unwrap();
        assert_eq!(c.state(), HandshakeState::Initialized);
        assert_eq!(c.protocol_version(), ProtocolVersion { major: 3, minor: 3 });
        assert_eq!(c.desktop_name(), "box");
        assert_eq!((c.width(), c.height()), (4, 2));
        let out = out.lock().unwrap();
        assert_eq!(&out[..12], b"RFB 003.003\n");
        assert_eq!(out[12], 1); // shared
        assert_eq!(out[13], CLIENT_MSG_SET_PIXEL_FORMAT);
        assert_eq!(&out[out.len() - 10..], &[3, 0, 0, 0, 0, 0, 0, 4, 0, 2]);
    }

    #[test]
    fn refused_connection_reports_reason() {
        let mut s = b"RFB 003.003\n".to_vec();
        s.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 4]);
        s.extend_from_slice(b"busy");
        let (mut c, _) = client(s, ClientConfig::default());
        let err = c.init().unwrap_err();
        assert!(matches!(err, RfbError::UnsupportedServerCapability(ref r) if r.contains("busy")));
        assert_eq!(c.state(), HandshakeState::SecurityTypeSelect);
    }

    #[test]
    fn unsupported_security_list_is_rejected() {
        let mut s = b"RFB 003.008\n".to_vec();
        s.extend_from_slice(&[2, 30, 16]);
        let (mut c, _) = client(s, ClientConfig::default());
        assert!(matches!(c.init(), Err(RfbError::UnsupportedServerCapability(_))));
    }

    #[test]
    fn misc_server_messages() {
        let mut tail = vec![SERVER_MSG_BELL];
        tail.extend_from_slice(&[SERVER_MSG_SERVER_CUT_TEXT, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']);
        tail.extend_from_slice(&[SERVER_MSG_SET_COLOUR_MAP_ENTRIES, 0, 0, 0, 0, 1, 1, 2, 3, 4, 5, 6]);
        tail.extend_from_slice(&[SERVER_MSG_TEXT_CHAT, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
        tail.extend_from_slice(&[SERVER_MSG_TEXT_CHAT, 0, 0, 0, 0, 0, 0, 3, b'y', b'o', b'!']);
        tail.extend_from_slice(&[SERVER_MSG_RESIZE_FRAMEBUFFER, 0, 0, 8, 0, 6]);
        let (mut c, out) = client(server_33(&tail), ClientConfig::default());
        c.init().unwrap();
        let before = out.lock().unwrap().len();
        for _ in 0..6 {
            c.handle_server_message().unwrap();
        }
        let events = c.handler();
        assert_eq!(events.bells, 1);
        assert_eq!(events.cut_text, vec![b"hi".to_vec()]);
        assert_eq!(events.chat, vec![TextChatEvent::Open, TextChatEvent::Text("yo!".into())]);
        assert_eq!(events.resized, vec![(8, 6)]);
        assert_eq!((c.width(), c.height()), (8, 6));
        assert_eq!(&out.lock().unwrap()[before..], &[3, 0, 0, 0, 0, 0, 0, 8, 0, 6]);
    }

    #[test]
    fn unknown_server_message_is_a_violation() {
        let (mut c, _) = client(server_33(&[SERVER_MSG_FILE_TRANSFER]), ClientConfig::default());
        c.init().unwrap();
        assert!(matches!(c.handle_server_message(), Err(RfbError::ProtocolViolation(_))));
    }

    #[test]
    fn pseudo_rects_and_last_rect() {
        let mut tail = vec![SERVER_MSG_FRAMEBUFFER_UPDATE, 0, 0, 4];
        tail.extend_from_slice(&[0, 5, 0, 0, 0, 0, 0, 0]);
        tail.extend_from_slice(&ENCODING_KEYBOARD_LED_STATE.to_be_bytes());
        tail.extend_from_slice(&[0, 0, 0, 0, 0, 3, 0, 0]);
        tail.extend_from_slice(&ENCODING_SERVER_IDENTITY.to_be_bytes());
        tail.extend_from_slice(b"x11");
        tail.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        tail.extend_from_slice(&ENCODING_LAST_RECT.to_be_bytes());
        let (mut c, _) = client(server_33(&tail), ClientConfig::default());
        c.init().unwrap();
        c.handle_server_message().unwrap();
        assert_eq!(c.keyboard_led_state(), Some(5));
        assert_eq!(c.server_identity(), Some("x11"));
    }

    #[test]
    fn view_only_and_optional_messages_are_suppressed() {
        let config = ClientConfig { view_only: true, ..Default::default() };
        let (mut c, out) = client(server_33(&[]), config);
        c.init().unwrap();
        let before = out.lock().unwrap().len();
        c.send_key_event(0xff0d, true).unwrap();
        c.send_pointer_event(-5, 10, 1).unwrap();
        c.text_chat_open().unwrap();
        c.send_scale_setting(2).unwrap();
        assert_eq!(out.lock().unwrap().len(), before);
    }

    #[test]
    fn pointer_coordinates_are_clamped() {
        let (mut c, out) = client(server_33(&[]), ClientConfig::default());
        c.init().unwrap();
        let before = out.lock().unwrap().len();
        c.send_pointer_event(-5, 70_000, 1).unwrap();
        assert_eq!(&out.lock().unwrap()[before..], &[5, 1, 0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn update_rect_is_clipped() {
        let config = ClientConfig {
            update_rect: Some(UpdateRect { x: 2, y: 1, width: 100, height: 100 }),
            encodings: Some("raw".into()),
            ..Default::default()
        };
        let (mut c, out) = client(server_33(&[]), config);
        c.init().unwrap();
        assert_eq!(c.update_rect(), UpdateRect { x: 2, y: 1, width: 2, height: 1 });
        let out = out.lock().unwrap();
        assert_eq!(&out[out.len() - 10..], &[3, 0, 0, 2, 0, 1, 0, 2, 0, 1]);
        // version, shared flag, SetPixelFormat, then SetEncodings
        let at = 12 + 1 + 20;
        assert_eq!(&out[at..at + 8], &[2, 0, 0, 6, 0, 0, 0, ENCODING_RAW as u8]);
        assert_eq!(i32::from_be_bytes([out[at + 8], out[at + 9], out[at + 10], out[at + 11]]), ENCODING_KEYBOARD_LED_STATE);
    }
}
