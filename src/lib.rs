//! RFB (VNC) client protocol engine.
//!
//! This crate implements the client side of the Remote Framebuffer protocol:
//! version and security negotiation (None, VNC password, MS-Logon II, TLS and
//! VeNCrypt), pixel format and encoding negotiation, and the framebuffer update
//! loop with decoders for Raw, CopyRect, RRE, CoRRE, Hextile, Zlib, Tight,
//! Ultra/UltraZip and ZRLE/ZYWRLE.
//!
//! # Modules
//!
//! - `vnc`: The protocol engine. The most used types are re-exported here.
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::time::Duration;
//! use rfb_client::{ClientConfig, ClientHandler, RfbClient};
//!
//! struct Viewer;
//! impl ClientHandler for Viewer {}
//!
//! let sock = TcpStream::connect("127.0.0.1:5900")?;
//! let mut client = RfbClient::new(sock, ClientConfig::default(), Viewer);
//! client.init()?;
//! while client.wait_for_message(Duration::from_secs(5))? {
//!     client.handle_server_message()?;
//! }
//! # Ok::<(), rfb_client::RfbError>(())
//! ```

pub mod vnc;

pub use vnc::auth::{Credential, CredentialKind, X509Credential};
pub use vnc::client::{ClientHandler, HandshakeState, RfbClient, TextChatEvent};
pub use vnc::config::{ClientConfig, ColorDepth, QualityPreset, UpdateRect};
pub use vnc::encoding::CursorShape;
pub use vnc::error::{Result, RfbError};
pub use vnc::framebuffer::Framebuffer;
pub use vnc::protocol::{PixelFormat, ProtocolVersion};
pub use vnc::stream::Transport;
