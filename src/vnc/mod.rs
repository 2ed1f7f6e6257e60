//! RFB client protocol engine.
//!
//! # Architecture
//!
//! The engine is organized into several key components, leaves first:
//!
//! - **`stream`**: Buffered, deadline-aware byte transport over a socket or TLS channel
//! - **`tls`**: TLS channel for the TLS and VeNCrypt security types
//! - **`auth`**: Security type selection and each scheme's exchange
//! - **`protocol`**: RFB constants, wire structures and client message serialization
//! - **`client`**: Handshake state machine, session negotiation and the update loop
//! - **`encoding`**: One decoder per (encoding, bits-per-pixel) pair
//! - **`framebuffer`**: Bounds-checked pixel storage in the client pixel format
//! - **`config`**: Connection settings, presets and the advertised encoding list
//! - **`translate`**: Conversion of framebuffer pixels to RGBA8
//!
//! # Example Flow
//!
//! ```ignore
//! let mut client = RfbClient::new(sock, ClientConfig::default(), handler);
//! client.init()?;
//! while client.wait_for_message(Duration::from_millis(500))? {
//!     client.handle_server_message()?;
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod encoding;
pub mod error;
pub mod framebuffer;
pub mod protocol;
pub mod stream;
pub mod tls;
pub mod translate;
