//! Scripted server side shared by the integration tests.

#![allow(dead_code)]

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use rfb_client::{
    ClientConfig, ClientHandler, Credential, CredentialKind, CursorShape, Framebuffer, PixelFormat, RfbClient,
    Transport,
};

/// Replays canned server bytes and records everything the client writes.
pub struct Script {
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

/// Records callbacks and answers credential prompts.
#[derive(Default)]
pub struct Recorder {
    pub password: Option<String>,
    pub user: Option<(String, String)>,
    pub updates: Vec<(u16, u16, u16, u16)>,
    pub finished: usize,
    pub cursors: Vec<CursorShape>,
    pub resized: Vec<(u16, u16)>,
    pub certificates: usize,
    pub reject_certificate: bool,
}

impl ClientHandler for Recorder {
    fn get_password(&mut self) -> Option<String> {
        self.password.clone()
    }

    fn get_credential(&mut self, kind: CredentialKind) -> Option<Credential> {
        match kind {
            CredentialKind::User => {
                self.user.clone().map(|(username, password)| Credential::User { username, password })
            }
            CredentialKind::X509 => None,
        }
    }

    fn got_update(&mut self, _fb: &Framebuffer, x: u16, y: u16, w: u16, h: u16) {
        self.updates.push((x, y, w, h));
    }

    fn finished_update(&mut self, _fb: &Framebuffer) {
        self.finished += 1;
    }

    fn got_cursor_shape(&mut self, shape: &CursorShape) {
        self.cursors.push(shape.clone());
    }

    fn resized(&mut self, width: u16, height: u16) {
        self.resized.push((width, height));
    }

    fn verify_certificate(&mut self, _der: &[u8], valid: bool) -> bool {
        self.certificates += 1;
        valid && !self.reject_certificate
    }
}

/// Builds the byte stream a server would send.
#[derive(Default)]
pub struct ServerScript {
    bytes: Vec<u8>,
}

impl ServerScript {
    pub fn new(version: &[u8; 12]) -> Self {
        Self { bytes: version.to_vec() }
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn u32(self, v: u32) -> Self {
        self.raw(&v.to_be_bytes())
    }

    pub fn security_types(self, types: &[u8]) -> Self {
        self.raw(&[types.len() as u8]).raw(types)
    }

    pub fn server_init(self, width: u16, height: u16, format: PixelFormat, name: &str) -> Self {
        self.raw(&server_init(width, height, format, name))
    }

    /// A FramebufferUpdate header announcing `count` rectangles.
    pub fn update(self, count: u16) -> Self {
        let c = count.to_be_bytes();
        self.raw(&[0, 0, c[0], c[1]])
    }

    pub fn rect(self, x: u16, y: u16, w: u16, h: u16, encoding: i32) -> Self {
        self.raw(&rect_header(x, y, w, h, encoding))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

pub fn server_init(width: u16, height: u16, format: PixelFormat, name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    let mut pf = BytesMut::new();
    format.write_to(&mut pf);
    out.extend_from_slice(&pf);
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

pub fn rect_header(x: u16, y: u16, w: u16, h: u16, encoding: i32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..2].copy_from_slice(&x.to_be_bytes());
    out[2..4].copy_from_slice(&y.to_be_bytes());
    out[4..6].copy_from_slice(&w.to_be_bytes());
    out[6..8].copy_from_slice(&h.to_be_bytes());
    out[8..12].copy_from_slice(&encoding.to_be_bytes());
    out
}

/// A 3.8 server with no authentication.
pub fn none_38(width: u16, height: u16, format: PixelFormat) -> ServerScript {
    ServerScript::new(b"RFB 003.008\n")
        .security_types(&[1])
        .u32(0)
        .server_init(width, height, format, "test desktop")
}

pub fn client(
    input: Vec<u8>,
    config: ClientConfig,
    handler: Recorder,
) -> (RfbClient<Script, Recorder>, Arc<Mutex<Vec<u8>>>) {
    let output = Arc::new(Mutex::new(Vec::new()));
    let script = Script { input: Cursor::new(input), output: output.clone() };
    (RfbClient::new(script, config, handler), output)
}

/// SetPixelFormat for `format`.
pub fn set_pixel_format(format: PixelFormat) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 0];
    let mut pf = BytesMut::new();
    format.write_to(&mut pf);
    out.extend_from_slice(&pf);
    out
}

/// SetEncodings for `encodings`.
pub fn set_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut out = vec![2, 0];
    out.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for e in encodings {
        out.extend_from_slice(&e.to_be_bytes());
    }
    out
}

/// FramebufferUpdateRequest.
pub fn update_request(incremental: bool, x: u16, y: u16, w: u16, h: u16) -> Vec<u8> {
    let mut out = vec![3, u8::from(incremental)];
    for v in [x, y, w, h] {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

/// The messages a client sends right after ServerInit.
pub fn post_init(config: &ClientConfig, width: u16, height: u16) -> Vec<u8> {
    let mut out = set_pixel_format(config.pixel_format);
    out.extend(set_encodings(&config.encoding_list()));
    out.extend(update_request(false, 0, 0, width, height));
    out
}
