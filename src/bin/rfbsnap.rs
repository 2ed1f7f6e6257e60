//! Connects to an RFB server, waits for complete frames and saves the screen as PNG.

use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{info, warn};

use rfb_client::vnc::translate;
use rfb_client::{
    ClientConfig, ClientHandler, ColorDepth, Credential, CredentialKind, Framebuffer, QualityPreset, RfbClient,
    X509Credential,
};

#[derive(Clone, Copy, ValueEnum)]
enum Quality {
    Poor,
    Medium,
    Good,
    Best,
}

impl From<Quality> for QualityPreset {
    fn from(q: Quality) -> Self {
        match q {
            Quality::Poor => QualityPreset::Poor,
            Quality::Medium => QualityPreset::Medium,
            Quality::Good => QualityPreset::Good,
            Quality::Best => QualityPreset::Best,
        }
    }
}

#[derive(Parser)]
#[command(name = "rfbsnap")]
#[command(about = "Save a VNC server's screen as PNG")]
struct Args {
    #[arg(help = "Server address, host:port")]
    server: String,

    #[arg(short, long, default_value = "snapshot.png", help = "Output PNG file")]
    output: PathBuf,

    #[arg(short = 'n', long, default_value_t = 1, help = "Number of complete updates to wait for")]
    frames: u32,

    #[arg(short, long, help = "VNC password")]
    password: Option<String>,

    #[arg(short, long, help = "Username for Plain and MS-Logon authentication")]
    username: Option<String>,

    #[arg(long, value_enum, help = "Encoding/compression preset")]
    quality: Option<Quality>,

    #[arg(long, help = "Space-separated encoding names, e.g. \"tight zrle raw\"")]
    encodings: Option<String>,

    #[arg(long, default_value_t = 32, help = "Colour depth: 32, 24, 16, 15 or 8")]
    depth: u8,

    #[arg(long, help = "Compress level 0-9")]
    compress: Option<u8>,

    #[arg(long, default_value_t = 30, help = "Read timeout in seconds")]
    timeout: u64,

    #[arg(long, default_value = "localhost", help = "Server name for TLS")]
    tls_name: String,

    #[arg(long, help = "CA bundle (PEM) for X.509 VeNCrypt")]
    ca_cert: Option<PathBuf>,

    #[arg(long, help = "Certificate revocation list (PEM)")]
    ca_crl: Option<PathBuf>,

    #[arg(long, help = "Client certificate (PEM)")]
    client_cert: Option<PathBuf>,

    #[arg(long, help = "Client private key (PEM)")]
    client_key: Option<PathBuf>,

    #[arg(long, help = "Accept server certificates that fail validation")]
    insecure: bool,
}

struct Snapshot {
    password: Option<String>,
    username: Option<String>,
    x509: X509Credential,
    insecure: bool,
    frames: u32,
}

impl ClientHandler for Snapshot {
    fn get_password(&mut self) -> Option<String> {
        self.password.clone()
    }

    fn get_credential(&mut self, kind: CredentialKind) -> Option<Credential> {
        match kind {
            CredentialKind::User => Some(Credential::User {
                username: self.username.clone()?,
                password: self.password.clone().unwrap_or_default(),
            }),
            CredentialKind::X509 => Some(Credential::X509(self.x509.clone())),
        }
    }

    fn finished_update(&mut self, _fb: &Framebuffer) {
        self.frames += 1;
    }

    fn resized(&mut self, width: u16, height: u16) {
        info!("desktop resized to {}x{}", width, height);
    }

    fn verify_certificate(&mut self, _der: &[u8], valid: bool) -> bool {
        if !valid && self.insecure {
            warn!("accepting a server certificate that failed validation");
            return true;
        }
        valid
    }
}

fn write_png(path: &Path, fb: &Framebuffer) -> Result<(), Box<dyn Error>> {
    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(writer, u32::from(fb.width()), u32::from(fb.height()));
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&translate::to_rgba(fb))?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();

    let depth = ColorDepth::from_depth(args.depth).ok_or_else(|| format!("unsupported colour depth {}", args.depth))?;
    let mut config = ClientConfig {
        read_timeout: Some(Duration::from_secs(args.timeout)),
        tls_server_name: args.tls_name,
        view_only: true,
        ..ClientConfig::default()
    }
    .with_color_depth(depth);
    if let Some(quality) = args.quality {
        config = config.with_quality(quality.into());
    }
    if args.encodings.is_some() {
        config.encodings = args.encodings;
    }
    if args.compress.is_some() {
        config.compress_level = args.compress;
    }

    let handler = Snapshot {
        password: args.password,
        username: args.username,
        x509: X509Credential {
            ca_cert: args.ca_cert,
            ca_crl: args.ca_crl,
            client_cert: args.client_cert,
            client_key: args.client_key,
        },
        insecure: args.insecure,
        frames: 0,
    };

    let sock = TcpStream::connect(&args.server)?;
    sock.set_nodelay(true)?;
    let mut client = RfbClient::new(sock, config, handler);
    client.init()?;
    info!(
        "connected to \"{}\" ({}x{}, protocol {})",
        client.desktop_name(),
        client.width(),
        client.height(),
        client.protocol_version()
    );

    while client.handler().frames < args.frames {
        client.handle_server_message()?;
    }

    write_png(&args.output, client.framebuffer())?;
    info!("wrote {}", args.output.display());
    Ok(())
}
