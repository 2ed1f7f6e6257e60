//! Authentication schemes and their wire exchanges.
//!
//! The client state machine decides which scheme runs and fetches credentials
//! from the caller; this module holds the cryptography and the byte-level
//! exchange for each scheme.

use std::io::{Read, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use log::{info, warn};

use super::encoding::common::read_into;
use super::error::{Result, RfbError};
use super::protocol::{
    ProtocolVersion, CHALLENGE_SIZE, SECURITY_RESULT_FAILED, SECURITY_RESULT_OK, SECURITY_RESULT_TOO_MANY,
    SECURITY_TYPE_MS_LOGON, SECURITY_TYPE_NONE, SECURITY_TYPE_TLS, SECURITY_TYPE_VENCRYPT, SECURITY_TYPE_VNC_AUTH,
    VENCRYPT_TLS_NONE, VENCRYPT_X509_PLAIN,
};

/// MS-Logon username field size.
pub const MS_LOGON_USERNAME_LEN: usize = 256;
/// MS-Logon password field size.
pub const MS_LOGON_PASSWORD_LEN: usize = 64;

/// What kind of credential a scheme is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Username and password.
    User,
    /// X.509 material for certificate-based TLS.
    X509,
}

/// PEM file paths for certificate-based TLS.
#[derive(Debug, Clone, Default)]
pub struct X509Credential {
    /// CA bundle used to validate the server.
    pub ca_cert: Option<PathBuf>,
    /// Certificate revocation list.
    pub ca_crl: Option<PathBuf>,
    /// Client certificate chain.
    pub client_cert: Option<PathBuf>,
    /// Client private key.
    pub client_key: Option<PathBuf>,
}

/// A credential supplied by the caller.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Username and password.
    User {
        /// Login name.
        username: String,
        /// Password.
        password: String,
    },
    /// Certificate material.
    X509(X509Credential),
}

/// Returns a printable name for a security type.
pub fn security_type_name(t: u32) -> &'static str {
    match t {
        SECURITY_TYPE_NONE => "None",
        SECURITY_TYPE_VNC_AUTH => "VNC Authentication",
        SECURITY_TYPE_TLS => "TLS",
        SECURITY_TYPE_VENCRYPT => "VeNCrypt",
        SECURITY_TYPE_MS_LOGON => "MS-Logon II",
        257 => "VeNCrypt TLSNone",
        258 => "VeNCrypt TLSVnc",
        259 => "VeNCrypt TLSPlain",
        260 => "VeNCrypt X509None",
        261 => "VeNCrypt X509Vnc",
        262 => "VeNCrypt X509Plain",
        _ => "Unknown",
    }
}

/// Picks the first offered security type this client implements.
///
/// `nested` restricts the choice to the schemes allowed inside a TLS tunnel.
/// MS-Logon travels as the low byte `0xfa` of its 32-bit code.
pub fn select_security_type(offered: &[u8], nested: bool) -> Option<u32> {
    offered.iter().find_map(|&t| {
        let code = if u32::from(t) == SECURITY_TYPE_MS_LOGON & 0xff {
            SECURITY_TYPE_MS_LOGON
        } else {
            u32::from(t)
        };
        let allowed = match code {
            SECURITY_TYPE_NONE | SECURITY_TYPE_VNC_AUTH => true,
            SECURITY_TYPE_MS_LOGON | SECURITY_TYPE_TLS | SECURITY_TYPE_VENCRYPT => !nested,
            _ => false,
        };
        allowed.then_some(code)
    })
}

/// Reads a u32 length followed by that many bytes of (lossy) UTF-8 text.
pub(crate) fn read_reason<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut text = Vec::new();
    read_into(reader, &mut text, len)?;
    Ok(String::from_utf8_lossy(&text).into_owned())
}

/// Reads and interprets a SecurityResult.
pub(crate) fn read_security_result<R: Read + ?Sized>(reader: &mut R, version: ProtocolVersion) -> Result<()> {
    match reader.read_u32::<BigEndian>()? {
        SECURITY_RESULT_OK => {
            info!("VNC authentication succeeded");
            Ok(())
        }
        SECURITY_RESULT_FAILED => {
            // Servers below 3.8 send no reason.
            let reason = if version.has_result_for_none() { Some(read_reason(reader)?) } else { None };
            warn!("VNC authentication failed{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default());
            Err(RfbError::AuthenticationFailed(reason))
        }
        SECURITY_RESULT_TOO_MANY => {
            warn!("VNC authentication failed - too many tries");
            Err(RfbError::AuthenticationFailed(Some("too many tries".into())))
        }
        other => Err(RfbError::violation(format!("unknown security result {other}"))),
    }
}

/// DES key schedule in the bit order the RFB DES variant expects.
fn des_cipher(key: &[u8; 8]) -> Des {
    let mut reversed = [0u8; 8];
    for (dst, src) in reversed.iter_mut().zip(key) {
        *dst = src.reverse_bits();
    }
    let cipher = Des::new(&reversed.into());
    reversed.fill(0);
    cipher
}

/// Encrypts the VNC authentication challenge in place with `password`.
///
/// Only the first eight bytes of the password are significant; shorter
/// passwords are zero-padded.
pub fn encrypt_challenge(challenge: &mut [u8; CHALLENGE_SIZE], password: &[u8]) {
    let mut key = [0u8; 8];
    for (dst, src) in key.iter_mut().zip(password) {
        *dst = *src;
    }
    let cipher = des_cipher(&key);
    key.fill(0);
    for block in challenge.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// DES-CBC in place with the key doubling as the IV, as MS-Logon II uses it.
/// `data` must be a multiple of eight bytes.
fn encrypt_cbc(data: &mut [u8], key: &[u8; 8]) {
    let cipher = des_cipher(key);
    let mut prev = *key;
    for block in data.chunks_exact_mut(8) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) % u128::from(m)) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result = 1 % m;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

/// The client's reply to an MS-Logon II challenge.
pub struct MsLogonResponse {
    /// Client public value, big-endian.
    pub public: [u8; 8],
    /// Encrypted, zero-padded username.
    pub username: [u8; MS_LOGON_USERNAME_LEN],
    /// Encrypted, zero-padded password.
    pub password: [u8; MS_LOGON_PASSWORD_LEN],
}

/// Derives the MS-Logon II reply from the server's Diffie-Hellman values and a private exponent.
pub fn ms_logon_response(
    generator: u64,
    modulus: u64,
    server_public: u64,
    private: u64,
    username: &str,
    password: &str,
) -> Result<MsLogonResponse> {
    if modulus == 0 {
        return Err(RfbError::violation("MS-Logon modulus is zero"));
    }
    let public = pow_mod(generator, private, modulus);
    let key = pow_mod(server_public, private, modulus).to_be_bytes();

    let mut response = MsLogonResponse {
        public: public.to_be_bytes(),
        username: [0; MS_LOGON_USERNAME_LEN],
        password: [0; MS_LOGON_PASSWORD_LEN],
    };
    let user = username.as_bytes();
    let n = user.len().min(MS_LOGON_USERNAME_LEN);
    response.username[..n].copy_from_slice(&user[..n]);
    let pass = password.as_bytes();
    let n = pass.len().min(MS_LOGON_PASSWORD_LEN);
    response.password[..n].copy_from_slice(&pass[..n]);

    encrypt_cbc(&mut response.username, &key);
    encrypt_cbc(&mut response.password, &key);
    Ok(response)
}

/// VNC authentication: reads the 16-byte challenge and sends the DES response.
pub(crate) fn vnc_auth<S: Read + Write + ?Sized>(stream: &mut S, password: Option<String>) -> Result<()> {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    stream.read_exact(&mut challenge)?;

    let mut password = match password {
        Some(p) if !p.is_empty() => p.into_bytes(),
        _ => {
            warn!("no password supplied for VNC authentication");
            return Err(RfbError::AuthenticationFailed(Some("no password supplied".into())));
        }
    };
    encrypt_challenge(&mut challenge, &password);
    password.fill(0);

    stream.write_all(&challenge)?;
    stream.flush()?;
    Ok(())
}

/// Plain authentication: lengths, then username and password.
pub(crate) fn plain_auth<S: Write + ?Sized>(stream: &mut S, username: &str, password: &str) -> Result<()> {
    let mut msg = Vec::with_capacity(8 + username.len() + password.len());
    msg.write_u32::<BigEndian>(username.len() as u32)?;
    msg.write_u32::<BigEndian>(password.len() as u32)?;
    msg.extend_from_slice(username.as_bytes());
    msg.extend_from_slice(password.as_bytes());
    stream.write_all(&msg)?;
    stream.flush()?;
    msg.fill(0);
    Ok(())
}

/// MS-Logon II: read the Diffie-Hellman values, send the obfuscated credentials.
pub(crate) fn ms_logon_auth<S: Read + Write + ?Sized>(stream: &mut S, username: &str, password: &str) -> Result<()> {
    let generator = stream.read_u64::<BigEndian>()?;
    let modulus = stream.read_u64::<BigEndian>()?;
    let server_public = stream.read_u64::<BigEndian>()?;

    warn!("MS-Logon II uses very weak password encryption; use it only over a tunnel or a trusted network");

    let response = ms_logon_response(generator, modulus, server_public, rand::random(), username, password)?;
    stream.write_all(&response.public)?;
    stream.write_all(&response.username)?;
    stream.write_all(&response.password)?;
    stream.flush()?;
    Ok(())
}

/// VeNCrypt version exchange and sub-type selection. Returns the chosen sub-type.
pub(crate) fn vencrypt_negotiate<S: Read + Write + ?Sized>(stream: &mut S) -> Result<u32> {
    let major = stream.read_u8()?;
    let minor = stream.read_u8()?;
    if (major, minor) != (0, 2) {
        return Err(RfbError::UnsupportedServerCapability(format!("VeNCrypt version {major}.{minor}")));
    }
    stream.write_all(&[0, 2])?;
    stream.flush()?;
    if stream.read_u8()? != 0 {
        return Err(RfbError::UnsupportedServerCapability("server refused VeNCrypt 0.2".into()));
    }

    let count = stream.read_u8()?;
    if count == 0 {
        return Err(RfbError::UnsupportedServerCapability("server offers no VeNCrypt sub-types".into()));
    }
    let mut chosen = None;
    for _ in 0..count {
        let t = stream.read_u32::<BigEndian>()?;
        if chosen.is_none() && (VENCRYPT_TLS_NONE..=VENCRYPT_X509_PLAIN).contains(&t) {
            chosen = Some(t);
        }
    }
    let chosen = chosen
        .ok_or_else(|| RfbError::UnsupportedServerCapability("no supported VeNCrypt sub-type offered".into()))?;
    info!("selected VeNCrypt sub-type {} ({})", chosen, security_type_name(chosen));

    stream.write_u32::<BigEndian>(chosen)?;
    stream.flush()?;
    if stream.read_u8()? != 1 {
        return Err(RfbError::UnsupportedServerCapability(format!(
            "server did not accept VeNCrypt sub-type {chosen}"
        )));
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use des::cipher::BlockDecrypt;
    use std::io::{self, Cursor};

    /// Scripted duplex: reads from `input`, collects writes.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: Vec<u8>) -> Self {
            Self { input: Cursor::new(input), output: Vec::new() }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const V38: ProtocolVersion = ProtocolVersion { major: 3, minor: 8 };
    const V37: ProtocolVersion = ProtocolVersion { major: 3, minor: 7 };

    #[test]
    fn selects_first_supported_type() {
        assert_eq!(select_security_type(&[30, 16, 2, 1], false), Some(SECURITY_TYPE_VNC_AUTH));
        assert_eq!(select_security_type(&[0xfa, 2], false), Some(SECURITY_TYPE_MS_LOGON));
        assert_eq!(select_security_type(&[19, 1], false), Some(SECURITY_TYPE_VENCRYPT));
        assert_eq!(select_security_type(&[19, 18, 1], true), Some(SECURITY_TYPE_NONE));
        assert_eq!(select_security_type(&[5, 6], false), None);
    }

    #[test]
    fn challenge_response_decrypts_back() {
        let original: [u8; 16] = *b"0123456789abcdef";
        let mut challenge = original;
        encrypt_challenge(&mut challenge, b"secret-password");
        assert_ne!(challenge, original);

        let key: [u8; 8] = *b"secret-p";
        let cipher = des_cipher(&key);
        for block in challenge.chunks_exact_mut(8) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        assert_eq!(challenge, original);
    }

    #[test]
    fn challenge_blocks_are_independent() {
        // ECB: identical plaintext blocks give identical ciphertext.
        let mut challenge = [0u8; 16];
        encrypt_challenge(&mut challenge, b"password");
        assert_eq!(challenge[..8], challenge[8..]);
    }

    #[test]
    fn pow_mod_handles_large_moduli() {
        assert_eq!(pow_mod(2, 10, 1000), 24);
        assert_eq!(pow_mod(3, 0, 7), 1);
        let m = 0xFFFF_FFFF_FFFF_FFC5; // largest 64-bit prime
        assert_eq!(pow_mod(m - 1, 2, m), 1);
    }

    #[test]
    fn ms_logon_shared_key_agrees() {
        let (g, m) = (5u64, 0xFFFF_FFFF_FFFF_FFC5u64);
        let server_private = 0x1234_5678_9abc_def0;
        let server_public = pow_mod(g, server_private, m);
        let client_private = 0x0fed_cba9_8765_4321;

        let response = ms_logon_response(g, m, server_public, client_private, "alice", "pw").unwrap();
        let client_public = u64::from_be_bytes(response.public);
        let key = pow_mod(client_public, server_private, m).to_be_bytes();

        // Server side: undo CBC with the key it derived itself.
        let cipher = des_cipher(&key);
        let mut user = response.username;
        let mut prev = key;
        for block in user.chunks_exact_mut(8) {
            let saved: [u8; 8] = block.try_into().unwrap();
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            prev = saved;
        }
        assert_eq!(&user[..5], b"alice");
        assert!(user[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn ms_logon_rejects_zero_modulus() {
        assert!(ms_logon_response(2, 0, 3, 4, "a", "b").is_err());
    }

    #[test]
    fn security_result_reason_on_38() {
        let mut input = vec![0, 0, 0, 1, 0, 0, 0, 4];
        input.extend_from_slice(b"nope");
        let err = read_security_result(&mut Cursor::new(input), V38).unwrap_err();
        assert!(matches!(err, RfbError::AuthenticationFailed(Some(ref r)) if r == "nope"));

        let err = read_security_result(&mut Cursor::new(vec![0, 0, 0, 1]), V37).unwrap_err();
        assert!(matches!(err, RfbError::AuthenticationFailed(None)));

        let err = read_security_result(&mut Cursor::new(vec![0, 0, 0, 9]), V38).unwrap_err();
        assert!(matches!(err, RfbError::ProtocolViolation(_)));
    }

    #[test]
    fn huge_reason_length_with_short_body_is_a_closed_transport() {
        let mut input = 0xFFFF_FFF0u32.to_be_bytes().to_vec();
        input.extend_from_slice(b"nope");
        assert!(matches!(read_reason(&mut Cursor::new(input)), Err(RfbError::TransportClosed)));
    }

    #[test]
    fn vnc_auth_requires_password() {
        let mut s = Duplex::new(vec![0; 16]);
        assert!(matches!(vnc_auth(&mut s, None), Err(RfbError::AuthenticationFailed(_))));
        assert!(s.output.is_empty());
    }

    #[test]
    fn vnc_auth_sends_response() {
        let mut s = Duplex::new(vec![7u8; 16]);
        vnc_auth(&mut s, Some("pw".into())).unwrap();
        let mut expected = [7u8; 16];
        encrypt_challenge(&mut expected, b"pw");
        assert_eq!(s.output, expected);
    }

    #[test]
    fn plain_auth_layout() {
        let mut s = Duplex::new(Vec::new());
        plain_auth(&mut s, "bob", "hunter2").unwrap();
        let mut expected = vec![0, 0, 0, 3, 0, 0, 0, 7];
        expected.extend_from_slice(b"bobhunter2");
        assert_eq!(s.output, expected);
    }

    #[test]
    fn vencrypt_picks_first_known_subtype() {
        let mut input = vec![0, 2, 0, 3];
        for t in [30u32, 262, 257] {
            input.extend_from_slice(&t.to_be_bytes());
        }
        input.push(1);
        let mut s = Duplex::new(input);
        assert_eq!(vencrypt_negotiate(&mut s).unwrap(), VENCRYPT_X509_PLAIN);
        assert_eq!(s.output, vec![0, 2, 0, 0, 1, 6]);
    }

    #[test]
    fn vencrypt_rejects_other_versions_and_empty_lists() {
        let mut s = Duplex::new(vec![0, 1]);
        assert!(matches!(vencrypt_negotiate(&mut s), Err(RfbError::UnsupportedServerCapability(_))));
        let mut s = Duplex::new(vec![0, 2, 0, 0]);
        assert!(matches!(vencrypt_negotiate(&mut s), Err(RfbError::UnsupportedServerCapability(_))));
    }
}
