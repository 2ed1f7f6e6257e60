//! Helpers shared by the decoders: the pixel abstraction and zlib plumbing.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use flate2::{Decompress, FlushDecompress, Status};

use crate::vnc::error::{Result, RfbError};
use crate::vnc::protocol::PixelFormat;

/// A client pixel of fixed width.
pub trait Pixel: Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// Size in bytes.
    const BYTES: usize;
    /// Size in bits, as it appears in the pixel format.
    const BITS: u8;

    /// Decodes a pixel from the first `BYTES` bytes of `bytes`.
    fn from_slice(bytes: &[u8], big_endian: bool) -> Self;

    /// Encodes the pixel into the first `BYTES` bytes of `out`.
    fn put(self, out: &mut [u8], big_endian: bool);

    /// Truncating conversion from a pixel value.
    fn from_u32(v: u32) -> Self;

    /// Widening conversion to a pixel value.
    fn to_u32(self) -> u32;

    /// Reads one pixel from a stream.
    fn read<R: Read + ?Sized>(r: &mut R, big_endian: bool) -> Result<Self> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf[..Self::BYTES])?;
        Ok(Self::from_slice(&buf, big_endian))
    }
}

impl Pixel for u8 {
    const BYTES: usize = 1;
    const BITS: u8 = 8;

    fn from_slice(bytes: &[u8], _big_endian: bool) -> Self {
        bytes[0]
    }

    fn put(self, out: &mut [u8], _big_endian: bool) {
        out[0] = self;
    }

    fn from_u32(v: u32) -> Self {
        v as u8
    }

    fn to_u32(self) -> u32 {
        u32::from(self)
    }
}

impl Pixel for u16 {
    const BYTES: usize = 2;
    const BITS: u8 = 16;

    fn from_slice(bytes: &[u8], big_endian: bool) -> Self {
        if big_endian {
            BigEndian::read_u16(bytes)
        } else {
            LittleEndian::read_u16(bytes)
        }
    }

    fn put(self, out: &mut [u8], big_endian: bool) {
        if big_endian {
            BigEndian::write_u16(out, self);
        } else {
            LittleEndian::write_u16(out, self);
        }
    }

    fn from_u32(v: u32) -> Self {
        v as u16
    }

    fn to_u32(self) -> u32 {
        u32::from(self)
    }
}

impl Pixel for u32 {
    const BYTES: usize = 4;
    const BITS: u8 = 32;

    fn from_slice(bytes: &[u8], big_endian: bool) -> Self {
        if big_endian {
            BigEndian::read_u32(bytes)
        } else {
            LittleEndian::read_u32(bytes)
        }
    }

    fn put(self, out: &mut [u8], big_endian: bool) {
        if big_endian {
            BigEndian::write_u32(out, self);
        } else {
            LittleEndian::write_u32(out, self);
        }
    }

    fn from_u32(v: u32) -> Self {
        v
    }

    fn to_u32(self) -> u32 {
        self
    }
}

/// Serializes `pixels` into `out` in the client byte order.
pub fn pixels_to_bytes<P: Pixel>(pixels: &[P], format: &PixelFormat, out: &mut Vec<u8>) {
    out.clear();
    out.resize(pixels.len() * P::BYTES, 0);
    for (p, chunk) in pixels.iter().zip(out.chunks_exact_mut(P::BYTES)) {
        p.put(chunk, format.big_endian);
    }
}

/// Rectangle payload size in bytes at the given pixel width.
pub fn rect_bytes(w: u16, h: u16, bytes_per_pixel: usize) -> usize {
    usize::from(w) * usize::from(h) * bytes_per_pixel
}

/// Reads a Tight compact length: 1 to 3 bytes carrying 7, 7 and 8 bits.
pub fn read_compact_length<R: Read + ?Sized>(r: &mut R) -> Result<usize> {
    let b0 = r.read_u8()?;
    let mut len = usize::from(b0 & 0x7F);
    if b0 & 0x80 != 0 {
        let b1 = r.read_u8()?;
        len |= usize::from(b1 & 0x7F) << 7;
        if b1 & 0x80 != 0 {
            let b2 = r.read_u8()?;
            len |= usize::from(b2) << 14;
        }
    }
    Ok(len)
}

/// Upper bound on the zlib encoding of `n` bytes, sync-flush markers included.
pub fn deflate_bound(n: usize) -> usize {
    n + n / 8 + 1024
}

/// Reads a u32 length prefix and then that many bytes into `buf`.
///
/// A length above `max` is rejected before anything is read.
pub fn read_length_prefixed<R: Read + ?Sized>(r: &mut R, buf: &mut Vec<u8>, max: usize) -> Result<usize> {
    let len = r.read_u32::<BigEndian>()? as usize;
    if len > max {
        return Err(RfbError::violation(format!("compressed payload of {len} bytes (max {max})")));
    }
    read_into(r, buf, len)?;
    Ok(len)
}

/// Reads exactly `len` bytes into `buf`, replacing its contents.
///
/// The buffer grows with the data that actually arrives, never ahead of it.
pub fn read_into<R: Read + ?Sized>(r: &mut R, buf: &mut Vec<u8>, len: usize) -> Result<()> {
    buf.clear();
    let got = (&mut *r).take(len as u64).read_to_end(buf)?;
    if got < len {
        return Err(RfbError::TransportClosed);
    }
    Ok(())
}

fn progress(stream: &Decompress, before_in: u64, before_out: u64) -> (usize, usize) {
    ((stream.total_in() - before_in) as usize, (stream.total_out() - before_out) as usize)
}

/// Inflates `input` through a persistent stream into exactly `expected` bytes of `out`.
pub fn inflate_exact(stream: &mut Decompress, input: &[u8], out: &mut Vec<u8>, expected: usize) -> Result<()> {
    out.clear();
    out.resize(expected, 0);
    let mut consumed = 0;
    let mut filled = 0;
    while filled < expected {
        let (bi, bo) = (stream.total_in(), stream.total_out());
        let status = stream.decompress(&input[consumed..], &mut out[filled..], FlushDecompress::Sync)?;
        let (read, written) = progress(stream, bi, bo);
        consumed += read;
        filled += written;
        if filled < expected && (status == Status::StreamEnd || (read == 0 && written == 0)) {
            return Err(RfbError::violation(format!(
                "compressed data ended after {filled} of {expected} bytes"
            )));
        }
    }
    // Let the stream swallow trailing blocks that carry no output, such as the sync-flush marker.
    if consumed < input.len() {
        let mut spare = [0u8; 1];
        let (bi, bo) = (stream.total_in(), stream.total_out());
        stream.decompress(&input[consumed..], &mut spare, FlushDecompress::Sync)?;
        let (read, written) = progress(stream, bi, bo);
        consumed += read;
        if written > 0 || consumed < input.len() {
            return Err(RfbError::violation(format!("compressed data exceeds the expected {expected} bytes")));
        }
    }
    Ok(())
}

/// Inflates all of `input` through a persistent stream, allowing at most `limit` output bytes.
pub fn inflate_all(stream: &mut Decompress, input: &[u8], out: &mut Vec<u8>, limit: usize) -> Result<()> {
    out.clear();
    let mut consumed = 0;
    loop {
        if out.len() == out.capacity() {
            if out.len() >= limit {
                return Err(RfbError::violation(format!("decompressed data exceeds {limit} bytes")));
            }
            out.reserve((limit - out.len()).min(input.len().max(1024) * 4));
        }
        let (bi, bo) = (stream.total_in(), stream.total_out());
        stream.decompress_vec(&input[consumed..], out, FlushDecompress::Sync)?;
        let (read, written) = progress(stream, bi, bo);
        consumed += read;
        if consumed >= input.len() && out.len() < out.capacity() {
            break;
        }
        if read == 0 && written == 0 && out.len() < out.capacity() {
            return Err(RfbError::violation("inflate made no progress"));
        }
    }
    if out.len() > limit {
        return Err(RfbError::violation(format!("decompressed data exceeds {limit} bytes")));
    }
    Ok(())
}
