//! Buffered byte transport shared by every protocol layer.
//!
//! [`RfbStream`] owns the socket (or the TLS channel wrapped around it) and a
//! read-ahead buffer. It implements [`Read`] so decoders can pull big-endian
//! fields with `byteorder::ReadBytesExt`, and it turns stalls into
//! [`RfbError::TransportTimeout`] once the configured deadline passes.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, trace};

use super::error::{Result, RfbError};
use super::protocol::ClientMessage;
use super::tls::TlsChannel;

/// Size of the read-ahead buffer.
pub const READ_BUFFER_SIZE: usize = 8192;

/// A byte transport the engine can run over.
///
/// Connection establishment is the caller's job; the engine only needs a
/// readable/writable stream and a way to wait for incoming data.
pub trait Transport: Read + Write {
    /// Waits up to `timeout` for incoming data. Returns `Ok(true)` when a read
    /// would make progress (including end of stream).
    fn wait_for_data(&mut self, timeout: Duration) -> io::Result<bool>;
}

impl Transport for TcpStream {
    fn wait_for_data(&mut self, timeout: Duration) -> io::Result<bool> {
        let previous = self.read_timeout()?;
        // A zero timeout is rejected by the OS.
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut peeked = [0u8; 1];
        let ready = match self.peek(&mut peeked) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(e),
        };
        self.set_read_timeout(previous)?;
        ready
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn wait_for_data(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_for_data(timeout)
    }
}

enum Channel<S: Transport> {
    Plain(S),
    Tls(Box<TlsChannel<S>>),
    /// Transient state while the socket is being handed to the TLS layer.
    Detached,
}

impl<S: Transport> Channel<S> {
    fn transport(&mut self) -> io::Result<&mut dyn Transport> {
        match self {
            Channel::Plain(s) => Ok(s),
            Channel::Tls(t) => Ok(t.as_mut()),
            Channel::Detached => Err(io::Error::new(io::ErrorKind::NotConnected, "transport detached")),
        }
    }
}

/// Buffered, deadline-aware RFB byte stream.
pub struct RfbStream<S: Transport> {
    channel: Channel<S>,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    read_timeout: Option<Duration>,
    poll_interval: Duration,
    scratch: BytesMut,
}

impl<S: Transport> RfbStream<S> {
    /// Wraps `transport`. `read_timeout` of `None` waits forever.
    pub fn new(transport: S, read_timeout: Option<Duration>, poll_interval: Duration) -> Self {
        Self {
            channel: Channel::Plain(transport),
            buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            read_timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            scratch: BytesMut::with_capacity(64),
        }
    }

    /// True once the channel has been upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.channel, Channel::Tls(_))
    }

    /// Number of bytes already buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Waits up to `timeout` for data. Buffered bytes count as available.
    pub fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        if self.start < self.end {
            return Ok(true);
        }
        Ok(self.channel.transport()?.wait_for_data(timeout)?)
    }

    /// Reads exactly `out.len()` bytes.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        Ok(self.read_exact(out)?)
    }

    /// Reads `len` bytes into a fresh vector.
    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Discards `len` bytes.
    pub fn skip(&mut self, mut len: usize) -> Result<()> {
        while len > 0 {
            if self.start == self.end {
                self.fill()?;
            }
            let n = len.min(self.end - self.start);
            self.start += n;
            len -= n;
        }
        Ok(())
    }

    /// Writes all of `data`, retrying while the transport would block.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data)?;
        self.flush()?;
        Ok(())
    }

    /// Serializes and sends one client message.
    pub fn send(&mut self, msg: &ClientMessage<'_>) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        msg.write_to(&mut scratch);
        let result = self.write_bytes(&scratch);
        self.scratch = scratch;
        result
    }

    /// Hands the plain socket to `handshake` and continues over the TLS channel it returns.
    pub(crate) fn start_tls<F>(&mut self, handshake: F) -> Result<()>
    where
        F: FnOnce(S) -> Result<TlsChannel<S>>,
    {
        if self.start != self.end {
            return Err(RfbError::violation("server sent data before the TLS handshake"));
        }
        let plain = match std::mem::replace(&mut self.channel, Channel::Detached) {
            Channel::Plain(s) => s,
            other => {
                self.channel = other;
                return Err(RfbError::violation("TLS requested twice on one connection"));
            }
        };
        self.channel = Channel::Tls(Box::new(handshake(plain)?));
        debug!("transport upgraded to TLS");
        Ok(())
    }

    /// Refills the read-ahead buffer with at least one byte.
    fn fill(&mut self) -> io::Result<()> {
        self.start = 0;
        self.end = 0;
        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        let poll = self.poll_interval;
        let transport = self.channel.transport()?;
        loop {
            let stalled = match transport.wait_for_data(poll) {
                Ok(true) => match transport.read(&mut self.buf) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => {
                        trace!("read {} bytes from transport", n);
                        self.end = n;
                        return Ok(());
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => true,
                    Err(e) => return Err(e),
                },
                Ok(false) => true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
                Err(e) => return Err(e),
            };
            if stalled && deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(io::ErrorKind::TimedOut.into());
            }
        }
    }
}

impl<S: Transport> Read for RfbStream<S> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.start == self.end {
            self.fill()?;
        }
        let n = out.len().min(self.end - self.start);
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }
}

impl<S: Transport> Write for RfbStream<S> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        let poll = self.poll_interval;
        let transport = self.channel.transport()?;
        loop {
            match transport.write(data) {
                Ok(0) if !data.is_empty() => return Err(io::ErrorKind::BrokenPipe.into()),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.transport()?.flush()
    }
}
