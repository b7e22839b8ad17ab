//! Byte-stream transport for one client session.
//!
//! A session starts on a raw stream and may be upgraded to TLS exactly once
//! (via `STARTTLS` during negotiation). After the upgrade every byte crosses
//! the TLS layer; the raw variant is gone.
#![deny(missing_docs)]

use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::sync::Arc;

use nix::libc;
use rustls::{ServerConfig, ServerConnection, StreamOwned};

/// Outcome of a full-frame receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// The peer closed the stream before sending any byte of the frame.
    Eof,
    /// The buffer was filled completely.
    Full,
}

/// The I/O capability a session owns for its lifetime.
pub enum Transport<S: Read + Write> {
    /// Plain byte stream, as handed to us by the acceptor.
    Raw(S),
    /// TLS-wrapped stream installed by a successful `STARTTLS`.
    Tls(Box<StreamOwned<ServerConnection, S>>),
    /// Stream has been torn down; any further I/O is an error.
    Closed,
}

fn closed() -> io::Error {
    io::Error::new(ErrorKind::NotConnected, "transport is closed")
}

impl<S: Read + Write> Transport<S> {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: S) -> Self {
        Transport::Raw(stream)
    }

    /// Whether the TLS upgrade has happened on this session.
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Receive exactly `buf.len()` bytes.
    ///
    /// Returns [`Recv::Eof`] only when the peer disconnects cleanly before
    /// the first byte. A disconnect mid-frame corrupts the stream and is
    /// reported as `EBADMSG`. Interruptions and spurious wakeups are retried.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<Recv> {
        let mut off = 0;
        while off < buf.len() {
            let r = match self {
                Transport::Raw(stream) => stream.read(&mut buf[off..]),
                Transport::Tls(stream) => stream.read(&mut buf[off..]),
                Transport::Closed => Err(closed()),
            };
            match r {
                Ok(0) => {
                    if off == 0 {
                        return Ok(Recv::Eof);
                    }
                    // Partial record read.  This is an error.
                    return Err(io::Error::from_raw_os_error(libc::EBADMSG));
                }
                Ok(n) => off += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Recv::Full)
    }

    /// Send the whole of `buf`, retrying partial writes and interruptions.
    pub fn send(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let r = match self {
                Transport::Raw(stream) => stream.write(buf),
                Transport::Tls(stream) => stream.write(buf),
                Transport::Closed => Err(closed()),
            };
            match r {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Tear the stream down, ignoring errors (there is no in-band channel to
    /// report them). Closes the underlying descriptor once.
    pub fn close(&mut self) {
        if let Transport::Tls(stream) = self {
            stream.conn.send_close_notify();
            let _ = stream.flush();
        }
        *self = Transport::Closed;
    }

    /// Perform the server side of a TLS handshake on the underlying stream
    /// and install the TLS variant in place of the raw one.
    ///
    /// On failure the transport is left closed; the session cannot continue
    /// on a half-negotiated stream.
    pub fn starttls(&mut self, config: Arc<ServerConfig>) -> io::Result<()> {
        match mem::replace(self, Transport::Closed) {
            Transport::Raw(stream) => {
                let conn = ServerConnection::new(config)
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                let mut tls = StreamOwned::new(conn, stream);
                while tls.conn.is_handshaking() {
                    tls.conn.complete_io(&mut tls.sock)?;
                }
                *self = Transport::Tls(Box::new(tls));
                Ok(())
            }
            Transport::Tls(stream) => {
                *self = Transport::Tls(stream);
                Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "connection is already using tls",
                ))
            }
            Transport::Closed => Err(closed()),
        }
    }
}
