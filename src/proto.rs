//! NBD protocol constants and struct definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![deny(missing_docs)]
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use std::error::Error;
use std::fmt;
use std::io::prelude::*;

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use nix::libc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Port NBD servers conventionally listen on.
pub const DEFAULT_PORT: u16 = 10809;

/// Initial handshake magic, b"NBDMAGIC".
pub const MAGIC: u64 = 0x4e42444d41474943;
/// Version tag for the old-style handshake.
pub const OLD_VERSION: u64 = 0x0000420281861253;
/// Version tag for the new-style handshake, b"IHAVEOPT".
pub const IHAVEOPT: u64 = 0x49484156454F5054;
/// Magic prefixing every reply in the option phase.
pub const REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
/// Magic prefixing every transmission-phase request.
pub const REQUEST_MAGIC: u32 = 0x25609513;
/// Magic prefixing every transmission-phase reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// Size of a transmission-phase request frame on the wire.
pub const REQUEST_SIZE: usize = 28;

/// Largest read or write request the server will handle.
pub const MAX_REQUEST_SIZE: u32 = 64 * 1024 * 1024;
/// Maximum number of client options accepted before giving up.
pub const MAX_NR_OPTIONS: usize = 32;
/// Maximum length of any option payload (bytes).
pub const MAX_OPTION_LENGTH: u32 = 4096;

/// An unrecoverable violation of the wire protocol by the peer.
#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    /// Create a `ProtocolError` from a description of the violation.
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
  /// Global flags the server advertises in the new-style greeting.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct HandshakeFlags: u16 {
    /// Server understands the fixed new-style option phase.
    const FIXED_NEWSTYLE = 1 << 0;
    /// Server can omit the 124 zero bytes after the export info.
    const NO_ZEROES = 1 << 1;
  }

  /// Flags word the client sends back after the greeting.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct ClientHandshakeFlags: u32 {
    /// Client wants the fixed new-style option phase.
    const C_FIXED_NEWSTYLE = 1 << 0;
    /// Client asks the server to omit the trailing zero padding.
    const C_NO_ZEROES = 1 << 1;
  }

  /// Per-export transmission flags sent at the end of negotiation.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct TransmitFlags: u16 {
    /// Always set; the flags word is meaningful.
    const HAS_FLAGS = 1 << 0;
    /// Export does not accept writes.
    const READ_ONLY = 1 << 1;
    /// Export supports `Cmd::FLUSH`.
    const SEND_FLUSH = 1 << 2;
    /// Export supports the FUA command flag.
    const SEND_FUA = 1 << 3;
    /// Export is backed by spinning rust.
    const ROTATIONAL = 1 << 4;
    /// Export supports `Cmd::TRIM`.
    const SEND_TRIM = 1 << 5;
    /// Export supports `Cmd::WRITE_ZEROES`.
    const SEND_WRITE_ZEROES = 1 << 6;
  }

  /// Flags modifying a single transmission-phase command.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct CmdFlags: u16 {
    /// Force unit access: commit to stable storage before replying.
    const FUA = 1 << 0;
    /// With `WRITE_ZEROES`, write literal zeroes rather than punching a hole.
    const NO_HOLE = 1 << 1;
  }
}

/// Option codes a client may send during the new-style option phase.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    /// Select an export by name and end negotiation.
    EXPORT_NAME = 1,
    /// Abandon negotiation; the server will close the connection.
    ABORT = 2,
    /// List the exports this server offers.
    LIST = 3,
    /// Upgrade the connection to TLS before continuing.
    STARTTLS = 5,
}

/// Reply codes for the option phase.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    /// Option processed successfully.
    ACK = 1,
    /// One export description follows (reply to `LIST`).
    SERVER = 2,
    /// Option not known to this server.
    ERR_UNSUP = (1 << 31) + 1,
    /// Option forbidden by server policy.
    ERR_POLICY = (1 << 31) + 2,
    /// Option was syntactically invalid.
    ERR_INVALID = (1 << 31) + 3,
    /// Server requires TLS before this option is acceptable.
    ERR_TLS_REQD = (1 << 31) + 5,
}

/// A single client option frame.
#[derive(Debug, Clone)]
pub struct Opt {
    /// Option code.
    pub typ: OptType,
    /// Option payload (interpretation depends on `typ`).
    pub data: Vec<u8>,
}

impl Opt {
    /// Read an option frame sent by a client.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT')
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!(ProtocolError::new(format!(
                "unexpected option magic {magic}"
            )));
        }
        let option = stream.read_u32::<BE>()?;
        let typ = OptType::try_from(option)
            .map_err(|_| ProtocolError::new(format!("unexpected option {option}")))?;
        let option_len = stream.read_u32::<BE>()?;
        ensure!(
            option_len <= MAX_OPTION_LENGTH,
            ProtocolError::new(format!("option length {option_len} is too large"))
        );
        let mut data = vec![0u8; option_len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self { typ, data })
    }

    /// Send this option frame to a server.
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.typ.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// A server reply to one option.
#[derive(Debug, Clone)]
#[must_use]
pub struct OptReply {
    /// The option code this reply answers (echoed even for unknown options).
    pub option: u32,
    /// Outcome of the option.
    pub reply_type: ReplyType,
    /// Reply payload, e.g. an export description for `SERVER`.
    pub data: Vec<u8>,
}

impl OptReply {
    /// Build a bare `ACK` for `option`.
    pub fn ack(option: u32) -> Self {
        Self {
            option,
            reply_type: ReplyType::ACK,
            data: vec![],
        }
    }

    /// Build a reply with an explicit type and payload.
    pub fn new(option: u32, reply_type: ReplyType, data: Vec<u8>) -> Self {
        Self {
            option,
            reply_type,
            data,
        }
    }

    /// Serialize this reply.
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply
        // S: any data as required by the reply
        stream.write_u64::<BE>(REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.option)?;
        stream.write_u32::<BE>(self.reply_type.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }

    /// Read a reply frame sent by a server.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        if magic != REPLY_MAGIC {
            bail!(ProtocolError::new(format!(
                "unexpected option reply magic {magic}"
            )));
        }
        let option = stream.read_u32::<BE>()?;
        let reply = stream.read_u32::<BE>()?;
        let reply_type = ReplyType::try_from(reply)
            .map_err(|_| ProtocolError::new(format!("unexpected option reply {reply}")))?;
        let reply_len = stream.read_u32::<BE>()?;
        ensure!(
            reply_len <= MAX_OPTION_LENGTH,
            ProtocolError::new(format!("option reply length {reply_len} is too large"))
        );
        let mut data = vec![0u8; reply_len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self {
            option,
            reply_type,
            data,
        })
    }
}

// -------------------
// Transmission phase
// -------------------

/// Transmission-phase commands.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    /// Read `len` bytes at `offset`.
    READ = 0,
    /// Write `len` bytes at `offset`.
    WRITE = 1,
    /// Disconnect cleanly (NBD_CMD_DISC); no reply is sent.
    DISCONNECT = 2,
    /// Commit outstanding writes to stable storage.
    FLUSH = 3,
    /// Hint that a range may be discarded.
    TRIM = 4,
    /// Zero a range without transferring data.
    WRITE_ZEROES = 6,
}

/// A transmission-phase request.
#[derive(Debug)]
pub struct Request {
    /// Command modifier flags.
    pub flags: CmdFlags,
    /// The command to execute.
    pub typ: Cmd,
    /// Opaque cookie echoed back in the reply.
    pub handle: u64,
    /// Byte offset into the export.
    pub offset: u64,
    /// Byte count (payload length for `WRITE`, data length for `READ`).
    pub len: u32,
}

impl Request {
    /// Create a request with a fresh random handle and no flags.
    pub fn new(typ: Cmd, offset: u64, len: u32) -> Self {
        Self::with_flags(typ, CmdFlags::empty(), offset, len)
    }

    /// Create a request with explicit command flags.
    pub fn with_flags(typ: Cmd, flags: CmdFlags, offset: u64, len: u32) -> Self {
        Self {
            flags,
            typ,
            handle: rand::random(),
            offset,
            len,
        }
    }

    /// Send this request, followed by `data` as the payload for `WRITE`.
    pub fn put<IO: Write>(&self, data: &[u8], mut stream: IO) -> Result<()> {
        // C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, handle
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned)
        // C: (length bytes of data if the request is of type NBD_CMD_WRITE)
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.len)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }
}

/// The restricted error set a reply may carry.
///
/// Host error codes outside this set are collapsed by [`ErrorType::from_errno`]
/// before transmission.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    /// Command succeeded.
    OK = 0,
    /// Operation not permitted (also covers read-only violations).
    EPERM = 1,
    /// Input/output error.
    EIO = 5,
    /// Cannot allocate memory (also covers over-large requests).
    ENOMEM = 12,
    /// Invalid argument.
    EINVAL = 22,
    /// No space left on device.
    ENOSPC = 28,
    /// Server is shutting down.
    ESHUTDOWN = 108,
}

impl ErrorType {
    /// Collapse a host errno into the restricted wire error set.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            0 => Self::OK,
            libc::EROFS | libc::EPERM => Self::EPERM,
            libc::EIO => Self::EIO,
            libc::ENOMEM => Self::ENOMEM,
            libc::EDQUOT | libc::EFBIG | libc::ENOSPC => Self::ENOSPC,
            libc::ESHUTDOWN => Self::ESHUTDOWN,
            _ => Self::EINVAL,
        }
    }
}

/// A transmission-phase reply header. For a successful `READ` the server
/// sends the data payload immediately after this header.
#[derive(Debug)]
#[must_use]
pub struct SimpleReply {
    /// Wire error code for the request.
    pub err: ErrorType,
    /// Handle echoed from the request.
    pub handle: u64,
}

impl SimpleReply {
    /// Build a success reply for `req`.
    pub fn ok(req: &Request) -> Self {
        SimpleReply {
            err: ErrorType::OK,
            handle: req.handle,
        }
    }

    /// Build an error reply for `req`.
    pub fn err(err: ErrorType, req: &Request) -> Self {
        SimpleReply {
            err,
            handle: req.handle,
        }
    }

    /// Serialize this reply header.
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.err.into())?;
        stream.write_u64::<BE>(self.handle)?;
        Ok(())
    }

    /// Read a reply header; on success with a non-empty `buf`, also read the
    /// data payload into `buf`.
    pub fn get<IO: Read>(mut stream: IO, buf: &mut [u8]) -> Result<Self> {
        let magic = stream.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            bail!(ProtocolError::new(format!("wrong reply magic {magic}")));
        }
        let err = stream.read_u32::<BE>()?;
        let err = ErrorType::try_from(err)
            .map_err(|_| ProtocolError::new(format!("unexpected error code {err}")))?;
        let handle = stream.read_u64::<BE>()?;
        if err == ErrorType::OK && !buf.is_empty() {
            stream.read_exact(buf)?;
        }
        Ok(SimpleReply { err, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_collapses_to_wire_set() {
        assert_eq!(ErrorType::from_errno(0), ErrorType::OK);
        assert_eq!(ErrorType::from_errno(libc::EPERM), ErrorType::EPERM);
        assert_eq!(ErrorType::from_errno(libc::EROFS), ErrorType::EPERM);
        assert_eq!(ErrorType::from_errno(libc::EIO), ErrorType::EIO);
        assert_eq!(ErrorType::from_errno(libc::ENOMEM), ErrorType::ENOMEM);
        assert_eq!(ErrorType::from_errno(libc::EDQUOT), ErrorType::ENOSPC);
        assert_eq!(ErrorType::from_errno(libc::EFBIG), ErrorType::ENOSPC);
        assert_eq!(ErrorType::from_errno(libc::ENOSPC), ErrorType::ENOSPC);
        assert_eq!(ErrorType::from_errno(libc::ESHUTDOWN), ErrorType::ESHUTDOWN);
        assert_eq!(ErrorType::from_errno(libc::EINVAL), ErrorType::EINVAL);
        // everything else collapses to EINVAL
        assert_eq!(ErrorType::from_errno(libc::ENOENT), ErrorType::EINVAL);
        assert_eq!(ErrorType::from_errno(libc::EBADF), ErrorType::EINVAL);
    }

    #[test]
    fn opt_round_trip() {
        let opt = Opt {
            typ: OptType::EXPORT_NAME,
            data: b"default".to_vec(),
        };
        let mut buf = vec![];
        opt.put(&mut buf).unwrap();
        assert_eq!(buf.len(), 16 + 7);
        let parsed = Opt::get(&buf[..]).unwrap();
        assert_eq!(parsed.typ, OptType::EXPORT_NAME);
        assert_eq!(parsed.data, b"default");
    }

    #[test]
    fn opt_reply_round_trip() {
        let reply = OptReply::new(OptType::LIST.into(), ReplyType::SERVER, b"disk".to_vec());
        let mut buf = vec![];
        reply.put(&mut buf).unwrap();
        let parsed = OptReply::get(&buf[..]).unwrap();
        assert_eq!(parsed.option, u32::from(OptType::LIST));
        assert_eq!(parsed.reply_type, ReplyType::SERVER);
        assert_eq!(parsed.data, b"disk");
    }

    #[test]
    fn oversized_option_rejected() {
        let mut buf = vec![];
        buf.write_u64::<BE>(IHAVEOPT).unwrap();
        buf.write_u32::<BE>(OptType::LIST.into()).unwrap();
        buf.write_u32::<BE>(MAX_OPTION_LENGTH + 1).unwrap();
        assert!(Opt::get(&buf[..]).is_err());
    }

    #[test]
    fn request_wire_layout() {
        let req = Request {
            flags: CmdFlags::FUA,
            typ: Cmd::WRITE,
            handle: 0x1122334455667788,
            offset: 4096,
            len: 4,
        };
        let mut buf = vec![];
        req.put(&[0xde, 0xad, 0xbe, 0xef], &mut buf).unwrap();
        assert_eq!(buf.len(), REQUEST_SIZE + 4);
        assert_eq!(&buf[..4], 0x25609513u32.to_be_bytes());
        assert_eq!(&buf[4..6], [0, 1]); // flags
        assert_eq!(&buf[6..8], [0, 1]); // type
        assert_eq!(&buf[8..16], 0x1122334455667788u64.to_be_bytes());
        assert_eq!(&buf[24..28], [0, 0, 0, 4]);
        assert_eq!(&buf[28..], [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn reply_round_trip() {
        let req = Request::new(Cmd::READ, 0, 4);
        let mut buf = vec![];
        SimpleReply::err(ErrorType::EIO, &req).put(&mut buf).unwrap();
        let parsed = SimpleReply::get(&buf[..], &mut []).unwrap();
        assert_eq!(parsed.err, ErrorType::EIO);
        assert_eq!(parsed.handle, req.handle);
    }
}
