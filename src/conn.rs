//! One client connection: handshake negotiation and the request loop.
//!
//! A [`Connection`] owns the transport and the backend handle for the
//! lifetime of a session. Control flow is strictly sequential: negotiate
//! the handshake (either dialect, possibly upgrading to TLS along the way),
//! then answer one request at a time until the client disconnects, the
//! stream breaks, or the server shuts down.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;

use crate::backend::Backend;
use crate::diag;
use crate::proto::*;
use crate::server::Server;
use crate::tls::TlsPolicy;
use crate::transport::{Recv, Transport};

/// Outcome of one request-loop iteration.
enum Status {
    /// A request was answered; keep going.
    Processed,
    /// The client went away (DISC or clean EOF); leave the loop.
    Disconnect,
}

/// Per-connection session state.
///
/// Export size and capability flags are populated during the handshake and
/// frozen afterwards.
pub(crate) struct Connection<'a, B: Backend, S: Read + Write> {
    server: &'a Server<B>,
    transport: Transport<S>,
    handle: B::Handle,
    request_lock: Arc<Mutex<()>>,
    exportsize: u64,
    readonly: bool,
    can_flush: bool,
    can_trim: bool,
}

fn valid_range(exportsize: u64, offset: u64, count: u32) -> bool {
    count > 0
        && offset <= exportsize
        && offset
            .checked_add(count as u64)
            .is_some_and(|end| end <= exportsize)
}

impl<'a, B: Backend, S: Read + Write> Connection<'a, B, S> {
    pub(crate) fn new(server: &'a Server<B>, handle: B::Handle, stream: S) -> Self {
        Self {
            server,
            transport: Transport::new(stream),
            handle,
            request_lock: Arc::new(Mutex::new(())),
            exportsize: 0,
            readonly: false,
            can_flush: false,
            can_trim: false,
        }
    }

    /// Run the session to completion: handshake, then the request loop.
    ///
    /// Returns `Ok(())` on a graceful disconnect (DISC command or clean EOF
    /// between requests) and an error for anything that corrupts the stream.
    pub(crate) fn serve(&mut self) -> Result<()> {
        self.negotiate_handshake().wrap_err("handshake failed")?;
        while !self.server.quit() {
            match self.recv_request_send_reply()? {
                Status::Disconnect => break,
                Status::Processed => {}
            }
        }
        Ok(())
    }

    // ----------------
    // Handshake
    // ----------------

    fn negotiate_handshake(&mut self) -> Result<()> {
        // Serialize against any late backend activity on this session.
        let lock = Arc::clone(&self.request_lock);
        let _guard = lock.lock().unwrap();
        if self.server.newstyle {
            self.negotiate_newstyle()
        } else {
            self.negotiate_oldstyle()
        }
    }

    fn negotiate_oldstyle(&mut self) -> Result<()> {
        // An old-style handshake has no way to negotiate TLS.
        if self.server.tls == TlsPolicy::Required {
            bail!("rejecting client: tls is required but the old-style handshake cannot negotiate it");
        }

        let eflags = self.export_params()?;
        debug!(
            target: "nbd",
            "oldstyle negotiation: flags: global 0x0 export {:#x}",
            eflags.bits()
        );

        let mut handshake = Vec::with_capacity(152);
        handshake.write_u64::<BE>(MAGIC)?;
        handshake.write_u64::<BE>(OLD_VERSION)?;
        handshake.write_u64::<BE>(self.exportsize)?;
        handshake.write_u16::<BE>(0)?; // global flags
        handshake.write_u16::<BE>(eflags.bits())?;
        handshake.resize(152, 0);
        self.transport
            .send(&handshake)
            .wrap_err("writing oldstyle handshake")?;
        Ok(())
    }

    fn negotiate_newstyle(&mut self) -> Result<()> {
        let gflags = HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES;
        debug!(target: "nbd", "newstyle negotiation: flags: global {:#x}", gflags.bits());

        let mut greeting = Vec::with_capacity(18);
        greeting.write_u64::<BE>(MAGIC)?;
        greeting.write_u64::<BE>(IHAVEOPT)?;
        greeting.write_u16::<BE>(gflags.bits())?;
        self.transport
            .send(&greeting)
            .wrap_err("writing newstyle greeting")?;

        // The client answers with its own 32 bit flags word, which may not
        // contain anything we did not advertise.
        let mut word = [0u8; 4];
        if self.transport.recv(&mut word).wrap_err("reading client flags")? == Recv::Eof {
            bail!(ProtocolError::new(
                "client closed connection before sending flags"
            ));
        }
        let raw_cflags = u32::from_be_bytes(word);
        debug!(target: "nbd", "newstyle negotiation: client flags: {raw_cflags:#x}");
        let Some(cflags) = ClientHandshakeFlags::from_bits(raw_cflags) else {
            bail!(ProtocolError::new(format!(
                "client requested unknown flags {raw_cflags:#x}"
            )));
        };

        self.negotiate_newstyle_options()?;

        if self.server.tls == TlsPolicy::Required && !self.transport.is_tls() {
            bail!("rejecting client: tls is required but the client did not upgrade");
        }

        let eflags = self.export_params()?;
        debug!(target: "nbd", "newstyle negotiation: flags: export {:#x}", eflags.bits());

        let mut finish = Vec::with_capacity(134);
        finish.write_u64::<BE>(self.exportsize)?;
        finish.write_u16::<BE>(eflags.bits())?;
        if !cflags.contains(ClientHandshakeFlags::C_NO_ZEROES) {
            finish.extend_from_slice(&[0u8; 124]);
        }
        self.transport
            .send(&finish)
            .wrap_err("writing handshake finish")?;
        Ok(())
    }

    fn negotiate_newstyle_options(&mut self) -> Result<()> {
        for _ in 0..MAX_NR_OPTIONS {
            let mut header = [0u8; 16];
            if self.transport.recv(&mut header).wrap_err("reading option")? == Recv::Eof {
                bail!(ProtocolError::new(
                    "client closed connection during option negotiation"
                ));
            }
            let mut r = &header[..];
            let version = r.read_u64::<BE>()?;
            if version != IHAVEOPT {
                bail!(ProtocolError::new(format!(
                    "unknown option version {version:#x}, expecting {IHAVEOPT:#x}"
                )));
            }
            let option = r.read_u32::<BE>()?;
            let optlen = r.read_u32::<BE>()?;
            if optlen > MAX_OPTION_LENGTH {
                bail!(ProtocolError::new(format!(
                    "client option data too long ({optlen})"
                )));
            }

            // Until the upgrade happens in require mode, the only
            // acceptable options are ABORT and STARTTLS.
            if self.server.tls == TlsPolicy::Required
                && !self.transport.is_tls()
                && OptType::try_from(option)
                    .map_or(true, |o| o != OptType::ABORT && o != OptType::STARTTLS)
            {
                self.send_option_reply(option, ReplyType::ERR_TLS_REQD)?;
                continue;
            }

            match OptType::try_from(option) {
                Ok(OptType::EXPORT_NAME) => {
                    let name = self.recv_option_data(optlen)?;
                    debug!(
                        target: "nbd",
                        "newstyle negotiation: client requested export {:?} (ignored)",
                        String::from_utf8_lossy(&name)
                    );
                    // EXPORT_NAME ends option negotiation
                    return Ok(());
                }
                Ok(OptType::ABORT) => {
                    self.send_option_reply(option, ReplyType::ACK)?;
                    bail!("client sent ABORT to end the connection");
                }
                Ok(OptType::LIST) => {
                    if optlen != 0 {
                        self.send_option_reply(option, ReplyType::ERR_INVALID)?;
                        self.recv_option_data(optlen)?;
                        continue;
                    }
                    debug!(
                        target: "nbd",
                        "newstyle negotiation: advertising export {:?}",
                        self.server.export_name
                    );
                    self.send_option_reply_server(option)?;
                    self.send_option_reply(option, ReplyType::ACK)?;
                }
                Ok(OptType::STARTTLS) => {
                    if optlen != 0 {
                        self.send_option_reply(option, ReplyType::ERR_INVALID)?;
                        self.recv_option_data(optlen)?;
                        continue;
                    }
                    self.negotiate_starttls(option)?;
                }
                Err(_) => {
                    self.send_option_reply(option, ReplyType::ERR_UNSUP)?;
                    self.recv_option_data(optlen)?;
                }
            }
        }
        bail!(ProtocolError::new(format!(
            "client exceeded maximum number of options ({MAX_NR_OPTIONS})"
        )))
    }

    fn negotiate_starttls(&mut self, option: u32) -> Result<()> {
        let config = match (self.server.tls, &self.server.tls_config) {
            (TlsPolicy::Off, _) | (_, None) => {
                return self.send_option_reply(option, ReplyType::ERR_POLICY);
            }
            (_, Some(config)) => Arc::clone(config),
        };
        if self.transport.is_tls() {
            // can't upgrade to TLS twice on the same connection
            return self.send_option_reply(option, ReplyType::ERR_INVALID);
        }
        // the reply goes out in the clear, before the handshake starts
        self.send_option_reply(option, ReplyType::ACK)?;
        self.transport
            .starttls(config)
            .wrap_err("tls handshake failed")?;
        debug!(target: "nbd", "using TLS on this connection");
        Ok(())
    }

    fn send_option_reply(&mut self, option: u32, reply: ReplyType) -> Result<()> {
        let mut msg = Vec::with_capacity(20);
        OptReply::new(option, reply, vec![]).put(&mut msg)?;
        self.transport.send(&msg).wrap_err("writing option reply")?;
        Ok(())
    }

    fn send_option_reply_server(&mut self, option: u32) -> Result<()> {
        let name = self.server.export_name.as_bytes();
        let mut payload = Vec::with_capacity(4 + name.len());
        payload.write_u32::<BE>(name.len() as u32)?;
        payload.extend_from_slice(name);
        let mut msg = Vec::new();
        OptReply::new(option, ReplyType::SERVER, payload).put(&mut msg)?;
        self.transport.send(&msg).wrap_err("writing option reply")?;
        Ok(())
    }

    fn recv_option_data(&mut self, optlen: u32) -> Result<Vec<u8>> {
        let mut data = vec![0u8; optlen as usize];
        if self
            .transport
            .recv(&mut data)
            .wrap_err("reading option data")?
            == Recv::Eof
        {
            bail!(ProtocolError::new(
                "client closed connection during option negotiation"
            ));
        }
        Ok(data)
    }

    /// Query the backend for the export size and capabilities, fixing this
    /// session's view of them for the rest of its lifetime.
    fn export_params(&mut self) -> Result<TransmitFlags> {
        let server = self.server;
        self.exportsize = server
            .backend
            .get_size(&mut self.handle)
            .wrap_err("backend refused to report a size")?;

        let mut eflags = TransmitFlags::HAS_FLAGS;

        let can_write = server.backend.can_write(&mut self.handle)?;
        if server.readonly || !can_write {
            eflags |= TransmitFlags::READ_ONLY;
            self.readonly = true;
        }
        if !self.readonly {
            eflags |= TransmitFlags::SEND_WRITE_ZEROES;
        }
        if server.backend.can_flush(&mut self.handle)? {
            eflags |= TransmitFlags::SEND_FLUSH | TransmitFlags::SEND_FUA;
            self.can_flush = true;
        }
        if server.backend.is_rotational(&mut self.handle)? {
            eflags |= TransmitFlags::ROTATIONAL;
        }
        if server.backend.can_trim(&mut self.handle)? {
            eflags |= TransmitFlags::SEND_TRIM;
            self.can_trim = true;
        }
        Ok(eflags)
    }

    // ----------------
    // Request loop
    // ----------------

    fn recv_request_send_reply(&mut self) -> Result<Status> {
        let mut header = [0u8; REQUEST_SIZE];
        match self.transport.recv(&mut header).wrap_err("reading request")? {
            Recv::Eof => {
                debug!(target: "nbd", "client closed input socket, closing connection");
                return Ok(Status::Disconnect);
            }
            Recv::Full => {}
        }

        let mut r = &header[..];
        let magic = r.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError::new(format!(
                "wrong request magic {magic:#x}"
            )));
        }
        let raw_flags = r.read_u16::<BE>()?;
        let raw_cmd = r.read_u16::<BE>()?;
        let handle = r.read_u64::<BE>()?;
        let offset = r.read_u64::<BE>()?;
        let count = r.read_u32::<BE>()?;

        let cmd = Cmd::try_from(raw_cmd).ok();
        if cmd == Some(Cmd::DISCONNECT) {
            debug!(target: "nbd", "client sent disconnect command, closing connection");
            return Ok(Status::Disconnect);
        }
        debug!(
            target: "nbd",
            "request {cmd:?} flags {raw_flags:#x} offset {offset} count {count}"
        );

        let validated = match cmd {
            Some(cmd) => self
                .validate_request(cmd, raw_flags, offset, count)
                .map(|flags| (cmd, flags)),
            None => {
                warn!(target: "nbd", "invalid request: unknown command ({raw_cmd})");
                Err(libc::EINVAL)
            }
        };
        let (cmd, flags) = match validated {
            Ok(ok) => ok,
            Err(errno) => {
                // keep the stream aligned for the next request
                if cmd == Some(Cmd::WRITE) {
                    self.skip_over_write_buffer(count)?;
                }
                self.send_reply(handle, errno, &[])?;
                return Ok(Status::Processed);
            }
        };

        // Data buffer for reads and writes, scoped to this iteration.
        let mut buf: Vec<u8> = Vec::new();
        if cmd == Cmd::READ || cmd == Cmd::WRITE {
            if buf.try_reserve_exact(count as usize).is_err() {
                warn!(target: "nbd", "cannot allocate a {count} byte request buffer");
                if cmd == Cmd::WRITE {
                    self.skip_over_write_buffer(count)?;
                }
                self.send_reply(handle, libc::ENOMEM, &[])?;
                return Ok(Status::Processed);
            }
            buf.resize(count as usize, 0);
        }

        if cmd == Cmd::WRITE {
            match self
                .transport
                .recv(&mut buf)
                .wrap_err("reading write payload")?
            {
                Recv::Eof => bail!(ProtocolError::new(
                    "client closed connection in the middle of a write request"
                )),
                Recv::Full => {}
            }
        }

        // Only the dispatch runs under the request lock; framing and the
        // reply do not.
        let error = {
            let lock = Arc::clone(&self.request_lock);
            let _guard = lock.lock().unwrap();
            self.handle_request(cmd, flags, offset, count, &mut buf)
        };

        let data = if cmd == Cmd::READ { &buf[..] } else { &[] };
        self.send_reply(handle, error, data)?;
        Ok(Status::Processed)
    }

    fn validate_request(
        &self,
        cmd: Cmd,
        raw_flags: u16,
        offset: u64,
        count: u32,
    ) -> Result<CmdFlags, i32> {
        match cmd {
            Cmd::READ | Cmd::WRITE | Cmd::TRIM | Cmd::WRITE_ZEROES => {
                if !valid_range(self.exportsize, offset, count) {
                    warn!(target: "nbd", "invalid request: offset and length are out of range");
                    return Err(libc::EIO);
                }
            }
            Cmd::FLUSH => {
                if offset != 0 || count != 0 {
                    warn!(target: "nbd", "invalid flush request: expecting offset and length == 0");
                    return Err(libc::EINVAL);
                }
            }
            // DISC never reaches validation
            Cmd::DISCONNECT => return Err(libc::EINVAL),
        }

        let Some(flags) = CmdFlags::from_bits(raw_flags) else {
            warn!(target: "nbd", "invalid request: unknown flag ({raw_flags:#x})");
            return Err(libc::EINVAL);
        };
        if flags.contains(CmdFlags::NO_HOLE) && cmd != Cmd::WRITE_ZEROES {
            warn!(target: "nbd", "invalid request: NO_HOLE flag needs WRITE_ZEROES request");
            return Err(libc::EINVAL);
        }

        if (cmd == Cmd::READ || cmd == Cmd::WRITE) && count > MAX_REQUEST_SIZE {
            warn!(
                target: "nbd",
                "invalid request: data request is too large ({count} > {MAX_REQUEST_SIZE})"
            );
            return Err(libc::ENOMEM);
        }

        if self.readonly
            && matches!(
                cmd,
                Cmd::WRITE | Cmd::FLUSH | Cmd::TRIM | Cmd::WRITE_ZEROES
            )
        {
            warn!(target: "nbd", "invalid request: write request on readonly connection");
            return Err(libc::EROFS);
        }

        if cmd == Cmd::FLUSH && !self.can_flush {
            warn!(target: "nbd", "invalid request: flush operation not supported");
            return Err(libc::EINVAL);
        }
        if cmd == Cmd::TRIM && !self.can_trim {
            warn!(target: "nbd", "invalid request: trim operation not supported");
            return Err(libc::EINVAL);
        }

        Ok(flags)
    }

    /// Execute a validated request against the backend. Returns the errno
    /// for the reply (0 on success); never fails the session.
    fn handle_request(
        &mut self,
        cmd: Cmd,
        flags: CmdFlags,
        offset: u64,
        count: u32,
        buf: &mut [u8],
    ) -> i32 {
        let server = self.server;

        // FUA is honored by flushing after the main operation.
        let flush_after_command =
            flags.contains(CmdFlags::FUA) && self.can_flush && !self.readonly;

        // The backend may pick the reply errno with diag::set_error();
        // otherwise we fall back to the failure's own code or EIO.
        diag::set_error(0);

        let r = match cmd {
            Cmd::READ => server.backend.pread(&mut self.handle, buf, offset),
            Cmd::WRITE => server.backend.pwrite(&mut self.handle, buf, offset),
            Cmd::FLUSH => server.backend.flush(&mut self.handle),
            Cmd::TRIM => server.backend.trim(&mut self.handle, count, offset),
            Cmd::WRITE_ZEROES => server.backend.zero(
                &mut self.handle,
                count,
                offset,
                !flags.contains(CmdFlags::NO_HOLE),
            ),
            // validation refuses anything else before dispatch
            Cmd::DISCONNECT => return libc::EINVAL,
        };
        if let Err(err) = r {
            warn!(target: "nbd", "{cmd:?} failed: {err}");
            return self.request_error(&err);
        }

        if flush_after_command {
            if let Err(err) = server.backend.flush(&mut self.handle) {
                warn!(target: "nbd", "flush after {cmd:?} failed: {err}");
                return self.request_error(&err);
            }
        }
        0
    }

    /// Pick the errno reported to the client for a failed backend call:
    /// the per-thread override if the backend set one, else the OS error
    /// carried by the failure (when the backend preserves errnos), else EIO.
    fn request_error(&self, err: &std::io::Error) -> i32 {
        let e = diag::get_error();
        if e != 0 {
            return e;
        }
        if self.server.backend.errno_is_preserved() {
            if let Some(os) = err.raw_os_error() {
                return os;
            }
        }
        libc::EIO
    }

    /// Read and discard `count` bytes of an already-rejected write payload
    /// so the stream stays aligned for the next request.
    fn skip_over_write_buffer(&mut self, count: u32) -> Result<()> {
        let mut scratch = [0u8; 8192];
        let mut remaining = count as usize;
        while remaining > 0 {
            let n = remaining.min(scratch.len());
            match self
                .transport
                .recv(&mut scratch[..n])
                .wrap_err("skipping write buffer")?
            {
                Recv::Eof => bail!(ProtocolError::new(
                    "client closed connection in the middle of a write request"
                )),
                Recv::Full => remaining -= n,
            }
        }
        Ok(())
    }

    fn send_reply(&mut self, handle: u64, error: i32, data: &[u8]) -> Result<()> {
        let mut reply = Vec::with_capacity(16);
        SimpleReply {
            err: ErrorType::from_errno(error),
            handle,
        }
        .put(&mut reply)?;
        if error != 0 {
            // the client only sees the collapsed wire code; keep the real
            // errno findable on the server side
            debug!(target: "nbd", "sending error reply: {}", Errno::from_raw(error));
        }
        self.transport.send(&reply).wrap_err("writing reply")?;
        if error == 0 && !data.is_empty() {
            self.transport
                .send(data)
                .wrap_err("writing reply data")?;
        }
        Ok(())
    }
}

impl<'a, B: Backend, S: Read + Write> Drop for Connection<'a, B, S> {
    fn drop(&mut self) {
        self.transport.close();
        self.server.backend.close(&mut self.handle);
    }
}
