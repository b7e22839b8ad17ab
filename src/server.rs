//! Network Block Device server, exporting a pluggable [`Backend`].
//!
//! Implements a single fixed export over the old-style or fixed new-style
//! handshake, read/write/flush/trim/write-zeroes commands, read-only mode,
//! and opt-in TLS (upgraded in-band via `STARTTLS`).
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![deny(missing_docs)]

use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{error, info, warn};
use rustls::ServerConfig;

use crate::backend::Backend;
use crate::conn::Connection;
use crate::diag;
use crate::tls::{self, TlsPolicy, TlsSettings};

/// An NBD server offering one export from a [`Backend`].
///
/// Configure with the builder-style methods, then either hand sockets to
/// [`Server::handle_client`] yourself or let [`Server::start`] run the
/// accept loop.
pub struct Server<B> {
    pub(crate) backend: B,
    pub(crate) export_name: String,
    pub(crate) readonly: bool,
    pub(crate) newstyle: bool,
    pub(crate) tls: TlsPolicy,
    pub(crate) tls_config: Option<Arc<ServerConfig>>,
    quit: AtomicBool,
    connection_lock: Mutex<()>,
    next_instance: AtomicUsize,
}

impl<B: Backend> Server<B> {
    /// Create a server for `backend` with default settings: new-style
    /// handshake, writable, TLS off, export named `"default"`.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            export_name: "default".to_string(),
            readonly: false,
            newstyle: true,
            tls: TlsPolicy::Off,
            tls_config: None,
            quit: AtomicBool::new(false),
            connection_lock: Mutex::new(()),
            next_instance: AtomicUsize::new(1),
        }
    }

    /// Set the advertised export name.
    pub fn export_name<S: Into<String>>(mut self, name: S) -> Self {
        self.export_name = name.into();
        self
    }

    /// Refuse all write-class commands on every connection.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Use the legacy old-style handshake instead of fixed new-style.
    pub fn oldstyle(mut self, oldstyle: bool) -> Self {
        self.newstyle = !oldstyle;
        self
    }

    /// Enable TLS with the given policy, loading certificates from
    /// `settings`.
    pub fn tls(mut self, policy: TlsPolicy, settings: &TlsSettings) -> Result<Self> {
        if policy != TlsPolicy::Off {
            self.tls_config = Some(tls::server_config(settings)?);
        }
        self.tls = policy;
        Ok(self)
    }

    /// Ask the server to stop: the accept loop winds down and every
    /// connection exits after finishing its request in flight.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Serve one client on an established stream: handshake, request loop,
    /// teardown. Returns `Ok(())` when the client disconnects gracefully.
    pub fn handle_client<S: Read + Write>(&self, stream: S) -> Result<()> {
        // A backend that cannot handle parallel connections gets them
        // serialized wholesale; otherwise only open() runs under the lock.
        if self.backend.serialize_connections() {
            let _guard = self.connection_lock.lock().unwrap();
            let handle = self.backend.open(self.readonly).wrap_err("opening backend")?;
            Connection::new(self, handle, stream).serve()
        } else {
            let handle = {
                let _guard = self.connection_lock.lock().unwrap();
                self.backend.open(self.readonly).wrap_err("opening backend")?
            };
            Connection::new(self, handle, stream).serve()
        }
    }

    /// Bind to `port` on localhost and serve clients, one thread per
    /// connection, until [`Server::shutdown`] is called.
    pub fn start(self: Arc<Self>, port: u16) -> Result<()>
    where
        B: Send + Sync + 'static,
    {
        let listener =
            TcpListener::bind(("127.0.0.1", port)).wrap_err("binding listen socket")?;
        listener.set_nonblocking(true)?;
        info!(target: "nbd", "listening on port {port}");

        while !self.quit() {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(target: "nbd", "failed to set TCP_NODELAY for {addr}: {err}");
                    }
                    let server = Arc::clone(&self);
                    thread::spawn(move || {
                        diag::new_server_thread();
                        diag::set_name(server.backend.name());
                        diag::set_instance_num(
                            server.next_instance.fetch_add(1, Ordering::Relaxed),
                        );
                        diag::set_peer_addr(addr);
                        info!(target: "nbd", "{}: client connected from {addr}", diag::thread_tag());
                        match server.handle_client(stream) {
                            Ok(()) => {
                                info!(target: "nbd", "{}: client disconnected", diag::thread_tag())
                            }
                            Err(err) => {
                                error!(
                                    target: "nbd",
                                    "{}: error handling client: {err:#}",
                                    diag::thread_tag()
                                )
                            }
                        }
                    });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err).wrap_err("accepting connection"),
            }
        }

        // let in-flight sessions notice the quit flag and drain
        while diag::running_threads() > 0 {
            thread::sleep(Duration::from_millis(10));
        }
        info!(target: "nbd", "server shut down");
        Ok(())
    }
}
