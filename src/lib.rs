//! A Network Block Device (NBD) server framework with pluggable storage
//! backends, plus a small client and the ioctl glue to attach an export to
//! the Linux kernel's `/dev/nbdX` driver.
//!
//! The server speaks both handshake dialects (old-style and fixed
//! new-style), supports in-band TLS upgrades via `STARTTLS`, and exposes a
//! single export backed by anything implementing [`Backend`].
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.

pub mod backend;
pub mod client;
mod conn;
pub mod diag;
pub mod kernel;
pub mod proto;
pub mod server;
pub mod tls;
pub mod transport;

pub use backend::{Backend, DeviceBackend, FileBackend, MemBackend};
pub use client::Client;
pub use server::Server;
pub use tls::{TlsPolicy, TlsSettings};
