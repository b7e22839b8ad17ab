//! TLS policy and server configuration.
//!
//! The NBD protocol upgrades to TLS in-band: the client sends `STARTTLS`
//! during the option phase and the server answers `ACK` in the clear before
//! both sides run the TLS handshake on the same connection. This module
//! builds the `rustls` configuration that upgrade uses; the byte-level swap
//! lives in [`crate::transport`].
#![deny(missing_docs)]

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

/// Whether and how strongly the server insists on TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Never negotiate TLS; `STARTTLS` is refused.
    #[default]
    Off,
    /// Negotiate TLS when the client asks, but serve plaintext clients too.
    On,
    /// Refuse to serve any client that does not upgrade to TLS.
    Required,
}

impl FromStr for TlsPolicy {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(TlsPolicy::Off),
            "on" => Ok(TlsPolicy::On),
            "require" | "required" => Ok(TlsPolicy::Required),
            _ => Err(eyre!("invalid tls policy {s:?} (try off, on or require)")),
        }
    }
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TlsPolicy::Off => "off",
            TlsPolicy::On => "on",
            TlsPolicy::Required => "require",
        };
        write!(f, "{s}")
    }
}

/// File paths the TLS configuration is loaded from.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Server certificate chain (PEM).
    pub cert: PathBuf,
    /// Server private key (PEM).
    pub key: PathBuf,
    /// CA bundle for verifying client certificates. When set, clients must
    /// present a certificate signed by one of these CAs.
    pub ca: Option<PathBuf>,
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .wrap_err_with(|| format!("parsing certificates from {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .wrap_err_with(|| format!("parsing private key from {}", path.display()))?
        .ok_or_else(|| eyre!("no private key found in {}", path.display()))
}

/// Build the `rustls` server configuration used for `STARTTLS` upgrades.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&settings.cert)?;
    let key = load_key(&settings.key)?;

    let builder = ServerConfig::builder();
    let config = match &settings.ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert).wrap_err("adding CA certificate")?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .wrap_err("building client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .wrap_err("invalid certificate/key pair")?;

    Ok(Arc::new(config))
}
