use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::bail;
use color_eyre::Result;

use nbdserve::{
    proto::DEFAULT_PORT, Backend, DeviceBackend, FileBackend, MemBackend, Server, TlsPolicy,
    TlsSettings,
};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// The port the server should listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Name the export is advertised under
    #[arg(long, default_value = "default")]
    export: String,

    /// Refuse writes from every client
    #[arg(long)]
    readonly: bool,

    /// Use the legacy oldstyle handshake
    #[arg(long)]
    oldstyle: bool,

    /// TLS policy: off, on, or require
    #[arg(long, default_value_t = TlsPolicy::Off)]
    tls: TlsPolicy,

    /// Server certificate chain (PEM), required unless --tls off
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Server private key (PEM), required unless --tls off
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Verify client certificates against this CA bundle (PEM)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Subcommands,
}

const DEFAULT_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Spawn a server backed by memory
    Memory {
        /// Size of backing storage
        #[arg(short, long, default_value_t = DEFAULT_SIZE)]
        size: u64,
    },
    /// Spawn a server backed by a file
    File {
        /// Size of backing storage
        #[arg(short, long, default_value_t = DEFAULT_SIZE)]
        size: u64,

        /// Don't create/truncate existing file
        #[arg(long)]
        no_create: bool,

        /// Path to the backing file
        path: String,
    },
    /// Spawn a server backed by a block device
    Device {
        /// Path to the backing block device
        path: String,
    },
}

fn run<B: Backend + Send + Sync + 'static>(args: &Args, backend: B) -> Result<()> {
    let mut server = Server::new(backend)
        .export_name(&args.export)
        .readonly(args.readonly)
        .oldstyle(args.oldstyle);

    if args.tls != TlsPolicy::Off {
        let (Some(cert), Some(key)) = (args.tls_cert.clone(), args.tls_key.clone()) else {
            bail!("--tls {} needs --tls-cert and --tls-key", args.tls);
        };
        server = server.tls(
            args.tls,
            &TlsSettings {
                cert,
                key,
                ca: args.tls_ca.clone(),
            },
        )?;
    }

    Arc::new(server).start(args.port)
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    match &args.subcommand {
        Subcommands::Memory { size } => {
            let backend = MemBackend::with_size(*size);
            run(&args, backend)
        }
        Subcommands::File {
            size,
            no_create,
            path,
        } => {
            let file = File::options()
                .read(true)
                .write(true)
                .create(!no_create)
                .truncate(!no_create)
                .open(path)?;

            file.set_len(*size)?;

            run(&args, FileBackend::new(file))
        }
        Subcommands::Device { path } => {
            let file = File::options().read(true).write(true).open(path)?;
            run(&args, DeviceBackend::new(file))
        }
    }
}
