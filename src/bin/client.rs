use clap::Parser;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use fork::{daemon, Fork};

use nbdserve::{kernel::NbdDevice, proto::DEFAULT_PORT, Client};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = "default", help = "export to request")]
    export: String,

    #[arg(short, long, help = "disconnect from an existing client")]
    disconnect: bool,

    #[arg(
        short,
        long,
        help = "keep running in the foreground (don't daemonize)"
    )]
    foreground: bool,

    #[arg(default_value = "/dev/nbd0", help = "nbd device to set up")]
    device: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    if let Err(err) = sudo::escalate_if_needed() {
        bail!("could not get sudo privilege: {}", err);
    }

    if args.disconnect {
        let nbd = NbdDevice::open(&args.device)?;
        nbd.disconnect()?;
        return Ok(());
    }

    let stream = std::net::TcpStream::connect((args.host.as_str(), args.port))
        .wrap_err("connecting to nbd server")?;
    let client =
        Client::with_export(stream, &args.export).wrap_err("handshaking with nbd server")?;

    let nbd = match NbdDevice::open(&args.device) {
        Ok(nbd) => nbd,
        Err(err) => {
            eprintln!("could not open nbd device - do you need to run sudo modprobe nbd?");
            return Err(err).wrap_err("opening nbd device");
        }
    };
    nbd.attach(client)?;

    if args.foreground {
        nbd.serve()?;
        return Ok(());
    }

    if let Ok(Fork::Child) = daemon(false, false) {
        nbd.serve()?;
    }

    Ok(())
}
