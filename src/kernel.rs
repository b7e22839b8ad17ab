//! Attach an NBD connection to the kernel's `/dev/nbdX` driver, using ioctls.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/nbd.h>.
#![deny(missing_docs)]

use std::{
    fs::File,
    io,
    os::unix::prelude::{AsRawFd, IntoRawFd, RawFd},
    path::Path,
};

use std::io::{Read, Write};

use nix::sys::ioctl::ioctl_param_type;

use crate::client::Client;

mod ioctl {
    use nix::{ioctl_none, ioctl_write_int};
    const NBD_IOCTL: u8 = 0xab;
    ioctl_write_int!(set_sock, NBD_IOCTL, 0);
    ioctl_write_int!(set_blksize, NBD_IOCTL, 1);
    ioctl_none!(do_it, NBD_IOCTL, 3);
    ioctl_none!(clear_sock, NBD_IOCTL, 4);
    ioctl_write_int!(set_size_blocks, NBD_IOCTL, 7);
    ioctl_none!(disconnect, NBD_IOCTL, 8);
}

/// Block size the kernel device is configured with.
pub const BLOCK_SIZE: u64 = 4096;

/// A handle to one `/dev/nbdX` device node.
#[derive(Debug)]
pub struct NbdDevice {
    file: File,
}

impl NbdDevice {
    /// Open the NBD device node at `path` (e.g. `/dev/nbd0`).
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Hand a connected client to the kernel: configure the block size and
    /// device size from the negotiated export, then install the socket.
    ///
    /// The client must have completed its handshake; the kernel takes over
    /// the transmission phase.
    pub fn attach<IO>(&self, client: Client<IO>) -> io::Result<()>
    where
        IO: Read + Write + IntoRawFd,
    {
        let size = client.size();
        unsafe {
            ioctl::set_blksize(self.fd(), BLOCK_SIZE as ioctl_param_type)?;
            ioctl::set_size_blocks(self.fd(), (size / BLOCK_SIZE) as ioctl_param_type)?;
            ioctl::clear_sock(self.fd())?;
            ioctl::set_sock(self.fd(), client.into_raw_fd() as ioctl_param_type)?;
        }
        Ok(())
    }

    /// Run the device (NBD_DO_IT). Blocks until the connection ends or the
    /// device is disconnected from another process.
    pub fn serve(&self) -> io::Result<()> {
        unsafe { ioctl::do_it(self.fd())? };
        Ok(())
    }

    /// Tell the kernel to disconnect from the server and release the
    /// device's socket.
    pub fn disconnect(&self) -> io::Result<()> {
        unsafe {
            ioctl::disconnect(self.fd())?;
            ioctl::clear_sock(self.fd())?;
        }
        Ok(())
    }
}
