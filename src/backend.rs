//! Storage backends exported by the server.
//!
//! A [`Backend`] supplies the block data behind the single export this
//! server offers. The server interrogates its capabilities once per
//! connection during the handshake and never invokes an operation the
//! backend has denied (e.g. `flush` when `can_flush` returned false).
//!
//! Backends for in-memory buffers, regular files and raw block devices are
//! provided; anything else can plug in by implementing the trait.
#![deny(missing_docs)]

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use nix::libc;

static ZEROES: [u8; 4096] = [0u8; 4096];

/// A pluggable source of block data for one export.
///
/// `open` is called once per client connection and produces a handle that
/// the connection owns until it ends; all I/O operations receive that
/// handle. Backends without per-connection state use `Handle = ()`.
///
/// I/O errors should carry a real OS error code where one exists; report
/// `true` from [`Backend::errno_is_preserved`] in that case so the code
/// reaches the client (collapsed to the wire error set) instead of a
/// generic `EIO`. A backend can also pick the exact reply code for the
/// request in flight with [`crate::diag::set_error`], which takes
/// precedence over both.
pub trait Backend {
    /// Per-connection state, owned by the connection between `open` and
    /// `close`.
    type Handle;

    /// Short name of this backend, used in log tags.
    fn name(&self) -> &str;

    /// Start serving one connection.
    fn open(&self, readonly: bool) -> io::Result<Self::Handle>;

    /// Connection teardown notification. The handle is dropped afterwards.
    fn close(&self, _handle: &mut Self::Handle) {}

    /// Size of the export in bytes.
    fn get_size(&self, handle: &mut Self::Handle) -> io::Result<u64>;

    /// Whether the export accepts writes.
    fn can_write(&self, _handle: &mut Self::Handle) -> io::Result<bool> {
        Ok(true)
    }

    /// Whether the export supports flushing to stable storage.
    fn can_flush(&self, _handle: &mut Self::Handle) -> io::Result<bool> {
        Ok(false)
    }

    /// Whether the export is backed by rotational media.
    fn is_rotational(&self, _handle: &mut Self::Handle) -> io::Result<bool> {
        Ok(false)
    }

    /// Whether the export supports discarding ranges.
    fn can_trim(&self, _handle: &mut Self::Handle) -> io::Result<bool> {
        Ok(false)
    }

    /// Fill `buf` from the export, starting at `offset`.
    fn pread(&self, handle: &mut Self::Handle, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write `buf` to the export, starting at `offset`.
    fn pwrite(&self, handle: &mut Self::Handle, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Commit outstanding writes to stable storage.
    fn flush(&self, _handle: &mut Self::Handle) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EINVAL))
    }

    /// Discard `count` bytes at `offset`.
    fn trim(&self, _handle: &mut Self::Handle, _count: u32, _offset: u64) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EINVAL))
    }

    /// Zero `count` bytes at `offset`. When `may_trim` is set the backend
    /// may punch a hole instead of writing literal zeroes.
    fn zero(
        &self,
        handle: &mut Self::Handle,
        count: u32,
        offset: u64,
        _may_trim: bool,
    ) -> io::Result<()> {
        let mut offset = offset;
        let mut remaining = count as u64;
        while remaining > 0 {
            let n = remaining.min(ZEROES.len() as u64) as usize;
            self.pwrite(handle, &ZEROES[..n], offset)?;
            offset += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Whether errors from this backend carry accurate OS error codes.
    fn errno_is_preserved(&self) -> bool {
        false
    }

    /// Whether connections must be serialized instead of running in
    /// parallel threads.
    fn serialize_connections(&self) -> bool {
        false
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

/// Export backed by an in-memory byte buffer, shared by all connections.
#[derive(Debug)]
pub struct MemBackend {
    data: Mutex<Vec<u8>>,
}

impl MemBackend {
    /// Export the given bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Export `size` zeroed bytes.
    pub fn with_size(size: u64) -> Self {
        Self::new(vec![0u8; size as usize])
    }
}

impl Backend for MemBackend {
    type Handle = ();

    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, _readonly: bool) -> io::Result<()> {
        Ok(())
    }

    fn get_size(&self, _handle: &mut ()) -> io::Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn can_flush(&self, _handle: &mut ()) -> io::Result<bool> {
        Ok(true)
    }

    fn can_trim(&self, _handle: &mut ()) -> io::Result<bool> {
        Ok(true)
    }

    fn pread(&self, _handle: &mut (), buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or_else(einval)?;
        if end > data.len() {
            return Err(einval());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn pwrite(&self, _handle: &mut (), buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or_else(einval)?;
        if end > data.len() {
            return Err(einval());
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self, _handle: &mut ()) -> io::Result<()> {
        Ok(())
    }

    fn trim(&self, handle: &mut (), count: u32, offset: u64) -> io::Result<()> {
        // discarded ranges read back as zeroes
        self.zero(handle, count, offset, true)
    }

    fn zero(&self, _handle: &mut (), count: u32, offset: u64, _may_trim: bool) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(count as usize).ok_or_else(einval)?;
        if end > data.len() {
            return Err(einval());
        }
        data[start..end].fill(0);
        Ok(())
    }

    fn errno_is_preserved(&self) -> bool {
        true
    }
}

/// Export backed by a regular file.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Export the contents of `file`, which should be open for reading and
    /// writing.
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl Backend for FileBackend {
    type Handle = ();

    fn name(&self) -> &str {
        "file"
    }

    fn open(&self, _readonly: bool) -> io::Result<()> {
        Ok(())
    }

    fn get_size(&self, _handle: &mut ()) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    fn can_flush(&self, _handle: &mut ()) -> io::Result<bool> {
        Ok(true)
    }

    fn can_trim(&self, _handle: &mut ()) -> io::Result<bool> {
        Ok(true)
    }

    fn pread(&self, _handle: &mut (), buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn pwrite(&self, _handle: &mut (), buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn flush(&self, _handle: &mut ()) -> io::Result<()> {
        self.file.sync_all()
    }

    fn trim(&self, _handle: &mut (), count: u32, offset: u64) -> io::Result<()> {
        let r = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                count as libc::off_t,
            )
        };
        if r == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn zero(&self, handle: &mut (), count: u32, offset: u64, may_trim: bool) -> io::Result<()> {
        if may_trim {
            // a hole reads back as zeroes
            return self.trim(handle, count, offset);
        }
        let mut offset = offset;
        let mut remaining = count as u64;
        while remaining > 0 {
            let n = remaining.min(ZEROES.len() as u64) as usize;
            self.file.write_all_at(&ZEROES[..n], offset)?;
            offset += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn errno_is_preserved(&self) -> bool {
        true
    }
}

/// Export passing through to a raw block device.
#[derive(Debug)]
pub struct DeviceBackend {
    file: File,
}

mod ioctl {
    use nix::ioctl_read;
    // BLKGETSIZE64: size of a block device in bytes
    ioctl_read!(blkgetsize64, 0x12, 114, u64);
}

impl DeviceBackend {
    /// Export the block device open at `file`.
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl Backend for DeviceBackend {
    type Handle = ();

    fn name(&self) -> &str {
        "device"
    }

    fn open(&self, _readonly: bool) -> io::Result<()> {
        Ok(())
    }

    fn get_size(&self, _handle: &mut ()) -> io::Result<u64> {
        let mut size = 0u64;
        unsafe { ioctl::blkgetsize64(self.file.as_raw_fd(), &mut size)? };
        Ok(size)
    }

    fn can_flush(&self, _handle: &mut ()) -> io::Result<bool> {
        Ok(true)
    }

    fn pread(&self, _handle: &mut (), buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn pwrite(&self, _handle: &mut (), buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn flush(&self, _handle: &mut ()) -> io::Result<()> {
        self.file.sync_all()
    }

    fn errno_is_preserved(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_read_write() {
        let backend = MemBackend::with_size(1024);
        let mut h = backend.open(false).unwrap();
        assert_eq!(backend.get_size(&mut h).unwrap(), 1024);

        backend.pwrite(&mut h, &[7u8; 16], 512).unwrap();
        let mut buf = [0u8; 16];
        backend.pread(&mut h, &mut buf, 512).unwrap();
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn mem_backend_rejects_out_of_bounds() {
        let backend = MemBackend::with_size(64);
        let mut h = backend.open(false).unwrap();
        let err = backend.pwrite(&mut h, &[1u8; 8], 60).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        let mut buf = [0u8; 8];
        assert!(backend.pread(&mut h, &mut buf, u64::MAX).is_err());
    }

    #[test]
    fn mem_backend_trim_and_zero_clear_data() {
        let backend = MemBackend::new(vec![0xffu8; 128]);
        let mut h = backend.open(false).unwrap();
        backend.trim(&mut h, 32, 0).unwrap();
        backend.zero(&mut h, 32, 64, false).unwrap();

        let mut buf = [0u8; 128];
        backend.pread(&mut h, &mut buf, 0).unwrap();
        assert_eq!(&buf[..32], &[0u8; 32]);
        assert_eq!(&buf[32..64], &[0xffu8; 32]);
        assert_eq!(&buf[64..96], &[0u8; 32]);
        assert_eq!(&buf[96..], &[0xffu8; 32]);
    }

    #[test]
    fn default_zero_emulation_writes_zeroes() {
        // a backend that only implements the required operations
        struct Plain(Mutex<Vec<u8>>);
        impl Backend for Plain {
            type Handle = ();
            fn name(&self) -> &str {
                "plain"
            }
            fn open(&self, _readonly: bool) -> io::Result<()> {
                Ok(())
            }
            fn get_size(&self, _h: &mut ()) -> io::Result<u64> {
                Ok(self.0.lock().unwrap().len() as u64)
            }
            fn pread(&self, _h: &mut (), buf: &mut [u8], offset: u64) -> io::Result<()> {
                let data = self.0.lock().unwrap();
                let start = offset as usize;
                buf.copy_from_slice(&data[start..start + buf.len()]);
                Ok(())
            }
            fn pwrite(&self, _h: &mut (), buf: &[u8], offset: u64) -> io::Result<()> {
                let mut data = self.0.lock().unwrap();
                let start = offset as usize;
                data[start..start + buf.len()].copy_from_slice(buf);
                Ok(())
            }
        }

        let backend = Plain(Mutex::new(vec![0xaau8; 10000]));
        let mut h = backend.open(false).unwrap();
        backend.zero(&mut h, 9000, 500, false).unwrap();
        let mut buf = vec![0u8; 10000];
        backend.pread(&mut h, &mut buf, 0).unwrap();
        assert_eq!(&buf[..500], &vec![0xaau8; 500][..]);
        assert_eq!(&buf[500..9500], &vec![0u8; 9000][..]);
        assert_eq!(&buf[9500..], &vec![0xaau8; 500][..]);
    }

    #[test]
    fn file_backend_read_write_and_size() {
        let path = std::env::temp_dir().join(format!("nbdserve-backend-{}", std::process::id()));
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(4096).unwrap();

        let backend = FileBackend::new(file);
        let mut h = backend.open(false).unwrap();
        assert_eq!(backend.get_size(&mut h).unwrap(), 4096);

        backend.pwrite(&mut h, b"hello", 100).unwrap();
        backend.flush(&mut h).unwrap();
        let mut buf = [0u8; 5];
        backend.pread(&mut h, &mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");

        // punched holes read back as zeroes
        backend.trim(&mut h, 5, 100).unwrap();
        backend.pread(&mut h, &mut buf, 100).unwrap();
        assert_eq!(buf, [0u8; 5]);

        std::fs::remove_file(&path).unwrap();
    }
}
