//! Byte transport underneath the control channel.
//!
//! The platform wire format (netlink, ioctl, character device) is opaque at
//! this layer: all the channel needs is a non-blocking byte pipe that
//! reports `WouldBlock` instead of suspending the thread.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::debug;

/// Non-blocking byte pipe to the kernel module.
pub trait ControlTransport {
    /// Read available bytes; `ErrorKind::WouldBlock` when none are ready.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the transport accepts right now.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Descriptor to watch for readiness, if the transport has one.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Release the underlying handle. Calling it again is a no-op.
    fn close(&mut self) -> io::Result<()>;
}

/// Transport over any non-blocking file descriptor.
#[derive(Debug)]
pub struct FdTransport<T> {
    inner: Option<T>,
}

impl FdTransport<File> {
    /// Open a control node (character device or FIFO) in non-blocking mode.
    pub fn open_node<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), fd = file.as_raw_fd(), "Opened control node");
        Ok(FdTransport { inner: Some(file) })
    }
}

impl FdTransport<UnixStream> {
    /// Wrap a connected stream socket, switching it to non-blocking mode.
    pub fn from_stream(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(FdTransport {
            inner: Some(stream),
        })
    }
}

impl<T> FdTransport<T> {
    fn inner_mut(&mut self) -> io::Result<&mut T> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl<T: Read + Write + AsRawFd> ControlTransport for FdTransport<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_mut()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_mut()?.write(buf)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.inner.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the handle closes the descriptor.
        if let Some(inner) = self.inner.take() {
            debug!(fd = inner.as_raw_fd(), "Closing control transport");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_transport_would_block() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut transport = FdTransport::from_stream(ours).unwrap();
        assert!(transport.raw_fd().is_some());

        let mut buf = [0u8; 16];
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        (&theirs).write_all(b"ping").unwrap();
        assert_eq!(transport.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let mut transport = FdTransport::from_stream(ours).unwrap();
        transport.close().unwrap();
        transport.close().unwrap();
        assert!(transport.raw_fd().is_none());

        let err = transport.write(b"x").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_open_missing_node() {
        let dir = tempfile::tempdir().unwrap();
        let err = FdTransport::open_node(dir.path().join("ovpn-dco")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
