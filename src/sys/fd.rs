use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::syscall;

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct FileDesc(OwnedFd);

impl FileDesc {
    /// Takes ownership of `fd`. The caller must not close it afterwards.
    pub unsafe fn new(fd: RawFd) -> FileDesc {
        FileDesc(OwnedFd::from_raw_fd(fd))
    }

    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(
            self.raw(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(
            self.raw(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc::new(fd)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.raw()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}
