//! Linux kernel NBD device control.
//!
//! This module wraps the ioctl surface of an open `/dev/nbdX` control file:
//! geometry and feature-flag configuration, socket handoff, the blocking
//! `NBD_DO_IT` call that cedes the socket to the kernel driver, and
//! disconnect/cleanup.
//!
//! # Example
//!
//! ```ignore
//! use nbd::NbdDevice;
//!
//! let device = NbdDevice::open("/dev/nbd0")?;
//! device.set_block_size(512)?;
//! device.set_size_blocks(4096)?;
//! device.clear_sock()?;
//! // hand one half of a socket pair to the kernel, then:
//! device.do_it()?; // blocks until disconnect
//! ```

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::libc;

// NBD ioctl numbers from linux/nbd.h (architecture-independent)
#[allow(dead_code)]
mod ioctl {
    use nix::libc;
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_TIMEOUT: libc::c_ulong = 0xab09;
    pub const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;
}
use ioctl::*;

/// Requests a kernel-level disconnect on a raw NBD control fd.
///
/// Safe to call from a signal handler: a single ioctl, no allocation.
pub fn disconnect_fd(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, NBD_DISCONNECT) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An open NBD device control file.
///
/// Holds the `/dev/nbdX` fd for the duration of one serving session. The fd
/// is shared across `fork()`; each process closes its own copy on drop.
pub struct NbdDevice {
    fd: OwnedFd,
}

impl NbdDevice {
    /// Open the NBD device control file read-write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self {
            fd: OwnedFd::from(file),
        })
    }

    fn ioctl(&self, req: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), req, arg) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Set the device block size in bytes.
    pub fn set_block_size(&self, block_size: u64) -> io::Result<()> {
        self.ioctl(NBD_SET_BLKSIZE, block_size as libc::c_ulong)
    }

    /// Set the device size as a count of blocks.
    pub fn set_size_blocks(&self, block_count: u64) -> io::Result<()> {
        self.ioctl(NBD_SET_SIZE_BLOCKS, block_count as libc::c_ulong)
    }

    /// Detach any socket previously associated with the device.
    pub fn clear_sock(&self) -> io::Result<()> {
        self.ioctl(NBD_CLEAR_SOCK, 0)
    }

    /// Hand a connected socket endpoint to the kernel driver.
    pub fn set_sock(&self, socket: RawFd) -> io::Result<()> {
        self.ioctl(NBD_SET_SOCK, socket as libc::c_ulong)
    }

    /// Declare the optional commands the server supports (trim, flush, ...).
    pub fn set_flags(&self, flags: u16) -> io::Result<()> {
        self.ioctl(NBD_SET_FLAGS, flags as libc::c_ulong)
    }

    /// Transfer control to the kernel driver.
    ///
    /// Blocks until the device is disconnected, via an in-band
    /// `NBD_CMD_DISCONNECT` or an `NBD_DISCONNECT` ioctl from another fd.
    pub fn do_it(&self) -> io::Result<()> {
        self.ioctl(NBD_DO_IT, 0)
    }

    /// Discard any requests still queued on the device.
    pub fn clear_queue(&self) -> io::Result<()> {
        self.ioctl(NBD_CLEAR_QUE, 0)
    }

    /// Ask the kernel to send the server a disconnect request.
    pub fn disconnect(&self) -> io::Result<()> {
        disconnect_fd(self.fd.as_raw_fd())
    }

    /// The raw control fd, for registration as a disconnect target.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Disconnect an NBD device by path.
///
/// Opens the device fresh, the way `nbd-client -d` does, so a device attached
/// by another process can be torn down. Errors from the cleanup ioctls are
/// ignored; the device may already be disconnected.
///
/// NOTE: There's a known kernel bug where systemd-udevd's inotify watching
/// can keep the device open and prevent proper cleanup. Workaround is to
/// add udev rule: ACTION=="add|change", KERNEL=="nbd*", OPTIONS:="nowatch"
/// See: https://bugs.launchpad.net/ubuntu/+source/linux/+bug/1896350
pub fn disconnect_device(path: impl AsRef<Path>) -> io::Result<()> {
    let device = NbdDevice::open(path)?;
    let _ = device.disconnect();
    let _ = device.clear_sock();
    Ok(())
}
