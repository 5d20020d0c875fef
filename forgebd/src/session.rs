//! Device lifecycle: binding a backend to a kernel NBD device.
//!
//! One serving session is a two-process affair. The parent and child share an
//! open `/dev/nbdX` control file and a connected socket pair; the child hands
//! its socket half to the kernel and blocks in `NBD_DO_IT` until disconnect,
//! while the parent runs the serving loop on the other half. SIGINT/SIGTERM
//! request a kernel-level disconnect through a process-wide target slot,
//! which unblocks the child and drains the session from both ends.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use tracing::info;

use nbd::{NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_TRIM, NbdDevice};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::serve::serve;

const NO_TARGET: RawFd = -1;

/// Control fd of the device currently being served, or [`NO_TARGET`].
///
/// Single-writer-at-a-time: written once when a session starts, cleared by
/// whichever of the signal handler or the teardown path gets there first.
static DISCONNECT_TARGET: AtomicI32 = AtomicI32::new(NO_TARGET);

fn register_disconnect_target(fd: RawFd) -> Result<()> {
    DISCONNECT_TARGET
        .compare_exchange(NO_TARGET, fd, Ordering::SeqCst, Ordering::SeqCst)
        .map(|_| ())
        .map_err(|_| Error::SessionActive)
}

fn clear_disconnect_target() {
    DISCONNECT_TARGET.store(NO_TARGET, Ordering::SeqCst);
}

/// Requests a kernel-level disconnect of the active device, if any.
///
/// Runs in signal context: one ioctl plus, on failure, a raw write to
/// stderr. Failure is not escalated; there is no one to report it to.
extern "C" fn disconnect_on_signal(_signal: libc::c_int) {
    let fd = DISCONNECT_TARGET.load(Ordering::SeqCst);
    if fd == NO_TARGET {
        return;
    }
    if nbd::disconnect_fd(fd).is_ok() {
        clear_disconnect_target();
    } else {
        static MSG: &[u8] = b"forgebd: failed to request disconnect on nbd device\n";
        unsafe { libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len()) };
    }
}

fn install_disconnect_handlers() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    let action = SigAction::new(
        SigHandler::Handler(disconnect_on_signal),
        SaFlags::SA_RESTART,
        mask,
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)
            .map_err(|e| Error::setup("sigaction")(e.into()))?;
        signal::sigaction(Signal::SIGTERM, &action)
            .map_err(|e| Error::setup("sigaction")(e.into()))?;
    }
    Ok(())
}

/// Child side of the session: cede the socket to the kernel and block until
/// the device disconnects, then clear the device's queue and socket.
fn kernel_handoff(device: &NbdDevice, retained: UnixStream, socket: &UnixStream) -> io::Result<()> {
    // Nothing may interrupt NBD_DO_IT; there is no good way to resume it.
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None)
        .map_err(io::Error::from)?;
    drop(retained);
    device.set_sock(socket.as_raw_fd())?;
    device.set_flags(NBD_FLAG_SEND_TRIM | NBD_FLAG_SEND_FLUSH)?;
    match device.do_it() {
        Ok(()) => {}
        // ENOTCONN is how DO_IT returns after a requested disconnect
        Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => {}
        Err(e) => return Err(e),
    }
    device.clear_queue()?;
    device.clear_sock()?;
    Ok(())
}

/// Present `backend` as the kernel block device at `device_path`.
///
/// Blocks until the session ends: an in-band disconnect request from the
/// kernel, a SIGINT/SIGTERM-driven disconnect, or a fatal error. Only one
/// session may be active per process at a time.
///
/// Requires permission to open the NBD device read-write (typically root).
pub fn run<B: Backend>(device_path: impl AsRef<Path>, backend: &mut B) -> Result<()> {
    let device_path = device_path.as_ref();
    let geometry = backend.geometry();
    geometry.validate()?;

    let (parent_sock, child_sock) = UnixStream::pair().map_err(Error::setup("socketpair"))?;
    let device = NbdDevice::open(device_path).map_err(Error::setup("open device"))?;

    device
        .set_block_size(geometry.block_size)
        .map_err(Error::setup("set block size"))?;
    device
        .set_size_blocks(geometry.block_count)
        .map_err(Error::setup("set block count"))?;
    device.clear_sock().map_err(Error::setup("clear socket"))?;

    match unsafe { fork() }.map_err(|e| Error::setup("fork")(e.into()))? {
        ForkResult::Child => {
            let status = match kernel_handoff(&device, parent_sock, &child_sock) {
                Ok(()) => 0,
                Err(e) => e.raw_os_error().unwrap_or(1),
            };
            process::exit(status);
        }
        ForkResult::Parent { child } => {
            register_disconnect_target(device.as_raw_fd())?;
            install_disconnect_handlers()?;
            drop(child_sock);

            info!(
                device = %device_path.display(),
                block_size = geometry.block_size,
                block_count = geometry.block_count,
                "serving nbd device"
            );

            let mut stream = parent_sock;
            let served = serve(&mut stream, backend);
            drop(stream);
            clear_disconnect_target();

            let status = waitpid(child, None)
                .map_err(|e| Error::setup("waitpid")(e.into()))?;
            served?;

            info!(device = %device_path.display(), "session complete");
            match status {
                WaitStatus::Exited(_, 0) => Ok(()),
                WaitStatus::Exited(_, code) => Err(Error::ChildFailed { status: code }),
                WaitStatus::Signaled(_, sig, _) => Err(Error::ChildFailed {
                    status: 128 + sig as i32,
                }),
                _ => Err(Error::ChildFailed { status: 1 }),
            }
        }
    }
}
