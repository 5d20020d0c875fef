//! The request/reply serving loop.
//!
//! Frames kernel requests off an established socket, dispatches each one to a
//! byte-addressable [`Backend`], and writes the reply before touching the
//! next frame. Responses are strictly synchronous per request, so completion
//! order matches arrival order.
//!
//! The loop is generic over any blocking stream: the kernel's socket half in
//! production, an in-memory or socket-pair stream in tests.

use std::io::{Read, Write};

use bytes::BytesMut;
use tracing::{debug, warn};

use nbd::{NBD_EOVERFLOW, NBD_OK, NbdCommand, NbdError, NbdReply, NbdRequest};

use crate::backend::Backend;

/// Serve the userland side of an NBD socket until disconnect.
///
/// Returns `Ok(())` on an in-band disconnect request. Backend failures are
/// absorbed into reply error codes; framing and socket failures are fatal to
/// the session.
pub fn serve<S, B>(stream: &mut S, backend: &mut B) -> Result<(), NbdError>
where
    S: Read + Write,
    B: Backend + ?Sized,
{
    let size_bytes = backend.geometry().size_bytes();
    let mut req_buf = [0u8; NbdRequest::SIZE_BYTES];

    loop {
        stream.read_exact(&mut req_buf)?;

        let req = match NbdRequest::from_bytes(&req_buf, size_bytes) {
            Ok(req) => req,
            Err(NbdError::RequestTooLarge { .. }) => {
                let handle = NbdRequest::handle_of(&req_buf);
                stream.write_all(&NbdReply::error(handle, NBD_EOVERFLOW).to_bytes())?;
                continue;
            }
            Err(e) => return Err(e),
        };

        debug!(
            command = ?req.command,
            offset = req.offset,
            length = req.length,
            "request"
        );

        match req.command {
            NbdCommand::Read => {
                let mut data = vec![0u8; req.length as usize];
                let error = match backend.read(req.offset, &mut data) {
                    Ok(()) => NBD_OK,
                    Err(e) => {
                        warn!(error = %e, offset = req.offset, "read error");
                        e.to_wire()
                    }
                };
                // The payload goes out even on failure; the driver keys off
                // the error field, not the payload contents.
                stream.write_all(
                    &NbdReply {
                        error,
                        handle: req.handle,
                    }
                    .to_bytes(),
                )?;
                stream.write_all(&data)?;
            }
            NbdCommand::Write => {
                let len = req.length as usize;
                let mut data = BytesMut::with_capacity(len);
                data.resize(len, 0);
                stream.read_exact(&mut data)?;

                let error = match backend.write(req.offset, &data) {
                    Ok(()) => NBD_OK,
                    Err(e) => {
                        warn!(error = %e, offset = req.offset, "write error");
                        e.to_wire()
                    }
                };
                stream.write_all(
                    &NbdReply {
                        error,
                        handle: req.handle,
                    }
                    .to_bytes(),
                )?;
            }
            NbdCommand::Disconnect => {
                // No reply frame for a disconnect request.
                if let Err(e) = backend.disconnect() {
                    debug!(error = %e, "disconnect hook");
                }
                return Ok(());
            }
            NbdCommand::Flush => {
                let error = match backend.flush() {
                    Ok(()) => NBD_OK,
                    Err(e) => {
                        warn!(error = %e, "flush error");
                        e.to_wire()
                    }
                };
                stream.write_all(
                    &NbdReply {
                        error,
                        handle: req.handle,
                    }
                    .to_bytes(),
                )?;
            }
            NbdCommand::Trim => {
                let error = match backend.trim(req.offset, req.length as u64) {
                    Ok(()) => NBD_OK,
                    Err(e) => {
                        warn!(error = %e, offset = req.offset, "trim error");
                        e.to_wire()
                    }
                };
                stream.write_all(
                    &NbdReply {
                        error,
                        handle: req.handle,
                    }
                    .to_bytes(),
                )?;
            }
        }
    }
}
