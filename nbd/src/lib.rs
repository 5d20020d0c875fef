//! NBD (Network Block Device) kernel transmission protocol.
//!
//! This crate provides the wire framing used by the Linux NBD driver once a
//! socket has been handed to the kernel, plus the ioctl control surface for
//! configuring and running an `/dev/nbdX` device.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! There is no handshake or option negotiation here: a socket attached via
//! `NBD_SET_SOCK` enters transmission phase directly.

mod device;
mod protocol;

pub use device::{NbdDevice, disconnect_device, disconnect_fd};
pub use protocol::*;
