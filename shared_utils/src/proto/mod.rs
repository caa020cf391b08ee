//! Protocol definitions for the offload control channel.
//!
//! This module contains the framing used on the byte stream between the
//! daemon and the kernel module.

pub mod framing;
