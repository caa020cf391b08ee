//! Error types for the offload control layer.

use std::io;
use thiserror::Error;

use shared_utils::framing::FrameError;

use crate::types::PeerId;

/// Result type for offload operations.
pub type DcoResult<T> = Result<T, DcoError>;

/// Coarse classification that tells the daemon how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The host cannot offload; fall back to user-space crypto.
    CapabilityAbsent,
    /// An option rules out offload; the caller picks fallback or abort.
    ConfigConflict,
    /// The interface instance is unusable; the process is not.
    Transport,
    /// The offending message is dropped; the channel stays usable.
    Protocol,
    /// Rejected synchronously; nothing changed.
    State,
}

/// Error types that can occur in offload operations.
#[derive(Debug, Error)]
pub enum DcoError {
    /// Kernel support is missing
    #[error("Data channel offload is not available on this host")]
    CapabilityAbsent,

    /// A configured option is incompatible with offload
    #[error("Option '{option}' conflicts with data channel offload")]
    ConfigConflict { option: String },

    /// Interface already created and not destroyed
    #[error("Interface already exists: {0}")]
    AlreadyExists(String),

    /// Interface name the kernel would refuse
    #[error("Invalid interface name: {0:?}")]
    InvalidName(String),

    /// Platform failure, carrying the negative errno
    #[error("Transport error during {op}: code {code}")]
    Transport { op: &'static str, code: i32 },

    /// Binding destroyed or never opened
    #[error("Control channel closed")]
    Closed,

    /// Malformed frame on the control channel
    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    /// No slot state registered for this peer
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Peer id already registered
    #[error("Peer already registered: {0}")]
    PeerExists(PeerId),

    /// Point-to-point instances carry a single peer
    #[error("Point-to-point instance cannot add peer {0}")]
    PeerLimit(PeerId),

    /// Cipher the kernel cannot run
    #[error("Unsupported cipher for offload: {0}")]
    UnsupportedCipher(String),

    /// Key container shorter than the cipher needs
    #[error("Key material too short for {cipher}: need {needed} bytes, have {available}")]
    KeyMaterial {
        cipher: &'static str,
        needed: usize,
        available: usize,
    },

    /// Key id outside the range the data channel carries
    #[error("Invalid key id: {0}")]
    InvalidKeyId(u8),

    /// A pending key set would be clobbered
    #[error("Rekey already in progress for peer {0}")]
    RekeyAlreadyInProgress(PeerId),

    /// Pushing the key failed; slot state is unchanged
    #[error("Key install for peer {peer_id} failed: {source}")]
    InstallFailed {
        peer_id: PeerId,
        #[source]
        source: Box<DcoError>,
    },

    /// The transport cannot take the frame right now; nothing was sent
    #[error("Control channel would block")]
    WouldBlock,

    /// Binding is already registered with an event loop
    #[error("Binding already registered with the event loop")]
    AlreadyRegistered,
}

impl DcoError {
    /// Wrap an I/O failure with the operation that hit it.
    pub fn transport(op: &'static str, err: &io::Error) -> Self {
        let code = err.raw_os_error().map(|c| -c).unwrap_or(-libc::EIO);
        DcoError::Transport { op, code }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DcoError::CapabilityAbsent => ErrorClass::CapabilityAbsent,
            DcoError::ConfigConflict { .. } => ErrorClass::ConfigConflict,
            DcoError::Transport { .. } | DcoError::Closed => ErrorClass::Transport,
            DcoError::InstallFailed { source, .. } => source.class(),
            DcoError::Framing(_)
            | DcoError::UnknownPeer(_)
            | DcoError::UnsupportedCipher(_)
            | DcoError::InvalidKeyId(_)
            | DcoError::KeyMaterial { .. } => ErrorClass::Protocol,
            DcoError::AlreadyExists(_)
            | DcoError::InvalidName(_)
            | DcoError::PeerExists(_)
            | DcoError::PeerLimit(_)
            | DcoError::RekeyAlreadyInProgress(_)
            | DcoError::WouldBlock
            | DcoError::AlreadyRegistered => ErrorClass::State,
        }
    }

    /// Negative errno equivalent, passed through for platform failures.
    pub fn code(&self) -> i32 {
        match self {
            DcoError::CapabilityAbsent | DcoError::UnsupportedCipher(_) => -libc::EOPNOTSUPP,
            DcoError::ConfigConflict { .. }
            | DcoError::InvalidName(_)
            | DcoError::InvalidKeyId(_)
            | DcoError::KeyMaterial { .. } => -libc::EINVAL,
            DcoError::AlreadyExists(_) | DcoError::PeerExists(_) => -libc::EEXIST,
            DcoError::Transport { code, .. } => *code,
            DcoError::Closed => -libc::EBADF,
            DcoError::Framing(_) => -libc::EPROTO,
            DcoError::UnknownPeer(_) => -libc::ENOENT,
            DcoError::PeerLimit(_) => -libc::ENOSPC,
            DcoError::RekeyAlreadyInProgress(_) => -libc::EBUSY,
            DcoError::InstallFailed { source, .. } => source.code(),
            DcoError::WouldBlock => -libc::EAGAIN,
            DcoError::AlreadyRegistered => -libc::EALREADY,
        }
    }

    /// Whether the interface instance must be torn down.
    pub fn is_fatal_to_interface(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    /// Whether this error, hit while creating the interface at startup,
    /// should stop the daemon. Everything else degrades to fallback.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Transport)
    }
}

/// Collapse a result into the `0` / negative errno convention.
pub fn status<T>(result: &DcoResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
