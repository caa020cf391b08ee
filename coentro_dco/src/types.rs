//! Type definitions shared across the offload control layer.

use std::fmt;

use shared_utils::config::InstanceMode;

/// Peer identifier assigned by the daemon; unique within a context.
pub type PeerId = u32;

/// Bytes of implicit IV the kernel appends to each packet id to form a nonce.
pub const NONCE_TAIL_LEN: usize = 8;

/// Highest key id the data channel can carry.
pub const MAX_KEY_ID: u8 = 7;

/// Token handed to the event loop and returned with each readiness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopToken(pub usize);

impl fmt::Display for LoopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// Operating mode of an offload context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcoMode {
    /// Exactly one peer
    PointToPoint,
    /// Many peers multiplexed by peer id
    MultiPeer,
}

impl From<InstanceMode> for DcoMode {
    fn from(mode: InstanceMode) -> Self {
        match mode {
            InstanceMode::PointToPoint => DcoMode::PointToPoint,
            InstanceMode::Server => DcoMode::MultiPeer,
        }
    }
}

/// Which end of the handshake this instance played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A single traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Encrypt,
    Decrypt,
}

/// Directions covered by one install call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDirection {
    Encrypt,
    Decrypt,
    Both,
}

impl InstallDirection {
    pub fn directions(self) -> &'static [KeyDirection] {
        match self {
            InstallDirection::Encrypt => &[KeyDirection::Encrypt],
            InstallDirection::Decrypt => &[KeyDirection::Decrypt],
            InstallDirection::Both => &[KeyDirection::Encrypt, KeyDirection::Decrypt],
        }
    }
}

/// Outcome of a handshake or rekey, reported by the TLS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Peer proved it holds the new keys
    Confirmed,
    /// Negotiation failed or timed out
    Aborted,
}

/// Kernel key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotKind {
    Primary = 0,
    Secondary = 1,
}

/// AEAD ciphers the kernel data path implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DcoCipher {
    Aes128Gcm = 1,
    Aes192Gcm = 2,
    Aes256Gcm = 3,
    ChaCha20Poly1305 = 4,
}

impl DcoCipher {
    /// Parse a cipher name as negotiated by the TLS layer.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES-128-GCM" => Some(DcoCipher::Aes128Gcm),
            "AES-192-GCM" => Some(DcoCipher::Aes192Gcm),
            "AES-256-GCM" => Some(DcoCipher::Aes256Gcm),
            "CHACHA20-POLY1305" => Some(DcoCipher::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DcoCipher::Aes128Gcm => "AES-128-GCM",
            DcoCipher::Aes192Gcm => "AES-192-GCM",
            DcoCipher::Aes256Gcm => "AES-256-GCM",
            DcoCipher::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            DcoCipher::Aes128Gcm => 16,
            DcoCipher::Aes192Gcm => 24,
            DcoCipher::Aes256Gcm | DcoCipher::ChaCha20Poly1305 => 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_names() {
        assert_eq!(DcoCipher::from_name("aes-256-gcm"), Some(DcoCipher::Aes256Gcm));
        assert_eq!(
            DcoCipher::from_name("CHACHA20-POLY1305").map(DcoCipher::key_len),
            Some(32)
        );
        assert_eq!(DcoCipher::from_name("AES-256-CBC"), None);
        assert_eq!(DcoCipher::Aes192Gcm.name(), "AES-192-GCM");
    }

    #[test]
    fn test_install_directions() {
        assert_eq!(InstallDirection::Both.directions().len(), 2);
        assert_eq!(
            InstallDirection::Decrypt.directions(),
            &[KeyDirection::Decrypt]
        );
    }
}
