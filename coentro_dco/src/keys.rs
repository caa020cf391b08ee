//! Key slot manager.
//!
//! Each peer has two kernel key slots. The primary carries the active key
//! set; the secondary exists only while a rekey is in flight. A newly
//! installed key set stays *pending* until the TLS layer reports a
//! [`KeyOutcome`]: a confirmed secondary is swapped into the primary slot,
//! an aborted one is wiped.
//!
//! Installs are staged before anything is written: the kernel message is
//! built from the caller's key material, written in full, and only then
//! committed to local state. A write that does not complete leaves the
//! slots exactly as they were.

use byteorder::{BigEndian, WriteBytesExt};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use shared_utils::framing::{ControlFrame, Opcode};

use crate::channel::ControlChannel;
use crate::error::{DcoError, DcoResult};
use crate::types::{
    DcoCipher, InstallDirection, KeyDirection, KeyOutcome, PeerId, Role, SlotKind, MAX_KEY_ID,
    NONCE_TAIL_LEN,
};

const DIR_ENCRYPT: u8 = 0x01;
const DIR_DECRYPT: u8 = 0x02;

/// Bidirectional key container produced by the TLS layer.
pub trait KeyMaterialSource {
    /// Cipher key bytes for `direction` as seen by an instance in `role`.
    fn cipher_key(&self, direction: KeyDirection, role: Role) -> &[u8];

    /// Implicit IV bytes for `direction` as seen by an instance in `role`.
    fn implicit_iv(&self, direction: KeyDirection, role: Role) -> &[u8];
}

/// Key material negotiated for both directions of a session.
///
/// Half 0 is the server-to-client direction, half 1 client-to-server.
/// The buffers are wiped when the container is dropped.
#[derive(Clone)]
pub struct BidirectionalKey {
    keys: [Zeroizing<Vec<u8>>; 2],
    ivs: [Zeroizing<Vec<u8>>; 2],
}

impl BidirectionalKey {
    pub fn new(
        server_to_client: (Vec<u8>, Vec<u8>),
        client_to_server: (Vec<u8>, Vec<u8>),
    ) -> Self {
        BidirectionalKey {
            keys: [
                Zeroizing::new(server_to_client.0),
                Zeroizing::new(client_to_server.0),
            ],
            ivs: [
                Zeroizing::new(server_to_client.1),
                Zeroizing::new(client_to_server.1),
            ],
        }
    }

    fn half(direction: KeyDirection, role: Role) -> usize {
        match (direction, role) {
            (KeyDirection::Encrypt, Role::Server) | (KeyDirection::Decrypt, Role::Client) => 0,
            (KeyDirection::Encrypt, Role::Client) | (KeyDirection::Decrypt, Role::Server) => 1,
        }
    }
}

impl KeyMaterialSource for BidirectionalKey {
    fn cipher_key(&self, direction: KeyDirection, role: Role) -> &[u8] {
        &self.keys[Self::half(direction, role)]
    }

    fn implicit_iv(&self, direction: KeyDirection, role: Role) -> &[u8] {
        &self.ivs[Self::half(direction, role)]
    }
}

impl fmt::Debug for BidirectionalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidirectionalKey").finish_non_exhaustive()
    }
}

/// Key and nonce tail for one direction of one slot.
#[derive(Clone)]
pub struct DirectionKey {
    key: Zeroizing<Vec<u8>>,
    nonce_tail: Zeroizing<[u8; NONCE_TAIL_LEN]>,
}

impl DirectionKey {
    fn extract(
        source: &dyn KeyMaterialSource,
        direction: KeyDirection,
        role: Role,
        cipher: DcoCipher,
    ) -> DcoResult<Self> {
        let key = source.cipher_key(direction, role);
        if key.len() < cipher.key_len() {
            return Err(DcoError::KeyMaterial {
                cipher: cipher.name(),
                needed: cipher.key_len(),
                available: key.len(),
            });
        }
        let iv = source.implicit_iv(direction, role);
        if iv.len() < NONCE_TAIL_LEN {
            return Err(DcoError::KeyMaterial {
                cipher: cipher.name(),
                needed: NONCE_TAIL_LEN,
                available: iv.len(),
            });
        }

        let mut nonce_tail = Zeroizing::new([0u8; NONCE_TAIL_LEN]);
        nonce_tail.copy_from_slice(&iv[..NONCE_TAIL_LEN]);
        Ok(DirectionKey {
            key: Zeroizing::new(key[..cipher.key_len()].to_vec()),
            nonce_tail,
        })
    }

    pub fn key_len(&self) -> usize {
        self.key.len()
    }
}

impl fmt::Debug for DirectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionKey")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

/// One kernel key slot.
#[derive(Debug, Clone)]
pub struct KeySlot {
    key_id: u8,
    cipher: DcoCipher,
    encrypt: Option<DirectionKey>,
    decrypt: Option<DirectionKey>,
}

impl KeySlot {
    fn empty(key_id: u8, cipher: DcoCipher) -> Self {
        KeySlot {
            key_id,
            cipher,
            encrypt: None,
            decrypt: None,
        }
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn cipher(&self) -> DcoCipher {
        self.cipher
    }

    pub fn has(&self, direction: KeyDirection) -> bool {
        match direction {
            KeyDirection::Encrypt => self.encrypt.is_some(),
            KeyDirection::Decrypt => self.decrypt.is_some(),
        }
    }

    /// Both directions installed.
    pub fn is_complete(&self) -> bool {
        self.encrypt.is_some() && self.decrypt.is_some()
    }

    fn set(&mut self, direction: KeyDirection, key: DirectionKey) {
        match direction {
            KeyDirection::Encrypt => self.encrypt = Some(key),
            KeyDirection::Decrypt => self.decrypt = Some(key),
        }
    }

    /// Whether an install of `directions` with this cipher and key id
    /// fills in what this slot is still missing.
    fn accepts(&self, key_id: u8, cipher: DcoCipher, directions: &[KeyDirection]) -> bool {
        !self.is_complete()
            && self.key_id == key_id
            && self.cipher == cipher
            && directions.iter().all(|d| !self.has(*d))
    }
}

/// Key slot state of one peer.
#[derive(Debug)]
pub struct PeerSlotState {
    peer_id: PeerId,
    primary: Option<KeySlot>,
    secondary: Option<KeySlot>,
    pending: Option<SlotKind>,
    rekey_requested: bool,
}

impl PeerSlotState {
    fn new(peer_id: PeerId) -> Self {
        PeerSlotState {
            peer_id,
            primary: None,
            secondary: None,
            pending: None,
            rekey_requested: false,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn primary(&self) -> Option<&KeySlot> {
        self.primary.as_ref()
    }

    pub fn secondary(&self) -> Option<&KeySlot> {
        self.secondary.as_ref()
    }

    /// Slot awaiting a [`KeyOutcome`], if any.
    pub fn pending(&self) -> Option<SlotKind> {
        self.pending
    }

    /// Set when the kernel reported the active key as expiring.
    pub fn rekey_requested(&self) -> bool {
        self.rekey_requested
    }

    fn slot(&self, kind: SlotKind) -> Option<&KeySlot> {
        match kind {
            SlotKind::Primary => self.primary.as_ref(),
            SlotKind::Secondary => self.secondary.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: SlotKind) -> &mut Option<KeySlot> {
        match kind {
            SlotKind::Primary => &mut self.primary,
            SlotKind::Secondary => &mut self.secondary,
        }
    }
}

/// What a key-related kernel notification meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyNotice {
    /// The kernel acknowledged a key operation we issued
    Acknowledged(Opcode),
    /// The kernel wants fresh key material for this peer
    RekeyRequested,
}

/// Per-peer key slot bookkeeping for one context.
#[derive(Debug, Default)]
pub struct KeySlotManager {
    peers: HashMap<PeerId, PeerSlotState>,
}

impl KeySlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `peer_id` with empty slots.
    pub fn add_peer(&mut self, peer_id: PeerId) -> DcoResult<()> {
        if self.peers.contains_key(&peer_id) {
            return Err(DcoError::PeerExists(peer_id));
        }
        self.peers.insert(peer_id, PeerSlotState::new(peer_id));
        debug!(peer_id, "Tracking key slots for peer");
        Ok(())
    }

    /// Stop tracking `peer_id`; its key material is wiped on drop.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<PeerSlotState> {
        let removed = self.peers.remove(&peer_id);
        if removed.is_some() {
            debug!(peer_id, "Dropped key slots for peer");
        }
        removed
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerSlotState> {
        self.peers.get(&peer_id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Wipe every slot of every peer.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Push key material for `peer_id` into the kernel.
    ///
    /// The target slot follows from the current state: primary when the
    /// peer has none, otherwise a new secondary. While a slot is pending
    /// only the missing direction of that same key set is accepted.
    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip(self, channel, material))]
    pub fn install_key(
        &mut self,
        channel: &mut ControlChannel,
        peer_id: PeerId,
        key_id: u8,
        material: &dyn KeyMaterialSource,
        direction: InstallDirection,
        cipher_name: &str,
        role: Role,
    ) -> DcoResult<()> {
        let state = self
            .peers
            .get_mut(&peer_id)
            .ok_or(DcoError::UnknownPeer(peer_id))?;
        let cipher = DcoCipher::from_name(cipher_name)
            .ok_or_else(|| DcoError::UnsupportedCipher(cipher_name.to_string()))?;
        if key_id > MAX_KEY_ID {
            return Err(DcoError::InvalidKeyId(key_id));
        }
        let directions = direction.directions();

        let kind = match state.pending {
            None if state.primary.is_none() => SlotKind::Primary,
            None => SlotKind::Secondary,
            Some(kind) => {
                let fills_pending = state
                    .slot(kind)
                    .is_some_and(|slot| slot.accepts(key_id, cipher, directions));
                if !fills_pending {
                    warn!(peer_id, pending = ?kind, "Install rejected while a key set is pending");
                    return Err(DcoError::RekeyAlreadyInProgress(peer_id));
                }
                kind
            }
        };

        let mut staged = Vec::with_capacity(directions.len());
        for dir in directions {
            staged.push((*dir, DirectionKey::extract(material, *dir, role, cipher)?));
        }

        let payload = encode_new_key(kind, key_id, cipher, &staged);
        channel
            .write_message_all(peer_id, Opcode::NewKey, &payload)
            .map_err(|e| DcoError::InstallFailed {
                peer_id,
                source: Box::new(e),
            })?;

        let slot = state
            .slot_mut(kind)
            .get_or_insert_with(|| KeySlot::empty(key_id, cipher));
        for (dir, key) in staged {
            slot.set(dir, key);
        }
        let complete = slot.is_complete();
        state.pending = Some(kind);

        info!(peer_id, key_id, slot = ?kind, complete, "Installed key material");
        Ok(())
    }

    /// Resolve the pending slot of `peer_id` with the TLS layer's verdict.
    ///
    /// A confirmed slot that is missing a direction stays pending.
    #[instrument(level = "debug", skip(self, channel))]
    pub fn promote_or_wipe(
        &mut self,
        channel: &mut ControlChannel,
        peer_id: PeerId,
        outcome: KeyOutcome,
    ) -> DcoResult<()> {
        let state = self
            .peers
            .get_mut(&peer_id)
            .ok_or(DcoError::UnknownPeer(peer_id))?;
        let Some(kind) = state.pending else {
            debug!(peer_id, "No pending key set");
            return Ok(());
        };

        match outcome {
            KeyOutcome::Confirmed => {
                if !state.slot(kind).is_some_and(KeySlot::is_complete) {
                    warn!(peer_id, slot = ?kind, "Pending key set incomplete, not promoting");
                    return Ok(());
                }
                match kind {
                    SlotKind::Primary => {
                        state.pending = None;
                        info!(peer_id, "Primary key set confirmed");
                    }
                    SlotKind::Secondary => {
                        channel.write_message_all(peer_id, Opcode::SwapKeys, &[])?;
                        // The kernel now runs on the new keys; the old
                        // primary is wiped as it drops out of scope.
                        let retired = state.primary.take();
                        state.primary = state.secondary.take();
                        state.pending = None;
                        state.rekey_requested = false;
                        drop(retired);
                        info!(peer_id, "Rekey confirmed, keys swapped");
                        channel.write_message_all(
                            peer_id,
                            Opcode::DelKey,
                            &[SlotKind::Secondary as u8],
                        )?;
                    }
                }
            }
            KeyOutcome::Aborted => {
                state.slot_mut(kind).take();
                state.pending = None;
                info!(peer_id, slot = ?kind, "Pending key set wiped");
                channel.write_message_all(peer_id, Opcode::DelKey, &[kind as u8])?;
            }
        }
        Ok(())
    }

    /// Apply a key-related notification from the kernel.
    pub fn on_kernel_message(&mut self, msg: &ControlFrame) -> DcoResult<KeyNotice> {
        let state = self
            .peers
            .get_mut(&msg.peer_id)
            .ok_or(DcoError::UnknownPeer(msg.peer_id))?;
        match msg.opcode {
            Opcode::KeyExpired => {
                state.rekey_requested = true;
                info!(peer_id = msg.peer_id, "Kernel requested rekey");
                Ok(KeyNotice::RekeyRequested)
            }
            other => {
                debug!(peer_id = msg.peer_id, opcode = ?other, "Key operation acknowledged");
                Ok(KeyNotice::Acknowledged(other))
            }
        }
    }
}

/// `NewKey` payload: slot, key id, cipher, direction mask, then for each
/// direction (encrypt first) a u16 key length, the key and the nonce tail.
fn encode_new_key(
    kind: SlotKind,
    key_id: u8,
    cipher: DcoCipher,
    keys: &[(KeyDirection, DirectionKey)],
) -> Zeroizing<Vec<u8>> {
    let mut mask = 0u8;
    for (dir, _) in keys {
        mask |= match dir {
            KeyDirection::Encrypt => DIR_ENCRYPT,
            KeyDirection::Decrypt => DIR_DECRYPT,
        };
    }

    let mut payload = Zeroizing::new(Vec::with_capacity(
        4 + keys.len() * (2 + cipher.key_len() + NONCE_TAIL_LEN),
    ));
    payload.extend_from_slice(&[kind as u8, key_id, cipher as u8, mask]);
    for want in [KeyDirection::Encrypt, KeyDirection::Decrypt] {
        if let Some((_, key)) = keys.iter().find(|(d, _)| *d == want) {
            // Writes into a Vec cannot fail.
            let _ = payload.write_u16::<BigEndian>(key.key.len() as u16);
            payload.extend_from_slice(&key.key);
            payload.extend_from_slice(&key.nonce_tail[..]);
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;
    use shared_utils::framing::MAX_PAYLOAD_SIZE;

    fn material() -> BidirectionalKey {
        BidirectionalKey::new(
            (vec![0x11; 64], vec![0xA1; 12]),
            (vec![0x22; 64], vec![0xA2; 12]),
        )
    }

    fn setup(peers: &[PeerId]) -> (SimKernel, ControlChannel, KeySlotManager) {
        let kernel = SimKernel::new();
        let channel = ControlChannel::new(Box::new(kernel.transport()), MAX_PAYLOAD_SIZE);
        let mut keys = KeySlotManager::new();
        for p in peers {
            keys.add_peer(*p).unwrap();
        }
        (kernel, channel, keys)
    }

    fn install(
        keys: &mut KeySlotManager,
        ch: &mut ControlChannel,
        peer: PeerId,
        key_id: u8,
        dir: InstallDirection,
    ) -> DcoResult<()> {
        keys.install_key(ch, peer, key_id, &material(), dir, "AES-256-GCM", Role::Client)
    }

    #[test]
    fn test_role_selects_half() {
        let m = material();
        assert_eq!(m.cipher_key(KeyDirection::Encrypt, Role::Server)[0], 0x11);
        assert_eq!(m.cipher_key(KeyDirection::Decrypt, Role::Client)[0], 0x11);
        assert_eq!(m.cipher_key(KeyDirection::Encrypt, Role::Client)[0], 0x22);
        assert_eq!(m.implicit_iv(KeyDirection::Decrypt, Role::Server)[0], 0xA2);
    }

    #[test]
    fn test_first_install_goes_to_primary() {
        let (kernel, mut ch, mut keys) = setup(&[1]);
        install(&mut keys, &mut ch, 1, 0, InstallDirection::Both).unwrap();

        let state = keys.get(1).unwrap();
        assert!(state.primary().unwrap().is_complete());
        assert_eq!(state.pending(), Some(SlotKind::Primary));

        let frames = kernel.received_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::NewKey);
        // slot, key id, cipher, both directions
        assert_eq!(&frames[0].payload[..4], &[0, 0, DcoCipher::Aes256Gcm as u8, 0x03]);
        assert_eq!(frames[0].payload.len(), 4 + 2 * (2 + 32 + NONCE_TAIL_LEN));
    }

    #[test]
    fn test_rekey_swap_retires_old_primary() {
        let (kernel, mut ch, mut keys) = setup(&[1]);
        install(&mut keys, &mut ch, 1, 0, InstallDirection::Both).unwrap();
        keys.promote_or_wipe(&mut ch, 1, KeyOutcome::Confirmed).unwrap();

        install(&mut keys, &mut ch, 1, 1, InstallDirection::Both).unwrap();
        assert_eq!(keys.get(1).unwrap().pending(), Some(SlotKind::Secondary));

        keys.promote_or_wipe(&mut ch, 1, KeyOutcome::Confirmed).unwrap();
        let state = keys.get(1).unwrap();
        assert_eq!(state.primary().unwrap().key_id(), 1);
        assert!(state.secondary().is_none());
        assert_eq!(state.pending(), None);

        assert_eq!(
            kernel.received_opcodes(),
            vec![Opcode::NewKey, Opcode::NewKey, Opcode::SwapKeys, Opcode::DelKey]
        );
    }

    #[test]
    fn test_aborted_rekey_keeps_primary() {
        let (kernel, mut ch, mut keys) = setup(&[1]);
        install(&mut keys, &mut ch, 1, 0, InstallDirection::Both).unwrap();
        keys.promote_or_wipe(&mut ch, 1, KeyOutcome::Confirmed).unwrap();
        install(&mut keys, &mut ch, 1, 1, InstallDirection::Both).unwrap();

        keys.promote_or_wipe(&mut ch, 1, KeyOutcome::Aborted).unwrap();
        let state = keys.get(1).unwrap();
        assert_eq!(state.primary().unwrap().key_id(), 0);
        assert!(state.secondary().is_none());

        let last = kernel.received_frames().pop().unwrap();
        assert_eq!(last.opcode, Opcode::DelKey);
        assert_eq!(last.payload, vec![SlotKind::Secondary as u8]);
    }

    #[test]
    fn test_mismatched_completion_is_rejected() {
        let (_kernel, mut ch, mut keys) = setup(&[1]);
        install(&mut keys, &mut ch, 1, 2, InstallDirection::Encrypt).unwrap();

        // Same direction again, and the other direction under a new key id.
        assert!(matches!(
            install(&mut keys, &mut ch, 1, 2, InstallDirection::Encrypt),
            Err(DcoError::RekeyAlreadyInProgress(1))
        ));
        assert!(matches!(
            install(&mut keys, &mut ch, 1, 3, InstallDirection::Decrypt),
            Err(DcoError::RekeyAlreadyInProgress(1))
        ));
        install(&mut keys, &mut ch, 1, 2, InstallDirection::Decrypt).unwrap();
        assert!(keys.get(1).unwrap().primary().unwrap().is_complete());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let (kernel, mut ch, mut keys) = setup(&[5]);
        kernel.fail_writes_with(Some(libc::ENOBUFS));

        let err = install(&mut keys, &mut ch, 5, 0, InstallDirection::Both).unwrap_err();
        assert!(matches!(err, DcoError::InstallFailed { peer_id: 5, .. }));
        assert_eq!(err.code(), -libc::ENOBUFS);

        let state = keys.get(5).unwrap();
        assert!(state.primary().is_none());
        assert_eq!(state.pending(), None);

        kernel.fail_writes_with(None);
        install(&mut keys, &mut ch, 5, 0, InstallDirection::Both).unwrap();
    }

    #[test]
    fn test_partially_written_install_is_not_committed() {
        let (kernel, mut ch, mut keys) = setup(&[1]);
        kernel.set_write_budget(Some(5));

        let err = install(&mut keys, &mut ch, 1, 0, InstallDirection::Both).unwrap_err();
        assert!(matches!(err, DcoError::InstallFailed { peer_id: 1, .. }));
        assert!(err.is_fatal_to_interface());

        let state = keys.get(1).unwrap();
        assert!(state.primary().is_none());
        assert_eq!(state.pending(), None);

        // The cut-off frame is never completed behind our back.
        kernel.set_write_budget(None);
        assert!(matches!(ch.flush(), Err(DcoError::Closed)));
        assert!(kernel.received_opcodes().is_empty());
    }

    #[test]
    fn test_blocked_install_is_withdrawn() {
        let (kernel, mut ch, mut keys) = setup(&[1]);
        kernel.set_write_budget(Some(5));
        ch.write_message(1, Opcode::Packet, b"queued ahead").unwrap();

        let err = install(&mut keys, &mut ch, 1, 0, InstallDirection::Both).unwrap_err();
        assert_eq!(err.code(), -libc::EAGAIN);
        assert!(!err.is_fatal_to_interface());
        assert!(keys.get(1).unwrap().primary().is_none());

        kernel.set_write_budget(None);
        ch.flush().unwrap();
        assert_eq!(kernel.received_opcodes(), vec![Opcode::Packet]);

        install(&mut keys, &mut ch, 1, 0, InstallDirection::Both).unwrap();
        assert_eq!(kernel.received_opcodes(), vec![Opcode::Packet, Opcode::NewKey]);
        assert_eq!(keys.get(1).unwrap().pending(), Some(SlotKind::Primary));
    }

    #[test]
    fn test_blocked_swap_leaves_rekey_pending() {
        let (kernel, mut ch, mut keys) = setup(&[1]);
        install(&mut keys, &mut ch, 1, 0, InstallDirection::Both).unwrap();
        keys.promote_or_wipe(&mut ch, 1, KeyOutcome::Confirmed).unwrap();
        install(&mut keys, &mut ch, 1, 1, InstallDirection::Both).unwrap();

        kernel.set_write_budget(Some(0));
        assert!(matches!(
            keys.promote_or_wipe(&mut ch, 1, KeyOutcome::Confirmed),
            Err(DcoError::WouldBlock)
        ));
        let state = keys.get(1).unwrap();
        assert_eq!(state.primary().unwrap().key_id(), 0);
        assert_eq!(state.pending(), Some(SlotKind::Secondary));

        kernel.set_write_budget(None);
        keys.promote_or_wipe(&mut ch, 1, KeyOutcome::Confirmed).unwrap();
        assert_eq!(keys.get(1).unwrap().primary().unwrap().key_id(), 1);
    }

    #[test]
    fn test_rejects_bad_input() {
        let (_kernel, mut ch, mut keys) = setup(&[1]);
        assert!(matches!(
            install(&mut keys, &mut ch, 9, 0, InstallDirection::Both),
            Err(DcoError::UnknownPeer(9))
        ));
        assert!(matches!(
            keys.install_key(&mut ch, 1, 0, &material(), InstallDirection::Both, "BF-CBC", Role::Client),
            Err(DcoError::UnsupportedCipher(_))
        ));
        assert!(matches!(
            install(&mut keys, &mut ch, 1, 8, InstallDirection::Both),
            Err(DcoError::InvalidKeyId(8))
        ));

        let short = BidirectionalKey::new((vec![1; 16], vec![2; 8]), (vec![3; 16], vec![4; 8]));
        let err = keys
            .install_key(&mut ch, 1, 0, &short, InstallDirection::Both, "AES-256-GCM", Role::Server)
            .unwrap_err();
        assert!(matches!(err, DcoError::KeyMaterial { needed: 32, available: 16, .. }));
        assert!(keys.get(1).unwrap().primary().is_none());
    }

    #[test]
    fn test_key_expired_sets_rekey_flag() {
        let (_kernel, _ch, mut keys) = setup(&[3]);
        let msg = ControlFrame::new(Opcode::KeyExpired, 3, vec![0]).unwrap();
        assert_eq!(keys.on_kernel_message(&msg).unwrap(), KeyNotice::RekeyRequested);
        assert!(keys.get(3).unwrap().rekey_requested());

        let stray = ControlFrame::new(Opcode::KeyExpired, 4, vec![]).unwrap();
        assert!(matches!(keys.on_kernel_message(&stray), Err(DcoError::UnknownPeer(4))));
    }

    #[test]
    fn test_debug_hides_key_bytes() {
        let rendered = format!("{:?}", material());
        assert!(!rendered.contains("17"));
        assert!(rendered.contains("BidirectionalKey"));
    }
}
