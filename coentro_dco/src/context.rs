//! Per-instance offload context.
//!
//! One [`DcoContext`] exists per tunnel instance. It owns the binding (and
//! through it the control transport), the key slots of every peer, and the
//! event loop registration. Everything runs on the daemon's loop thread
//! through `&mut self`; there is no internal locking.

use byteorder::{BigEndian, WriteBytesExt};
use std::net::SocketAddr;
use tracing::{debug, info, instrument, warn};

use shared_utils::framing::Opcode;

use crate::channel::{ControlChannel, ReadOutcome};
use crate::dispatch::{self, Delivery, Drain};
use crate::error::{DcoError, DcoResult};
use crate::event::EventLoopRegistrar;
use crate::interface::{Binding, InterfaceManager, LinkDriver};
use crate::keys::{KeyMaterialSource, KeySlotManager, PeerSlotState};
use crate::types::{DcoMode, InstallDirection, KeyOutcome, LoopToken, PeerId, Role};

/// Offload state of one tunnel instance.
pub struct DcoContext<D: LinkDriver> {
    mode: DcoMode,
    interfaces: InterfaceManager<D>,
    binding: Option<Binding>,
    keys: KeySlotManager,
}

impl<D: LinkDriver> DcoContext<D> {
    pub fn init(mode: DcoMode, interfaces: InterfaceManager<D>) -> Self {
        info!(?mode, "Offload context initialised");
        DcoContext {
            mode,
            interfaces,
            binding: None,
            keys: KeySlotManager::new(),
        }
    }

    pub fn mode(&self) -> DcoMode {
        self.mode
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn interfaces(&self) -> &InterfaceManager<D> {
        &self.interfaces
    }

    /// Create the kernel interface for this instance.
    pub fn open_interface(&mut self, name: &str) -> DcoResult<()> {
        if let Some(binding) = self.binding.as_ref().filter(|b| b.is_open()) {
            return Err(DcoError::AlreadyExists(binding.name().to_string()));
        }
        self.binding = Some(self.interfaces.create_interface(name)?);
        Ok(())
    }

    /// Destroy the interface and wipe every peer's keys.
    ///
    /// The binding is kept in its closed state so later calls fail with
    /// `Closed` instead of touching a new interface.
    pub fn close_interface(&mut self) {
        if let Some(binding) = self.binding.as_mut() {
            self.interfaces.destroy_interface(binding);
        }
        if !self.keys.is_empty() {
            debug!(peers = self.keys.len(), "Wiping key slots");
            self.keys.clear();
        }
    }

    fn channel(&mut self) -> DcoResult<&mut ControlChannel> {
        self.binding
            .as_mut()
            .ok_or(DcoError::Closed)?
            .channel_mut()
    }

    fn parts(&mut self) -> DcoResult<(&mut ControlChannel, &mut KeySlotManager)> {
        let channel = self
            .binding
            .as_mut()
            .ok_or(DcoError::Closed)?
            .channel_mut()?;
        Ok((channel, &mut self.keys))
    }

    pub fn read_control(&mut self) -> DcoResult<ReadOutcome> {
        self.channel()?.read_message()
    }

    /// Send a control message to a registered peer.
    pub fn write_control(
        &mut self,
        peer_id: PeerId,
        opcode: Opcode,
        payload: &[u8],
    ) -> DcoResult<usize> {
        let (channel, keys) = self.parts()?;
        if !keys.contains(peer_id) {
            return Err(DcoError::UnknownPeer(peer_id));
        }
        channel.write_message(peer_id, opcode, payload)
    }

    /// Retry queued output after write readiness.
    pub fn flush(&mut self) -> DcoResult<usize> {
        self.channel()?.flush()
    }

    pub fn register_with_event_loop(
        &mut self,
        registrar: &dyn EventLoopRegistrar,
        token: LoopToken,
    ) -> DcoResult<()> {
        self.channel()?.register_with_event_loop(registrar, token)
    }

    pub fn token(&self) -> Option<LoopToken> {
        self.binding
            .as_ref()
            .and_then(Binding::channel)
            .and_then(ControlChannel::token)
    }

    /// Announce a peer to the kernel and start tracking its key slots.
    #[instrument(level = "info", skip(self))]
    pub fn register_peer(&mut self, peer_id: PeerId, remote: SocketAddr) -> DcoResult<()> {
        let mode = self.mode;
        let (channel, keys) = self.parts()?;
        if keys.contains(peer_id) {
            return Err(DcoError::PeerExists(peer_id));
        }
        if mode == DcoMode::PointToPoint && !keys.is_empty() {
            return Err(DcoError::PeerLimit(peer_id));
        }

        channel.write_message_all(peer_id, Opcode::NewPeer, &encode_remote(remote))?;
        keys.add_peer(peer_id)?;
        info!("Peer registered");
        Ok(())
    }

    /// Remove a peer from the kernel and wipe its key slots.
    #[instrument(level = "info", skip(self))]
    pub fn unregister_peer(&mut self, peer_id: PeerId) -> DcoResult<()> {
        let (channel, keys) = self.parts()?;
        if !keys.contains(peer_id) {
            return Err(DcoError::UnknownPeer(peer_id));
        }
        channel.write_message_all(peer_id, Opcode::DelPeer, &[])?;
        keys.remove_peer(peer_id);
        info!("Peer unregistered");
        Ok(())
    }

    pub fn peer_state(&self, peer_id: PeerId) -> Option<&PeerSlotState> {
        self.keys.get(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.keys.peer_ids().collect();
        ids.sort_unstable();
        ids
    }

    #[allow(clippy::too_many_arguments)]
    pub fn install_key(
        &mut self,
        peer_id: PeerId,
        key_id: u8,
        material: &dyn KeyMaterialSource,
        direction: InstallDirection,
        cipher: &str,
        role: Role,
    ) -> DcoResult<()> {
        let (channel, keys) = self.parts()?;
        keys.install_key(channel, peer_id, key_id, material, direction, cipher, role)
    }

    pub fn promote_or_wipe(&mut self, peer_id: PeerId, outcome: KeyOutcome) -> DcoResult<()> {
        let (channel, keys) = self.parts()?;
        keys.promote_or_wipe(channel, peer_id, outcome)
    }

    /// Messages ready on the control channel, without routing them.
    pub fn drain_events(&mut self) -> DcoResult<Drain<'_>> {
        Ok(dispatch::drain_events(self.channel()?))
    }

    /// Handle a readiness signal from the event loop.
    ///
    /// Drains and routes everything the kernel queued. Returns how many
    /// messages were routed; a token that is not ours is ignored. On a
    /// transport error the caller is expected to close the interface.
    pub fn on_readiness(
        &mut self,
        token: LoopToken,
        delivery: &mut dyn Delivery,
    ) -> DcoResult<usize> {
        if self.token() != Some(token) {
            debug!(token = %token, "Readiness for a foreign token");
            return Ok(0);
        }
        let (channel, keys) = self.parts()?;
        if channel.has_pending_output() {
            channel.flush()?;
        }
        dispatch::dispatch_ready(channel, keys, delivery)
    }
}

impl<D: LinkDriver> Drop for DcoContext<D> {
    fn drop(&mut self) {
        if self.binding.as_ref().is_some_and(Binding::is_open) {
            warn!("Offload context dropped with an open interface, tearing down");
            self.close_interface();
        }
    }
}

/// `NewPeer` payload: address family (4 or 6), address bytes, port (u16 BE).
fn encode_remote(remote: SocketAddr) -> Vec<u8> {
    let mut payload = Vec::with_capacity(19);
    match remote {
        SocketAddr::V4(addr) => {
            payload.push(4);
            payload.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            payload.push(6);
            payload.extend_from_slice(&addr.ip().octets());
        }
    }
    // Writes into a Vec cannot fail.
    let _ = payload.write_u16::<BigEndian>(remote.port());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::BidirectionalKey;
    use crate::sim::{ManualEventLoop, SimLinkDriver};
    use shared_utils::framing::MAX_PAYLOAD_SIZE;

    fn context(mode: DcoMode) -> (SimLinkDriver, DcoContext<SimLinkDriver>) {
        let driver = SimLinkDriver::new();
        let mut ctx = DcoContext::init(mode, InterfaceManager::new(driver.clone(), MAX_PAYLOAD_SIZE));
        ctx.open_interface("dco0").unwrap();
        (driver, ctx)
    }

    fn remote() -> SocketAddr {
        "198.51.100.7:1194".parse().unwrap()
    }

    #[test]
    fn test_point_to_point_single_peer() {
        let (driver, mut ctx) = context(DcoMode::PointToPoint);
        ctx.register_peer(0, remote()).unwrap();
        assert!(matches!(
            ctx.register_peer(1, remote()),
            Err(DcoError::PeerLimit(1))
        ));
        assert!(matches!(
            ctx.register_peer(0, remote()),
            Err(DcoError::PeerExists(0))
        ));

        let frames = driver.kernel("dco0").unwrap().received_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::NewPeer);
        assert_eq!(frames[0].payload, vec![4, 198, 51, 100, 7, 0x04, 0xAA]);
    }

    #[test]
    fn test_multi_peer_and_unregister() {
        let (driver, mut ctx) = context(DcoMode::MultiPeer);
        ctx.register_peer(2, remote()).unwrap();
        ctx.register_peer(1, "[2001:db8::1]:443".parse().unwrap()).unwrap();
        assert_eq!(ctx.peer_ids(), vec![1, 2]);

        ctx.unregister_peer(2).unwrap();
        assert!(ctx.peer_state(2).is_none());
        assert!(matches!(ctx.unregister_peer(2), Err(DcoError::UnknownPeer(2))));

        let opcodes = driver.kernel("dco0").unwrap().received_opcodes();
        assert_eq!(opcodes, vec![Opcode::NewPeer, Opcode::NewPeer, Opcode::DelPeer]);
    }

    #[test]
    fn test_write_to_unknown_peer() {
        let (_driver, mut ctx) = context(DcoMode::MultiPeer);
        assert!(matches!(
            ctx.write_control(5, Opcode::Packet, b"x"),
            Err(DcoError::UnknownPeer(5))
        ));
    }

    #[test]
    fn test_close_wipes_everything() {
        let (driver, mut ctx) = context(DcoMode::PointToPoint);
        let event_loop = ManualEventLoop::new();
        ctx.register_with_event_loop(&event_loop, LoopToken(3)).unwrap();
        ctx.register_peer(0, remote()).unwrap();
        let key = BidirectionalKey::new((vec![1; 32], vec![2; 8]), (vec![3; 32], vec![4; 8]));
        ctx.install_key(0, 0, &key, InstallDirection::Both, "AES-256-GCM", Role::Server)
            .unwrap();

        ctx.close_interface();
        assert!(!event_loop.is_registered(LoopToken(3)));
        assert!(ctx.peer_state(0).is_none());
        assert_eq!(driver.destroyed(), vec!["dco0".to_string()]);
        assert!(matches!(ctx.read_control(), Err(DcoError::Closed)));
        assert!(matches!(
            ctx.write_control(0, Opcode::Packet, b"x"),
            Err(DcoError::Closed)
        ));
        assert!(matches!(
            ctx.promote_or_wipe(0, KeyOutcome::Confirmed),
            Err(DcoError::Closed)
        ));
    }

    #[test]
    fn test_foreign_token_ignored() {
        let (driver, mut ctx) = context(DcoMode::PointToPoint);
        let event_loop = ManualEventLoop::new();
        ctx.register_with_event_loop(&event_loop, LoopToken(1)).unwrap();
        ctx.register_peer(0, remote()).unwrap();
        driver
            .kernel("dco0")
            .unwrap()
            .inject(Opcode::Packet, 0, b"hi");

        let mut events = Vec::new();
        assert_eq!(ctx.on_readiness(LoopToken(2), &mut events).unwrap(), 0);
        assert_eq!(ctx.on_readiness(LoopToken(1), &mut events).unwrap(), 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_drop_tears_down() {
        let driver = SimLinkDriver::new();
        {
            let mut ctx = DcoContext::init(
                DcoMode::PointToPoint,
                InterfaceManager::new(driver.clone(), MAX_PAYLOAD_SIZE),
            );
            ctx.open_interface("dco9").unwrap();
        }
        assert_eq!(driver.destroyed(), vec!["dco9".to_string()]);
        assert!(!driver.has_link("dco9"));
    }
}
