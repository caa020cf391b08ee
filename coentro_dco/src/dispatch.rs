//! Peer dispatch.
//!
//! Drains whatever the kernel has queued on a control channel and routes
//! each message by opcode and peer id: key notifications go to the key slot
//! manager, everything else to the daemon through [`Delivery`].

use tracing::{debug, warn};

use shared_utils::framing::Opcode;

use crate::channel::{ControlChannel, ControlMessage, ReadOutcome};
use crate::error::{DcoError, DcoResult};
use crate::keys::{KeyNotice, KeySlotManager};
use crate::types::PeerId;

/// Lazy iterator over the messages ready on a channel.
///
/// Ends at `WouldBlock`; calling [`drain_events`] again after the next
/// readiness signal picks up where this one stopped. A malformed frame is
/// yielded as an error and draining continues; a transport error is
/// yielded once and ends the iterator.
pub struct Drain<'a> {
    channel: &'a mut ControlChannel,
    done: bool,
}

pub fn drain_events(channel: &mut ControlChannel) -> Drain<'_> {
    Drain {
        channel,
        done: false,
    }
}

impl Iterator for Drain<'_> {
    type Item = DcoResult<ControlMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.channel.read_message() {
            Ok(ReadOutcome::Message(msg)) => Some(Ok(msg)),
            Ok(ReadOutcome::WouldBlock) => {
                self.done = true;
                None
            }
            Err(e) => {
                if e.is_fatal_to_interface() {
                    self.done = true;
                }
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for Drain<'_> {}

/// Kernel notification handed to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Control packet or any other peer-addressed message
    Message {
        peer_id: PeerId,
        opcode: Opcode,
        payload: Vec<u8>,
    },
    /// The kernel removed the peer; its key slots are gone
    PeerDeleted { peer_id: PeerId, reason: u8 },
    /// The active key is about to expire
    RekeyRequested { peer_id: PeerId },
}

/// Daemon-side sink for dispatched events.
pub trait Delivery {
    fn deliver(&mut self, event: DispatchEvent);
}

impl Delivery for Vec<DispatchEvent> {
    fn deliver(&mut self, event: DispatchEvent) {
        self.push(event);
    }
}

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Consumed by the key slot manager
    KeySlots,
    /// Handed to the daemon
    Delivered,
    /// Logged and discarded
    Dropped,
}

/// Route one message by opcode and peer id.
pub fn route(
    msg: ControlMessage,
    keys: &mut KeySlotManager,
    delivery: &mut dyn Delivery,
) -> Routed {
    let peer_id = msg.peer_id;
    if !keys.contains(peer_id) {
        warn!(peer_id, opcode = ?msg.opcode, "Dropping message for unknown peer");
        return Routed::Dropped;
    }

    if msg.opcode.is_key_op() {
        return match keys.on_kernel_message(&msg) {
            Ok(KeyNotice::RekeyRequested) => {
                delivery.deliver(DispatchEvent::RekeyRequested { peer_id });
                Routed::KeySlots
            }
            Ok(KeyNotice::Acknowledged(_)) => Routed::KeySlots,
            Err(e) => {
                warn!(peer_id, error = %e, "Key notification rejected");
                Routed::Dropped
            }
        };
    }

    match msg.opcode {
        Opcode::PeerDeleted => {
            let reason = msg.payload.first().copied().unwrap_or(0);
            keys.remove_peer(peer_id);
            debug!(peer_id, reason, "Kernel deleted peer");
            delivery.deliver(DispatchEvent::PeerDeleted { peer_id, reason });
        }
        opcode => {
            debug!(peer_id, opcode = ?opcode, len = msg.payload.len(), "Delivering message");
            delivery.deliver(DispatchEvent::Message {
                peer_id,
                opcode,
                payload: msg.payload,
            });
        }
    }
    Routed::Delivered
}

/// Drain `channel` and route everything ready.
///
/// Returns how many messages reached the key slots or the daemon; dropped
/// ones are not counted. Malformed frames are logged and skipped. A
/// transport error stops the drain and is returned; the count of routed
/// messages is lost with it.
pub fn dispatch_ready(
    channel: &mut ControlChannel,
    keys: &mut KeySlotManager,
    delivery: &mut dyn Delivery,
) -> DcoResult<usize> {
    let mut routed = 0;
    for item in drain_events(channel) {
        match item {
            Ok(msg) => {
                if route(msg, keys, delivery) != Routed::Dropped {
                    routed += 1;
                }
            }
            Err(e) if e.is_fatal_to_interface() => return Err(e),
            Err(DcoError::Framing(e)) => {
                warn!(error = %e, "Dropping malformed control frame");
            }
            Err(e) => warn!(error = %e, "Control read failed"),
        }
    }
    Ok(routed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;
    use shared_utils::framing::MAX_PAYLOAD_SIZE;

    fn setup() -> (SimKernel, ControlChannel, KeySlotManager) {
        let kernel = SimKernel::new();
        let channel = ControlChannel::new(Box::new(kernel.transport()), MAX_PAYLOAD_SIZE);
        let mut keys = KeySlotManager::new();
        keys.add_peer(1).unwrap();
        (kernel, channel, keys)
    }

    #[test]
    fn test_drain_stops_at_would_block_and_restarts() {
        let (kernel, mut ch, _keys) = setup();
        kernel.inject(Opcode::Packet, 1, b"a");
        kernel.inject(Opcode::Packet, 1, b"b");

        let first: Vec<_> = drain_events(&mut ch).collect();
        assert_eq!(first.len(), 2);

        kernel.inject(Opcode::Packet, 1, b"c");
        let again: Vec<_> = drain_events(&mut ch).map(|m| m.unwrap().payload).collect();
        assert_eq!(again, vec![b"c".to_vec()]);
    }

    #[test]
    fn test_drain_continues_after_malformed_frame() {
        let (kernel, mut ch, _keys) = setup();
        kernel.inject_raw(&[0xFF]);
        let items: Vec<_> = drain_events(&mut ch).collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(DcoError::Framing(_))));

        kernel.inject(Opcode::Packet, 1, b"ok");
        assert_eq!(drain_events(&mut ch).count(), 1);
    }

    #[test]
    fn test_route_by_opcode() {
        let (kernel, mut ch, mut keys) = setup();
        kernel.inject(Opcode::Packet, 1, b"ctl");
        kernel.inject(Opcode::KeyExpired, 1, &[0]);
        kernel.inject(Opcode::Packet, 42, b"stray");
        kernel.inject(Opcode::PeerDeleted, 1, &[3]);

        let mut events = Vec::new();
        // The stray message for peer 42 is read but not counted.
        assert_eq!(dispatch_ready(&mut ch, &mut keys, &mut events).unwrap(), 3);
        assert_eq!(
            events,
            vec![
                DispatchEvent::Message {
                    peer_id: 1,
                    opcode: Opcode::Packet,
                    payload: b"ctl".to_vec(),
                },
                DispatchEvent::RekeyRequested { peer_id: 1 },
                DispatchEvent::PeerDeleted {
                    peer_id: 1,
                    reason: 3
                },
            ]
        );
        assert!(!keys.contains(1));
    }

    #[test]
    fn test_unknown_peer_is_dropped() {
        let (_kernel, _ch, mut keys) = setup();
        let msg = ControlMessage::new(Opcode::Packet, 9, vec![1]).unwrap();
        let mut events = Vec::new();
        assert_eq!(route(msg, &mut keys, &mut events), Routed::Dropped);
        assert!(events.is_empty());
    }
}
