//! Data channel offload control layer for CoentroVPN.
//!
//! With offload the kernel encrypts and decrypts tunnel packets; the daemon
//! keeps only the control work. This crate is that control work: it checks
//! whether offload can be used, creates the kernel interface, pushes key
//! material for each peer, and routes kernel notifications back to the
//! daemon through its event loop.
//!
//! ```no_run
//! use coentro_dco::{Offload, TokioEventLoop, LoopToken};
//! use shared_utils::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let _log_guard = shared_utils::logging::init_logging_from_config(&config);
//!
//! let mut offload = Offload::from_config(&config)?;
//! offload.open_interface("coentro-dco0")?;
//!
//! let (event_loop, _ready) = TokioEventLoop::new();
//! offload.register_with_event_loop(&event_loop, LoopToken(0))?;
//! # Ok(())
//! # }
//! ```

pub mod availability;
pub mod channel;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod interface;
pub mod keys;
pub mod offload;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod transport;
pub mod types;

pub use availability::{
    check_conflicts, probe_availability, ConfigurationReader, ConflictReport, ConflictSeverity,
};
pub use channel::{ControlChannel, ControlMessage, ReadOutcome};
pub use context::DcoContext;
pub use dispatch::{drain_events, route, Delivery, DispatchEvent, Routed};
pub use error::{status, DcoError, DcoResult, ErrorClass};
pub use event::{EventLoopRegistrar, Registration, TokioEventLoop};
pub use interface::{Binding, InterfaceManager, InterfaceState, LinkDriver, LinuxLinkDriver};
pub use keys::{BidirectionalKey, KeyMaterialSource, KeySlot, KeySlotManager, PeerSlotState};
pub use offload::{DisabledReason, Offload};
pub use transport::{ControlTransport, FdTransport};
pub use types::{
    DcoCipher, DcoMode, InstallDirection, KeyDirection, KeyOutcome, LoopToken, PeerId, Role,
    SlotKind,
};
