//! Runtime choice between kernel offload and the user-space data channel.
//!
//! [`Offload::select`] looks at the probe result and the options once at
//! startup. The disabled variant answers every lifecycle call as a no-op so
//! the daemon drives both variants through the same calls.

use std::net::SocketAddr;
use tracing::{info, warn};

use shared_utils::config::{Config, OffloadMode};
use shared_utils::framing::Opcode;

use crate::availability::{
    check_conflicts, probe_availability, ConfigurationReader, ConflictReport, ConflictSeverity,
};
use crate::channel::ReadOutcome;
use crate::context::DcoContext;
use crate::dispatch::Delivery;
use crate::error::{DcoError, DcoResult};
use crate::event::EventLoopRegistrar;
use crate::interface::{InterfaceManager, LinkDriver, LinuxLinkDriver};
use crate::keys::KeyMaterialSource;
use crate::types::{InstallDirection, KeyOutcome, LoopToken, PeerId, Role};

/// Why the data channel stays in user space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisabledReason {
    /// `offload = "disabled"` in the configuration
    ByConfig,
    /// Kernel module not present
    NotAvailable,
    /// An option rules offload out
    Conflict(ConflictReport),
}

/// Offload facade selected at startup.
pub enum Offload<D: LinkDriver = LinuxLinkDriver> {
    Enabled(DcoContext<D>),
    Disabled(DisabledReason),
}

impl<D: LinkDriver> Offload<D> {
    /// Pick the variant for this instance.
    ///
    /// Fails only when offload is required and cannot be provided.
    pub fn select(
        config: &dyn ConfigurationReader,
        available: bool,
        interfaces: InterfaceManager<D>,
    ) -> DcoResult<Self> {
        let required = config.offload_mode() == OffloadMode::Required;
        if config.offload_mode() == OffloadMode::Disabled {
            info!("Data channel offload disabled by configuration");
            return Ok(Offload::Disabled(DisabledReason::ByConfig));
        }
        if !available {
            if required {
                return Err(DcoError::CapabilityAbsent);
            }
            return Ok(Offload::Disabled(DisabledReason::NotAvailable));
        }
        if let Some(report) = check_conflicts(config) {
            if report.severity == ConflictSeverity::Abort {
                return Err(report.into_error());
            }
            warn!(
                option = %report.option,
                message = %report.message,
                "Falling back to user-space data channel"
            );
            return Ok(Offload::Disabled(DisabledReason::Conflict(report)));
        }

        let mode = config.instance_mode().into();
        Ok(Offload::Enabled(DcoContext::init(mode, interfaces)))
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Offload::Enabled(_))
    }

    pub fn context(&self) -> Option<&DcoContext<D>> {
        match self {
            Offload::Enabled(ctx) => Some(ctx),
            Offload::Disabled(_) => None,
        }
    }

    pub fn context_mut(&mut self) -> Option<&mut DcoContext<D>> {
        match self {
            Offload::Enabled(ctx) => Some(ctx),
            Offload::Disabled(_) => None,
        }
    }

    pub fn disabled_reason(&self) -> Option<&DisabledReason> {
        match self {
            Offload::Enabled(_) => None,
            Offload::Disabled(reason) => Some(reason),
        }
    }

    /// Create the offload interface.
    ///
    /// A transport error here is the one failure that should stop the
    /// daemon (see [`DcoError::is_startup_fatal`]).
    pub fn open_interface(&mut self, name: &str) -> DcoResult<()> {
        match self {
            Offload::Enabled(ctx) => ctx.open_interface(name),
            Offload::Disabled(_) => Ok(()),
        }
    }

    pub fn close_interface(&mut self) {
        if let Offload::Enabled(ctx) = self {
            ctx.close_interface();
        }
    }

    pub fn register_with_event_loop(
        &mut self,
        registrar: &dyn EventLoopRegistrar,
        token: LoopToken,
    ) -> DcoResult<()> {
        match self {
            Offload::Enabled(ctx) => ctx.register_with_event_loop(registrar, token),
            Offload::Disabled(_) => Ok(()),
        }
    }

    pub fn register_peer(&mut self, peer_id: PeerId, remote: SocketAddr) -> DcoResult<()> {
        match self {
            Offload::Enabled(ctx) => ctx.register_peer(peer_id, remote),
            Offload::Disabled(_) => Ok(()),
        }
    }

    pub fn unregister_peer(&mut self, peer_id: PeerId) -> DcoResult<()> {
        match self {
            Offload::Enabled(ctx) => ctx.unregister_peer(peer_id),
            Offload::Disabled(_) => Ok(()),
        }
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
        match self {
            Offload::Enabled(ctx) => {
                ctx.install_key(peer_id, key_id, material, direction, cipher, role)
            }
            Offload::Disabled(_) => Ok(()),
        }
    }

    pub fn promote_or_wipe(&mut self, peer_id: PeerId, outcome: KeyOutcome) -> DcoResult<()> {
        match self {
            Offload::Enabled(ctx) => ctx.promote_or_wipe(peer_id, outcome),
            Offload::Disabled(_) => Ok(()),
        }
    }

    /// Without offload there is never anything to read.
    pub fn read_control(&mut self) -> DcoResult<ReadOutcome> {
        match self {
            Offload::Enabled(ctx) => ctx.read_control(),
            Offload::Disabled(_) => Ok(ReadOutcome::WouldBlock),
        }
    }

    /// Without offload there is no kernel to write to.
    pub fn write_control(
        &mut self,
        peer_id: PeerId,
        opcode: Opcode,
        payload: &[u8],
    ) -> DcoResult<usize> {
        match self {
            Offload::Enabled(ctx) => ctx.write_control(peer_id, opcode, payload),
            Offload::Disabled(_) => Err(DcoError::CapabilityAbsent),
        }
    }

    pub fn on_readiness(
        &mut self,
        token: LoopToken,
        delivery: &mut dyn Delivery,
    ) -> DcoResult<usize> {
        match self {
            Offload::Enabled(ctx) => ctx.on_readiness(token, delivery),
            Offload::Disabled(_) => Ok(0),
        }
    }
}

impl Offload<LinuxLinkDriver> {
    /// Probe the host and select using the daemon configuration.
    pub fn from_config(config: &Config) -> DcoResult<Self> {
        let available = probe_availability(config.dco.module_paths.as_slice());
        let driver = LinuxLinkDriver::new(&config.dco.control_node);
        Offload::select(
            config,
            available,
            InterfaceManager::new(driver, config.dco.max_payload),
        )
    }
}

impl<D: LinkDriver> std::fmt::Debug for Offload<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Offload::Enabled(ctx) => f.debug_tuple("Enabled").field(&ctx.mode()).finish(),
            Offload::Disabled(reason) => f.debug_tuple("Disabled").field(reason).finish(),
        }
    }
}
