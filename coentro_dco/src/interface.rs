//! Interface lifecycle.
//!
//! A [`Binding`] ties a kernel tunnel interface to the control channel
//! opened for it. It moves `Uncreated -> Open -> Closed`; `Closed` is
//! terminal and every channel operation on it fails with `Closed`.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::ControlChannel;
use crate::error::{DcoError, DcoResult};
use crate::transport::{ControlTransport, FdTransport};

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Platform mechanics for creating links and reaching their control node.
pub trait LinkDriver {
    /// Create the kernel tunnel object named `name`.
    fn create_link(&mut self, name: &str) -> io::Result<()>;

    /// Open the non-blocking control transport for `name`.
    fn open_control(&mut self, name: &str) -> io::Result<Box<dyn ControlTransport>>;

    /// Remove the kernel tunnel object named `name`.
    fn destroy_link(&mut self, name: &str) -> io::Result<()>;
}

/// Linux driver: links through `ip link`, control through a device node.
#[derive(Debug, Clone)]
pub struct LinuxLinkDriver {
    control_node: PathBuf,
}

impl LinuxLinkDriver {
    pub fn new<P: AsRef<Path>>(control_node: P) -> Self {
        LinuxLinkDriver {
            control_node: control_node.as_ref().to_path_buf(),
        }
    }

    fn run_ip(&self, args: &[&str]) -> io::Result<()> {
        debug!(?args, "running ip command");
        let output = Command::new("ip").args(args).output()?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("File exists") {
            Err(io::Error::from_raw_os_error(libc::EEXIST))
        } else if stderr.contains("Operation not permitted") {
            Err(io::Error::from_raw_os_error(libc::EPERM))
        } else if stderr.contains("Cannot find device") {
            Err(io::Error::from_raw_os_error(libc::ENODEV))
        } else {
            Err(io::Error::other(format!("ip {}: {}", args.join(" "), stderr)))
        }
    }
}

impl LinkDriver for LinuxLinkDriver {
    fn create_link(&mut self, name: &str) -> io::Result<()> {
        self.run_ip(&["link", "add", "dev", name, "type", "ovpn-dco"])
    }

    fn open_control(&mut self, _name: &str) -> io::Result<Box<dyn ControlTransport>> {
        Ok(Box::new(FdTransport::open_node(&self.control_node)?))
    }

    fn destroy_link(&mut self, name: &str) -> io::Result<()> {
        self.run_ip(&["link", "del", "dev", name])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Uncreated,
    Open,
    Closed,
}

/// A created interface and its control channel.
pub struct Binding {
    name: String,
    state: InterfaceState,
    channel: Option<ControlChannel>,
    link_created: bool,
}

impl Binding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InterfaceState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == InterfaceState::Open
    }

    /// Control channel of an open binding.
    pub fn channel_mut(&mut self) -> DcoResult<&mut ControlChannel> {
        match (self.state, self.channel.as_mut()) {
            (InterfaceState::Open, Some(channel)) if !channel.is_closed() => Ok(channel),
            _ => Err(DcoError::Closed),
        }
    }

    pub fn channel(&self) -> Option<&ControlChannel> {
        self.channel.as_ref().filter(|_| self.is_open())
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("link_created", &self.link_created)
            .finish()
    }
}

/// Creates and destroys offload interfaces through a [`LinkDriver`].
#[derive(Debug)]
pub struct InterfaceManager<D: LinkDriver> {
    driver: D,
    live: HashSet<String>,
    max_payload: usize,
}

impl<D: LinkDriver> InterfaceManager<D> {
    pub fn new(driver: D, max_payload: usize) -> Self {
        InterfaceManager {
            driver,
            live: HashSet::new(),
            max_payload,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.contains(name)
    }

    /// Create the kernel interface `name` and open its control channel.
    ///
    /// A half-finished create is undone before the error is returned.
    #[instrument(level = "info", skip(self))]
    pub fn create_interface(&mut self, name: &str) -> DcoResult<Binding> {
        validate_name(name)?;
        if self.live.contains(name) {
            return Err(DcoError::AlreadyExists(name.to_string()));
        }

        if let Err(e) = self.driver.create_link(name) {
            if e.raw_os_error() == Some(libc::EEXIST) {
                return Err(DcoError::AlreadyExists(name.to_string()));
            }
            error!(error = %e, "Failed to create offload interface");
            return Err(DcoError::transport("create", &e));
        }

        let transport = match self.driver.open_control(name) {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "Failed to open control channel");
                if let Err(cleanup) = self.driver.destroy_link(name) {
                    warn!(error = %cleanup, "Failed to remove half-created interface");
                }
                return Err(DcoError::transport("open", &e));
            }
        };

        self.live.insert(name.to_string());
        info!("Offload interface created");
        Ok(Binding {
            name: name.to_string(),
            state: InterfaceState::Open,
            channel: Some(ControlChannel::new(transport, self.max_payload)),
            link_created: true,
        })
    }

    /// Tear `binding` down. Safe to call any number of times.
    ///
    /// Unread frames are discarded and the event loop registration is
    /// dropped before the link is removed.
    #[instrument(level = "info", skip(self, binding), fields(name = %binding.name))]
    pub fn destroy_interface(&mut self, binding: &mut Binding) {
        if binding.state == InterfaceState::Closed {
            debug!("Interface already closed");
            return;
        }

        if let Some(channel) = binding.channel.as_mut() {
            channel.close();
        }
        binding.channel = None;

        if binding.link_created {
            if let Err(e) = self.driver.destroy_link(&binding.name) {
                warn!(error = %e, "Failed to remove offload interface");
            }
            binding.link_created = false;
        }

        self.live.remove(&binding.name);
        binding.state = InterfaceState::Closed;
        info!("Offload interface destroyed");
    }
}

/// Reject names the kernel would refuse.
pub fn validate_name(name: &str) -> DcoResult<()> {
    if name.is_empty()
        || name.len() > MAX_IFNAME_LEN
        || name.contains('/')
        || name.chars().any(char::is_whitespace)
    {
        return Err(DcoError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimLinkDriver;
    use shared_utils::framing::{Opcode, MAX_PAYLOAD_SIZE};

    fn manager() -> (SimLinkDriver, InterfaceManager<SimLinkDriver>) {
        let driver = SimLinkDriver::new();
        (driver.clone(), InterfaceManager::new(driver, MAX_PAYLOAD_SIZE))
    }

    #[test]
    fn test_create_twice_fails() {
        let (driver, mut mgr) = manager();
        let binding = mgr.create_interface("dco0").unwrap();
        assert!(binding.is_open());
        assert!(driver.has_link("dco0"));

        assert!(matches!(
            mgr.create_interface("dco0"),
            Err(DcoError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_name_validation() {
        let (_driver, mut mgr) = manager();
        for bad in ["", "this-name-is-too-long", "a/b", "dco 0"] {
            assert!(
                matches!(mgr.create_interface(bad), Err(DcoError::InvalidName(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_open_failure_cleans_up() {
        let (driver, mut mgr) = manager();
        driver.fail_open_with(Some(libc::ENOENT));

        let err = mgr.create_interface("dco1").unwrap_err();
        assert_eq!(err.code(), -libc::ENOENT);
        assert!(err.is_startup_fatal());
        assert!(!driver.has_link("dco1"));
        assert!(!mgr.is_live("dco1"));
    }

    #[test]
    fn test_create_failure_is_transport() {
        let (driver, mut mgr) = manager();
        driver.fail_create_with(Some(libc::EPERM));
        let err = mgr.create_interface("dco2").unwrap_err();
        assert_eq!(err.code(), -libc::EPERM);
    }

    #[test]
    fn test_destroy_is_idempotent_and_closes() {
        let (driver, mut mgr) = manager();
        let mut binding = mgr.create_interface("dco0").unwrap();
        let kernel = driver.kernel("dco0").unwrap();
        kernel.inject(Opcode::Packet, 1, b"unread");

        mgr.destroy_interface(&mut binding);
        mgr.destroy_interface(&mut binding);

        assert_eq!(binding.state(), InterfaceState::Closed);
        assert_eq!(driver.destroyed(), vec!["dco0".to_string()]);
        assert!(kernel.is_closed());
        assert!(matches!(binding.channel_mut(), Err(DcoError::Closed)));

        // The name is free again.
        mgr.create_interface("dco0").unwrap();
    }
}
