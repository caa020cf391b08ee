//! In-memory doubles for the kernel, the link driver and the event loop.
//!
//! These let the control layer run without the kernel module: the
//! simulated kernel records every frame the daemon writes, can echo them
//! back, and can be told to accept only part of a write or to fail with a
//! given errno. Compiled for unit tests and with the `sim` feature.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use shared_utils::framing::{ControlDecoder, ControlEncoder, ControlFrame, Opcode};

use crate::event::{EventLoopRegistrar, Registration};
use crate::interface::LinkDriver;
use crate::transport::ControlTransport;
use crate::types::{LoopToken, PeerId};

#[derive(Debug, Default)]
struct KernelState {
    to_daemon: VecDeque<u8>,
    from_daemon: Vec<u8>,
    echo: bool,
    write_budget: Option<usize>,
    fail_writes: Option<i32>,
    closed: bool,
}

/// Simulated kernel end of the control channel.
#[derive(Debug, Clone, Default)]
pub struct SimKernel {
    state: Rc<RefCell<KernelState>>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel that loops every written byte back to the read side.
    pub fn echoing() -> Self {
        let kernel = Self::default();
        kernel.state.borrow_mut().echo = true;
        kernel
    }

    /// Daemon-side transport sharing this kernel's buffers.
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            state: Rc::clone(&self.state),
        }
    }

    /// Queue a well-formed frame for the daemon to read.
    pub fn inject(&self, opcode: Opcode, peer_id: PeerId, payload: &[u8]) {
        let frame = ControlFrame::new(opcode, peer_id, payload.to_vec())
            .unwrap_or_else(|e| panic!("test frame rejected: {e}"));
        self.inject_raw(&ControlEncoder::new().encode(&frame));
    }

    /// Queue arbitrary bytes for the daemon to read.
    pub fn inject_raw(&self, bytes: &[u8]) {
        self.state.borrow_mut().to_daemon.extend(bytes.iter().copied());
    }

    /// Frames fully written by the daemon so far.
    pub fn received_frames(&self) -> Vec<ControlFrame> {
        let mut decoder = ControlDecoder::new();
        decoder.feed(&self.state.borrow().from_daemon);
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = decoder.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Opcodes of [`SimKernel::received_frames`], in order.
    pub fn received_opcodes(&self) -> Vec<Opcode> {
        self.received_frames().iter().map(|f| f.opcode).collect()
    }

    /// Limit how many bytes the next writes accept in total; `None` lifts it.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().write_budget = budget;
    }

    /// Make writes fail with `errno`; `None` restores them.
    pub fn fail_writes_with(&self, errno: Option<i32>) {
        self.state.borrow_mut().fail_writes = errno;
    }

    pub fn pending_for_daemon(&self) -> usize {
        self.state.borrow().to_daemon.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

/// Daemon end of a [`SimKernel`].
#[derive(Debug)]
pub struct SimTransport {
    state: Rc<RefCell<KernelState>>,
}

impl ControlTransport for SimTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if state.to_daemon.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.to_daemon.len());
        for (slot, byte) in buf.iter_mut().zip(state.to_daemon.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if let Some(errno) = state.fail_writes {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let n = match state.write_budget {
            Some(budget) => buf.len().min(budget),
            None => buf.len(),
        };
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= n;
        }
        state.from_daemon.extend_from_slice(&buf[..n]);
        if state.echo {
            state.to_daemon.extend(buf[..n].iter().copied());
        }
        Ok(n)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.to_daemon.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DriverState {
    links: HashSet<String>,
    kernels: HashMap<String, SimKernel>,
    destroyed: Vec<String>,
    echo: bool,
    fail_create: Option<i32>,
    fail_open: Option<i32>,
}

/// Link driver that keeps links in memory and hands out [`SimKernel`]s.
#[derive(Debug, Clone, Default)]
pub struct SimLinkDriver {
    state: Rc<RefCell<DriverState>>,
}

impl SimLinkDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control channels opened by this driver echo their writes.
    pub fn echoing() -> Self {
        let driver = Self::default();
        driver.state.borrow_mut().echo = true;
        driver
    }

    /// Kernel behind the control channel of `name`, once opened.
    pub fn kernel(&self, name: &str) -> Option<SimKernel> {
        self.state.borrow().kernels.get(name).cloned()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.borrow().links.contains(name)
    }

    /// Links removed through `destroy_link`, in order.
    pub fn destroyed(&self) -> Vec<String> {
        self.state.borrow().destroyed.clone()
    }

    pub fn fail_create_with(&self, errno: Option<i32>) {
        self.state.borrow_mut().fail_create = errno;
    }

    pub fn fail_open_with(&self, errno: Option<i32>) {
        self.state.borrow_mut().fail_open = errno;
    }
}

impl LinkDriver for SimLinkDriver {
    fn create_link(&mut self, name: &str) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.fail_create {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if !state.links.insert(name.to_string()) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        Ok(())
    }

    fn open_control(&mut self, name: &str) -> io::Result<Box<dyn ControlTransport>> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.fail_open {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let kernel = if state.echo {
            SimKernel::echoing()
        } else {
            SimKernel::new()
        };
        let transport = kernel.transport();
        state.kernels.insert(name.to_string(), kernel);
        Ok(Box::new(transport))
    }

    fn destroy_link(&mut self, name: &str) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.links.remove(name);
        state.destroyed.push(name.to_string());
        Ok(())
    }
}

/// Event loop double: records which tokens are registered.
#[derive(Debug, Clone, Default)]
pub struct ManualEventLoop {
    registered: Rc<RefCell<HashMap<LoopToken, Option<RawFd>>>>,
}

impl ManualEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, token: LoopToken) -> bool {
        self.registered.borrow().contains_key(&token)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.borrow().len()
    }
}

struct ManualRegistration {
    token: LoopToken,
    registered: Rc<RefCell<HashMap<LoopToken, Option<RawFd>>>>,
}

impl Registration for ManualRegistration {
    fn token(&self) -> LoopToken {
        self.token
    }
}

impl Drop for ManualRegistration {
    fn drop(&mut self) {
        self.registered.borrow_mut().remove(&self.token);
    }
}

impl EventLoopRegistrar for ManualEventLoop {
    fn register(&self, fd: Option<RawFd>, token: LoopToken) -> io::Result<Box<dyn Registration>> {
        let mut registered = self.registered.borrow_mut();
        if registered.contains_key(&token) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        registered.insert(token, fd);
        Ok(Box::new(ManualRegistration {
            token,
            registered: Rc::clone(&self.registered),
        }))
    }
}
