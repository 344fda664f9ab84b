//! In-memory collaborators for tests.
//!
//! `FakeTunnel` stands in for a running OpenVPN process and its management
//! interface: the recording runner "executes" OpenVPN by replaying a script
//! of state events and then blocking until the management interface is
//! asked to disconnect.

use crate::management::{ManagementInterface, ManagementStarter};
use crate::obfsproxy::{Obfsproxy, ObfsproxyLauncher};
use crate::platform::PlatformHooks;
use crate::shell::{CommandRunner, ExecError};
use crate::state::{StateInfo, VpnState};
use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds, panicking after a few seconds
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Latch
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LatchState {
    closed: bool,
    waiting: bool,
}

/// Holds threads at a fixed point until released
#[derive(Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl Latch {
    /// Make the next `pass` block
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    pub fn release(&self) {
        self.state.lock().unwrap().closed = false;
        self.changed.notify_all();
    }

    /// Block while the latch is closed
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        while state.closed {
            state.waiting = true;
            self.changed.notify_all();
            state = self.changed.wait(state).unwrap();
        }
        state.waiting = false;
    }

    /// Block until some thread is held by the latch
    pub fn wait_until_held(&self) {
        let deadline = Instant::now() + TIMEOUT;
        let mut state = self.state.lock().unwrap();
        while !state.waiting {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "timed out waiting for latch");
            state = self.changed.wait_timeout(state, left).unwrap().0;
        }
    }
}

// ---------------------------------------------------------------------------
// OpenVPN process + management interface
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TunnelInner {
    events: Option<Sender<StateInfo>>,
    script: Vec<StateInfo>,
    routes: Vec<String>,
    fail_start: bool,
    running: bool,
    exit_requested: bool,
    starts: usize,
    stops: usize,
    disconnects: usize,
}

/// Simulated OpenVPN process and management interface
#[derive(Default)]
pub struct FakeTunnel {
    inner: Mutex<TunnelInner>,
    changed: Condvar,
    /// Passed at the top of `ManagementStarter::start`
    pub start_latch: Latch,
    /// Passed at the top of `ManagementInterface::listen_address`
    pub listen_latch: Latch,
}

impl FakeTunnel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events the process reports once it runs
    pub fn script(&self, events: Vec<StateInfo>) {
        self.inner.lock().unwrap().script = events;
    }

    /// Route-add commands the management interface reports
    pub fn routes(&self, routes: &[&str]) {
        self.inner.lock().unwrap().routes = routes.iter().map(|r| r.to_string()).collect();
    }

    /// Make the management listener fail to start
    pub fn fail_start(&self) {
        self.inner.lock().unwrap().fail_start = true;
    }

    pub fn starts(&self) -> usize {
        self.inner.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.inner.lock().unwrap().stops
    }

    pub fn disconnects(&self) -> usize {
        self.inner.lock().unwrap().disconnects
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    /// Block until the simulated OpenVPN process is running
    pub fn wait_until_running(&self) {
        let deadline = Instant::now() + TIMEOUT;
        let mut inner = self.inner.lock().unwrap();
        while !inner.running {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "timed out waiting for OpenVPN to run");
            inner = self.changed.wait_timeout(inner, left).unwrap().0;
        }
    }

    /// Body of the simulated OpenVPN process
    fn run(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = true;
        if let Some(events) = &inner.events {
            for event in &inner.script {
                let _ = events.send(event.clone());
            }
        }
        self.changed.notify_all();

        while !inner.exit_requested {
            inner = self.changed.wait(inner).unwrap();
        }
        inner.running = false;
    }

    /// Management listener handle for this tunnel
    pub fn starter(self: &Arc<Self>) -> Arc<FakeStarter> {
        Arc::new(FakeStarter {
            tunnel: self.clone(),
        })
    }
}

pub struct FakeStarter {
    tunnel: Arc<FakeTunnel>,
}

impl ManagementStarter for FakeStarter {
    fn start(
        &self,
        _username: &str,
        _password: &str,
        events: Sender<StateInfo>,
    ) -> anyhow::Result<Arc<dyn ManagementInterface>> {
        self.tunnel.start_latch.pass();

        let mut inner = self.tunnel.inner.lock().unwrap();
        if inner.fail_start {
            anyhow::bail!("address already in use");
        }
        inner.starts += 1;
        inner.events = Some(events);
        Ok(Arc::new(FakeManagement {
            tunnel: self.tunnel.clone(),
        }))
    }
}

struct FakeManagement {
    tunnel: Arc<FakeTunnel>,
}

impl ManagementInterface for FakeManagement {
    fn listen_address(&self) -> anyhow::Result<(IpAddr, u16)> {
        self.tunnel.listen_latch.pass();
        Ok((IpAddr::V4(Ipv4Addr::LOCALHOST), 7505))
    }

    fn stop(&self) -> anyhow::Result<()> {
        let mut inner = self.tunnel.inner.lock().unwrap();
        inner.stops += 1;
        inner.events = None;
        Ok(())
    }

    fn send_disconnect(&self) -> anyhow::Result<()> {
        let mut inner = self.tunnel.inner.lock().unwrap();
        inner.disconnects += 1;
        if let Some(events) = &inner.events {
            let _ = events.send(StateInfo::new(VpnState::Disconnected));
        }
        inner.exit_requested = true;
        self.tunnel.changed.notify_all();
        Ok(())
    }

    fn route_add_commands(&self) -> Vec<String> {
        self.tunnel.inner.lock().unwrap().routes.clone()
    }
}

// ---------------------------------------------------------------------------
// Command runner
// ---------------------------------------------------------------------------

/// Records every execution; the configured OpenVPN binary runs a `FakeTunnel`
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    failing: Mutex<HashSet<String>>,
    tunnel: Mutex<Option<(String, Arc<FakeTunnel>)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tunnel` whenever `binary` is executed
    pub fn with_tunnel(binary: &str, tunnel: Arc<FakeTunnel>) -> Self {
        let runner = Self::new();
        *runner.tunnel.lock().unwrap() = Some((binary.to_string(), tunnel));
        runner
    }

    /// Make every execution of `program` fail
    pub fn fail_program(&self, program: &str) {
        self.failing.lock().unwrap().insert(program.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Argument lists of every execution of `program`, in order
    pub fn args_of(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args)
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn exec(&self, program: &str, args: &[String]) -> Result<(), ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        if self.failing.lock().unwrap().contains(program) {
            return Err(ExecError::Io(std::io::Error::other(format!("{} failed", program))));
        }

        let tunnel = match &*self.tunnel.lock().unwrap() {
            Some((binary, tunnel)) if binary == program => Some(tunnel.clone()),
            _ => None,
        };
        if let Some(tunnel) = tunnel {
            tunnel.run();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Obfsproxy
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ObfsInner {
    fail_start: bool,
    exited: bool,
    starts: usize,
    stops: usize,
}

/// Simulated obfsproxy process
#[derive(Default)]
pub struct FakeObfsproxy {
    inner: Mutex<ObfsInner>,
    changed: Condvar,
}

impl FakeObfsproxy {
    pub const PORT: u16 = 5050;

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let proxy = Self::default();
        proxy.inner.lock().unwrap().fail_start = true;
        Arc::new(proxy)
    }

    /// Simulate the process dying on its own
    pub fn crash(&self) {
        self.inner.lock().unwrap().exited = true;
        self.changed.notify_all();
    }

    pub fn starts(&self) -> usize {
        self.inner.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.inner.lock().unwrap().stops
    }
}

impl Obfsproxy for FakeObfsproxy {
    fn start(&self) -> anyhow::Result<u16> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_start {
            anyhow::bail!("obfsproxy binary not found");
        }
        inner.starts += 1;
        Ok(Self::PORT)
    }

    fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stops += 1;
        inner.exited = true;
        self.changed.notify_all();
    }

    fn wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.exited {
            inner = self.changed.wait(inner).unwrap();
        }
    }
}

/// Hands out a single pre-built `FakeObfsproxy`
pub struct FakeLauncher {
    proxy: Arc<FakeObfsproxy>,
    scripts: Mutex<Vec<PathBuf>>,
}

impl FakeLauncher {
    pub fn new(proxy: Arc<FakeObfsproxy>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            scripts: Mutex::new(Vec::new()),
        })
    }

    pub fn scripts(&self) -> Vec<PathBuf> {
        self.scripts.lock().unwrap().clone()
    }
}

impl ObfsproxyLauncher for FakeLauncher {
    fn create(&self, start_script: &Path) -> Arc<dyn Obfsproxy> {
        self.scripts.lock().unwrap().push(start_script.to_path_buf());
        self.proxy.clone()
    }
}

// ---------------------------------------------------------------------------
// Platform hooks
// ---------------------------------------------------------------------------

/// Counts hook invocations
#[derive(Default)]
pub struct RecordingHooks {
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub paused: AtomicUsize,
    pub resumed: AtomicUsize,
    pub fail_pause: bool,
    pub disconnect_delay: Duration,
}

impl RecordingHooks {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl PlatformHooks for RecordingHooks {
    fn on_connected(&self) -> anyhow::Result<()> {
        self.connected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_disconnected(&self) -> anyhow::Result<()> {
        thread::sleep(self.disconnect_delay);
        self.disconnected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_pause(&self) -> anyhow::Result<()> {
        self.paused.fetch_add(1, Ordering::SeqCst);
        if self.fail_pause {
            anyhow::bail!("cannot restore default DNS");
        }
        Ok(())
    }

    fn on_resume(&self) -> anyhow::Result<()> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
