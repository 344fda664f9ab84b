//! VPN connection
//!
//! Drives one OpenVPN session from launch to teardown:
//!
//! 1. Starts obfsproxy (optional) and watches it for crashes
//! 2. Starts the management interface and relays its state events
//! 3. Writes the client config and runs OpenVPN until it exits
//! 4. Tears everything down in a fixed order, whatever ended the session
//!
//! # Usage
//!
//! ```rust,ignore
//! let conn = Arc::new(VpnConnection::new(settings, params, management));
//! let (tx, rx) = crossbeam_channel::unbounded();
//!
//! // Blocks until OpenVPN exits, so run it on its own thread
//! let worker = {
//!     let conn = conn.clone();
//!     std::thread::spawn(move || conn.connect(tx))
//! };
//!
//! for event in rx.iter() {
//!     println!("VPN: {}", event.state);
//! }
//!
//! // From anywhere: returns once the session is fully torn down
//! conn.disconnect()?;
//! ```
//!
//! A connection object is single-use. After `connect` returns it is
//! retired; create a new one for the next attempt.

use crate::management::{ManagementInterface, ManagementStarter};
use crate::obfsproxy::{Obfsproxy, ObfsproxyLauncher};
use crate::params::ConnectionParams;
use crate::platform::{PlatformHooks, hooks_for_current_os};
use crate::route::{RouteCommand, RouteParseError};
use crate::settings::SessionSettings;
use crate::shell::{CommandRunner, ExecError, SystemRunner};
use crate::state::{Lifecycle, StateInfo, VpnState};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("Unable to connect: management interface already initialized")]
    AlreadyConnecting,

    #[error("Connection object already used; create a new one to reconnect")]
    Retired,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Obfsproxy not started: {0:#}")]
    ObfsproxyStart(anyhow::Error),

    #[error("Failed to start management interface: {0:#}")]
    ManagementStart(anyhow::Error),

    #[error("Failed to get management interface listen address: {0:#}")]
    ListenAddress(anyhow::Error),

    #[error("Failed to write configuration file: {0}")]
    ConfigWrite(#[source] std::io::Error),

    #[error("OpenVPN process failed: {0}")]
    Process(#[source] ExecError),

    #[error("Not connected: management interface is not initialized")]
    NotConnected,

    #[error("No route-add commands detected")]
    NoRouteState,

    #[error(transparent)]
    RouteParse(#[from] RouteParseError),

    #[error("Route command failed: {0}")]
    Exec(#[source] ExecError),

    #[error("Disconnection error: {0:#}")]
    Disconnect(anyhow::Error),

    #[error("Platform hook failed: {0:#}")]
    Hook(anyhow::Error),
}

/// Mutable connection state, shared with the worker threads
struct Inner {
    lifecycle: Lifecycle,
    state: VpnState,
    /// Only set while `state` is `Connected`
    client_ip: Option<IpAddr>,
    /// Sticky: once set, the object never connects again
    disconnect_requested: bool,
    paused: bool,
    management: Option<Arc<dyn ManagementInterface>>,
    obfsproxy: Option<Arc<dyn Obfsproxy>>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled when `connect` leaves the `Running` lifecycle
    finished: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the disconnect intent and ask OpenVPN to exit.
    ///
    /// The management interface may not exist yet while connecting; the
    /// in-flight `connect` picks the flag up and cancels itself.
    fn request_disconnect(&self) -> anyhow::Result<()> {
        let management = {
            let mut inner = self.lock();
            inner.disconnect_requested = true;
            inner.management.clone()
        };

        match management {
            Some(mi) => mi.send_disconnect(),
            None => {
                warn!("Management interface not initialized, nothing to disconnect");
                Ok(())
            }
        }
    }

    fn wait_until_finished(&self) {
        let mut inner = self.lock();
        while inner.lifecycle == Lifecycle::Running {
            inner = self
                .finished
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Marks the running `connect` call; retires the object when dropped
struct RunningCall<'a> {
    shared: &'a Shared,
}

impl Drop for RunningCall<'_> {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.lock();
            inner.lifecycle = Lifecycle::Retired;
            inner.state = VpnState::Disconnected;
            inner.client_ip = None;
            inner.paused = false;
        }
        self.shared.finished.notify_all();
    }
}

/// One OpenVPN connection attempt
pub struct VpnConnection {
    settings: SessionSettings,
    params: ConnectionParams,
    management: Arc<dyn ManagementStarter>,
    obfsproxy: Option<Arc<dyn ObfsproxyLauncher>>,
    hooks: Arc<dyn PlatformHooks>,
    runner: Arc<dyn CommandRunner>,
    shared: Arc<Shared>,
}

impl VpnConnection {
    /// Create a connection using the system runner and this OS's hooks
    pub fn new(
        settings: SessionSettings,
        params: ConnectionParams,
        management: Arc<dyn ManagementStarter>,
    ) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let hooks = hooks_for_current_os(&settings, runner.clone());

        Self {
            settings,
            params,
            management,
            obfsproxy: None,
            hooks,
            runner,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    lifecycle: Lifecycle::Ready,
                    state: VpnState::Disconnected,
                    client_ip: None,
                    disconnect_requested: false,
                    paused: false,
                    management: None,
                    obfsproxy: None,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    /// Launcher used when obfsproxy is enabled in the settings
    pub fn with_obfsproxy_launcher(mut self, launcher: Arc<dyn ObfsproxyLauncher>) -> Self {
        self.obfsproxy = Some(launcher);
        self
    }

    /// Replace the platform hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn PlatformHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the command runner used for OpenVPN and route commands
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Last state reported by OpenVPN
    pub fn state(&self) -> VpnState {
        self.shared.lock().state
    }

    /// Tunnel address assigned to the client (only while connected)
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.shared.lock().client_ip
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lock().lifecycle
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.shared.lock().disconnect_requested
    }

    /// Whether a pause was requested (not a guarantee every route was removed)
    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Addresses that must be reachable (VPN servers, or the proxy if set).
    ///
    /// Used to open firewall exceptions before connecting.
    pub fn destination_ips(&self) -> Vec<IpAddr> {
        self.params.destination_ips()
    }

    /// Run the connection until OpenVPN exits.
    ///
    /// Blocks the calling thread for the whole session. State events are
    /// forwarded to `sink` in the order OpenVPN reports them; the sink must
    /// be drained (or unbounded) for teardown to complete.
    pub fn connect(&self, sink: Sender<StateInfo>) -> Result<(), VpnError> {
        let _running = self.begin()?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (event_tx, event_rx) = unbounded::<StateInfo>();
        let mut workers = Vec::new();

        let result = self
            .spawn_state_relay(event_rx, stop_rx, sink)
            .and_then(|relay| {
                workers.push(relay);
                self.establish(event_tx, &mut workers)
            });

        if let Err(e) = &result {
            error!("Connection error: {}", e);
        }

        self.teardown(stop_tx, workers);
        result
    }

    /// Ask OpenVPN to exit and wait until the session is fully torn down.
    ///
    /// Safe to call before or during `connect`. A failure to send the
    /// disconnect command is returned once the session has finished.
    pub fn disconnect(&self) -> Result<(), VpnError> {
        info!("Disconnect requested");

        let sent = self.shared.request_disconnect();
        if let Err(e) = &sent {
            error!("Failed to send disconnect command: {:#}", e);
        }

        self.shared.wait_until_finished();
        sent.map_err(VpnError::Disconnect)
    }

    /// Remove the routes OpenVPN added, then run the platform pause hook
    pub fn pause(&self) -> Result<(), VpnError> {
        let commands = self.recorded_routes()?;
        self.shared.lock().paused = true;

        info!("Pausing VPN: removing {} route(s)", commands.len());
        let mut last_err = self.apply_routes(&commands, RouteCommand::inverse);

        if let Err(e) = self.hooks.on_pause() {
            error!("Pause hook failed: {:#}", e);
            last_err = Some(VpnError::Hook(e));
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Re-add the routes removed by `pause`, then run the platform resume hook
    pub fn resume(&self) -> Result<(), VpnError> {
        let commands = self.recorded_routes()?;

        self.shared.lock().paused = false;

        info!("Resuming VPN: restoring {} route(s)", commands.len());
        let mut last_err = self.apply_routes(&commands, |cmd| Ok(cmd.clone()));

        if let Err(e) = self.hooks.on_resume() {
            error!("Resume hook failed: {:#}", e);
            last_err = Some(VpnError::Hook(e));
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Point system DNS at `addr`
    pub fn set_manual_dns(&self, addr: IpAddr) -> Result<(), VpnError> {
        self.hooks.set_manual_dns(addr).map_err(VpnError::Hook)
    }

    /// Restore system DNS
    pub fn reset_manual_dns(&self) -> Result<(), VpnError> {
        self.hooks.reset_manual_dns().map_err(VpnError::Hook)
    }

    // -----------------------------------------------------------------------
    // connect internals
    // -----------------------------------------------------------------------

    /// Enter the `Running` lifecycle, or refuse a second attempt
    fn begin(&self) -> Result<RunningCall<'_>, VpnError> {
        let mut inner = self.shared.lock();

        match inner.lifecycle {
            Lifecycle::Running => return Err(VpnError::AlreadyConnecting),
            Lifecycle::Retired => return Err(VpnError::Retired),
            Lifecycle::Ready => {}
        }
        if inner.management.is_some() {
            return Err(VpnError::AlreadyConnecting);
        }

        inner.lifecycle = Lifecycle::Running;
        inner.state = VpnState::Connecting;
        inner.client_ip = None;

        if inner.disconnect_requested {
            info!("Disconnect already requested, connection will stop after setup");
        }

        Ok(RunningCall {
            shared: &self.shared,
        })
    }

    /// Start the helpers and run OpenVPN to completion
    fn establish(
        &self,
        events: Sender<StateInfo>,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), VpnError> {
        let mut obfsproxy_port = 0;

        if self.settings.obfsproxy {
            let launcher = self.obfsproxy.as_ref().ok_or_else(|| {
                VpnError::ObfsproxyStart(anyhow::anyhow!("no obfsproxy launcher configured"))
            })?;

            let proxy = launcher.create(self.settings.obfsproxy_script());
            self.shared.lock().obfsproxy = Some(proxy.clone());

            obfsproxy_port = proxy.start().map_err(VpnError::ObfsproxyStart)?;
            info!("Obfsproxy started on local port {}", obfsproxy_port);

            workers.push(self.spawn_obfsproxy_watch(proxy)?);
        }

        let mi = self
            .management
            .start(&self.params.username, &self.params.password, events)
            .map_err(VpnError::ManagementStart)?;

        let cancelled = {
            let mut inner = self.shared.lock();
            inner.management = Some(mi.clone());
            inner.disconnect_requested
        };
        if cancelled {
            info!("Connection process cancelled");
            return Ok(());
        }

        let (mi_ip, mi_port) = mi.listen_address().map_err(VpnError::ListenAddress)?;
        debug!("Management interface listening on {}:{}", mi_ip, mi_port);

        self.params
            .write_config_file(
                &self.settings.config_path,
                mi_ip,
                mi_port,
                &self.settings.log_path,
                obfsproxy_port,
                &self.settings.extra_parameters,
            )
            .map_err(VpnError::ConfigWrite)?;

        let binary = self.settings.openvpn_binary.to_string_lossy();
        let args = vec![
            "--config".to_string(),
            self.settings.config_path.to_string_lossy().into_owned(),
        ];

        // A disconnect may have landed while the config was being prepared
        if self.shared.lock().disconnect_requested {
            info!("Connection process cancelled before OpenVPN started");
            return Ok(());
        }

        info!("Starting OpenVPN ({})", binary);
        self.runner.exec(&binary, &args).map_err(VpnError::Process)?;
        info!("OpenVPN process exited");

        Ok(())
    }

    fn spawn_state_relay(
        &self,
        events: Receiver<StateInfo>,
        stop: Receiver<()>,
        sink: Sender<StateInfo>,
    ) -> Result<JoinHandle<()>, VpnError> {
        let shared = self.shared.clone();
        let hooks = self.hooks.clone();

        thread::Builder::new()
            .name("ovpn-state-relay".to_string())
            .spawn(move || {
                debug!("State relay started");
                run_state_relay(&shared, hooks.as_ref(), &events, &stop, &sink);
                debug!("State relay stopped");
            })
            .map_err(VpnError::Spawn)
    }

    /// Watch obfsproxy; if it dies on its own, take the VPN down with it
    fn spawn_obfsproxy_watch(&self, proxy: Arc<dyn Obfsproxy>) -> Result<JoinHandle<()>, VpnError> {
        let shared = self.shared.clone();

        thread::Builder::new()
            .name("obfsproxy-watch".to_string())
            .spawn(move || {
                proxy.wait();

                // Teardown clears the handle before stopping the process
                let crashed = {
                    let inner = shared.lock();
                    !inner.disconnect_requested && inner.obfsproxy.is_some()
                };

                if crashed {
                    error!("Obfsproxy stopped unexpectedly. Disconnecting VPN...");
                    if let Err(e) = shared.request_disconnect() {
                        error!("Failed to disconnect after obfsproxy crash: {:#}", e);
                    }
                } else {
                    debug!("Obfsproxy exited");
                }
            })
            .map_err(VpnError::Spawn)
    }

    /// Stop everything `connect` started. Order matters and is fixed.
    fn teardown(&self, stop: Sender<()>, workers: Vec<JoinHandle<()>>) {
        // The relay may already be gone if it failed to spawn
        let _ = stop.send(());

        let (management, obfsproxy) = {
            let mut inner = self.shared.lock();
            (inner.management.take(), inner.obfsproxy.take())
        };

        if let Some(mi) = management {
            if let Err(e) = mi.stop() {
                error!("Failed to stop management interface: {:#}", e);
            }
        }

        if let Some(proxy) = obfsproxy {
            proxy.stop();
        }

        if let Err(e) = self.hooks.on_disconnected() {
            error!("Disconnected hook failed: {:#}", e);
        }

        for worker in workers {
            if worker.join().is_err() {
                error!("Connection worker thread panicked");
            }
        }

        debug!("Connection teardown complete");
    }

    // -----------------------------------------------------------------------
    // pause/resume internals
    // -----------------------------------------------------------------------

    fn recorded_routes(&self) -> Result<Vec<String>, VpnError> {
        let mi = self
            .shared
            .lock()
            .management
            .clone()
            .ok_or(VpnError::NotConnected)?;

        let commands = mi.route_add_commands();
        if commands.is_empty() {
            return Err(VpnError::NoRouteState);
        }
        Ok(commands)
    }

    /// Execute every recorded command through `transform`.
    ///
    /// Failures are logged and skipped; the last one is returned.
    fn apply_routes(
        &self,
        lines: &[String],
        transform: impl Fn(&RouteCommand) -> Result<RouteCommand, RouteParseError>,
    ) -> Option<VpnError> {
        let mut last_err = None;

        for line in lines {
            let command = match RouteCommand::parse(line).and_then(|parsed| transform(&parsed)) {
                Ok(command) => command,
                Err(e) => {
                    error!("{}", e);
                    last_err = Some(VpnError::RouteParse(e));
                    continue;
                }
            };

            if let Err(e) = self.runner.exec(command.program(), command.args()) {
                error!("Route command '{}' failed: {}", command, e);
                last_err = Some(VpnError::Exec(e));
            }
        }

        last_err
    }
}

fn run_state_relay(
    shared: &Shared,
    hooks: &dyn PlatformHooks,
    events: &Receiver<StateInfo>,
    stop: &Receiver<()>,
    sink: &Sender<StateInfo>,
) {
    loop {
        select! {
            recv(events) -> msg => match msg {
                Ok(info) => relay_event(shared, hooks, sink, info),
                Err(_) => {
                    // Management interface is gone; nothing more will arrive
                    let _ = stop.recv();
                    return;
                }
            },
            recv(stop) -> _ => {
                for info in events.try_iter() {
                    relay_event(shared, hooks, sink, info);
                }
                return;
            }
        }
    }
}

fn relay_event(shared: &Shared, hooks: &dyn PlatformHooks, sink: &Sender<StateInfo>, info: StateInfo) {
    let became_connected = {
        let mut inner = shared.lock();
        let was_connected = inner.state.is_connected();
        inner.state = info.state;
        inner.client_ip = if info.state.is_connected() {
            info.client_ip
        } else {
            None
        };
        info.state.is_connected() && !was_connected
    };

    info!("VPN state: {}", info.state);

    if sink.send(info).is_err() {
        debug!("State sink closed, event not delivered");
    }

    if became_connected {
        if let Err(e) = hooks.on_connected() {
            error!("Connected hook failed: {:#}", e);
        }
    }
}
