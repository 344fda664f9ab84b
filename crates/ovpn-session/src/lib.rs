//! ovpn-session - OpenVPN Connection Lifecycle
//!
//! Launches and supervises one OpenVPN client session: generates its
//! configuration, relays state changes from the management interface,
//! optionally tunnels through obfsproxy, and pauses traffic by removing
//! the routes OpenVPN added.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      VpnConnection                         │
//! │                                                            │
//! │  connect() ──▶ obfsproxy ──▶ management ──▶ openvpn        │
//! │                   │          interface      --config       │
//! │                   │              │                         │
//! │            obfsproxy-watch   state events                  │
//! │                   │              ▼                         │
//! │                   │       ovpn-state-relay ──▶ caller sink │
//! │                   ▼                                        │
//! │             disconnect ◀── disconnect() / pause / resume   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single-use sessions**: a connection object runs at most once
//! - **Ordered state relay**: events reach the caller in report order
//! - **Blocking disconnect**: returns only after teardown completes
//! - **Pause/Resume**: route-add commands inverted and replayed
//! - **Obfsproxy supervision**: a crashed proxy takes the VPN down
//! - **Platform hooks**: DNS helper integration per OS

mod connection;
mod management;
mod obfsproxy;
mod params;
mod platform;
mod route;
mod settings;
mod shell;
mod state;

#[cfg(test)]
mod testing;

pub use connection::{VpnConnection, VpnError};
pub use management::{ManagementInterface, ManagementStarter};
pub use obfsproxy::{Obfsproxy, ObfsproxyLauncher};
pub use params::{ConnectionParams, Protocol, ProxyKind, ProxySettings};
pub use platform::{DnsScriptHooks, NoopHooks, PlatformHooks, hooks_for_current_os};
pub use route::{RouteCommand, RouteOp, RouteParseError};
pub use settings::{SessionSettings, SettingsError};
pub use shell::{CommandRunner, ExecError, SystemRunner};
pub use state::{Lifecycle, StateInfo, UnknownState, VpnState};
