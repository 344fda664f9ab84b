//! Connection state model
//!
//! States mirror the names OpenVPN reports on its management interface,
//! so a management implementation can translate `>STATE:` lines straight
//! into [`StateInfo`] events.

use std::net::IpAddr;

/// VPN connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VpnState {
    /// No tunnel (initial and final state)
    #[default]
    Disconnected,
    /// Initial state, resolving or connecting to the remote
    Connecting,
    /// Waiting for the initial response from the server
    Wait,
    /// Authenticating with the server
    Auth,
    /// Downloading configuration options from the server
    GetConfig,
    /// Assigning an IP address to the virtual interface
    AssignIp,
    /// Adding routes to the system
    AddRoutes,
    /// Tunnel is up
    Connected,
    /// A restart has occurred
    Reconnecting,
    /// Graceful exit is in progress
    Exiting,
}

impl VpnState {
    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Check if the tunnel is being established
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            VpnState::Connecting
                | VpnState::Wait
                | VpnState::Auth
                | VpnState::GetConfig
                | VpnState::AssignIp
                | VpnState::AddRoutes
                | VpnState::Reconnecting
        )
    }

    /// Check if the state ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, VpnState::Disconnected | VpnState::Exiting)
    }

    /// Management-interface name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            VpnState::Disconnected => "DISCONNECTED",
            VpnState::Connecting => "CONNECTING",
            VpnState::Wait => "WAIT",
            VpnState::Auth => "AUTH",
            VpnState::GetConfig => "GET_CONFIG",
            VpnState::AssignIp => "ASSIGN_IP",
            VpnState::AddRoutes => "ADD_ROUTES",
            VpnState::Connected => "CONNECTED",
            VpnState::Reconnecting => "RECONNECTING",
            VpnState::Exiting => "EXITING",
        }
    }
}

impl std::fmt::Display for VpnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VpnState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DISCONNECTED" => Ok(VpnState::Disconnected),
            "CONNECTING" | "TCP_CONNECT" | "RESOLVE" => Ok(VpnState::Connecting),
            "WAIT" => Ok(VpnState::Wait),
            "AUTH" => Ok(VpnState::Auth),
            "GET_CONFIG" => Ok(VpnState::GetConfig),
            "ASSIGN_IP" => Ok(VpnState::AssignIp),
            "ADD_ROUTES" => Ok(VpnState::AddRoutes),
            "CONNECTED" => Ok(VpnState::Connected),
            "RECONNECTING" => Ok(VpnState::Reconnecting),
            "EXITING" => Ok(VpnState::Exiting),
            _ => Err(UnknownState(s.to_string())),
        }
    }
}

/// Unrecognized management state name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown VPN state: {0}")]
pub struct UnknownState(pub String);

/// A single state transition, as emitted by the management interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInfo {
    /// New state
    pub state: VpnState,
    /// Client tunnel address (only meaningful in `Connected`)
    pub client_ip: Option<IpAddr>,
    /// Free-form detail reported alongside the state
    pub description: String,
}

impl StateInfo {
    /// Create an event without a client address
    pub fn new(state: VpnState) -> Self {
        Self {
            state,
            client_ip: None,
            description: String::new(),
        }
    }

    /// Create a `Connected` event carrying the assigned tunnel address
    pub fn connected(client_ip: IpAddr) -> Self {
        Self {
            state: VpnState::Connected,
            client_ip: Some(client_ip),
            description: String::new(),
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Lifecycle of a connection object
///
/// A connection object drives exactly one attempt. Once `connect` has
/// returned, the object is retired and rejects further attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, `connect` not called yet
    Ready,
    /// `connect` is in flight
    Running,
    /// `connect` has returned; create a new object to reconnect
    Retired,
}
