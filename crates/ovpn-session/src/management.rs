//! OpenVPN management interface seam
//!
//! The management interface is the control channel OpenVPN connects back
//! to (`management <ip> <port>` in the generated config). The connection
//! starts a listener before spawning OpenVPN, then uses it to answer
//! credential queries, receive state transitions and request a graceful
//! exit. The wire protocol itself lives behind these traits.

use crate::state::StateInfo;
use crossbeam_channel::Sender;
use std::net::IpAddr;
use std::sync::Arc;

/// A running management-interface listener
pub trait ManagementInterface: Send + Sync {
    /// Address OpenVPN must connect to
    fn listen_address(&self) -> anyhow::Result<(IpAddr, u16)>;

    /// Stop the listener. Calling it on an already stopped listener is a no-op.
    fn stop(&self) -> anyhow::Result<()>;

    /// Ask OpenVPN to exit gracefully
    fn send_disconnect(&self) -> anyhow::Result<()>;

    /// Route-add commands OpenVPN reported while connecting, in order
    fn route_add_commands(&self) -> Vec<String>;
}

/// Starts management-interface listeners
pub trait ManagementStarter: Send + Sync {
    /// Bind a new listener.
    ///
    /// `username`/`password` answer OpenVPN's credential query; every state
    /// transition is sent to `events` in the order OpenVPN reports it.
    /// Fails if the listener cannot bind.
    fn start(
        &self,
        username: &str,
        password: &str,
        events: Sender<StateInfo>,
    ) -> anyhow::Result<Arc<dyn ManagementInterface>>;
}
