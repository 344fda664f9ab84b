//! Obfsproxy seam
//!
//! Obfsproxy runs in front of OpenVPN and exposes a local SOCKS port that
//! OpenVPN tunnels through. Its supervisor is external; the connection only
//! needs to start it, learn the port, notice if it dies, and stop it.

use std::path::Path;
use std::sync::Arc;

/// A supervised obfsproxy process
pub trait Obfsproxy: Send + Sync {
    /// Start the process and return its local SOCKS port
    fn start(&self) -> anyhow::Result<u16>;

    /// Stop the process (no-op if it is not running)
    fn stop(&self);

    /// Block until the process has exited
    fn wait(&self);
}

/// Creates obfsproxy supervisors
pub trait ObfsproxyLauncher: Send + Sync {
    /// Create a (not yet started) supervisor for `start_script`
    fn create(&self, start_script: &Path) -> Arc<dyn Obfsproxy>;
}
