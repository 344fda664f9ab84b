//! Platform hooks
//!
//! OS-specific work performed at fixed points of the connection lifecycle.
//! Every hook is best-effort: the connection logs hook failures and keeps
//! going, except `pause`/`resume` which return the hook's error.
//!
//! One implementation is chosen at startup with [`hooks_for_current_os`]:
//!
//! | Platform | Implementation |
//! |----------|----------------|
//! | macOS (DNS script configured) | [`DnsScriptHooks`] |
//! | everything else | [`NoopHooks`] |

use crate::settings::SessionSettings;
use crate::shell::CommandRunner;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle callbacks implemented per operating system
pub trait PlatformHooks: Send + Sync {
    /// Tunnel reported `CONNECTED`
    fn on_connected(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// OpenVPN has exited and the connection is torn down
    fn on_disconnected(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Routes were removed for a pause (typically restores default DNS)
    fn on_pause(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Routes were re-applied after a pause
    fn on_resume(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Point system DNS at `addr`
    fn set_manual_dns(&self, _addr: IpAddr) -> anyhow::Result<()> {
        Ok(())
    }

    /// Undo [`PlatformHooks::set_manual_dns`]
    fn reset_manual_dns(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks for platforms without any system integration
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl PlatformHooks for NoopHooks {}

/// Hooks delegating to a DNS helper script.
///
/// The script is invoked with one action flag per hook:
/// `-up`, `-down`, `-pause`, `-resume`, `-set_alternate_dns <ip>` and
/// `-delete_alternate_dns`.
pub struct DnsScriptHooks {
    script: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl DnsScriptHooks {
    /// Create hooks running `script` through `runner`
    pub fn new(script: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            script: script.into(),
            runner,
        }
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let script = self.script.to_string_lossy();
        debug!("DNS script: {} {}", script, args.join(" "));
        self.runner.exec(&script, &args)?;
        Ok(())
    }
}

impl PlatformHooks for DnsScriptHooks {
    fn on_connected(&self) -> anyhow::Result<()> {
        self.run(&["-up"])
    }

    fn on_disconnected(&self) -> anyhow::Result<()> {
        self.run(&["-down"])
    }

    fn on_pause(&self) -> anyhow::Result<()> {
        self.run(&["-pause"])
    }

    fn on_resume(&self) -> anyhow::Result<()> {
        self.run(&["-resume"])
    }

    fn set_manual_dns(&self, addr: IpAddr) -> anyhow::Result<()> {
        self.run(&["-set_alternate_dns", &addr.to_string()])
    }

    fn reset_manual_dns(&self) -> anyhow::Result<()> {
        self.run(&["-delete_alternate_dns"])
    }
}

/// Select the hook implementation for the running OS
pub fn hooks_for_current_os(
    settings: &SessionSettings,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn PlatformHooks> {
    #[cfg(target_os = "macos")]
    {
        if let Some(script) = &settings.dns_script {
            debug!("Using DNS script hooks ({})", script.display());
            return Arc::new(DnsScriptHooks::new(script.clone(), runner));
        }
    }

    #[cfg(not(target_os = "macos"))]
    let _ = (settings, runner);

    debug!("Using no-op platform hooks");
    Arc::new(NoopHooks)
}
