//! Connection parameters
//!
//! Immutable description of one connection attempt and the OpenVPN client
//! configuration it renders to.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

/// Transport protocol for the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// OpenVPN `proto` value for a client
    pub fn directive(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp-client",
        }
    }
}

/// Upstream proxy type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks,
}

/// Upstream proxy the tunnel is routed through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Proxy type
    pub kind: ProxyKind,
    /// Proxy address
    pub address: IpAddr,
    /// Proxy port
    pub port: u16,
}

/// Parameters of a single connection attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Upstream proxy; when set, it is the only destination the client talks to
    pub proxy: Option<ProxySettings>,
    /// Candidate VPN server addresses
    pub host_ips: Vec<IpAddr>,
    /// VPN server port
    pub port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// Account username
    pub username: String,
    /// Account password
    #[serde(skip_serializing, default)]
    pub password: String,
}

impl ConnectionParams {
    /// Create parameters for a direct (no proxy) connection
    pub fn new(
        host_ips: Vec<IpAddr>,
        port: u16,
        protocol: Protocol,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            proxy: None,
            host_ips,
            port,
            protocol,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Route the connection through an upstream proxy
    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Addresses the client must be allowed to reach (for firewall exceptions)
    pub fn destination_ips(&self) -> Vec<IpAddr> {
        match &self.proxy {
            Some(proxy) => vec![proxy.address],
            None => self.host_ips.clone(),
        }
    }

    /// Render the OpenVPN client configuration.
    ///
    /// `obfsproxy_port` of 0 means obfsproxy is disabled. When enabled,
    /// OpenVPN reaches the server through obfsproxy's local SOCKS port
    /// over TCP, and any configured upstream proxy is ignored.
    pub fn render_config(
        &self,
        mi_ip: IpAddr,
        mi_port: u16,
        log_path: &Path,
        obfsproxy_port: u16,
        extra_parameters: &str,
    ) -> String {
        let mut lines: Vec<String> = vec!["client".to_string(), "dev tun".to_string()];

        let protocol = if obfsproxy_port > 0 { Protocol::Tcp } else { self.protocol };
        lines.push(format!("proto {}", protocol.directive()));

        for host in &self.host_ips {
            lines.push(format!("remote {} {}", host, self.port));
        }
        if self.host_ips.len() > 1 {
            lines.push("remote-random".to_string());
        }

        lines.push("nobind".to_string());
        lines.push("persist-key".to_string());
        lines.push("persist-tun".to_string());

        // Management interface: credentials and hold release go through it
        lines.push(format!("management {} {}", mi_ip, mi_port));
        lines.push("management-query-passwords".to_string());
        lines.push("management-hold".to_string());
        lines.push("auth-user-pass".to_string());
        lines.push("auth-nocache".to_string());

        if !log_path.as_os_str().is_empty() {
            lines.push(format!("log \"{}\"", log_path.display()));
        }

        if obfsproxy_port > 0 {
            if self.proxy.is_some() {
                warn!("Obfsproxy enabled, ignoring upstream proxy");
            }
            lines.push(format!("socks-proxy 127.0.0.1 {}", obfsproxy_port));
        } else if let Some(proxy) = &self.proxy {
            let directive = match proxy.kind {
                ProxyKind::Http => "http-proxy",
                ProxyKind::Socks => "socks-proxy",
            };
            lines.push(format!("{} {} {}", directive, proxy.address, proxy.port));
        }

        let extra = extra_parameters.trim();
        if !extra.is_empty() {
            lines.push("# user-defined parameters".to_string());
            lines.extend(extra.lines().map(|l| l.trim().to_string()));
        }

        let mut config = lines.join("\n");
        config.push('\n');
        config
    }

    /// Render the configuration and write it to `path`
    pub fn write_config_file(
        &self,
        path: &Path,
        mi_ip: IpAddr,
        mi_port: u16,
        log_path: &Path,
        obfsproxy_port: u16,
        extra_parameters: &str,
    ) -> std::io::Result<()> {
        let config = self.render_config(mi_ip, mi_port, log_path, obfsproxy_port, extra_parameters);

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(path, config)?;

        debug!("Wrote OpenVPN configuration to {}", path.display());
        Ok(())
    }
}
