// ── Session configuration ──

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which wire dialect an interface speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Xml,
    Bin,
}

/// One logical interface of the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name as the controller knows it, e.g. `BidCos-RF`.
    pub name: String,
    pub dialect: Dialect,
    pub port: u16,
    /// URL path suffix for XML endpoints that are not mounted at `/`.
    #[serde(default)]
    pub path: Option<String>,
    /// Whether the interface requires the init handshake.
    pub init: bool,
    /// Whether the interface needs keepalive pings.
    pub ping: bool,
    /// Per-interface override of the session-wide ping timeout.
    #[serde(default)]
    pub ping_timeout: Option<Duration>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub auth: Option<(String, String)>,
}

impl InterfaceConfig {
    fn stock(name: &str, dialect: Dialect, port: u16) -> Self {
        InterfaceConfig {
            name: name.to_owned(),
            dialect,
            port,
            path: None,
            init: true,
            ping: true,
            ping_timeout: None,
            tls: false,
            auth: None,
        }
    }

    pub fn bidcos_rf() -> Self {
        Self::stock("BidCos-RF", Dialect::Xml, 2001)
    }

    pub fn bidcos_wired() -> Self {
        Self::stock("BidCos-Wired", Dialect::Xml, 2000)
    }

    /// HmIP reports device activity sparsely; the stock ping timeout is
    /// ten minutes instead of the session-wide default.
    pub fn hmip_rf() -> Self {
        InterfaceConfig {
            ping_timeout: Some(Duration::from_secs(600)),
            ..Self::stock("HmIP-RF", Dialect::Xml, 2010)
        }
    }

    /// Group (heating) channels, served under `/groups`. The endpoint
    /// answers pings but never pushes them back, so keepalive stays off.
    pub fn virtual_devices() -> Self {
        InterfaceConfig {
            path: Some("/groups".to_owned()),
            ping: false,
            ..Self::stock("VirtualDevices", Dialect::Xml, 9292)
        }
    }

    pub fn cuxd() -> Self {
        InterfaceConfig {
            ping: false,
            ..Self::stock("CUxD", Dialect::Bin, 8701)
        }
    }

    /// Effective ping timeout given the session default.
    pub fn effective_ping_timeout(&self, default: Duration) -> Duration {
        self.ping_timeout.unwrap_or(default)
    }
}

/// Configuration for one controller session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcuConfig {
    /// Controller hostname or address.
    pub host: String,
    /// Enabled interfaces. See [`CcuConfig::with_stock_interfaces`].
    pub interfaces: Vec<InterfaceConfig>,
    /// Address the controller can reach us on for callbacks.
    pub callback_host: IpAddr,
    /// Local port for the XML callback listener (0 = ephemeral).
    pub callback_xml_port: u16,
    /// Local port for the binary callback listener (0 = ephemeral).
    pub callback_bin_port: u16,
    /// Liveness window per interface; half of it triggers a ping.
    pub ping_timeout: Duration,
    /// Per-item bound in the serialized write queue.
    pub queue_timeout: Duration,
    /// Pause between queued writes.
    pub queue_pause: Duration,
    /// Throttle window for the direct write path.
    pub set_value_throttle: Duration,
    /// Settling window for actuators that report transient busy states.
    pub working_debounce: Duration,
    /// Clamp numeric writes to the schema MIN/MAX. Off by default: some
    /// firmware advertises bounds tighter than what it accepts.
    pub clamp_to_bounds: bool,
    /// Directory for persisted registry/value/paramset state.
    pub data_dir: PathBuf,
    /// Poll interval for system variables and programs.
    pub rega_poll_interval: Duration,
    /// Per-call RPC timeout.
    pub rpc_timeout: Duration,
}

impl CcuConfig {
    pub fn new(host: impl Into<String>, callback_host: IpAddr) -> Self {
        CcuConfig {
            host: host.into(),
            interfaces: Vec::new(),
            callback_host,
            callback_xml_port: 0,
            callback_bin_port: 0,
            ping_timeout: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(5),
            queue_pause: Duration::ZERO,
            set_value_throttle: Duration::from_millis(500),
            working_debounce: Duration::from_millis(300),
            clamp_to_bounds: false,
            data_dir: PathBuf::from("."),
            rega_poll_interval: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(10),
        }
    }

    /// All five stock CCU interfaces with their factory defaults.
    pub fn with_stock_interfaces(mut self) -> Self {
        self.interfaces = vec![
            InterfaceConfig::bidcos_rf(),
            InterfaceConfig::bidcos_wired(),
            InterfaceConfig::hmip_rf(),
            InterfaceConfig::virtual_devices(),
            InterfaceConfig::cuxd(),
        ];
        self
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Endpoint URL or address the interface client connects to.
    pub fn endpoint(&self, iface: &InterfaceConfig) -> String {
        match iface.dialect {
            Dialect::Xml => {
                let scheme = if iface.tls { "https" } else { "http" };
                let path = iface.path.as_deref().unwrap_or("");
                format!("{scheme}://{}:{}{path}", self.host, iface.port)
            }
            Dialect::Bin => format!("{}:{}", self.host, iface.port),
        }
    }
}

impl Default for CcuConfig {
    fn default() -> Self {
        Self::new("ccu", IpAddr::V4(Ipv4Addr::LOCALHOST)).with_stock_interfaces()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_interfaces_carry_factory_defaults() {
        let config = CcuConfig::default();
        assert_eq!(config.interfaces.len(), 5);

        let hmip = config.interface("HmIP-RF").expect("HmIP-RF");
        assert_eq!(hmip.port, 2010);
        assert_eq!(
            hmip.effective_ping_timeout(config.ping_timeout),
            Duration::from_secs(600)
        );

        let groups = config.interface("VirtualDevices").expect("VirtualDevices");
        assert!(!groups.ping);
        assert_eq!(config.endpoint(groups), "http://ccu:9292/groups");

        let cuxd = config.interface("CUxD").expect("CUxD");
        assert_eq!(cuxd.dialect, Dialect::Bin);
        assert_eq!(config.endpoint(cuxd), "ccu:8701");
    }

    #[test]
    fn interface_without_override_uses_session_default() {
        let rf = InterfaceConfig::bidcos_rf();
        assert_eq!(
            rf.effective_ping_timeout(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }
}
