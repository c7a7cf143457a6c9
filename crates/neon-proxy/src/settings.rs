//! Per-proxy settings: port range, connection caps, timeouts, resolvers.

use serde::{Deserialize, Serialize};

/// Settings shared by every route of one proxy instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxySettings {
    /// First port of the range this proxy may bind.
    pub first_port: u16,
    /// Last port (inclusive) of the range this proxy may bind.
    pub last_port: u16,
    /// Global connection cap.
    pub max_connections: u32,
    /// Maximum Diffie-Hellman parameter size for TLS.
    pub max_dh_param_bits: u32,
    pub timeouts: ProxyTimeouts,
    #[serde(default)]
    pub resolvers: Vec<ProxyResolver>,
}

/// Timeouts applied in the `defaults` section, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyTimeouts {
    pub connect_seconds: u32,
    pub client_seconds: u32,
    pub server_seconds: u32,
    pub check_seconds: u32,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            connect_seconds: 5,
            client_seconds: 50,
            server_seconds: 50,
            check_seconds: 5,
        }
    }
}

/// A named DNS resolver that backends may use for dynamic address lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyResolver {
    pub name: String,
    pub resolve_retries: u32,
    pub retry_seconds: u32,
    pub hold_seconds: u32,
    /// Nameserver endpoints (`host:port`).
    pub nameservers: Vec<String>,
}

impl ProxyResolver {
    /// The embedded Docker DNS server.
    pub fn docker() -> Self {
        Self {
            name: "docker".to_string(),
            resolve_retries: 3,
            retry_seconds: 1,
            hold_seconds: 10,
            nameservers: vec!["127.0.0.11:53".to_string()],
        }
    }
}

impl ProxySettings {
    /// Settings written on first run for a proxy that has none yet.
    ///
    /// The two standard proxies get their reserved host port blocks; any
    /// other proxy gets the block after them.
    pub fn defaults_for(proxy: &str) -> Self {
        let (first_port, last_port) = match proxy {
            "public" => (5100, 5299),
            "private" => (5300, 5499),
            _ => (5500, 5699),
        };

        Self {
            first_port,
            last_port,
            max_connections: 32_000,
            max_dh_param_bits: 2048,
            timeouts: ProxyTimeouts::default(),
            resolvers: vec![ProxyResolver::docker()],
        }
    }

    /// Whether `port` lies inside the configured range.
    pub fn in_range(&self, port: u16) -> bool {
        (self.first_port..=self.last_port).contains(&port)
    }

    /// Find a resolver by name.
    pub fn resolver(&self, name: &str) -> Option<&ProxyResolver> {
        self.resolvers.iter().find(|r| r.name == name)
    }
}
