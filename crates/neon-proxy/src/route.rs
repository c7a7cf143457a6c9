//! Route definitions: HTTP and TCP routes with their frontends and backends.
//!
//! Routes are JSON documents stored by the operator tooling under
//! `conf/proxies/{proxy}/routes/{name}`. The `mode` field selects the variant.

use serde::{Deserialize, Serialize};

/// A proxy route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProxyRoute {
    Http(HttpRoute),
    Tcp(TcpRoute),
}

/// An HTTP route: host/port (optionally TLS) frontends dispatching to backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRoute {
    pub name: String,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub check_enabled: bool,
    #[serde(default)]
    pub log_checks: bool,
    /// Resolver used for backend address lookups.
    #[serde(default)]
    pub resolver: Option<String>,
    pub frontends: Vec<HttpFrontend>,
    pub backends: Vec<HttpBackend>,
    /// Redirect plain HTTP requests for this route's hosts to HTTPS.
    #[serde(default)]
    pub https_redirect: bool,
    #[serde(default = "default_check_method")]
    pub check_method: String,
    /// Health check path; no check is emitted without one.
    #[serde(default)]
    pub check_uri: Option<String>,
    #[serde(default = "default_check_status")]
    pub check_expect_status: u16,
    #[serde(default = "default_check_version")]
    pub check_version: String,
    /// `Host` header sent with health checks.
    #[serde(default)]
    pub check_host: Option<String>,
}

/// An HTTP listening endpoint. An empty host catches every request on the port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpFrontend {
    #[serde(default)]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Certificate presented for `host` when `tls` is set.
    #[serde(default)]
    pub cert_name: Option<String>,
}

/// An upstream HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpBackend {
    #[serde(default)]
    pub name: Option<String>,
    pub server: String,
    pub port: u16,
    /// Connect to the server over TLS, verifying its certificate.
    #[serde(default)]
    pub tls: bool,
}

/// A TCP route: raw port forwarding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpRoute {
    pub name: String,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub check_enabled: bool,
    #[serde(default)]
    pub log_checks: bool,
    #[serde(default)]
    pub resolver: Option<String>,
    /// Connection cap for the listener; zero means unlimited.
    #[serde(default)]
    pub max_connections: u32,
    pub frontends: Vec<TcpFrontend>,
    pub backends: Vec<TcpBackend>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpFrontend {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpBackend {
    #[serde(default)]
    pub name: Option<String>,
    pub server: String,
    pub port: u16,
}

fn default_check_method() -> String {
    "GET".to_string()
}

fn default_check_status() -> u16 {
    200
}

fn default_check_version() -> String {
    "HTTP/1.0".to_string()
}

impl ProxyRoute {
    pub fn name(&self) -> &str {
        match self {
            ProxyRoute::Http(route) => &route.name,
            ProxyRoute::Tcp(route) => &route.name,
        }
    }

    pub fn resolver(&self) -> Option<&str> {
        match self {
            ProxyRoute::Http(route) => route.resolver.as_deref(),
            ProxyRoute::Tcp(route) => route.resolver.as_deref(),
        }
    }

    /// Name of the generated backend (or listener) section for this route.
    pub fn backend_name(&self) -> String {
        match self {
            ProxyRoute::Http(route) => route.backend_name(),
            ProxyRoute::Tcp(route) => format!("tcp:{}", route.name),
        }
    }

    /// Every port this route binds.
    pub fn ports(&self) -> Vec<u16> {
        match self {
            ProxyRoute::Http(route) => route.frontends.iter().map(|f| f.port).collect(),
            ProxyRoute::Tcp(route) => route.frontends.iter().map(|f| f.port).collect(),
        }
    }
}

impl HttpRoute {
    pub fn backend_name(&self) -> String {
        format!("http:{}", self.name)
    }
}

/// Server name used in generated `server` lines.
pub fn server_name(index: usize, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("server-{index}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_route_document_applies_defaults() {
        let json = r#"{
            "mode": "http",
            "name": "web",
            "frontends": [{ "host": "site.example.com", "port": 443, "tls": true, "cert_name": "site-cert" }],
            "backends": [{ "server": "10.0.0.5", "port": 8080 }]
        }"#;
        let route: ProxyRoute = serde_json::from_str(json).unwrap();

        let ProxyRoute::Http(http) = &route else {
            panic!("expected an HTTP route");
        };
        assert_eq!(http.check_method, "GET");
        assert_eq!(http.check_expect_status, 200);
        assert_eq!(http.check_version, "HTTP/1.0");
        assert!(!http.log);
        assert!(!http.backends[0].tls);
        assert_eq!(route.backend_name(), "http:web");
        assert!(matches!(route, ProxyRoute::Http(_)));
    }

    #[test]
    fn tcp_route_document_parses() {
        let json = r#"{
            "mode": "tcp",
            "name": "db",
            "max_connections": 50,
            "frontends": [{ "port": 5300 }, { "port": 5301 }],
            "backends": [{ "name": "primary", "server": "10.0.0.9", "port": 5432 }]
        }"#;
        let route: ProxyRoute = serde_json::from_str(json).unwrap();

        assert_eq!(route.name(), "db");
        assert!(matches!(route, ProxyRoute::Tcp(_)));
        assert_eq!(route.ports(), vec![5300, 5301]);
        assert_eq!(route.backend_name(), "tcp:db");
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let json = r#"{ "mode": "udp", "name": "x", "frontends": [], "backends": [] }"#;
        assert!(serde_json::from_str::<ProxyRoute>(json).is_err());
    }

    #[test]
    fn server_names_fall_back_to_index() {
        assert_eq!(server_name(2, None), "server-2");
        assert_eq!(server_name(2, Some("")), "server-2");
        assert_eq!(server_name(2, Some("primary")), "primary");
    }
}
