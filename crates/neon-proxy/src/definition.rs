//! Proxy definitions and their joint validation.
//!
//! A [`ProxyDefinition`] aggregates one proxy's settings and all of its
//! routes. It is validated as a whole so conflicts between routes (shared
//! ports, duplicate hosts) are caught before anything is rendered.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;

use regex::Regex;

use crate::certificate::CertificateRegistry;
use crate::error::{ProxyError, ProxyResult};
use crate::haproxy::STATS_PORT;
use crate::route::{HttpRoute, ProxyRoute, TcpRoute, server_name};
use crate::settings::ProxySettings;

/// Ports that may be bound regardless of the configured range.
const WELL_KNOWN_PORTS: [u16; 2] = [80, 443];

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid name regex"));

static HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*$").expect("valid host regex")
});

/// One proxy's settings plus every route, keyed by route name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyDefinition {
    pub name: String,
    pub settings: ProxySettings,
    pub routes: BTreeMap<String, ProxyRoute>,
}

/// Policy knobs for validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Fail, rather than warn, when a certificate does not cover its host.
    pub strict_cert_hosts: bool,
}

/// Aggregate outcome of validating a definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        self.warnings.push(message);
    }

    /// Convert into a `Result`, failing if any error was recorded.
    pub fn into_result(self, proxy: &str) -> ProxyResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ProxyError::Validation {
                proxy: proxy.to_string(),
                count: self.errors.len(),
            })
        }
    }
}

/// Cross-route bookkeeping while walking the definition.
#[derive(Default)]
struct PortUsage {
    /// HTTP port → (TLS flag, first route that bound it).
    http: BTreeMap<u16, (bool, String)>,
    /// (HTTP port, lowercase host) → route.
    hosts: BTreeMap<(u16, String), String>,
    /// TCP port → route.
    tcp: BTreeMap<u16, String>,
}

impl ProxyDefinition {
    pub fn new(name: impl Into<String>, settings: ProxySettings) -> Self {
        Self {
            name: name.into(),
            settings,
            routes: BTreeMap::new(),
        }
    }

    /// Add or replace a route under its own name.
    pub fn insert_route(&mut self, route: ProxyRoute) {
        self.routes.insert(route.name().to_string(), route);
    }

    /// Validate settings and every route jointly against the certificates.
    pub fn validate(
        &self,
        certs: &CertificateRegistry,
        options: ValidationOptions,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut usage = PortUsage::default();

        self.validate_settings(&mut result);

        for (key, route) in &self.routes {
            if key != route.name() {
                result.error(format!(
                    "route stored as [{key}] is named [{}]",
                    route.name()
                ));
            }
            if !NAME_RE.is_match(route.name()) {
                result.error(format!(
                    "route [{}]: name must be non-empty and use only letters, digits, '.', '_' or '-'",
                    route.name()
                ));
            }
            if let Some(resolver) = route.resolver()
                && self.settings.resolver(resolver).is_none()
            {
                result.error(format!(
                    "route [{}]: resolver [{resolver}] is not defined",
                    route.name()
                ));
            }
            for port in route.ports() {
                self.check_port(route.name(), port, &mut result);
            }

            match route {
                ProxyRoute::Http(http) => {
                    validate_http(http, certs, options, &mut usage, &mut result)
                }
                ProxyRoute::Tcp(tcp) => validate_tcp(tcp, &mut result),
            }
        }

        // TCP ports are exclusive: checked once all HTTP ports are known.
        for route in self.routes.values() {
            if let ProxyRoute::Tcp(tcp) = route {
                for frontend in &tcp.frontends {
                    claim_tcp_port(&tcp.name, frontend.port, &mut usage, &mut result);
                }
            }
        }

        result
    }

    fn validate_settings(&self, result: &mut ValidationResult) {
        let settings = &self.settings;
        if settings.first_port > settings.last_port {
            result.error(format!(
                "settings: first_port {} is greater than last_port {}",
                settings.first_port, settings.last_port
            ));
        }
        let mut seen = BTreeSet::new();
        for resolver in &settings.resolvers {
            if !NAME_RE.is_match(&resolver.name) {
                result.error(format!("settings: invalid resolver name [{}]", resolver.name));
            }
            if !seen.insert(resolver.name.as_str()) {
                result.error(format!("settings: duplicate resolver [{}]", resolver.name));
            }
            if resolver.nameservers.is_empty() {
                result.error(format!("settings: resolver [{}] has no nameservers", resolver.name));
            }
            for nameserver in &resolver.nameservers {
                if !is_endpoint(nameserver) {
                    result.error(format!(
                        "settings: resolver [{}] has invalid nameserver [{nameserver}], expected host:port",
                        resolver.name
                    ));
                }
            }
        }
    }

    fn check_port(&self, route: &str, port: u16, result: &mut ValidationResult) {
        if port == 0 {
            result.error(format!("route [{route}]: frontend port 0 is invalid"));
        } else if port == STATS_PORT {
            result.error(format!(
                "route [{route}]: port {port} is reserved for the statistics listener"
            ));
        } else if !self.settings.in_range(port) && !WELL_KNOWN_PORTS.contains(&port) {
            result.warning(format!(
                "route [{route}]: port {port} is outside the proxy range {}-{}",
                self.settings.first_port, self.settings.last_port
            ));
        }
    }
}

fn validate_http(
    route: &HttpRoute,
    certs: &CertificateRegistry,
    options: ValidationOptions,
    usage: &mut PortUsage,
    result: &mut ValidationResult,
) {
    let name = &route.name;
    if route.frontends.is_empty() {
        result.error(format!("route [{name}]: at least one frontend is required"));
    }
    if route.backends.is_empty() {
        result.error(format!("route [{name}]: at least one backend is required"));
    }

    for frontend in &route.frontends {
        let host = frontend.host.to_ascii_lowercase();
        if !host.is_empty() && !HOST_RE.is_match(&host) {
            result.error(format!("route [{name}]: invalid frontend host [{}]", frontend.host));
        }

        if frontend.tls {
            if host.is_empty() {
                result.error(format!(
                    "route [{name}]: TLS frontend on port {} needs a host for SNI",
                    frontend.port
                ));
            }
            match frontend.cert_name.as_deref() {
                None | Some("") => result.error(format!(
                    "route [{name}]: TLS frontend [{host}:{}] does not name a certificate",
                    frontend.port
                )),
                Some(cert_name) if !NAME_RE.is_match(cert_name) => {
                    result.error(format!("route [{name}]: invalid certificate name [{cert_name}]"))
                }
                Some(cert_name) => match certs.get(cert_name) {
                    None => result.error(format!(
                        "route [{name}]: certificate [{cert_name}] does not exist"
                    )),
                    Some(cert) if !host.is_empty() && !cert.covers(&host) => {
                        let message = format!(
                            "route [{name}]: certificate [{cert_name}] does not cover host [{host}]"
                        );
                        if options.strict_cert_hosts {
                            result.error(message);
                        } else {
                            result.warning(message);
                        }
                    }
                    Some(_) => {}
                },
            }
        } else if route.https_redirect && host.is_empty() {
            result.warning(format!(
                "route [{name}]: https_redirect is ignored for the host-less frontend on port {}",
                frontend.port
            ));
        }

        match usage.http.get(&frontend.port) {
            Some((tls, owner)) if *tls != frontend.tls => result.error(format!(
                "route [{name}]: port {} mixes TLS and non-TLS frontends (also bound by [{owner}])",
                frontend.port
            )),
            Some(_) => {}
            None => {
                usage
                    .http
                    .insert(frontend.port, (frontend.tls, name.clone()));
            }
        }

        if let Some(owner) = usage
            .hosts
            .insert((frontend.port, host.clone()), name.clone())
        {
            let shown = if host.is_empty() { "<default>" } else { host.as_str() };
            result.error(format!(
                "route [{name}]: host [{shown}] on port {} is already bound by [{owner}]",
                frontend.port
            ));
        }
    }

    let mut servers = BTreeSet::new();
    for (index, backend) in route.backends.iter().enumerate() {
        let label = server_name(index, backend.name.as_deref());
        validate_backend(name, &label, &backend.server, backend.port, &mut servers, result);
    }

    if route.check_enabled && let Some(uri) = &route.check_uri {
        if !uri.starts_with('/') || uri.contains(char::is_whitespace) {
            result.error(format!("route [{name}]: invalid check_uri [{uri}]"));
        }
        if route.check_method.is_empty() || !route.check_method.chars().all(|c| c.is_ascii_uppercase()) {
            result.error(format!("route [{name}]: invalid check_method [{}]", route.check_method));
        }
        if route.check_version.contains(char::is_whitespace) {
            result.error(format!("route [{name}]: invalid check_version [{}]", route.check_version));
        }
        if let Some(check_host) = &route.check_host
            && !HOST_RE.is_match(check_host)
        {
            result.error(format!("route [{name}]: invalid check_host [{check_host}]"));
        }
    }
}

fn validate_tcp(route: &TcpRoute, result: &mut ValidationResult) {
    let name = &route.name;
    if route.frontends.is_empty() {
        result.error(format!("route [{name}]: at least one frontend is required"));
    }
    if route.backends.is_empty() {
        result.error(format!("route [{name}]: at least one backend is required"));
    }
    let mut servers = BTreeSet::new();
    for (index, backend) in route.backends.iter().enumerate() {
        let label = server_name(index, backend.name.as_deref());
        validate_backend(name, &label, &backend.server, backend.port, &mut servers, result);
    }
}

/// `label` is the generated server name, unique within its section.
fn validate_backend(
    route: &str,
    label: &str,
    server: &str,
    port: u16,
    seen: &mut BTreeSet<String>,
    result: &mut ValidationResult,
) {
    if !NAME_RE.is_match(label) {
        result.error(format!("route [{route}]: invalid backend name [{label}]"));
    } else if !seen.insert(label.to_string()) {
        result.error(format!("route [{route}]: duplicate backend name [{label}]"));
    }
    if !is_server_address(server) {
        result.error(format!("route [{route}]: invalid backend server [{server}]"));
    }
    if port == 0 {
        result.error(format!("route [{route}]: backend port 0 is invalid"));
    }
}

/// A DNS name or a literal IP address.
fn is_server_address(server: &str) -> bool {
    HOST_RE.is_match(server) || server.parse::<IpAddr>().is_ok()
}

/// `host:port` or `[v6]:port` with a non-zero port.
fn is_endpoint(endpoint: &str) -> bool {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return addr.port() != 0;
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            HOST_RE.is_match(host) && port.parse::<u16>().is_ok_and(|port| port != 0)
        }
        None => false,
    }
}

fn claim_tcp_port(route: &str, port: u16, usage: &mut PortUsage, result: &mut ValidationResult) {
    if let Some((_, owner)) = usage.http.get(&port) {
        result.error(format!(
            "route [{route}]: TCP port {port} is already bound by HTTP route [{owner}]"
        ));
    }
    if let Some(owner) = usage.tcp.insert(port, route.to_string()) {
        result.error(format!(
            "route [{route}]: TCP port {port} is already bound by [{owner}]"
        ));
    }
}
