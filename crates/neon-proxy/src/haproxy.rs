//! HAProxy configuration synthesis.
//!
//! [`render`] turns a validated [`ProxyDefinition`] and the loaded
//! [`CertificateRegistry`] into configuration text, a certificate manifest
//! and the set of certificates the output actually references.
//!
//! Output is a pure function of the inputs. Every collection that affects
//! the text is ordered explicitly: routes by name, frontends by port, hosts
//! by name and certificates by name.

use std::collections::BTreeMap;
use std::fmt::{self, Write};

use tracing::debug;

use crate::certificate::{CertificateRegistry, ReferencedCertificates};
use crate::definition::ProxyDefinition;
use crate::error::{ProxyError, ProxyResult};
use crate::route::{HttpRoute, ProxyRoute, TcpRoute, server_name};
use crate::settings::{ProxyResolver, ProxySettings};

/// Port of the always-present statistics listener.
pub const STATS_PORT: u16 = 1936;

/// URI path of the statistics page.
pub const STATS_PATH: &str = "/_stats";

/// Directory certificate paths in the config are relative to.
pub const CERT_BASE: &str = "/etc/neon/proxy";

/// CA bundle used to verify TLS backends.
const CA_FILE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Directory holding the certificates served on `port`.
pub fn cert_directory(port: u16) -> String {
    format!("certs-port-{port}")
}

/// File name of a certificate inside its directory.
pub fn cert_filename(cert_name: &str) -> String {
    format!("{cert_name}.pem")
}

/// One `.certmanifest` line: where a certificate comes from and where the
/// proxy runtime must place it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CertManifestEntry {
    pub secret_path: String,
    pub directory: String,
    pub filename: String,
}

impl fmt::Display for CertManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.secret_path, self.directory, self.filename)
    }
}

/// Result of one synthesis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedConfig {
    /// Contents of `config.txt`.
    pub config: String,
    /// Certificate manifest, ordered by port then certificate name.
    pub manifest: Vec<CertManifestEntry>,
    /// Certificates bound by at least one emitted frontend.
    pub referenced: ReferencedCertificates,
}

impl RenderedConfig {
    /// Contents of `.certmanifest`, one line per entry.
    pub fn manifest_text(&self) -> String {
        self.manifest
            .iter()
            .map(|entry| format!("{entry}\n"))
            .collect()
    }
}

/// Where one virtual host on a port is sent.
#[derive(Debug, Clone)]
struct HostBinding {
    backend: String,
    https_redirect: bool,
}

/// Per-port aggregate of every HTTP route frontend bound to that port.
#[derive(Debug)]
struct HttpFrontend {
    port: u16,
    /// Established by the first frontend registered on the port.
    tls: bool,
    log: bool,
    /// Certificate name → secret path.
    certificates: BTreeMap<String, String>,
    /// Lowercase host (empty for the default) → binding.
    hosts: BTreeMap<String, HostBinding>,
}

impl HttpFrontend {
    fn name(&self) -> String {
        format!("http:port-{}", self.port)
    }
}

/// Render the configuration for one proxy.
///
/// The definition is expected to have passed validation. Conflicts that
/// validation should have caught (mixed TLS on one port, a missing
/// certificate) are still reported as errors rather than rendered.
pub fn render(
    definition: &ProxyDefinition,
    certs: &CertificateRegistry,
) -> ProxyResult<RenderedConfig> {
    let mut referenced = certs.clear_references();
    let frontends = aggregate_http_frontends(definition, certs, &mut referenced)?;

    let mut config = String::new();
    write_config(&mut config, definition, &frontends)
        .map_err(|e| ProxyError::Bundle(format!("failed to format config: {e}")))?;

    let manifest: Vec<CertManifestEntry> = frontends
        .values()
        .flat_map(|frontend| {
            frontend
                .certificates
                .iter()
                .map(|(name, secret_path)| CertManifestEntry {
                    secret_path: secret_path.clone(),
                    directory: cert_directory(frontend.port),
                    filename: cert_filename(name),
                })
        })
        .collect();

    debug!(
        proxy = %definition.name,
        routes = definition.routes.len(),
        http_ports = frontends.len(),
        certificates = referenced.len(),
        "rendered proxy config"
    );

    Ok(RenderedConfig {
        config,
        manifest,
        referenced,
    })
}

fn aggregate_http_frontends(
    definition: &ProxyDefinition,
    certs: &CertificateRegistry,
    referenced: &mut ReferencedCertificates,
) -> ProxyResult<BTreeMap<u16, HttpFrontend>> {
    let mut frontends: BTreeMap<u16, HttpFrontend> = BTreeMap::new();

    for route in definition.routes.values() {
        let ProxyRoute::Http(http) = route else {
            continue;
        };
        for frontend in &http.frontends {
            let aggregate = frontends
                .entry(frontend.port)
                .or_insert_with(|| HttpFrontend {
                    port: frontend.port,
                    tls: frontend.tls,
                    log: false,
                    certificates: BTreeMap::new(),
                    hosts: BTreeMap::new(),
                });
            if aggregate.tls != frontend.tls {
                return Err(ProxyError::TlsConflict {
                    port: frontend.port,
                });
            }
            aggregate.log |= http.log;

            if frontend.tls {
                let cert_name = frontend.cert_name.as_deref().unwrap_or_default();
                let cert = certs
                    .get(cert_name)
                    .ok_or_else(|| ProxyError::MissingCertificate(cert_name.to_string()))?;
                aggregate
                    .certificates
                    .insert(cert.name.clone(), cert.secret_path.clone());
                referenced.mark(&cert.name);
            }

            aggregate.hosts.insert(
                frontend.host.to_ascii_lowercase(),
                HostBinding {
                    backend: http.backend_name(),
                    https_redirect: http.https_redirect && !frontend.tls,
                },
            );
        }
    }

    Ok(frontends)
}

fn write_config(
    out: &mut String,
    definition: &ProxyDefinition,
    frontends: &BTreeMap<u16, HttpFrontend>,
) -> fmt::Result {
    writeln!(out, "# proxy: {}", definition.name)?;
    writeln!(out)?;
    write_globals(out, &definition.settings)?;

    let mut resolvers: Vec<&ProxyResolver> = definition.settings.resolvers.iter().collect();
    resolvers.sort_by(|a, b| a.name.cmp(&b.name));
    for resolver in resolvers {
        write_resolver(out, resolver)?;
    }

    write_stats(out)?;

    for route in definition.routes.values() {
        if let ProxyRoute::Tcp(tcp) = route {
            write_tcp_listeners(out, tcp)?;
        }
    }

    for frontend in frontends.values() {
        write_http_frontend(out, frontend)?;
    }

    for route in definition.routes.values() {
        if let ProxyRoute::Http(http) = route {
            write_http_backend(out, http)?;
        }
    }

    Ok(())
}

fn write_globals(out: &mut String, settings: &ProxySettings) -> fmt::Result {
    let timeouts = &settings.timeouts;
    writeln!(out, "global")?;
    writeln!(out, "    daemon")?;
    writeln!(out, "    maxconn {}", settings.max_connections)?;
    writeln!(out, "    log stdout format raw local0")?;
    writeln!(out, "    tune.ssl.default-dh-param {}", settings.max_dh_param_bits)?;
    writeln!(out, "    crt-base {CERT_BASE}")?;
    writeln!(out, "    ssl-default-bind-options no-sslv3 no-tlsv10 no-tlsv11")?;
    writeln!(out)?;
    writeln!(out, "defaults")?;
    writeln!(out, "    log global")?;
    writeln!(out, "    timeout connect {}s", timeouts.connect_seconds)?;
    writeln!(out, "    timeout client {}s", timeouts.client_seconds)?;
    writeln!(out, "    timeout server {}s", timeouts.server_seconds)?;
    writeln!(out, "    timeout check {}s", timeouts.check_seconds)?;
    writeln!(out)
}

fn write_resolver(out: &mut String, resolver: &ProxyResolver) -> fmt::Result {
    writeln!(out, "resolvers {}", resolver.name)?;
    for (index, nameserver) in resolver.nameservers.iter().enumerate() {
        writeln!(out, "    nameserver ns-{index} {nameserver}")?;
    }
    writeln!(out, "    resolve_retries {}", resolver.resolve_retries)?;
    writeln!(out, "    timeout retry {}s", resolver.retry_seconds)?;
    writeln!(out, "    hold valid {}s", resolver.hold_seconds)?;
    writeln!(out)
}

fn write_stats(out: &mut String) -> fmt::Result {
    writeln!(out, "listen stats")?;
    writeln!(out, "    mode http")?;
    writeln!(out, "    bind *:{STATS_PORT}")?;
    writeln!(out, "    stats enable")?;
    writeln!(out, "    stats uri {STATS_PATH}")?;
    writeln!(out, "    stats refresh 5s")?;
    writeln!(out)
}

fn write_tcp_listeners(out: &mut String, route: &TcpRoute) -> fmt::Result {
    let mut ports: Vec<u16> = route.frontends.iter().map(|f| f.port).collect();
    ports.sort_unstable();
    for port in ports {
        writeln!(out, "listen tcp:{}-port-{port}", route.name)?;
        writeln!(out, "    mode tcp")?;
        writeln!(out, "    bind *:{port}")?;
        if route.log {
            writeln!(out, "    option tcplog")?;
        }
        if route.check_enabled && route.log_checks {
            writeln!(out, "    option log-health-checks")?;
        }
        if route.max_connections > 0 {
            writeln!(out, "    maxconn {}", route.max_connections)?;
        }
        for (index, backend) in route.backends.iter().enumerate() {
            write!(
                out,
                "    server {} {}:{}",
                server_name(index, backend.name.as_deref()),
                backend.server,
                backend.port
            )?;
            if route.check_enabled {
                write!(out, " check")?;
            }
            if let Some(resolver) = &route.resolver {
                write!(out, " resolvers {resolver} init-addr last,libc,none")?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_http_frontend(out: &mut String, frontend: &HttpFrontend) -> fmt::Result {
    writeln!(out, "frontend {}", frontend.name())?;
    writeln!(out, "    mode http")?;
    if frontend.tls {
        writeln!(
            out,
            "    bind *:{} ssl crt {}",
            frontend.port,
            cert_directory(frontend.port)
        )?;
    } else {
        writeln!(out, "    bind *:{}", frontend.port)?;
    }
    if frontend.log {
        writeln!(out, "    option httplog")?;
    }
    writeln!(out, "    option forwardfor")?;

    for (host, binding) in &frontend.hosts {
        if binding.https_redirect && !host.is_empty() {
            writeln!(
                out,
                "    http-request redirect scheme https code 301 if {}",
                host_condition(host)
            )?;
        }
    }

    let mut default_backend = None;
    for (host, binding) in &frontend.hosts {
        if host.is_empty() {
            default_backend = Some(&binding.backend);
        } else if frontend.tls {
            writeln!(
                out,
                "    use_backend {} if {{ ssl_fc_sni -i {host} }}",
                binding.backend
            )?;
        } else {
            writeln!(
                out,
                "    use_backend {} if {}",
                binding.backend,
                host_condition(host)
            )?;
        }
    }
    if let Some(backend) = default_backend {
        writeln!(out, "    default_backend {backend}")?;
    }
    writeln!(out)
}

fn write_http_backend(out: &mut String, route: &HttpRoute) -> fmt::Result {
    writeln!(out, "backend {}", route.backend_name())?;
    writeln!(out, "    mode http")?;

    let check_uri = route.check_uri.as_deref().filter(|_| route.check_enabled);
    if let Some(uri) = check_uri {
        writeln!(out, "    option httpchk")?;
        write!(
            out,
            "    http-check send meth {} uri {uri} ver {}",
            route.check_method, route.check_version
        )?;
        if let Some(host) = &route.check_host {
            write!(out, " hdr Host {host}")?;
        }
        writeln!(out)?;
        writeln!(out, "    http-check expect status {}", route.check_expect_status)?;
        if route.log_checks {
            writeln!(out, "    option log-health-checks")?;
        }
    }

    for (index, backend) in route.backends.iter().enumerate() {
        write!(
            out,
            "    server {} {}:{}",
            server_name(index, backend.name.as_deref()),
            backend.server,
            backend.port
        )?;
        if route.check_enabled {
            write!(out, " check")?;
        }
        if backend.tls {
            write!(out, " ssl verify required ca-file {CA_FILE}")?;
        }
        if let Some(resolver) = &route.resolver {
            write!(out, " resolvers {resolver} init-addr last,libc,none")?;
        }
        writeln!(out)?;
    }
    writeln!(out)
}

/// ACL matching the request host header, tolerant of case and a port suffix.
fn host_condition(host: &str) -> String {
    format!("{{ hdr_reg(host) -i ^{}(:[0-9]+)?$ }}", host.replace('.', "\\."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::cert;
    use crate::definition::tests::{http_route, plain, tcp_route, tls};
    use crate::route::HttpBackend;
    use crate::settings::ProxySettings;

    fn public(routes: Vec<ProxyRoute>) -> ProxyDefinition {
        let mut def = ProxyDefinition::new("public", ProxySettings::defaults_for("public"));
        for route in routes {
            def.insert_route(route);
        }
        def
    }

    fn registry() -> CertificateRegistry {
        CertificateRegistry::from_certs([
            cert("site-cert", &["site.example.com"]),
            cert("unused", &["unused.example.com"]),
        ])
    }

    fn count(text: &str, needle: &str) -> usize {
        text.matches(needle).count()
    }

    #[test]
    fn example_site_renders_one_frontend_backend_and_manifest_line() {
        let def = public(vec![http_route(
            "web",
            vec![tls("site.example.com", 443, "site-cert")],
        )]);
        let rendered = render(&def, &registry()).unwrap();
        let config = &rendered.config;

        assert_eq!(count(config, "\nfrontend "), 1);
        assert!(config.contains("bind *:443 ssl crt certs-port-443"));
        assert!(config.contains("use_backend http:web if { ssl_fc_sni -i site.example.com }"));
        assert_eq!(count(config, "\nbackend "), 1);
        assert!(config.contains("backend http:web\n"));
        assert_eq!(count(config, "    server "), 1);
        assert!(config.contains("server server-0 10.0.0.5:8080"));

        assert_eq!(rendered.manifest.len(), 1);
        assert_eq!(
            rendered.manifest_text(),
            "neon-secret/cert/site-cert certs-port-443 site-cert.pem\n"
        );
        assert!(rendered.referenced.contains("site-cert"));
        assert!(!rendered.referenced.contains("unused"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let def = public(vec![
            http_route("b", vec![plain("b.example.com", 80)]),
            http_route("a", vec![plain("a.example.com", 80), plain("", 5100)]),
            tcp_route("db", &[5300, 5301]),
        ]);
        let first = render(&def, &registry()).unwrap();
        let second = render(&def.clone(), &registry()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shared_port_dispatches_by_host_in_name_order() {
        let def = public(vec![
            http_route("zeta", vec![plain("z.example.com", 80)]),
            http_route("alpha", vec![plain("a.example.com", 80)]),
        ]);
        let config = render(&def, &CertificateRegistry::new()).unwrap().config;

        assert_eq!(count(&config, "\nfrontend "), 1);
        let a = config
            .find(r"use_backend http:alpha if { hdr_reg(host) -i ^a\.example\.com(:[0-9]+)?$ }")
            .unwrap();
        let z = config.find("use_backend http:zeta").unwrap();
        assert!(a < z);
        assert!(config.find("backend http:alpha\n").unwrap() < config.find("backend http:zeta\n").unwrap());
    }

    #[test]
    fn empty_host_becomes_default_backend() {
        let def = public(vec![http_route("web", vec![plain("", 5100)])]);
        let config = render(&def, &CertificateRegistry::new()).unwrap().config;
        assert!(config.contains("default_backend http:web"));
        assert!(!config.contains("use_backend"));
    }

    #[test]
    fn tcp_route_emits_listener_per_port() {
        let mut route = tcp_route("db", &[5301, 5300]);
        if let ProxyRoute::Tcp(tcp) = &mut route {
            tcp.check_enabled = true;
            tcp.log = true;
            tcp.max_connections = 100;
        }
        let config = render(&public(vec![route]), &CertificateRegistry::new())
            .unwrap()
            .config;

        let first = config.find("listen tcp:db-port-5300").unwrap();
        let second = config.find("listen tcp:db-port-5301").unwrap();
        assert!(first < second);
        assert_eq!(count(&config, "server server-0 10.0.0.9:5432 check"), 2);
        assert_eq!(count(&config, "option tcplog"), 2);
        assert_eq!(count(&config, "maxconn 100"), 2);
    }

    #[test]
    fn stats_listener_is_always_present() {
        let config = render(&public(vec![]), &CertificateRegistry::new())
            .unwrap()
            .config;
        assert!(config.contains("bind *:1936"));
        assert!(config.contains("stats uri /_stats"));
        assert!(config.contains("resolvers docker\n    nameserver ns-0 127.0.0.11:53"));
    }

    #[test]
    fn logging_is_or_across_routes_sharing_a_port() {
        let mut logged = http_route("logged", vec![plain("a.example.com", 80)]);
        if let ProxyRoute::Http(http) = &mut logged {
            http.log = true;
        }
        let quiet = http_route("quiet", vec![plain("b.example.com", 80)]);
        let config = render(&public(vec![logged, quiet]), &CertificateRegistry::new())
            .unwrap()
            .config;
        assert_eq!(count(&config, "option httplog"), 1);
    }

    #[test]
    fn health_check_and_backend_tls() {
        let mut route = http_route("api", vec![plain("api.example.com", 80)]);
        if let ProxyRoute::Http(http) = &mut route {
            http.check_enabled = true;
            http.check_uri = Some("/health".to_string());
            http.check_host = Some("api.example.com".to_string());
            http.https_redirect = true;
            http.backends.push(HttpBackend {
                name: Some("secure".to_string()),
                server: "10.0.0.6".to_string(),
                port: 8443,
                tls: true,
            });
        }
        let config = render(&public(vec![route]), &CertificateRegistry::new())
            .unwrap()
            .config;

        assert!(config.contains("option httpchk"));
        assert!(config.contains(
            "http-check send meth GET uri /health ver HTTP/1.0 hdr Host api.example.com"
        ));
        assert!(config.contains("http-check expect status 200"));
        assert!(config.contains("server server-0 10.0.0.5:8080 check\n"));
        assert!(config.contains(
            "server secure 10.0.0.6:8443 check ssl verify required ca-file /etc/ssl/certs/ca-certificates.crt"
        ));
        assert!(config.contains("http-request redirect scheme https code 301 if"));
    }

    #[test]
    fn check_without_uri_emits_no_httpchk() {
        let mut route = http_route("api", vec![plain("api.example.com", 80)]);
        if let ProxyRoute::Http(http) = &mut route {
            http.check_enabled = true;
        }
        let config = render(&public(vec![route]), &CertificateRegistry::new())
            .unwrap()
            .config;
        assert!(!config.contains("httpchk"));
        assert!(config.contains("10.0.0.5:8080 check"));
    }

    #[test]
    fn conflicting_tls_is_rejected_defensively() {
        let def = public(vec![
            http_route("a", vec![tls("site.example.com", 443, "site-cert")]),
            http_route("b", vec![plain("b.example.com", 443)]),
        ]);
        assert!(matches!(
            render(&def, &registry()),
            Err(ProxyError::TlsConflict { port: 443 })
        ));
    }

    #[test]
    fn missing_certificate_is_rejected_defensively() {
        let def = public(vec![http_route(
            "web",
            vec![tls("site.example.com", 443, "gone")],
        )]);
        assert!(matches!(
            render(&def, &registry()),
            Err(ProxyError::MissingCertificate(name)) if name == "gone"
        ));
    }

    #[test]
    fn no_tls_means_no_manifest() {
        let def = public(vec![http_route("web", vec![plain("a.example.com", 80)])]);
        let rendered = render(&def, &registry()).unwrap();
        assert!(rendered.manifest.is_empty());
        assert!(rendered.referenced.is_empty());
    }
}
