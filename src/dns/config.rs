//! resolved.conf compatible configuration loading
//!
//! The effective configuration is assembled from the main file, the drop-in
//! directory, and, when no `DNS=` was configured anywhere, from discovery
//! sources: `networkctl status` output first, then `/etc/resolv.conf`. As a
//! last resort the first `FallbackDNS=` entry is promoted to the primary
//! list. A configuration without any usable primary server is an error; the
//! proxy never falls back to implicit public resolvers.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use derive_more::{Display, Error, From};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/systemd/resolved.conf";
pub const CONFIG_DROPIN_DIR: &str = "/etc/systemd/resolved.conf.d";
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.53";
pub const DNS_PORT: u16 = 53;

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    NoDnsConfigured,
}

type Result<T> = std::result::Result<T, ConfigError>;

/// A single upstream server or extra listen address.
///
/// Accepted spellings: `1.2.3.4`, `1.2.3.4:5353`, `2001:db8::1`,
/// `[2001:db8::1]` and `[2001:db8::1]:5353`. The port defaults to 53.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: &str) -> ServerEndpoint {
        ServerEndpoint {
            host: host.to_string(),
            port: DNS_PORT,
        }
    }

    pub fn parse(s: &str) -> Option<ServerEndpoint> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6: [::1] or [::1]:53
            let close = match rest.find(']') {
                Some(idx) => idx,
                None => {
                    return Some(ServerEndpoint {
                        host: rest.to_string(),
                        port: DNS_PORT,
                    })
                }
            };

            let host = rest[..close].to_string();
            if host.is_empty() {
                return None;
            }

            let port = match rest[close + 1..].strip_prefix(':') {
                Some(port_str) => port_str.parse().ok()?,
                None => DNS_PORT,
            };

            return Some(ServerEndpoint { host, port });
        }

        let colons = s.chars().filter(|c| *c == ':').count();
        if colons > 1 {
            // Bare IPv6 address
            return Some(ServerEndpoint {
                host: s.to_string(),
                port: DNS_PORT,
            });
        }

        if colons == 1 {
            // host:port
            let (host, port_str) = s.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }

            return Some(ServerEndpoint {
                host: host.to_string(),
                port: port_str.parse().ok()?,
            });
        }

        Some(ServerEndpoint {
            host: s.to_string(),
            port: DNS_PORT,
        })
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DNS_PORT {
            write!(f, "{}", self.host)
        } else if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_endpoint_list(value: &str) -> Vec<ServerEndpoint> {
    value
        .split_whitespace()
        .filter_map(|entry| match ServerEndpoint::parse(entry) {
            Some(endpoint) => Some(endpoint),
            None => {
                log::warn!("Skipping invalid server endpoint: {}", entry);
                None
            }
        })
        .collect()
}

fn parse_bool(value: &str, default: bool) -> bool {
    if value.is_empty() {
        return default;
    }

    matches!(value.to_lowercase().as_str(), "yes" | "true" | "1")
}

fn is_localhost(server: &str) -> bool {
    server.starts_with("127.") || server == "::1"
}

/// A source of nameservers consulted when no `DNS=` was configured.
///
/// Keeping this behind a trait lets tests substitute predictable sources for
/// the process-backed and file-backed implementations below.
pub trait NameserverSource {
    fn discover(&self) -> Vec<String>;
}

/// Harvests DHCP-advertised servers from `networkctl status` output.
pub struct NetworkctlSource;

impl NameserverSource for NetworkctlSource {
    fn discover(&self) -> Vec<String> {
        let output = match Command::new("networkctl").arg("status").output() {
            Ok(output) => output,
            Err(e) => {
                log::debug!("Failed to run networkctl status: {}", e);
                return Vec::new();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("DNS:"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty() && !is_localhost(value))
            .collect()
    }
}

/// Collects `nameserver` entries from a resolv.conf style file, skipping
/// loopback entries that usually point back at a systemd-resolved stub.
pub struct ResolvConfSource {
    path: PathBuf,
}

impl ResolvConfSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> ResolvConfSource {
        ResolvConfSource { path: path.into() }
    }
}

impl NameserverSource for ResolvConfSource {
    fn discover(&self) -> Vec<String> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                log::debug!("Failed to read {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        let mut nameservers = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("nameserver") {
                let server = rest.trim();
                if !server.is_empty() && !is_localhost(server) {
                    nameservers.push(server.to_string());
                }
            }
        }

        nameservers
    }
}

/// The effective, immutable configuration the proxy runs with.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub dns: Vec<ServerEndpoint>,
    pub fallback_dns: Vec<ServerEndpoint>,
    pub cache: bool,
    pub dns_stub_listener: bool,
    pub dns_stub_listener_extra: Vec<ServerEndpoint>,
    pub bind_address: String,
    pub warning: Option<String>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        ResolvedConfig {
            dns: Vec::new(),
            fallback_dns: Vec::new(),
            cache: true,
            dns_stub_listener: true,
            dns_stub_listener_extra: Vec::new(),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            warning: None,
        }
    }
}

/// Parser for the `resolved.conf` configuration chain.
pub struct ResolvedConfigParser {
    dropin_dir: PathBuf,
    sources: Vec<Box<dyn NameserverSource>>,
}

impl ResolvedConfigParser {
    pub fn new() -> ResolvedConfigParser {
        ResolvedConfigParser {
            dropin_dir: PathBuf::from(CONFIG_DROPIN_DIR),
            sources: vec![
                Box::new(NetworkctlSource),
                Box::new(ResolvConfSource::new(RESOLV_CONF_PATH)),
            ],
        }
    }

    pub fn with_dropin_dir<P: Into<PathBuf>>(mut self, dir: P) -> ResolvedConfigParser {
        self.dropin_dir = dir.into();
        self
    }

    pub fn with_sources(mut self, sources: Vec<Box<dyn NameserverSource>>) -> ResolvedConfigParser {
        self.sources = sources;
        self
    }

    pub fn parse(&self, config_path: &Path) -> Result<ResolvedConfig> {
        let mut config = ResolvedConfig::default();

        if config_path.exists() {
            self.parse_file(config_path, &mut config);
        } else {
            log::info!(
                "Config file not found: {}, using defaults",
                config_path.display()
            );
        }

        self.parse_dropin_dir(&mut config);

        if config.dns.is_empty() {
            self.discover_nameservers(&mut config);
        }

        if config.dns.is_empty() {
            if config.fallback_dns.is_empty() {
                return Err(ConfigError::NoDnsConfigured);
            }

            let promoted = config.fallback_dns.remove(0);
            config.warning = Some(format!(
                "No DNS configured. Using first FallbackDNS ({}) as primary DNS.",
                promoted
            ));
            config.dns.push(promoted);
        }

        Ok(config)
    }

    fn parse_dropin_dir(&self, config: &mut ResolvedConfig) {
        let entries = match fs::read_dir(&self.dropin_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
            .collect();

        files.sort();

        for file in files {
            self.parse_file(&file, config);
        }
    }

    fn parse_file(&self, path: &Path, config: &mut ResolvedConfig) {
        log::debug!("Parsing config file: {}", path.display());

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}", path.display(), e);
                return;
            }
        };

        let mut in_resolve_section = false;

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                in_resolve_section = line.eq_ignore_ascii_case("[resolve]");
                continue;
            }

            if !in_resolve_section {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                self.apply_value(key.trim(), value.trim(), config);
            }
        }
    }

    fn apply_value(&self, key: &str, value: &str, config: &mut ResolvedConfig) {
        match key {
            // List keys accumulate across repeated lines and across files
            "DNS" => config.dns.extend(parse_endpoint_list(value)),
            "FallbackDNS" => config.fallback_dns.extend(parse_endpoint_list(value)),
            "DNSStubListenerExtra" => config
                .dns_stub_listener_extra
                .extend(parse_endpoint_list(value)),
            "Cache" => config.cache = parse_bool(value, true),
            "DNSStubListener" => config.dns_stub_listener = parse_bool(value, true),
            "BindAddress" => {
                if !value.is_empty() {
                    config.bind_address = value.to_string();
                }
            }
            _ => log::warn!("Unknown config key: {}", key),
        }
    }

    fn discover_nameservers(&self, config: &mut ResolvedConfig) {
        for source in &self.sources {
            let discovered = source.discover();
            if discovered.is_empty() {
                continue;
            }

            log::info!(
                "No DNS= configured, using {} discovered nameservers",
                discovered.len()
            );
            config
                .dns
                .extend(discovered.iter().flat_map(|s| ServerEndpoint::parse(s)));

            if !config.dns.is_empty() {
                return;
            }
        }
    }
}

impl Default for ResolvedConfigParser {
    fn default() -> Self {
        ResolvedConfigParser::new()
    }
}
