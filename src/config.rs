use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::domain::{HostTable, VirtualHost};
use crate::http::parser::ParseLimits;
use crate::http::redirect::RedirectRule;

/// Environment variable naming a YAML configuration file.
pub const CONFIG_ENV: &str = "POLYSERVE_CONFIG";
/// Environment variable overriding `listen_addr`.
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Event loop shards; each runs on its own thread.
    pub threads: usize,
    pub client_max_body_size: usize,
    pub max_uri_size: usize,
    pub max_header_size: usize,
    pub read_buffer_size: usize,
    pub poll_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub hosts: Vec<HostConfig>,
    pub mail: Option<MailConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let limits = ParseLimits::default();

        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            client_max_body_size: limits.max_body_size,
            max_uri_size: limits.max_uri_size,
            max_header_size: limits.max_header_size,
            read_buffer_size: 16 * 1024,
            poll_timeout_ms: 250,
            shutdown_timeout_secs: 10,
            hosts: Vec::new(),
            mail: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub name: String,
    /// Domain templates, e.g. `example.com` or `*.example.com`.
    pub domains: Vec<String>,
    pub redirects: Vec<RedirectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectConfig {
    /// Regex matched against the request path.
    pub location: String,
    /// Replacement; `#1`, `#2`... insert capture groups.
    pub destination: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    /// Upgrade with STARTTLS after the first EHLO.
    pub tls: bool,
    pub ehlo_domain: String,
    pub from: String,
    pub timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            tls: false,
            ehlo_domain: "localhost".to_string(),
            from: String::new(),
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Loads the file named by `POLYSERVE_CONFIG` when set, otherwise the
    /// defaults, then applies the `LISTEN` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(addr) = std::env::var(LISTEN_ENV) {
            config.listen_addr = addr;
        }

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        if config.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        Ok(config)
    }

    pub fn limits(&self) -> ParseLimits {
        ParseLimits {
            max_body_size: self.client_max_body_size,
            max_uri_size: self.max_uri_size,
            max_header_size: self.max_header_size,
        }
    }

    /// Builds the virtual host table. Without configured hosts a single
    /// catch-all host named `default` is created.
    pub fn host_table(&self) -> anyhow::Result<HostTable> {
        let mut table = HostTable::new();

        if self.hosts.is_empty() {
            let mut host = VirtualHost::new("default");
            host.add_domain("*")?;
            table.add(host);
            return Ok(table);
        }

        for host_config in &self.hosts {
            let mut host = VirtualHost::new(host_config.name.as_str());
            for domain in &host_config.domains {
                host.add_domain(domain)
                    .with_context(|| format!("host {}: bad domain {}", host_config.name, domain))?;
            }
            for redirect in &host_config.redirects {
                let rule = RedirectRule::new(&redirect.location, &redirect.destination)
                    .with_context(|| format!("host {}: bad redirect {}", host_config.name, redirect.location))?;
                host.add_redirect(rule);
            }
            table.add(host);
        }

        Ok(table)
    }
}
