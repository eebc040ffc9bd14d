//! Command-line configuration.

use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;

/// Local proxy pool front-end.
///
/// Binds a contiguous range of local ports, each speaking both HTTP proxy
/// and SOCKS5, tunneled through rotating authenticated remote proxies. An
/// HTTP endpoint hands out one ready port per request.
#[derive(Debug, Clone, Parser)]
#[command(name = "portpool", version, about)]
pub struct Config {
    /// Address the control endpoint binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the control endpoint.
    #[arg(long = "port", default_value_t = 7777)]
    pub web_port: u16,

    /// Remote proxy credential file (one `host port [user pass [kind]]`
    /// record per line).
    #[arg(long, default_value = "all_proxies.txt")]
    pub proxy_file: PathBuf,

    /// Upper bound on concurrently bound ports.
    #[arg(long, default_value_t = 200)]
    pub max_active_proxies: usize,

    /// First local proxy port.
    #[arg(long, default_value_t = 10000)]
    pub port_base: u16,

    /// Number of local proxy ports.
    #[arg(long, default_value_t = 100)]
    pub port_count: u16,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.port_count > 0, "--port-count must be at least 1");
        ensure!(
            u32::from(self.port_base) + u32::from(self.port_count) <= 65536,
            "--port-base {} with --port-count {} exceeds the port space",
            self.port_base,
            self.port_count
        );
        ensure!(
            self.max_active_proxies > 0,
            "--max-active-proxies must be at least 1"
        );
        Ok(())
    }

    /// The fixed set of local proxy ports.
    pub fn ports(&self) -> Vec<u16> {
        (0..self.port_count).map(|i| self.port_base + i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from(["portpool"])
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = base();
        assert_eq!(config.web_port, 7777);
        assert_eq!(config.port_base, 10000);
        assert_eq!(config.port_count, 100);
        assert_eq!(config.max_active_proxies, 200);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_range_overflow() {
        let mut config = base();
        config.port_base = 65500;
        config.port_count = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ports_are_contiguous() {
        let mut config = base();
        config.port_base = 20000;
        config.port_count = 3;
        assert_eq!(config.ports(), vec![20000, 20001, 20002]);
    }
}
