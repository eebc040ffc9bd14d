//! Remote proxy registry.
//!
//! The registry is loaded once at startup from a whitespace-delimited
//! credential file and never mutates afterwards. A remote's identity is its
//! load index; everything else in the pool refers to remotes by index.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

/// Protocol spoken by a remote proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Socks5 => f.write_str("socks5"),
            ProxyKind::Http => f.write_str("http"),
        }
    }
}

/// A single remote proxy endpoint with credentials.
///
/// Equality is by index: two entries with identical host/port but different
/// load positions are distinct remotes.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    /// Stable index assigned at load time.
    pub id: usize,
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl PartialEq for RemoteProxy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RemoteProxy {}

impl fmt::Display for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{} (#{})", self.kind, self.host, self.port, self.id)
    }
}

/// Immutable, indexed set of remote proxies.
pub struct Registry {
    remotes: Vec<RemoteProxy>,
}

impl Registry {
    /// Build a registry from already-parsed remotes. Indices are reassigned
    /// to match the final positions.
    pub fn from_remotes(remotes: Vec<RemoteProxy>) -> Self {
        let remotes = remotes
            .into_iter()
            .enumerate()
            .map(|(id, r)| RemoteProxy { id, ..r })
            .collect();
        Self { remotes }
    }

    /// Load the registry from a credential file.
    ///
    /// One record per line, whitespace-separated fields:
    /// `host port [user pass [kind]]`. Omitted user/pass default to
    /// `"1"`/`"1"`. Lines starting with `#` and blank lines are ignored.
    /// Malformed records are skipped with a debug log; an empty result is
    /// a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read proxy file {}", path.display()))?;

        let mut remotes = Vec::new();
        let mut rejected = 0usize;

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_record(line) {
                Ok((kind, host, port, user, pass)) => {
                    remotes.push(RemoteProxy {
                        id: remotes.len(),
                        kind,
                        host,
                        port,
                        user,
                        pass,
                    });
                }
                Err(reason) => {
                    debug!(line = lineno + 1, %reason, "skipping malformed proxy record");
                    rejected += 1;
                }
            }
        }

        if remotes.is_empty() {
            bail!(
                "proxy file {} contains no usable remotes ({} rejected)",
                path.display(),
                rejected
            );
        }

        if rejected > 0 {
            info!(
                loaded = remotes.len(),
                rejected, "loaded remote proxy registry (some records skipped)"
            );
        } else {
            info!(loaded = remotes.len(), "loaded remote proxy registry");
        }

        Ok(Self { remotes })
    }

    pub fn count(&self) -> usize {
        self.remotes.len()
    }

    pub fn get(&self, index: usize) -> Option<&RemoteProxy> {
        self.remotes.get(index)
    }
}

type ParsedRecord = (ProxyKind, String, u16, Option<String>, Option<String>);

fn parse_record(line: &str) -> std::result::Result<ParsedRecord, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 {
        return Err("expected at least host and port".into());
    }

    let host = fields[0].to_string();
    let port: u16 = fields[1]
        .parse()
        .map_err(|_| format!("invalid port {:?}", fields[1]))?;
    if port == 0 {
        return Err("port must be non-zero".into());
    }

    // Two-field records get the stock "1"/"1" credentials.
    let user = fields.get(2).copied().unwrap_or("1").to_string();
    let pass = fields.get(3).copied().unwrap_or("1").to_string();

    let kind = match fields.get(4) {
        None => ProxyKind::Socks5,
        Some(&"socks5") => ProxyKind::Socks5,
        Some(&"http") => ProxyKind::Http,
        Some(other) => return Err(format!("unknown proxy kind {other:?}")),
    };

    Ok((kind, host, port, Some(user), Some(pass)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(contents: &str) -> Result<Registry> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Registry::load(file.path())
    }

    #[test]
    fn parses_full_records() {
        let registry = load_str(
            "# comment\n\
             10.0.0.1 1080 alice secret\n\
             \n\
             proxy.example.net 3128 bob hunter2 http\n",
        )
        .unwrap();

        assert_eq!(registry.count(), 2);

        let first = registry.get(0).unwrap();
        assert_eq!(first.kind, ProxyKind::Socks5);
        assert_eq!(first.host, "10.0.0.1");
        assert_eq!(first.port, 1080);
        assert_eq!(first.user.as_deref(), Some("alice"));

        let second = registry.get(1).unwrap();
        assert_eq!(second.kind, ProxyKind::Http);
        assert_eq!(second.id, 1);
    }

    #[test]
    fn host_port_only_defaults_credentials() {
        let registry = load_str("10.0.0.1 1080\n").unwrap();
        let remote = registry.get(0).unwrap();
        assert_eq!(remote.user.as_deref(), Some("1"));
        assert_eq!(remote.pass.as_deref(), Some("1"));
        assert_eq!(remote.kind, ProxyKind::Socks5);
    }

    #[test]
    fn skips_malformed_records() {
        let registry = load_str(
            "10.0.0.1 notaport u p\n\
             10.0.0.2 0 u p\n\
             10.0.0.3 1080 u p ftp\n\
             10.0.0.4 1080 u p\n",
        )
        .unwrap();

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(0).unwrap().host, "10.0.0.4");
    }

    #[test]
    fn empty_registry_is_an_error() {
        assert!(load_str("# nothing here\n").is_err());
    }
}
