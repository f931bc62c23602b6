//! Collaborators the engine consults but does not own: name resolution,
//! HTTP credentials and cookies.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::lookup_host;

use crate::util::timeout_with_context;

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// Resolves through the operating system.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let lookup = timeout_with_context(
            self.timeout,
            lookup_host((host, port)),
            format!("resolving {host}:{port}"),
        )
        .await?;
        let addrs: Vec<SocketAddr> = lookup.collect();
        if addrs.is_empty() {
            bail!("{host} did not resolve to any address");
        }
        Ok(addrs)
    }
}

pub trait CredentialStore: Send + Sync {
    /// Basic token (base64 `user:password`) for `host`, optionally scoped to
    /// a realm.
    fn lookup(&self, host: &str, realm: Option<&str>) -> Option<String>;

    /// Records that `host` asked for credentials in `realm`.
    fn register_challenge(&self, host: &str, realm: &str);
}

pub trait CookieJar: Send + Sync {
    /// Value for the `Cookie` header, if anything is stored for the target.
    fn cookies_for(&self, host: &str, path: &str) -> Option<String>;

    fn remember(&self, host: &str, set_cookie: &str);
}

#[derive(Debug, Default)]
pub struct MemoryCredentials {
    tokens: Mutex<HashMap<(String, Option<String>), String>>,
    challenges: Mutex<Vec<(String, String)>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token stored without a realm answers for every realm of the host.
    pub fn insert(&self, host: &str, realm: Option<&str>, token: impl Into<String>) {
        self.tokens.lock().insert(
            (host.to_ascii_lowercase(), realm.map(str::to_string)),
            token.into(),
        );
    }

    pub fn challenges(&self) -> Vec<(String, String)> {
        self.challenges.lock().clone()
    }
}

impl CredentialStore for MemoryCredentials {
    fn lookup(&self, host: &str, realm: Option<&str>) -> Option<String> {
        let host = host.to_ascii_lowercase();
        let tokens = self.tokens.lock();
        realm
            .and_then(|realm| tokens.get(&(host.clone(), Some(realm.to_string()))))
            .or_else(|| tokens.get(&(host, None)))
            .cloned()
    }

    fn register_challenge(&self, host: &str, realm: &str) {
        let mut challenges = self.challenges.lock();
        let entry = (host.to_ascii_lowercase(), realm.to_string());
        if !challenges.contains(&entry) {
            challenges.push(entry);
        }
    }
}

/// Host-scoped name/value jar. Cookie attributes other than the pair itself
/// are ignored.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    hosts: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CookieJar for MemoryCookieJar {
    fn cookies_for(&self, host: &str, _path: &str) -> Option<String> {
        let hosts = self.hosts.lock();
        let cookies = hosts.get(&host.to_ascii_lowercase())?;
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn remember(&self, host: &str, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or_default();
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.hosts
            .lock()
            .entry(host.to_ascii_lowercase())
            .or_default()
            .insert(name.to_string(), value.trim().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_prefer_realm_specific_token() {
        let store = MemoryCredentials::new();
        store.insert("Example.com", None, "any");
        store.insert("example.com", Some("admin"), "admin-token");
        assert_eq!(
            store.lookup("example.com", Some("admin")).as_deref(),
            Some("admin-token")
        );
        assert_eq!(store.lookup("example.com", Some("other")).as_deref(), Some("any"));
        assert_eq!(store.lookup("elsewhere.test", None), None);
    }

    #[test]
    fn challenges_are_recorded_once() {
        let store = MemoryCredentials::new();
        store.register_challenge("example.com", "area");
        store.register_challenge("EXAMPLE.com", "area");
        assert_eq!(
            store.challenges(),
            vec![("example.com".to_string(), "area".to_string())]
        );
    }

    #[test]
    fn cookie_jar_replaces_and_joins() {
        let jar = MemoryCookieJar::new();
        assert_eq!(jar.cookies_for("example.com", "/"), None);
        jar.remember("example.com", "a=1; Path=/");
        jar.remember("example.com", "b=2");
        jar.remember("example.com", "a=3");
        jar.remember("example.com", "garbage");
        assert_eq!(
            jar.cookies_for("example.com", "/").as_deref(),
            Some("a=3; b=2")
        );
    }

    #[tokio::test]
    async fn system_resolver_handles_literals() -> Result<()> {
        let resolver = SystemResolver::new(Duration::from_secs(5));
        let addrs = resolver.resolve("127.0.0.1", 8080).await?;
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse::<SocketAddr>()?]);
        Ok(())
    }
}
