//! Proxy configuration shared by HTTP requests and WebSocket connections.

use serde::Deserialize;

use crate::error::{ClientError, NetError};

/// Supported proxy protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
    /// SOCKS5 with hostname resolution on the proxy side.
    Socks5Hostname,
}

impl ProxyType {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks4a => "socks4a",
            ProxyType::Socks5 => "socks5",
            ProxyType::Socks5Hostname => "socks5h",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// Immutable proxy description. Requests and connections hold it as
/// `Arc<ProxyConfig>`; nothing mutates it after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type")]
    pub kind: ProxyType,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyConfig {
    pub fn new(kind: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// `host:port` authority of the proxy itself.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL with percent-encoded credentials, e.g. `socks5h://u:p@host:1080`.
    pub fn to_url(&self) -> Result<reqwest::Url, NetError> {
        let invalid = |what: &str| -> NetError {
            ClientError::InvalidConfiguration(format!("proxy {what}")).into()
        };
        let mut url = reqwest::Url::parse(&format!("{}://{}", self.kind.scheme(), self.authority()))
            .map_err(|e| invalid(&e.to_string()))?;
        if let Some(creds) = &self.credentials {
            url.set_username(&creds.username)
                .map_err(|_| invalid("username rejected"))?;
            url.set_password(Some(&creds.password))
                .map_err(|_| invalid("password rejected"))?;
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_url_with_credentials() {
        let proxy = ProxyConfig::new(ProxyType::Socks5Hostname, "10.0.0.1", 1080)
            .with_credentials("user", "p@ss");
        let url = proxy.to_url().unwrap();
        assert_eq!(url.scheme(), "socks5h");
        assert_eq!(url.username(), "user");
        assert_eq!(url.password(), Some("p%40ss"));
        assert_eq!(url.port(), Some(1080));
    }

    #[test]
    fn test_proxy_validity() {
        assert!(ProxyConfig::new(ProxyType::Http, "proxy.local", 3128).is_valid());
        assert!(!ProxyConfig::new(ProxyType::Http, "", 3128).is_valid());
        assert!(!ProxyConfig::new(ProxyType::Http, "proxy.local", 0).is_valid());
    }

    #[test]
    fn test_proxy_deserialize() {
        let proxy: ProxyConfig = serde_json::from_str(
            r#"{"type":"socks5","host":"127.0.0.1","port":9050}"#,
        )
        .unwrap();
        assert_eq!(proxy.kind, ProxyType::Socks5);
        assert!(proxy.credentials.is_none());
    }
}
