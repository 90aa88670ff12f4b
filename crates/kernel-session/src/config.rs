//! Server connection settings.

use std::time::Duration;

use url::Url;

use crate::error::SessionError;

/// Which generation of the notebook server HTTP API to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerFlavor {
    /// `/api/contents` for documents, kernel id from the start-kernel reply.
    #[default]
    Contents,
    /// `/notebooks` listing and documents, kernel id resolved from the
    /// listing when the start-kernel reply does not carry it.
    Legacy,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Always ends with `/` so relative endpoints keep any path prefix.
    pub base_url: Url,
    pub password: Option<String>,
    /// Sent in the `username` field of every message header.
    pub username: String,
    pub flavor: ServerFlavor,
    /// Upper bound for each HTTP control call.
    pub request_timeout: Duration,
    /// Default deadline for completion requests.
    pub complete_timeout: Duration,
}

impl ServerConfig {
    /// Parse a server address: `host:port`, or a full `http(s)://` URL.
    pub fn new(address: &str) -> Result<Self, SessionError> {
        let address = address.trim();
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let mut base_url = Url::parse(&with_scheme)
            .map_err(|e| SessionError::InvalidAddress(format!("{}: {}", address, e)))?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SessionError::InvalidAddress(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            password: None,
            username: "username".to_string(),
            flavor: ServerFlavor::default(),
            request_timeout: Duration::from_secs(30),
            complete_timeout: Duration::from_secs(1),
        })
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_flavor(mut self, flavor: ServerFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_complete_timeout(mut self, timeout: Duration) -> Self {
        self.complete_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_gets_http_scheme() {
        let config = ServerConfig::new("localhost:8888").unwrap();
        assert_eq!(config.base_url.as_str(), "http://localhost:8888/");
        assert_eq!(config.flavor, ServerFlavor::Contents);
    }

    #[test]
    fn test_path_prefix_keeps_trailing_slash() {
        let config = ServerConfig::new("https://hub.example.org/user/ada").unwrap();
        assert_eq!(config.base_url.as_str(), "https://hub.example.org/user/ada/");
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(matches!(
            ServerConfig::new("ftp://example.org"),
            Err(SessionError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::new("127.0.0.1:9000")
            .unwrap()
            .with_password("secret")
            .with_flavor(ServerFlavor::Legacy)
            .with_complete_timeout(Duration::from_millis(250));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.flavor, ServerFlavor::Legacy);
        assert_eq!(config.complete_timeout, Duration::from_millis(250));
    }
}
