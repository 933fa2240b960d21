use std::{fmt, str::FromStr};

const TCP_SCHEME: &str = "tcp://";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("unsupported scheme in {0:?}, expected tcp://host:port")]
    UnsupportedScheme(String),
    #[error("missing port in {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("empty host in {0:?}")]
    EmptyHost(String),
}

/// The transport locator used to dial a peer, `tcp://host:port`.
///
/// A locator belongs to configuration rather than to a live connection: the
/// same locator is dialled again whenever its connection goes away.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri {
    host: String,
    port: u16,
}

impl Uri {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, in the form accepted by `tokio::net::lookup_host`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(TCP_SCHEME)
            .ok_or_else(|| UriError::UnsupportedScheme(s.into()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| UriError::MissingPort(s.into()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| UriError::InvalidPort(s.into()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(UriError::EmptyHost(s.into()));
        }
        Ok(Self::tcp(host, port))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", TCP_SCHEME, self.authority())
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({})", self)
    }
}
