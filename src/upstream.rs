use url::Url;

use crate::auth::Auth;

/// Error type for upstream URL parsing
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum UpstreamParseError {
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    #[error("unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),

    #[error("upstream url is missing a host")]
    MissingHost,
}

/// The route a user's tunnels take to reach their targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Connect straight to the target address.
    Direct,
    /// CONNECT through a SOCKS5 proxy.
    Socks5 { host: String, auth: Option<Auth> },
    /// CONNECT through an HTTP proxy.
    HttpConnect { host: String, auth: Option<Auth> },
}

/// A user's parsed upstream specification.
///
/// Immutable once constructed; an admin update replaces the whole value, so
/// concurrent readers holding a clone never observe a partial write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    raw: String,
    route: Route,
}

impl UpstreamSpec {
    /// Parse an admin-supplied `scheme://[user:pass@]host[:port]` string.
    ///
    /// Accepted schemes are `direct`, `socks5`, `http` and `https`; `http`
    /// and `https` both select the HTTP CONNECT route. `direct://` ignores
    /// any host or credentials. When the port is omitted, `http`/`https`
    /// fall back to their well-known ports and `socks5` to 1080.
    pub fn parse(raw: &str) -> Result<Self, UpstreamParseError> {
        let url = Url::parse(raw).map_err(|e| UpstreamParseError::InvalidUrl(e.to_string()))?;

        let route = match url.scheme() {
            "direct" => Route::Direct,
            "socks5" => Route::Socks5 {
                host: host_port(&url, 1080)?,
                auth: embedded_auth(&url),
            },
            "http" | "https" => Route::HttpConnect {
                host: host_port(&url, if url.scheme() == "https" { 443 } else { 80 })?,
                auth: embedded_auth(&url),
            },
            other => return Err(UpstreamParseError::UnsupportedScheme(other.to_string())),
        };

        Ok(Self {
            raw: raw.to_string(),
            route,
        })
    }

    /// The implicit specification for users with no admin-configured route.
    pub fn direct() -> Self {
        Self {
            raw: "direct://".to_string(),
            route: Route::Direct,
        }
    }

    /// The admin-supplied string this specification was parsed from
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn route(&self) -> &Route {
        &self.route
    }
}

fn host_port(url: &Url, default_port: u16) -> Result<String, UpstreamParseError> {
    let host = url.host_str().filter(|h| !h.is_empty());
    let host = host.ok_or(UpstreamParseError::MissingHost)?;
    let port = url.port_or_known_default().unwrap_or(default_port);
    Ok(format!("{}:{}", host, port))
}

fn embedded_auth(url: &Url) -> Option<Auth> {
    if url.username().is_empty() {
        return None;
    }
    Some(Auth::new(
        url.username().to_string(),
        url.password().unwrap_or("").to_string(),
    ))
}
