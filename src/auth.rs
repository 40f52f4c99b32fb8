use base64::engine::general_purpose;
use base64::Engine;
use hyper::header::HeaderValue;

/// Error type for proxy credential extraction
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Proxy-Authorization header")]
    Missing,

    #[error("unsupported authorization scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed Basic credentials")]
    Malformed,
}

/// A username/password pair.
///
/// Used both for credentials embedded in an upstream URL and for the
/// credentials a tunnel client presents. The client password is carried but
/// never verified anywhere; routing and invalidation key on the username
/// alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    /// Create new authentication credentials
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Encode as a Basic authorization token (base64 of `user:pass`)
    pub fn basic_token(&self) -> String {
        general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

/// Extract Basic credentials from a Proxy-Authorization header.
///
/// The header must be present and carry the `Basic` scheme (case-insensitive);
/// its payload must be valid base64 of `user:password`. Anything before the
/// first colon is the username; a payload without a colon yields an empty
/// password.
pub fn parse_proxy_authorization(header: Option<&HeaderValue>) -> Result<Auth, AuthError> {
    let header = header.ok_or(AuthError::Missing)?;
    let value = header.to_str().map_err(|_| AuthError::Malformed)?;

    let mut parts = value.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or("");
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::UnsupportedScheme(scheme.to_string()));
    }
    let payload = parts.next().ok_or(AuthError::Malformed)?.trim();

    let decoded = general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;

    let mut fields = decoded.splitn(2, ':');
    let username = fields.next().unwrap_or("").to_string();
    let password = fields.next().unwrap_or("").to_string();
    Ok(Auth::new(username, password))
}
