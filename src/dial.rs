use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;

use crate::auth::Auth;
use crate::upstream::{Route, UpstreamSpec};

/// Transport connection to a tunnel target, however it was reached
pub type TargetStream = Box<dyn AsyncRead + AsyncWrite + Send + Unpin>;

/// Connect timeout for reaching an HTTP CONNECT upstream
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on the response head an HTTP upstream may send back
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Error type for opening target connections
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to upstream proxy {0}")]
    UpstreamTimeout(String),

    #[error("SOCKS5 handshake with {host} failed: {source}")]
    Socks {
        host: String,
        #[source]
        source: tokio_socks::Error,
    },

    #[error("upstream proxy {host} refused CONNECT with status {status}")]
    UpstreamRefused { host: String, status: u16 },

    #[error("upstream proxy {0} sent an invalid CONNECT response")]
    BadUpstreamResponse(String),
}

/// Opens transport connections to arbitrary targets through one route.
///
/// The SOCKS5 handshake is delegated to `tokio-socks`; the HTTP CONNECT
/// handshake leaves the upstream connection carrying raw tunnel bytes. Every
/// variant is returned as a [`TargetStream`] ready for relaying.
#[derive(Debug, Clone)]
pub struct Dialer {
    route: Route,
}

impl Dialer {
    pub fn new(spec: &UpstreamSpec) -> Self {
        Self {
            route: spec.route().clone(),
        }
    }

    /// Open a connection to `target` (`host:port`) through this route.
    pub async fn open(&self, target: &str) -> Result<TargetStream, DialError> {
        match &self.route {
            Route::Direct => {
                let stream =
                    TcpStream::connect(target)
                        .await
                        .map_err(|e| DialError::Connect {
                            addr: target.to_string(),
                            source: e,
                        })?;
                Ok(Box::new(stream))
            }
            Route::Socks5 { host, auth } => {
                let stream = match auth {
                    Some(auth) => {
                        Socks5Stream::connect_with_password(
                            host.as_str(),
                            target,
                            &auth.username,
                            &auth.password,
                        )
                        .await
                    }
                    None => Socks5Stream::connect(host.as_str(), target).await,
                }
                .map_err(|e| DialError::Socks {
                    host: host.clone(),
                    source: e,
                })?;
                Ok(Box::new(stream))
            }
            Route::HttpConnect { host, auth } => {
                let stream = http_connect(host, auth.as_ref(), target).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Perform an HTTP CONNECT handshake against an upstream proxy.
///
/// Writes the CONNECT request (with Basic proxy authorization when
/// credentials are embedded in the upstream URL) and reads exactly one
/// response head off the connection. A 200 hands the same connection back as
/// the tunnel transport; any other status is a dial failure.
async fn http_connect(
    host: &str,
    auth: Option<&Auth>,
    target: &str,
) -> Result<TcpStream, DialError> {
    let mut stream = timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(host))
        .await
        .map_err(|_| DialError::UpstreamTimeout(host.to_string()))?
        .map_err(|e| DialError::Connect {
            addr: host.to_string(),
            source: e,
        })?;

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            auth.basic_token()
        ));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| DialError::Connect {
            addr: host.to_string(),
            source: e,
        })?;

    let status = read_response_status(&mut stream, host).await?;
    if status != 200 {
        return Err(DialError::UpstreamRefused {
            host: host.to_string(),
            status,
        });
    }

    Ok(stream)
}

/// Read one HTTP response head and return its status code.
///
/// Reads byte-by-byte up to the blank line so no tunnel payload the target
/// sends right after the proxy's response is consumed.
async fn read_response_status(stream: &mut TcpStream, host: &str) -> Result<u16, DialError> {
    let mut head = Vec::with_capacity(256);

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(DialError::BadUpstreamResponse(host.to_string()));
        }
        let byte = stream
            .read_u8()
            .await
            .map_err(|_| DialError::BadUpstreamResponse(host.to_string()))?;
        head.push(byte);
    }

    parse_status_line(&head).ok_or_else(|| DialError::BadUpstreamResponse(host.to_string()))
}

fn parse_status_line(head: &[u8]) -> Option<u16> {
    let line = head.split(|&b| b == b'\r').next()?;
    let line = std::str::from_utf8(line).ok()?;

    let mut fields = line.split_whitespace();
    let version = fields.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    fields.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 200 Connection established\r\n\r\n"),
            Some(200)
        );
        assert_eq!(parse_status_line(b"HTTP/1.0 407 Auth Required\r\n\r\n"), Some(407));
        assert_eq!(parse_status_line(b"HTTP/1.1 200\r\n\r\n"), Some(200));
        assert_eq!(parse_status_line(b"SSH-2.0-OpenSSH\r\n\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 abc\r\n\r\n"), None);
    }

    /// Fake HTTP proxy that captures the request head and answers with a
    /// fixed response.
    async fn fake_proxy(response: &'static str) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                let byte = socket.read_u8().await.unwrap();
                head.push(byte);
            }
            let _ = tx.send(String::from_utf8(head).unwrap());
            socket.write_all(response.as_bytes()).await.unwrap();
            // Keep the connection open briefly so the dialer can finish reading
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        (addr.to_string(), rx)
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dialer = Dialer::new(&UpstreamSpec::direct());
        assert!(dialer.open(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_direct_dial_failure() {
        // Port 1 on loopback is not listening
        let dialer = Dialer::new(&UpstreamSpec::direct());
        assert!(matches!(
            dialer.open("127.0.0.1:1").await,
            Err(DialError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_connect_handshake() {
        let (proxy_addr, head_rx) =
            fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;

        let spec = UpstreamSpec::parse(&format!("http://{proxy_addr}")).unwrap();
        let stream = Dialer::new(&spec).open("example.com:443").await;
        assert!(stream.is_ok());

        let head = head_rx.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com:443\r\n"));
        assert!(!head.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_http_connect_sends_proxy_authorization() {
        let (proxy_addr, head_rx) = fake_proxy("HTTP/1.1 200 OK\r\n\r\n").await;

        let spec = UpstreamSpec::parse(&format!("http://u:p@{proxy_addr}")).unwrap();
        Dialer::new(&spec)
            .open("example.com:80")
            .await
            .expect("handshake should succeed");

        let head = head_rx.await.unwrap();
        let token = Auth::new("u".to_string(), "p".to_string()).basic_token();
        assert!(head.contains(&format!("Proxy-Authorization: Basic {token}\r\n")));
    }

    #[tokio::test]
    async fn test_http_connect_refused_by_upstream() {
        let (proxy_addr, _head_rx) =
            fake_proxy("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;

        let spec = UpstreamSpec::parse(&format!("http://{proxy_addr}")).unwrap();
        let result = Dialer::new(&spec).open("example.com:80").await;
        assert!(matches!(
            result,
            Err(DialError::UpstreamRefused { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_http_connect_garbage_response() {
        let (proxy_addr, _head_rx) = fake_proxy("SSH-2.0-OpenSSH_9.0\r\n\r\n").await;

        let spec = UpstreamSpec::parse(&format!("http://{proxy_addr}")).unwrap();
        let result = Dialer::new(&spec).open("example.com:80").await;
        assert!(matches!(result, Err(DialError::BadUpstreamResponse(_))));
    }

    #[tokio::test]
    async fn test_http_connect_unreachable_upstream() {
        let spec = UpstreamSpec::parse("http://127.0.0.1:1").unwrap();
        let result = Dialer::new(&spec).open("example.com:80").await;
        assert!(matches!(
            result,
            Err(DialError::Connect { .. }) | Err(DialError::UpstreamTimeout(_))
        ));
    }
}
