use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::auth::parse_proxy_authorization;
use crate::config::GatewayConfig;
use crate::dial::Dialer;
use crate::registry::AppState;
use crate::relay::relay;
use crate::{empty, full};

/// Handle one CONNECT request end to end.
///
/// Order matters on the hot path: the tunnel registers its cancellation
/// handle before looking up the user's route, while a routing update writes
/// the route before draining handles. Whichever way the two interleave, the
/// tunnel either dials under the new route or is force-closed.
pub async fn handle(
    mut req: Request<Incoming>,
    state: Arc<AppState>,
    config: Arc<GatewayConfig>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let auth = match parse_proxy_authorization(req.headers().get(PROXY_AUTHORIZATION)) {
        Ok(auth) => auth,
        Err(e) => {
            debug!("rejected tunnel request: {}", e);
            return Ok(auth_required_response(&config.realm));
        }
    };
    let user = auth.username;

    if req.method() != Method::CONNECT {
        let mut resp = Response::new(full("only CONNECT is supported"));
        *resp.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(resp);
    }

    let Some(target) = host_addr(req.uri()) else {
        warn!(user = %user, "CONNECT target is not host:port: {:?}", req.uri());
        let mut resp = Response::new(full("CONNECT must be to host:port"));
        *resp.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(resp);
    };

    // The hijack equivalent: without an upgrade handle the raw transport can
    // never be handed to the relay.
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        warn!(user = %user, "connection does not support detaching");
        let mut resp = Response::new(full("hijacking not supported"));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(resp);
    };

    let handle = state.tunnels.register(&user).await;

    let spec = state.routes.get(&user).await;
    let dialer = Dialer::new(&spec);
    let target_stream = match dialer.open(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(user = %user, target = %target, upstream = spec.raw(), "dial failed: {}", e);
            state.tunnels.deregister(&user, handle.id).await;
            let mut resp = Response::new(full("bad gateway"));
            *resp.status_mut() = StatusCode::BAD_GATEWAY;
            return Ok(resp);
        }
    };

    debug!(user = %user, target = %target, upstream = spec.raw(), "tunnel established");

    let idle_timeout = config.idle_timeout;
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(user = %user, "detach failed: {}", e);
                state.tunnels.deregister(&user, handle.id).await;
                return;
            }
        };

        let client = TokioIo::new(upgraded);
        match relay(client, target_stream, handle.token, idle_timeout).await {
            Ok((from_client, from_target)) => {
                debug!(user = %user, target = %target, from_client, from_target, "tunnel closed");
            }
            Err(e) => {
                debug!(user = %user, target = %target, "tunnel ended with error: {}", e);
            }
        }
        state.tunnels.deregister(&user, handle.id).await;
    });

    // The handshake reply the CONNECT client sees before raw bytes flow
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::OK;
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    Ok(resp)
}

fn auth_required_response(realm: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"proxy\""));

    let mut resp = Response::new(full("proxy authentication required"));
    *resp.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    resp.headers_mut().insert(PROXY_AUTHENTICATE, challenge);
    resp
}

fn host_addr(uri: &http::Uri) -> Option<String> {
    uri.authority().map(|auth| auth.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_addr() {
        assert_eq!(
            host_addr(&"example.com:443".parse().unwrap()),
            Some("example.com:443".to_string())
        );
        assert_eq!(host_addr(&"/upstream".parse().unwrap()), None);
    }

    #[test]
    fn test_auth_required_response() {
        let resp = auth_required_response("gw");
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            resp.headers().get(PROXY_AUTHENTICATE).unwrap(),
            "Basic realm=\"gw\""
        );
    }
}
