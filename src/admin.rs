use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use crate::registry::AppState;
use crate::upstream::{UpstreamParseError, UpstreamSpec};
use crate::{empty, full};

/// Body of a routing update request
#[derive(Debug, Deserialize)]
struct UpstreamUpdate {
    user: String,
    /// Accepted for forward compatibility; tunnel clients are not
    /// authenticated against it.
    #[allow(dead_code)]
    password: String,
    upstream: String,
}

/// Replace a user's upstream route and sever their open tunnels.
///
/// The route table is written before the tunnel registry is drained. A
/// tunnel racing this update either reads the new route (it registers before
/// its lookup, so it registered after the drain) or had registered earlier
/// and gets force-closed here.
pub async fn apply_update(
    state: &AppState,
    user: &str,
    upstream: &str,
) -> Result<(), UpstreamParseError> {
    let spec = UpstreamSpec::parse(upstream)?;

    info!(user, upstream = spec.raw(), "routing update");
    state.routes.set(user, spec).await;

    let closed = state.tunnels.invalidate(user).await;
    if closed > 0 {
        info!(user, closed, "severed tunnels after routing update");
    }
    Ok(())
}

/// Handle a request to the admin endpoint
pub async fn handle(
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() != Method::POST {
        let mut resp = Response::new(full("method not allowed"));
        *resp.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(resp);
    }

    let body = req.into_body().collect().await?.to_bytes();
    let update: UpstreamUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("rejected admin update: {}", e);
            let mut resp = Response::new(full("invalid json"));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(resp);
        }
    };

    if let Err(e) = apply_update(state, &update.user, &update.upstream).await {
        warn!(user = %update.user, "rejected upstream url: {}", e);
        let mut resp = Response::new(full("bad upstream url"));
        *resp.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(resp);
    }

    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::NO_CONTENT;
    Ok(resp)
}
