mod admin;
mod auth;
mod config;
mod dial;
mod registry;
mod relay;
mod tunnel;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use color_eyre::eyre::Result;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, GatewayConfig};
use crate::registry::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mthp=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Arc::new(GatewayConfig::from_cli(args));
    let state = Arc::new(AppState::new());

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("CONNECT gateway listening on {}", config.listen_addr);
    info!("routing updates via POST /upstream on the same port");

    // Graceful shutdown signal handling
    let shutdown_state = state.clone();
    let shutdown = async move {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");

        info!("shutdown signal received");

        let active = shutdown_state.tunnels.active_count().await;
        if active > 0 {
            info!("waiting for {} tunnels to close...", active);

            for i in 1..=30 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let remaining = shutdown_state.tunnels.active_count().await;

                if remaining == 0 {
                    info!("all tunnels closed gracefully");
                    break;
                }

                if i % 5 == 0 {
                    info!("still waiting for {} tunnels... ({}/30s)", remaining, i);
                }
            }

            let final_count = shutdown_state.tunnels.active_count().await;
            if final_count > 0 {
                warn!("forced shutdown with {} tunnels still active", final_count);
            }
        }
    };

    tokio::select! {
        _ = serve(listener, state, config) => {
            warn!("server loop terminated");
        }
        _ = shutdown => {
            info!("server shutdown complete");
        }
    }

    Ok(())
}

/// Accept loop: one task per connection, HTTP/1 with upgrade support so
/// CONNECT tunnels can take over the raw transport.
async fn serve(listener: TcpListener, state: Arc<AppState>, config: Arc<GatewayConfig>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();
                let config = config.clone();

                tokio::task::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        dispatch(req, state.clone(), config.clone())
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        if !err.to_string().contains("connection closed") {
                            debug!("connection from {} error: {:?}", peer_addr, err);
                        }
                    }
                });
            }
            Err(e) => {
                warn!("accept error: {} (continuing)", e);
                continue;
            }
        }
    }
}

/// One listener serves both surfaces, dispatched by path
async fn dispatch(
    req: Request<Incoming>,
    state: Arc<AppState>,
    config: Arc<GatewayConfig>,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.uri().path() == "/upstream" {
        admin::handle(req, &state).await
    } else {
        tunnel::handle(req, state, config).await
    }
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
