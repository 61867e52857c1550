//! OpenMetrics HTTP endpoint (`general.openmetrics_port`). Hand-rolled on
//! hyper directly rather than through a metrics-registry crate, the same
//! way the grounding codebase's own `stats::http_server` serves its
//! `OpenMetric` types.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::shard_manager::ShardManager;
use crate::sharding::Sharding;

#[derive(Clone)]
struct State {
    manager: Option<Arc<ShardManager>>,
    sharding: Arc<Sharding>,
}

async fn metrics(state: State, _request: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut body = String::new();

    if let Some(manager) = &state.manager {
        for metric in manager.counts().metrics() {
            body.push_str(&metric.to_string());
        }
    }
    for metric in state.sharding.counts().metrics() {
        body.push_str(&metric.to_string());
    }

    let response = Response::builder()
        .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("metrics unavailable"))));

    Ok(response)
}

/// Serve the OpenMetrics endpoint forever. Returns only if the listener
/// itself fails to bind or accept.
pub async fn serve(port: u16, manager: Option<Arc<ShardManager>>, sharding: Arc<Sharding>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "openmetrics endpoint listening");

    let state = State { manager, sharding };

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| metrics(state.clone(), req)))
                .await
            {
                warn!("openmetrics connection error: {err:?}");
            }
        });
    }
}
