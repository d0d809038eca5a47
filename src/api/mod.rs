//! HTTP surface of the bridge
//!
//! `POST /sendmqtt/<topic>` publishes the JSON body, `GET /healthcheck`
//! reports transport health and `GET /metrics` dumps the collector snapshot.

mod auth;
pub mod routes;

pub use routes::routes;

use crate::service::BridgeService;
use std::net::SocketAddr;
use std::future::Future;
use tracing::info;

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(service: BridgeService, addr: SocketAddr, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) =
        warp::serve(routes(service)).bind_with_graceful_shutdown(addr, shutdown);
    info!(address = %bound, "HTTP API listening");
    server.await;
    info!("HTTP API stopped");
}
