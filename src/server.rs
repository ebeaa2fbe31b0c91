use std::net::SocketAddr;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, get_service},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{config::Config, error::Error, portal::Portal, websocket};

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 8081;

/// Response to listing the devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceList {
    /// Names of the open devices, sorted.
    pub device_names: Vec<String>,
}

/// The routes served.
pub fn router(portal: Portal, config: Config) -> Router {
    let static_files = get_service(ServeDir::new(&config.static_dir)).handle_error(
        |e: std::io::Error| async move {
            warn!(%e, "Could not serve static file");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not serve file: {e}"),
            )
        },
    );

    Router::new()
        .route("/serial", get(list_devices))
        .route("/serial/:name", get(websocket::ws_handler))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .fallback(static_files)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each websocket needs to be able to reach the devices
                .layer(Extension(portal))
                .layer(Extension(config)),
        )
}

async fn run(
    portal: Portal,
    config: Config,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error> {
    let app = router(portal, config);

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::Server(format!("Could not bind {addr}: {e}")))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            warn!("Nobody wanted to know which port was allocated");
        }
    }

    info!("listening on {}", addr);

    server
        .await
        .map_err(|e| Error::Server(axum::Error::new(e).to_string()))
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    portal: Portal,
    config: Config,
    allocated_port: oneshot::Sender<u16>,
) -> Result<(), Error> {
    run(portal, config, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(portal: Portal, config: Config, port: u16) -> Result<(), Error> {
    run(portal, config, Some(port), None).await
}

async fn list_devices(Extension(portal): Extension<Portal>) -> Json<DeviceList> {
    Json(DeviceList {
        device_names: portal.list_devices(),
    })
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    config.serialize_pretty()
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Portal v{}\n", env!("CARGO_PKG_VERSION"))
}
