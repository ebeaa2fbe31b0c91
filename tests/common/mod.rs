#![allow(dead_code)]

use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    http::{Request, StatusCode},
    Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use serial_portal::{config::Config, logging, mock::MockOpener, portal::Portal, server};
use tokio::{net::TcpStream, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;
use tracing::{info, Level};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const PATIENCE: Duration = Duration::from_secs(5);

/// A portal with mock devices, served on some free port.
pub struct TestServer {
    pub port: u16,
    pub portal: Portal,
    pub opener: MockOpener,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(Config::default()).await
    }

    pub async fn start_with(config: Config) -> Result<Self> {
        logging::init(Level::INFO, None).await;

        let opener = MockOpener::new();
        let portal = Portal::new(&config, opener.clone());
        let (port_tx, port_rx) = oneshot::channel();

        tokio::spawn({
            let portal = portal.clone();
            async move { server::run_any_port(portal, config, port_tx).await }
        });

        let port = port_rx.await?;

        Ok(Self {
            port,
            portal,
            opener,
        })
    }

    pub async fn connect(&self, device: &str) -> Result<Client> {
        info!("Connecting to {device} on port {}", self.port);
        let (stream, http_response) = tokio_tungstenite::connect_async(format!(
            "ws://127.0.0.1:{}/serial/{device}",
            self.port
        ))
        .await?;

        assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

        Ok(stream)
    }

    /// Wait until the device has this many sessions.
    pub async fn sessions(&self, device: &str, count: usize) -> Result<()> {
        timeout(PATIENCE, async {
            while self.portal.bus().subscriber_count(device) != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        Ok(())
    }
}

/// The next frame the client gets, if any.
pub async fn receive(client: &mut Client) -> Result<Option<tungstenite::Message>> {
    match timeout(PATIENCE, client.next()).await? {
        Some(message) => Ok(Some(message?)),
        None => Ok(None),
    }
}

/// The next binary frame.
pub async fn receive_binary(client: &mut Client) -> Result<Vec<u8>> {
    match receive(client).await? {
        Some(tungstenite::Message::Binary(bytes)) => Ok(bytes),
        other => Err(eyre!("Expected binary, got {other:?}")),
    }
}

/// Wait for the server to close the connection.
pub async fn closed(client: &mut Client) -> Result<()> {
    match receive(client).await {
        Ok(Some(tungstenite::Message::Close(_))) | Ok(None) => Ok(()),
        Ok(Some(other)) => Err(eyre!("Expected close, got {other:?}")),
        // Dropping the connection without a close frame also counts.
        Err(e) if e.downcast_ref::<tungstenite::Error>().is_some() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ask the router directly, no sockets involved.
pub async fn get(router: Router, path: &str) -> Result<(StatusCode, String)> {
    let request = Request::builder().uri(path).body(Body::empty())?;
    let response = router.oneshot(request).await?;

    let status = response.status();
    let mut body = response.into_body();
    let mut bytes = vec![];
    while let Some(chunk) = body.data().await {
        bytes.extend_from_slice(&chunk?);
    }

    Ok((status, String::from_utf8(bytes)?))
}
