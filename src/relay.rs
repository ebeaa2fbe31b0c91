//! A relay session bridges one client to one device.
//!
//! Device output reaches the client through the [`EventBus`].
//! Client input is written straight to the device entry.
//!
//! The session's token is a child of the device entry's token,
//! so a disconnecting device ends the session by construction.
//! The client closing its side cancels the session token directly.

use std::{fmt::Display, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{pin_mut, Sink, SinkExt, Stream, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    bus::{self, Event, EventBus, SubscriberId},
    events::{Notice, Payload},
    registry::DeviceEntry,
};

/// Per-session knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Capacity of the session's subscriber channel.
    pub capacity: usize,

    /// How long to spend on the terminal notice and on closing the client.
    pub notice_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            capacity: 64,
            notice_timeout: Duration::from_secs(1),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its side.
    ClientClosed,

    /// Sending to the client failed.
    ClientWriteFailed,

    /// The device went away. The client was sent the terminal notice.
    DeviceDisconnected,

    /// Writing client input to the device failed.
    DeviceWriteFailed,

    /// The bus gave up delivering to this session because it did not keep up.
    Evicted,
}

impl Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SessionEnd::ClientClosed => "client closed",
            SessionEnd::ClientWriteFailed => "could not send to client",
            SessionEnd::DeviceDisconnected => "device disconnected",
            SessionEnd::DeviceWriteFailed => "could not write to device",
            SessionEnd::Evicted => "too slow, evicted by the bus",
        };
        write!(f, "{reason}")
    }
}

enum Outbound {
    Cancelled,
    ClientGone,
    Evicted,
}

// Everything which must be released however the session ends,
// including the session future itself being dropped.
struct Teardown<'a> {
    bus: &'a EventBus<Payload>,
    topic: &'a str,
    subscriber: SubscriberId,
    session: CancellationToken,
    inbound: Option<JoinHandle<SessionEnd>>,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.session.cancel();
        if let Some(inbound) = self.inbound.take() {
            inbound.abort();
        }
        self.bus.unsubscribe(self.topic, self.subscriber);
        trace!("Torn down");
    }
}

/// Bridge a client to the device until either side goes away.
///
/// `client_tx` receives device output, and the terminal notice if the device disconnects.
/// Everything `client_rx` yields is written to the device.
/// The client sink is closed before returning.
pub async fn run<Tx, Rx>(
    bus: &EventBus<Payload>,
    entry: Arc<DeviceEntry>,
    settings: RelaySettings,
    client_tx: Tx,
    client_rx: Rx,
) -> SessionEnd
where
    Tx: Sink<Payload> + Send + 'static,
    Rx: Stream<Item = Bytes> + Send + 'static,
{
    let mut client_tx = Box::pin(client_tx);

    let (tx, mut rx) = bus::channel(settings.capacity);
    let subscriber = bus.subscribe(entry.name(), tx);
    let session = entry.cancellation().child_token();

    let inbound = tokio::spawn(
        client_to_device(client_rx, entry.clone(), session.clone())
            .instrument(info_span!("inbound")),
    );

    let mut teardown = Teardown {
        bus,
        topic: entry.name(),
        subscriber,
        session: session.clone(),
        inbound: Some(inbound),
    };

    info!("Relaying");

    let end = match device_to_client(&mut rx, &mut client_tx, &session).await {
        Outbound::Cancelled if entry.is_disconnected() => SessionEnd::DeviceDisconnected,
        // Only the inbound direction cancels the session by itself,
        // and it does so as its very last act.
        Outbound::Cancelled => match teardown.inbound.take() {
            Some(inbound) => inbound.await.unwrap_or_else(|e| {
                warn!(?e, "Inbound task did not finish cleanly");
                SessionEnd::ClientClosed
            }),
            None => SessionEnd::ClientClosed,
        },
        Outbound::ClientGone => SessionEnd::ClientWriteFailed,
        Outbound::Evicted => SessionEnd::Evicted,
    };

    drop(teardown);

    if end == SessionEnd::DeviceDisconnected {
        // What the device printed before going away still goes out ahead of the notice.
        let last_words = async {
            while let Ok(Event { payload, .. }) = rx.try_recv() {
                client_tx.send(payload).await?;
            }
            client_tx
                .send(Payload::Notice(Notice::DeviceDisconnected))
                .await
        };
        match timeout(settings.notice_timeout, last_words).await {
            Ok(Ok(())) => debug!("Notice sent"),
            Ok(Err(_)) => debug!("Client went away before the notice"),
            Err(_) => debug!("Client too slow to take the notice"),
        }
    }

    drop(rx);

    if timeout(settings.notice_timeout, client_tx.close())
        .await
        .is_err()
    {
        debug!("Client too slow to close");
    }

    info!(%end, "Session over");

    end
}

async fn device_to_client<Tx>(
    rx: &mut mpsc::Receiver<Event<Payload>>,
    client_tx: &mut Pin<Box<Tx>>,
    session: &CancellationToken,
) -> Outbound
where
    Tx: Sink<Payload>,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = session.cancelled() => return Outbound::Cancelled,
            event = rx.recv() => event,
        };

        let Some(Event { payload, .. }) = event else {
            return Outbound::Evicted;
        };

        trace!(%payload, "To client");

        let sent = tokio::select! {
            biased;
            _ = session.cancelled() => return Outbound::Cancelled,
            sent = client_tx.send(payload) => sent,
        };

        if sent.is_err() {
            return Outbound::ClientGone;
        }
    }
}

async fn client_to_device<Rx>(
    client_rx: Rx,
    entry: Arc<DeviceEntry>,
    session: CancellationToken,
) -> SessionEnd
where
    Rx: Stream<Item = Bytes>,
{
    pin_mut!(client_rx);

    let end = loop {
        let Some(bytes) = client_rx.next().await else {
            debug!("Client closed");
            break SessionEnd::ClientClosed;
        };

        trace!("From client: {} byte(s)", bytes.len());

        if let Err(e) = entry.write(bytes).await {
            warn!(%e, "Dropping session");
            break SessionEnd::DeviceWriteFailed;
        }
    };

    session.cancel();

    end
}
