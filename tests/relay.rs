//! Sessions driven through the portal with in-memory connections.

use std::time::Duration;

use bytes::Bytes;
use color_eyre::Result;
use futures::{channel::mpsc, StreamExt};
use pretty_assertions::assert_eq;
use serial_portal::{
    config::Config,
    error::Error,
    events::{Notice, Payload},
    mock::MockOpener,
    portal::Portal,
    relay::SessionEnd,
};
use tokio::{task::JoinHandle, time::timeout};

const PATIENCE: Duration = Duration::from_secs(2);

struct Connection {
    from_device: mpsc::UnboundedReceiver<Payload>,
    _to_device: mpsc::UnboundedSender<Bytes>,
    session: JoinHandle<Result<SessionEnd, Error>>,
}

impl Connection {
    async fn open(portal: &Portal, device: &str) -> Result<Self> {
        let before = portal.bus().subscriber_count(device);

        let (to_client, from_device) = mpsc::unbounded();
        let (to_device, from_client) = mpsc::unbounded();

        let session = tokio::spawn({
            let portal = portal.clone();
            let device = device.to_owned();
            async move { portal.open_relay(&device, to_client, from_client).await }
        });

        timeout(PATIENCE, async {
            while portal.bus().subscriber_count(device) == before {
                tokio::task::yield_now().await;
            }
        })
        .await?;

        Ok(Self {
            from_device,
            _to_device: to_device,
            session,
        })
    }

    async fn next(&mut self) -> Result<Option<Payload>> {
        Ok(timeout(PATIENCE, self.from_device.next()).await?)
    }
}

fn chunk(s: &'static str) -> Option<Payload> {
    Some(Payload::Bytes(Bytes::from_static(s.as_bytes())))
}

#[tokio::test]
async fn two_clients_then_disconnect() -> Result<()> {
    let opener = MockOpener::new();
    let portal = Portal::new(&Config::default(), opener.clone());

    portal.notify_device_appeared("ttyUSB0")?;
    let mut device = opener.take_device("ttyUSB0").unwrap();

    let mut a = Connection::open(&portal, "ttyUSB0").await?;

    // Each chunk is awaited before the next, so reads do not merge them.
    for c in ["first", "second", "third"] {
        device.emit(c).await?;
        assert_eq!(a.next().await?, chunk(c));
    }

    let mut b = Connection::open(&portal, "ttyUSB0").await?;
    device.emit("fourth").await?;

    assert_eq!(a.next().await?, chunk("fourth"));
    assert_eq!(b.next().await?, chunk("fourth"));

    portal.notify_device_vanished("ttyUSB0");

    for connection in [&mut a, &mut b] {
        assert_eq!(
            connection.next().await?,
            Some(Payload::Notice(Notice::DeviceDisconnected))
        );
        assert_eq!(connection.next().await?, None);
    }

    assert_eq!(
        timeout(PATIENCE, a.session).await??,
        Ok(SessionEnd::DeviceDisconnected)
    );
    assert_eq!(
        timeout(PATIENCE, b.session).await??,
        Ok(SessionEnd::DeviceDisconnected)
    );

    assert_eq!(portal.bus().subscriber_count("ttyUSB0"), 0);
    assert!(portal.list_devices().is_empty());

    Ok(())
}

#[tokio::test]
async fn relay_to_nonexistent_device() -> Result<()> {
    let portal = Portal::new(&Config::default(), MockOpener::new());

    let (to_client, mut from_device) = mpsc::unbounded::<Payload>();
    let (_to_device, from_client) = mpsc::unbounded::<Bytes>();

    let result = portal
        .open_relay("nonexistent", to_client, from_client)
        .await;

    assert_eq!(result, Err(Error::NotFound("nonexistent".into())));

    // The connection was dropped unused, never written to.
    assert_eq!(from_device.next().await, None);

    Ok(())
}

#[tokio::test]
async fn device_can_come_back() -> Result<()> {
    let opener = MockOpener::new();
    let portal = Portal::new(&Config::default(), opener.clone());

    portal.notify_device_appeared("ttyUSB0")?;
    let mut a = Connection::open(&portal, "ttyUSB0").await?;

    portal.notify_device_vanished("ttyUSB0");
    assert_eq!(
        a.next().await?,
        Some(Payload::Notice(Notice::DeviceDisconnected))
    );

    portal.notify_device_appeared("ttyUSB0")?;
    let mut device = opener.take_device("ttyUSB0").unwrap();
    let mut b = Connection::open(&portal, "ttyUSB0").await?;

    device.emit("back").await?;
    assert_eq!(b.next().await?, chunk("back"));
    assert_eq!(opener.times_opened("ttyUSB0"), 2);

    Ok(())
}
