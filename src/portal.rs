//! The portal ties the bus, the registry and relay sessions together.
//!
//! This is the surface transports and the hotplug watcher talk to.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, Stream};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    bus::EventBus,
    config::Config,
    error::Error,
    events::Payload,
    registry::{DeviceEntry, DeviceRegistry},
    relay::{self, RelaySettings, SessionEnd},
    serial::DeviceOpener,
};

/// Handle to a running portal.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Portal {
    bus: Arc<EventBus<Payload>>,
    registry: DeviceRegistry,
    config: Arc<Config>,
}

impl Portal {
    /// Set up a portal which opens devices using `opener`.
    /// No devices are open until they are announced.
    pub fn new(config: &Config, opener: impl DeviceOpener) -> Self {
        let bus = Arc::new(EventBus::new(config.delivery));
        let registry = DeviceRegistry::new(
            bus.clone(),
            opener,
            config.read_chunk_size,
            config.write_queue_capacity,
        );

        Self {
            bus,
            registry,
            config: Arc::new(config.clone()),
        }
    }

    /// The bus device output is published on.
    pub fn bus(&self) -> &EventBus<Payload> {
        &self.bus
    }

    /// The open devices.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// What relay sessions run with.
    pub fn relay_settings(&self) -> RelaySettings {
        self.config.relay_settings()
    }

    /// Names of the open devices, sorted.
    pub fn list_devices(&self) -> Vec<String> {
        self.registry.list()
    }

    /// The entry of an open device.
    pub fn lookup(&self, name: &str) -> Result<Arc<DeviceEntry>, Error> {
        self.registry.lookup(name)
    }

    /// Relay between a client and the named device.
    ///
    /// Fails with [`Error::NotFound`] without touching the client if the device is not open.
    /// Otherwise runs until the session is over.
    pub async fn open_relay<Tx, Rx>(
        &self,
        name: &str,
        client_tx: Tx,
        client_rx: Rx,
    ) -> Result<SessionEnd, Error>
    where
        Tx: Sink<Payload> + Send + 'static,
        Rx: Stream<Item = Bytes> + Send + 'static,
    {
        let entry = self.lookup(name)?;

        Ok(self.bridge(entry, client_tx, client_rx).await)
    }

    /// Relay between a client and a device already looked up.
    pub async fn bridge<Tx, Rx>(
        &self,
        entry: Arc<DeviceEntry>,
        client_tx: Tx,
        client_rx: Rx,
    ) -> SessionEnd
    where
        Tx: Sink<Payload> + Send + 'static,
        Rx: Stream<Item = Bytes> + Send + 'static,
    {
        let span = info_span!("session", device = %entry.name(), entry = %entry.id());

        relay::run(
            &self.bus,
            entry,
            self.relay_settings(),
            client_tx,
            client_rx,
        )
        .instrument(span)
        .await
    }

    /// A device showed up. Open it, using its configured serial settings.
    ///
    /// A device which is already open is left as is.
    pub fn notify_device_appeared(&self, name: &str) -> Result<(), Error> {
        let options = self.config.serial_for(name);

        match self.registry.connect(name, options) {
            Ok(entry) => {
                info!(device = %name, id = %entry.id(), baud = options.baud_rate, "Device appeared");
                Ok(())
            }
            Err(Error::AlreadyConnected(_)) => {
                debug!(device = %name, "Appeared again, already connected");
                Ok(())
            }
            Err(e) => {
                warn!(device = %name, %e, "Device appeared but could not be opened");
                Err(e)
            }
        }
    }

    /// A device went away. Close it, ending its sessions.
    pub fn notify_device_vanished(&self, name: &str) {
        if self.registry.disconnect(name) {
            info!(device = %name, "Device vanished");
        }
    }

    /// Close every device.
    /// Sessions end with the disconnect notice.
    pub fn shutdown(&self) {
        info!("Shutting down portal");
        self.registry.shutdown();
    }
}
