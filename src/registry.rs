//! The table of currently open devices.
//!
//! Each [`DeviceEntry`] owns its device handle through two tasks:
//! a reader pump publishing everything read onto the [`EventBus`],
//! and a writer draining the entry's write queue onto the device.
//! Both stop when the entry's cancellation token fires, which closes the handle.
//!
//! Every entry token is a child of the registry's root token,
//! so [`DeviceRegistry::shutdown`] reaches all of them.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use itertools::Itertools;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    bus::EventBus,
    error::Error,
    events::Payload,
    serial::{DeviceOpener, SerialOptions},
};

mod pump;

/// Tells apart entries which (at different times) had the same device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(Uuid);

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One open device.
#[derive(Debug)]
pub struct DeviceEntry {
    name: String,
    id: EntryId,
    options: SerialOptions,
    writes: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

impl DeviceEntry {
    /// The device name, which is also its topic on the bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique to this opening of the device.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// What the device was opened with.
    pub fn options(&self) -> &SerialOptions {
        &self.options
    }

    /// Fires when the device is disconnected, for whatever reason.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Has the device been disconnected?
    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Hand bytes to the device's writer.
    ///
    /// Waits while the device is not keeping up with earlier writes.
    /// Writes from different callers interleave at the granularity of these calls.
    pub async fn write(&self, bytes: Bytes) -> Result<(), Error> {
        if self.is_disconnected() {
            return Err(self.write_error("device is disconnected"));
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.write_error("device is disconnected")),
            sent = self.writes.send(bytes) => {
                sent.map_err(|_| self.write_error("device is no longer accepting writes"))
            }
        }
    }

    fn write_error(&self, problem: &str) -> Error {
        Error::Write {
            device: self.name.clone(),
            problem: problem.into(),
        }
    }
}

struct Inner {
    devices: RwLock<HashMap<String, Arc<DeviceEntry>>>,
    opener: Box<dyn DeviceOpener>,
    bus: Arc<EventBus<Payload>>,
    root: CancellationToken,
    read_chunk_size: usize,
    write_capacity: usize,
}

/// Owns the open devices.
///
/// Cheap to clone, clones refer to the same table.
#[derive(Clone)]
pub struct DeviceRegistry(Arc<Inner>);

impl DeviceRegistry {
    /// An empty registry.
    /// Devices opened will publish what they read to `bus`,
    /// in chunks of at most `read_chunk_size` bytes.
    /// At most `write_capacity` writes wait for a device before writers are held up.
    pub fn new(
        bus: Arc<EventBus<Payload>>,
        opener: impl DeviceOpener,
        read_chunk_size: usize,
        write_capacity: usize,
    ) -> Self {
        Self(Arc::new(Inner {
            devices: RwLock::new(HashMap::new()),
            opener: Box::new(opener),
            bus,
            root: CancellationToken::new(),
            read_chunk_size: read_chunk_size.max(1),
            write_capacity: write_capacity.max(1),
        }))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<DeviceEntry>>> {
        self.0.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<DeviceEntry>>> {
        self.0.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bus(&self) -> &EventBus<Payload> {
        &self.0.bus
    }

    /// Open the device and start pumping what it reads onto the bus.
    pub fn connect(&self, name: &str, options: SerialOptions) -> Result<Arc<DeviceEntry>, Error> {
        // The table stays locked while opening,
        // so racing connects for one name open at most one handle.
        let mut devices = self.write();

        if devices.contains_key(name) {
            return Err(Error::AlreadyConnected(name.to_owned()));
        }

        if self.0.root.is_cancelled() {
            return Err(Error::Open {
                device: name.to_owned(),
                problem: "shutting down".into(),
            });
        }

        let io = self.0.opener.open(name, &options)?;
        let (reader, writer) = tokio::io::split(io);
        let (writes, write_queue) = mpsc::channel(self.0.write_capacity);

        let entry = Arc::new(DeviceEntry {
            name: name.to_owned(),
            id: EntryId(Uuid::new_v4()),
            options,
            writes,
            token: self.0.root.child_token(),
        });

        devices.insert(name.to_owned(), entry.clone());
        drop(devices);

        info!(device = %name, id = %entry.id, "Connected");

        pump::spawn(
            self.clone(),
            entry.clone(),
            reader,
            writer,
            write_queue,
            self.0.read_chunk_size,
        );

        Ok(entry)
    }

    /// Close the device, if open.
    /// Returns whether anything was disconnected.
    pub fn disconnect(&self, name: &str) -> bool {
        let removed = self.write().remove(name);

        match removed {
            Some(entry) => {
                entry.token.cancel();
                info!(device = %name, id = %entry.id, "Disconnected");
                true
            }
            None => {
                debug!(device = %name, "Nothing to disconnect");
                false
            }
        }
    }

    /// Close the device only if the current entry is the given one.
    /// A newer entry by the same name is left alone.
    pub(crate) fn disconnect_entry(&self, name: &str, id: EntryId) -> bool {
        let removed = {
            let mut devices = self.write();
            if devices.get(name).map(|entry| entry.id) == Some(id) {
                devices.remove(name)
            } else {
                None
            }
        };

        match removed {
            Some(entry) => {
                entry.token.cancel();
                info!(device = %name, %id, "Disconnected");
                true
            }
            None => false,
        }
    }

    /// The entry for an open device.
    ///
    /// The entry's handle is only usable until its cancellation token fires.
    pub fn lookup(&self, name: &str) -> Result<Arc<DeviceEntry>, Error> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// Names of all open devices, sorted.
    pub fn list(&self) -> Vec<String> {
        self.read().keys().cloned().sorted().collect()
    }

    /// Disconnect everything.
    /// Nothing can be connected afterwards.
    pub fn shutdown(&self) {
        self.0.root.cancel();

        let drained = self.write().drain().collect::<Vec<_>>();
        for (name, entry) in drained {
            entry.token.cancel();
            debug!(device = %name, "Disconnected by shutdown");
        }

        info!("Registry shut down");
    }
}
