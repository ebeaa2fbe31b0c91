//! Mocked devices, useful to exercise the portal without actual serial ports.
//!
//! Opening a mock device creates an in-memory duplex pipe.
//! The portal gets one end, the other end is a [`MockDevice`]
//! which plays the part of the hardware.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::io::{self, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, info, info_span, Instrument};

use crate::{
    error::Error,
    serial::{DeviceIo, DeviceOpener, SerialOptions},
};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct MockState {
    loopback: bool,
    devices: HashMap<String, MockDevice>,
    opened: HashMap<String, usize>,
    refuse: HashSet<String>,
}

/// Opens mock devices.
///
/// Clones share state, so a test can keep one clone
/// and give another to the portal.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    state: Arc<Mutex<MockState>>,
}

impl MockOpener {
    /// Devices are handed out to whoever calls [`MockOpener::take_device`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices echo whatever is written to them.
    pub fn loopback() -> Self {
        let opener = Self::default();
        opener.state().loopback = true;
        opener
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make opening the device with this name fail, like a busy or missing port would.
    pub fn refuse(&self, name: &str) {
        self.state().refuse.insert(name.to_owned());
    }

    /// Undo [`MockOpener::refuse`].
    pub fn allow(&self, name: &str) {
        self.state().refuse.remove(name);
    }

    /// Take the hardware side of the most recent opening of this device.
    pub fn take_device(&self, name: &str) -> Option<MockDevice> {
        self.state().devices.remove(name)
    }

    /// How many times this device has been opened successfully.
    pub fn times_opened(&self, name: &str) -> usize {
        self.state().opened.get(name).copied().unwrap_or_default()
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self, name: &str, options: &SerialOptions) -> Result<Box<dyn DeviceIo>, Error> {
        let mut state = self.state();

        if state.refuse.contains(name) {
            return Err(Error::Open {
                device: name.to_owned(),
                problem: "Device or resource busy".into(),
            });
        }

        let (portal_side, device_side) = io::duplex(PIPE_CAPACITY);
        let device = MockDevice {
            name: name.to_owned(),
            stream: device_side,
        };

        *state.opened.entry(name.to_owned()).or_default() += 1;

        if state.loopback {
            info!(%name, baud = options.baud_rate, "Running loopback mock");
            tokio::spawn(device.echo().instrument(info_span!("mock", %name)));
        } else {
            debug!(%name, baud = options.baud_rate, "Mock opened");
            state.devices.insert(name.to_owned(), device);
        }

        Ok(Box::new(portal_side))
    }
}

/// The hardware side of a mock device.
///
/// Dropping it (or calling [`MockDevice::unplug`]) looks like
/// the device disappearing to whoever reads from the other side.
#[derive(Debug)]
pub struct MockDevice {
    name: String,
    stream: DuplexStream,
}

impl MockDevice {
    /// The device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Produce output, as if the device printed it.
    pub async fn emit<B: AsRef<[u8]>>(&mut self, bytes: B) -> io::Result<()> {
        self.stream.write_all(bytes.as_ref()).await?;
        self.stream.flush().await
    }

    /// Read whatever has been written to the device so far,
    /// waiting for at least one byte.
    /// Empty means the other side has closed.
    pub async fn received(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; PIPE_CAPACITY];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read exactly `n` bytes written to the device.
    pub async fn received_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; n];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Pull the plug.
    pub fn unplug(self) {
        debug!(name = %self.name, "Unplugged");
    }

    async fn echo(self) {
        let (mut reader, mut writer) = io::split(self.stream);

        match io::copy(&mut reader, &mut writer).await {
            Ok(bytes) => debug!("Echoed {bytes} byte(s) before closing"),
            Err(e) => debug!(?e, "Echo stopped"),
        }
    }
}
