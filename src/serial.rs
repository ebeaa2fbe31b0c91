use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::error::Error;

/// Transmission settings used when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// Symbols per second.
    pub baud_rate: u32,

    /// Bits per character.
    pub data_bits: DataBits,

    /// Parity checking.
    pub parity: Parity,

    /// Stop bits after each character.
    pub stop_bits: StopBits,

    /// Hardware/software flow control.
    pub flow_control: FlowControl,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialOptions {
    /// The default settings at a different baud rate.
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }
}

/// A bidirectional byte stream to a device.
pub trait DeviceIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DeviceIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Something which knows how to open devices by name.
pub trait DeviceOpener: Send + Sync + 'static {
    /// Open the device.
    ///
    /// Must fail rather than hand out a second handle to a device
    /// which is already open elsewhere.
    fn open(&self, name: &str, options: &SerialOptions) -> Result<Box<dyn DeviceIo>, Error>;
}

/// Opens real serial ports found in a device directory.
#[derive(Debug, Clone)]
pub struct TtyOpener {
    device_dir: PathBuf,
}

impl TtyOpener {
    /// Devices will be looked for in the given directory.
    /// Likely `/dev`.
    pub fn new<P: AsRef<Path>>(device_dir: P) -> Self {
        Self {
            device_dir: device_dir.as_ref().into(),
        }
    }
}

impl DeviceOpener for TtyOpener {
    fn open(&self, name: &str, options: &SerialOptions) -> Result<Box<dyn DeviceIo>, Error> {
        let path = self.device_dir.join(name);
        debug!(?path, ?options, "Opening port");

        let serial_stream = tokio_serial::new(path.to_string_lossy(), options.baud_rate)
            .data_bits(options.data_bits)
            .parity(options.parity)
            .stop_bits(options.stop_bits)
            .flow_control(options.flow_control)
            .open_native_async()
            .map_err(|e| Error::Open {
                device: name.to_owned(),
                problem: e.to_string(),
            })?;

        info!(?path, baud = options.baud_rate, "Opened port");

        Ok(Box::new(serial_stream))
    }
}
