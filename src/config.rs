use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{bus::DeliveryPolicy, error::Error, relay::RelaySettings, serial::SerialOptions};

/// Serial settings for one particular device,
/// used instead of [`Config::serial`] when it appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOverride {
    /// The device name, e.g. "ttyUSB3".
    pub name: String,

    /// What to open it with.
    pub serial: SerialOptions,
}

/// The configuration used for running the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where devices show up.
    pub device_dir: PathBuf,

    /// Entries in [`Config::device_dir`] starting with any of these are devices.
    pub device_prefixes: Vec<String>,

    /// How often to rescan [`Config::device_dir`].
    pub poll_interval_ms: u64,

    /// Serial settings for devices without an override.
    pub serial: SerialOptions,

    /// Per device serial settings.
    pub devices: Vec<DeviceOverride>,

    /// Largest chunk read from a device in one go.
    pub read_chunk_size: usize,

    /// How many client writes may wait for a device before clients are held up.
    pub write_queue_capacity: usize,

    /// How many events a session may have waiting before delivery to it stalls.
    pub subscriber_capacity: usize,

    /// What to do about sessions which stall.
    pub delivery: DeliveryPolicy,

    /// How long to try telling a client its device went away.
    pub notice_timeout_ms: u64,

    /// Static files served at `/`.
    pub static_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_dir: "/dev".into(),
            device_prefixes: vec!["ttyUSB".into()],
            poll_interval_ms: 1000,
            serial: SerialOptions::default(),
            devices: vec![],
            read_chunk_size: 1024,
            write_queue_capacity: 16,
            subscriber_capacity: 64,
            delivery: DeliveryPolicy::default(),
            notice_timeout_ms: 1000,
            static_dir: "public".into(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not a valid config: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            device_prefixes: vec!["ttyUSB".into(), "ttyACM".into()],
            devices: vec![
                DeviceOverride {
                    name: "ttyUSB0".into(),
                    serial: SerialOptions::with_baud_rate(9600),
                },
                DeviceOverride {
                    name: "ttyACM0".into(),
                    serial: SerialOptions::with_baud_rate(921_600),
                },
            ],
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap_or_else(|e| format!("/* Could not serialize config: {e} */"))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let p = p.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::BadConfig(format!("Could not read {p:?}: {e}")))?;

        Self::deserialize(&s)
    }

    /// The serial settings to open the given device with.
    pub fn serial_for(&self, name: &str) -> SerialOptions {
        self.devices
            .iter()
            .find(|device| device.name == name)
            .map(|device| device.serial)
            .unwrap_or(self.serial)
    }

    /// The hotplug rescan period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// What relay sessions run with.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            capacity: self.subscriber_capacity,
            notice_timeout: Duration::from_millis(self.notice_timeout_ms),
        }
    }

    fn check_duplicate_overrides(&self) -> Result<(), Error> {
        let duplicates = self
            .devices
            .iter()
            .map(|device| &device.name)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "A device may only have one set of serial settings. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_baud_rates(&self) -> Result<(), Error> {
        if self.serial.baud_rate == 0 {
            return Err(Error::BadConfig(
                "The default serial settings have a baud rate of zero".into(),
            ));
        }

        let zero = self
            .devices
            .iter()
            .filter(|device| device.serial.baud_rate == 0)
            .map(|device| &device.name)
            .collect::<Vec<_>>();

        if zero.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "These devices have a baud rate of zero: {zero:?}"
            )))
        }
    }

    fn check_nonzero(&self) -> Result<(), Error> {
        for (field, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("read_chunk_size", self.read_chunk_size as u64),
            ("write_queue_capacity", self.write_queue_capacity as u64),
            ("subscriber_capacity", self.subscriber_capacity as u64),
        ] {
            if value == 0 {
                return Err(Error::BadConfig(format!("`{field}` must be above zero")));
            }
        }

        if self.device_prefixes.iter().any(String::is_empty) {
            return Err(Error::BadConfig(
                "An empty device prefix would match everything in the device directory".into(),
            ));
        }

        Ok(())
    }

    /// Check that the configuration makes sense.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_nonzero()?;
        self.check_baud_rates()?;
        self.check_duplicate_overrides()?;

        Ok(())
    }
}
