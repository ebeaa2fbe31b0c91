use std::fmt::Display;

use bytes::Bytes;

/// Shown to clients when the device they were bridged to goes away.
///
/// Clears the screen of a terminal emulator and prints the notice
/// white on red, roughly in the middle.
pub const DEVICE_DISCONNECTED_SCREEN: &str =
    "\u{1b}[41;38;1m\u{1b}[;H\u{1b}[J\u{1b}[12;37HDEVICE\u{1b}[13;34HDISCONNECTED";

/// What travels from a device to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A chunk of bytes read from the device.
    Bytes(Bytes),

    /// A terminal notice. Nothing follows it.
    Notice(Notice),
}

/// Terminal notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The device was unplugged, failed, or the server is shutting down.
    DeviceDisconnected,
}

impl Notice {
    /// The bytes a client receives for this notice.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Notice::DeviceDisconnected => DEVICE_DISCONNECTED_SCREEN.as_bytes(),
        }
    }
}

impl Payload {
    /// The bytes a client receives for this payload.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Notice(notice) => Bytes::from_static(notice.as_bytes()),
        }
    }

    /// Is this the terminal notice?
    pub fn is_notice(&self) -> bool {
        matches!(self, Payload::Notice(_))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Bytes(bytes) => {
                let s = String::from_utf8_lossy(&bytes[..bytes.len().min(48)]);
                write!(f, "{} byte(s): {}", bytes.len(), s.trim())
            }
            Payload::Notice(Notice::DeviceDisconnected) => write!(f, "device disconnected"),
        }
    }
}
