#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// Topic based publish/subscribe of device output.
pub mod bus;

/// What devices publish.
pub mod events;

/// The open devices, and the tasks reading and writing them.
pub mod registry;

/// Bridging a client to a device.
pub mod relay;

/// Ties devices, the bus and sessions together.
pub mod portal;

/// Serial port settings and opening.
pub mod serial;

/// Mocked devices.
pub mod mock;

/// Noticing devices coming and going.
pub mod hotplug;

/// Code relating to setting up the HTTP server.
pub mod server;

/// Handles incoming websockets.
pub(crate) mod websocket;

/// Relates to config files.
pub mod config;

/// The command line interface.
pub mod cli;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
