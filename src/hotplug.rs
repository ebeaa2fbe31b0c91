//! Finds devices by polling a directory.
//!
//! Devices present at startup are announced right away.
//! After that, each rescan is compared with the previous one.

use std::{collections::BTreeSet, io, path::Path, time::Duration};

use futures::StreamExt;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::portal::Portal;

/// Names of entries in `dir` which start with one of the prefixes.
pub async fn scan<P: AsRef<Path>>(dir: P, prefixes: &[String]) -> io::Result<BTreeSet<String>> {
    let mut found = BTreeSet::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            found.insert(name.to_owned());
        }
    }

    Ok(found)
}

/// What changed between two scans.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Changes {
    /// Present now, but not registered.
    pub appeared: Vec<String>,

    /// Present last time, gone now.
    pub vanished: Vec<String>,
}

/// Compare a scan with the previous one.
///
/// A device counts as appeared as long as it is present but not registered,
/// so devices which failed to open are retried.
pub fn diff(
    previous: &BTreeSet<String>,
    current: &BTreeSet<String>,
    registered: &BTreeSet<String>,
) -> Changes {
    Changes {
        appeared: current.difference(registered).cloned().collect(),
        vanished: previous.difference(current).cloned().collect(),
    }
}

/// Where and how often to look for devices.
#[derive(Debug, Clone)]
pub struct WatchSettings<'a> {
    /// Directory to scan.
    pub dir: &'a Path,

    /// File name prefixes of devices.
    pub prefixes: &'a [String],

    /// Time between scans.
    pub period: Duration,
}

/// Announce devices to the portal as they come and go,
/// until the token fires.
pub async fn watch(portal: Portal, settings: WatchSettings<'_>, token: CancellationToken) {
    let mut ticker = interval(settings.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(ticker);

    let mut previous = BTreeSet::new();
    let mut failing = BTreeSet::new();

    info!(dir = ?settings.dir, prefixes = ?settings.prefixes, "Watching for devices");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            tick = ticks.next() => if tick.is_none() { break },
        }

        let current = match scan(settings.dir, settings.prefixes).await {
            Ok(current) => current,
            Err(e) => {
                warn!(dir = ?settings.dir, %e, "Could not scan for devices");
                continue;
            }
        };

        let registered = portal.list_devices().into_iter().collect();
        let Changes { appeared, vanished } = diff(&previous, &current, &registered);

        for name in vanished {
            failing.remove(&name);
            portal.notify_device_vanished(&name);
        }

        for name in appeared {
            match portal.notify_device_appeared(&name) {
                Ok(()) => {
                    failing.remove(&name);
                }
                Err(e) => {
                    // Retried every scan, only worth mentioning once.
                    if failing.insert(name.clone()) {
                        warn!(device = %name, %e, "Will keep retrying");
                    } else {
                        debug!(device = %name, %e, "Still failing");
                    }
                }
            }
        }

        previous = current;
    }

    debug!("Stopped watching for devices");
}
