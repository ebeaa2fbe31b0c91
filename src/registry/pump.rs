use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, error, info_span, trace, Instrument};

use super::{DeviceEntry, DeviceRegistry};
use crate::{error::Error, events::Payload};

/// Start the reader pump and the writer for a freshly opened device.
pub(super) fn spawn<R, W>(
    registry: DeviceRegistry,
    entry: Arc<DeviceEntry>,
    reader: R,
    writer: W,
    write_queue: mpsc::Receiver<Bytes>,
    chunk_size: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let tty_span = info_span!("tty", device = %entry.name());

    tokio::spawn(
        read_pump(registry.clone(), entry.clone(), reader, chunk_size)
            .instrument(info_span!(parent: &tty_span, "read")),
    );
    tokio::spawn(
        write_pump(registry, entry, writer, write_queue)
            .instrument(info_span!(parent: &tty_span, "write")),
    );
}

async fn read_pump<R>(
    registry: DeviceRegistry,
    entry: Arc<DeviceEntry>,
    mut reader: R,
    chunk_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let token = entry.cancellation().clone();
    let mut chunk = vec![0; chunk_size];

    let failure = loop {
        let read = tokio::select! {
            _ = token.cancelled() => break None,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            // A serial port does not end, it disappears.
            Ok(0) => break Some("end of stream".to_owned()),
            Ok(n) => {
                trace!("Message from port: `{:?}`", &chunk[..n.min(32)]);

                // The chunk buffer is reused, so publish a copy.
                let listeners = registry
                    .bus()
                    .publish(entry.name(), Payload::Bytes(Bytes::copy_from_slice(&chunk[..n])));
                trace!("Published {n} byte(s) to {listeners} listener(s)");
            }
            Err(e) => break Some(e.to_string()),
        }
    };

    match failure {
        Some(problem) => {
            let e = Error::Read {
                device: entry.name().to_owned(),
                problem,
            };
            error!(%e, "Serial port error, disconnecting");
            registry.disconnect_entry(entry.name(), entry.id());
        }
        None => debug!("Cancelled, reader stopped"),
    }
}

async fn write_pump<W>(
    registry: DeviceRegistry,
    entry: Arc<DeviceEntry>,
    mut writer: W,
    mut write_queue: mpsc::Receiver<Bytes>,
) where
    W: AsyncWrite + Unpin,
{
    let token = entry.cancellation().clone();

    loop {
        let bytes = tokio::select! {
            _ = token.cancelled() => break,
            bytes = write_queue.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };

        trace!("Message to port: `{:?}`", &bytes[..bytes.len().min(32)]);

        // A port which does not drain must not keep the handle open past a disconnect.
        let written = tokio::select! {
            _ = token.cancelled() => break,
            written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            } => written,
        };

        if let Err(e) = written {
            let e = Error::Write {
                device: entry.name().to_owned(),
                problem: e.to_string(),
            };
            error!(%e, "Serial port error in send, disconnecting");
            registry.disconnect_entry(entry.name(), entry.id());
            break;
        }
    }

    // Flushing could wait forever on a stuck port, just let go of it.
    if token.is_cancelled() {
        debug!("Cancelled, writer stopped");
        return;
    }

    if let Err(e) = writer.shutdown().await {
        debug!(?e, "Problem closing the port");
    }

    debug!("Writer stopped");
}
