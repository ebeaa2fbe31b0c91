use std::{future, net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, info_span, trace, Instrument};

use crate::{error::Error, events::Payload, portal::Portal, registry::DeviceEntry};

pub(crate) async fn ws_handler(
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(portal): Extension<Portal>,
) -> Result<impl IntoResponse, Error> {
    // Refuse before upgrading, so the client gets a plain 404.
    let entry = portal.lookup(&name)?;

    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected to {name}", user_agent.as_str());
    }

    Ok(ws.on_upgrade(move |socket| {
        let span = info_span!("client", %addr);
        handle_websocket(socket, portal, entry).instrument(span)
    }))
}

fn into_message(payload: Payload) -> Message {
    Message::Binary(payload.into_bytes().to_vec())
}

fn into_bytes(message: Message) -> Option<Bytes> {
    match message {
        Message::Binary(bytes) => Some(bytes.into()),
        Message::Text(text) => Some(text.into()),
        Message::Ping(_) => {
            trace!("socket ping");
            None
        }
        Message::Pong(_) => {
            trace!("socket pong");
            None
        }
        Message::Close(_) => None,
    }
}

pub(crate) async fn handle_websocket(websocket: WebSocket, portal: Portal, entry: Arc<DeviceEntry>) {
    let (sink, stream) = websocket.split();

    let to_client =
        sink.with(|payload: Payload| future::ready(Ok::<_, axum::Error>(into_message(payload))));

    let from_client = stream
        .take_while(|message| {
            let open = !matches!(message, Ok(Message::Close(_)) | Err(_));
            if !open {
                debug!("client disconnected");
            }
            future::ready(open)
        })
        .filter_map(|message| future::ready(message.ok().and_then(into_bytes)));

    let end = portal.bridge(entry, to_client, from_client).await;

    debug!(%end, "Websocket done");
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::events::{Notice, DEVICE_DISCONNECTED_SCREEN};

    #[test]
    fn device_output_is_binary() {
        assert_eq!(
            into_message(Payload::Bytes(Bytes::from_static(b"\x00\xffok"))),
            Message::Binary(b"\x00\xffok".to_vec())
        );
    }

    #[test]
    fn notice_is_the_disconnected_screen() {
        assert_eq!(
            into_message(Payload::Notice(Notice::DeviceDisconnected)),
            Message::Binary(DEVICE_DISCONNECTED_SCREEN.as_bytes().to_vec())
        );
    }

    #[test]
    fn text_and_binary_go_to_the_device() {
        assert_eq!(
            into_bytes(Message::Text("ls\n".into())),
            Some(Bytes::from_static(b"ls\n"))
        );
        assert_eq!(
            into_bytes(Message::Binary(vec![3])),
            Some(Bytes::from_static(&[3]))
        );
    }

    #[test]
    fn control_frames_are_dropped() {
        assert_eq!(into_bytes(Message::Ping(vec![1])), None);
        assert_eq!(into_bytes(Message::Pong(vec![1])), None);
        assert_eq!(into_bytes(Message::Close(None)), None);
    }
}
