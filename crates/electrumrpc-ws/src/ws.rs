//! `WsDialer`: tokio-tungstenite backed `Dialer` for `ws://` and `wss://`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use electrumrpc_core::error::TransportError;
use electrumrpc_core::transport::{CloseCode, OutboundFrame};

use crate::link::{Dialer, Link, LinkEvent};

/// Dials Electrum servers over WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Link, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::SetupFailed(e.to_string()))?;
        let (sink, stream) = ws_stream.split();

        let sink = sink
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|frame: OutboundFrame| future::ready(Ok::<_, TransportError>(to_message(frame))));
        let stream = stream.filter_map(|msg| future::ready(to_event(msg)));

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.into()),
        OutboundFrame::Binary(bytes) => Message::Binary(bytes.to_vec().into()),
        OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: u16::from(code).into(),
            reason: reason.unwrap_or_default().into(),
        })),
    }
}

fn to_event(msg: Result<Message, tungstenite::Error>) -> Option<LinkEvent> {
    match msg {
        Ok(Message::Text(text)) => Some(LinkEvent::Frame(Bytes::copy_from_slice(text.as_bytes()))),
        Ok(Message::Binary(data)) => Some(LinkEvent::Frame(Bytes::from(data))),
        Ok(Message::Close(Some(frame))) => {
            let reason = frame.reason.to_string();
            Some(LinkEvent::Closed {
                code: CloseCode::from(u16::from(frame.code)),
                reason: (!reason.is_empty()).then_some(reason),
            })
        }
        // 1005: closed without a status code
        Ok(Message::Close(None)) => Some(LinkEvent::Closed {
            code: CloseCode::from(1005),
            reason: None,
        }),
        // Pings are answered by tungstenite on the next write.
        Ok(_) => None,
        Err(e) => Some(LinkEvent::Failed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_maps_code_and_reason() {
        let msg = to_message(OutboundFrame::Close {
            code: CloseCode::GoingAway,
            reason: Some("bye".into()),
        });
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1001);
                assert_eq!(frame.reason.to_string(), "bye");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn inbound_messages_become_events() {
        let text = to_event(Ok(Message::Text("{\"id\":1}".to_string().into())));
        assert_eq!(text, Some(LinkEvent::Frame(Bytes::from_static(b"{\"id\":1}"))));

        let closed = to_event(Ok(Message::Close(Some(CloseFrame {
            code: 1000u16.into(),
            reason: "".into(),
        }))));
        assert_eq!(
            closed,
            Some(LinkEvent::Closed { code: CloseCode::Normal, reason: None })
        );

        assert_eq!(to_event(Ok(Message::Ping(vec![1].into()))), None);
    }
}
