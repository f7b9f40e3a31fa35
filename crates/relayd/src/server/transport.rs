//! Adapters between axum WebSockets and the registry's frame traits.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use crate::registry::{ConnectionError, Frame, FrameSink, FrameStream};

/// Write half of an upgraded listener socket.
pub struct WebSocketSink(SplitSink<WebSocket, Message>);

/// Read half of an upgraded listener socket.
pub struct WebSocketSource(SplitStream<WebSocket>);

/// Splits an upgraded socket into registry-facing halves.
pub fn split(socket: WebSocket) -> (WebSocketSink, WebSocketSource) {
    let (sink, stream) = socket.split();
    (WebSocketSink(sink), WebSocketSource(stream))
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping => Message::Ping(Bytes::new()),
        Frame::Pong => Message::Pong(Bytes::new()),
        Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code,
            reason: "".into(),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.to_string()),
        Message::Binary(data) => Frame::Binary(data.to_vec()),
        Message::Ping(_) => Frame::Ping,
        Message::Pong(_) => Frame::Pong,
        Message::Close(close) => Frame::Close(close.map(|c| c.code)),
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        self.0
            .send(into_message(frame))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.0
            .close()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }
}

#[async_trait]
impl FrameStream for WebSocketSource {
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        self.0.next().await.map(|message| {
            message
                .map(from_message)
                .map_err(|e| ConnectionError::Io(e.to_string()))
        })
    }
}
