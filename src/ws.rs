//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. The session is the only consumer, but all
//! WebSocket use in the crate goes through this module rather than
//! `tokio-tungstenite` directly.
//!
//! [`resolve_endpoint`] turns the addresses callers pass to
//! `Session::open` into absolute `ws(s)://` endpoints: absolute HTTP(S)
//! URLs get their scheme swapped, and path-only addresses are resolved
//! against the configured origin.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::SessionError;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Received WebSocket frame.
#[derive(Debug)]
pub enum WsFrame {
    /// UTF-8 text frame (the only frame kind the protocol uses).
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a pong frame in response to a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Flush pending writes and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next frame, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsFrame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsFrame::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsFrame::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsFrame::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsFrame::Pong(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsFrame::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames are skipped
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a resolved `ws(s)://` endpoint.
///
/// Returns split (writer, reader) halves for independent use in the
/// session's `tokio::select!`-free read loop.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the handshake fails.
pub async fn connect(endpoint: &str) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = endpoint
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {endpoint}"))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Resolve an address to an absolute WebSocket endpoint.
///
/// - `ws://` / `wss://` pass through unchanged;
/// - `http://` / `https://` swap to the matching WebSocket scheme;
/// - a path starting with `/` is resolved against `origin` (itself
///   scheme-swapped), mirroring how a page-relative address resolves in a
///   browser client.
///
/// # Errors
///
/// Returns [`SessionError::AddressInvalid`] for path addresses without a
/// configured origin and for anything that is not one of the forms above.
pub fn resolve_endpoint(address: &str, origin: Option<&str>) -> Result<String, SessionError> {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        return Ok(address.to_string());
    }
    if address.starts_with("http://") || address.starts_with("https://") {
        return Ok(ws_scheme(address));
    }
    if address.starts_with('/') {
        let origin =
            origin.ok_or_else(|| SessionError::AddressInvalid(address.to_string()))?;
        return Ok(format!(
            "{}{}",
            ws_scheme(origin.trim_end_matches('/')),
            address
        ));
    }

    Err(SessionError::AddressInvalid(address.to_string()))
}

/// Convert an HTTP(S) URL to WS(S) scheme, passing `ws(s)://` through.
#[must_use]
fn ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://").replace("http://", "ws://")
    }
}
