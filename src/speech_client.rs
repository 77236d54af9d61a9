//! # Speech Agent Client
//!
//! Outbound WebSocket connection to the speech-to-speech agent.
//!
//! ## How the connection is split:
//! - **Writer**: a tokio task drains an unbounded channel into the socket sink.
//!   The call supervisor holds the sending half as a [`SpeechLink`], so sending
//!   never blocks the actor.
//! - **Reader**: the [`SpeechStream`] is handed to the supervisor, which attaches it
//!   to its own context so speech messages are handled in order on the actor.

use crate::relay::SpeechPeer;
use anyhow::{Context, Result};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Read half of the speech-agent socket.
pub type SpeechStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Sending half of an open speech-agent connection.
#[derive(Debug, Clone)]
pub struct SpeechLink {
    tx: mpsc::UnboundedSender<Message>,
}

impl SpeechLink {
    fn send(&self, message: Message) -> Result<(), String> {
        self.tx
            .send(message)
            .map_err(|_| "speech connection writer has stopped".to_string())
    }

    /// Ask the writer to close the socket. Safe to call on a dead link.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

/// Lifecycle of the speech-agent connection as seen by one call.
#[derive(Debug, Default)]
pub enum SpeechConnection {
    /// Connect in progress, or agent settings not yet sent
    #[default]
    Connecting,
    /// Open with the agent settings already sent
    Open(SpeechLink),
    Closed,
}

impl SpeechConnection {
    /// Close the link if open; further sends are refused.
    pub fn close(&mut self) {
        if let SpeechConnection::Open(link) = std::mem::replace(self, SpeechConnection::Closed) {
            link.close();
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            SpeechConnection::Connecting => "connecting",
            SpeechConnection::Open(_) => "open",
            SpeechConnection::Closed => "closed",
        }
    }
}

impl SpeechPeer for SpeechConnection {
    fn is_ready(&self) -> bool {
        matches!(self, SpeechConnection::Open(_))
    }

    fn send_audio(&mut self, frame: Vec<u8>) -> Result<(), String> {
        match self {
            SpeechConnection::Open(link) => link.send(Message::Binary(frame)),
            _ => Err(format!("speech connection is {}", self.state_name())),
        }
    }

    fn send_json(&mut self, payload: String) -> Result<(), String> {
        match self {
            SpeechConnection::Open(link) => link.send(Message::Text(payload)),
            _ => Err(format!("speech connection is {}", self.state_name())),
        }
    }
}

/// Open a connection to the speech agent.
///
/// Returns once the WebSocket handshake completes. The writer task ends when
/// every [`SpeechLink`] clone has been dropped or the socket fails.
pub async fn connect(url: &str, api_key: &str) -> Result<(SpeechLink, SpeechStream)> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("Invalid speech agent URL {}", url))?;

    if !api_key.is_empty() {
        let value = HeaderValue::from_str(&format!("Token {}", api_key))
            .context("Speech API key is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .context("Failed to connect to speech agent")?;
    debug!("Speech agent handshake completed with status {}", response.status());

    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(err) = UnboundedReceiverStream::new(rx).map(Ok).forward(sink).await {
            warn!("Speech agent writer stopped: {}", err);
        }
    });

    Ok((SpeechLink { tx }, stream))
}

/// Link whose writer side is a plain channel, for tests.
#[cfg(test)]
pub(crate) fn test_link() -> (SpeechLink, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SpeechLink { tx }, rx)
}
