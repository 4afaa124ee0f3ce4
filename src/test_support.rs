//! In-process WebSocket peers for tests.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Stand-in for the remote realtime endpoint.
pub(crate) struct MockUpstream {
    addr: SocketAddr,
    peers: UnboundedReceiver<MockPeer>,
}

enum PeerCommand {
    Send(Message),
    Close,
    Drop,
}

/// One accepted connection on the mock endpoint.
pub(crate) struct MockPeer {
    pub uri: String,
    pub headers: HeaderMap,
    received: UnboundedReceiver<Message>,
    commands: UnboundedSender<PeerCommand>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer_tx, peers) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_peer(stream, peer_tx.clone()));
            }
        });

        Self { addr, peers }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub async fn next_peer(&mut self) -> MockPeer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("no upstream connection arrived")
            .expect("mock upstream stopped")
    }

    /// Whether another connection arrives within `window`.
    pub async fn has_peer_within(&mut self, window: Duration) -> bool {
        matches!(tokio::time::timeout(window, self.peers.recv()).await, Ok(Some(_)))
    }
}

impl MockPeer {
    pub fn send_text(&self, text: &str) {
        let _ = self.commands.send(PeerCommand::Send(Message::Text(text.to_string())));
    }

    pub fn send(&self, message: Message) {
        let _ = self.commands.send(PeerCommand::Send(message));
    }

    /// Clean close handshake.
    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }

    /// Drop the TCP connection without a close frame.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(PeerCommand::Drop);
    }

    /// Next data message, skipping control frames.
    pub async fn recv(&mut self) -> Message {
        loop {
            let message = tokio::time::timeout(WAIT, self.received.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("peer connection ended");
            if message.is_text() || message.is_binary() {
                return message;
            }
        }
    }

    /// Wait until the relay closed this connection (close frame or EOF).
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(WAIT, async {
            loop {
                match self.received.recv().await {
                    Some(message) if message.is_close() => return,
                    Some(_) => continue,
                    None => return,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "upstream peer was not closed");
    }

    /// Whether any data message arrives within `window`.
    pub async fn has_data_within(&mut self, window: Duration) -> bool {
        let outcome = tokio::time::timeout(window, async {
            while let Some(message) = self.received.recv().await {
                if message.is_text() || message.is_binary() {
                    return true;
                }
            }
            false
        })
        .await;
        matches!(outcome, Ok(true))
    }
}

async fn serve_peer(stream: TcpStream, peers: UnboundedSender<MockPeer>) {
    let captured: Arc<Mutex<Option<(String, HeaderMap)>>> = Arc::new(Mutex::new(None));
    let capture = captured.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        *capture.lock().unwrap() = Some((request.uri().to_string(), request.headers().clone()));
        Ok(response)
    };

    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (uri, headers) = captured.lock().unwrap().take().unwrap_or_default();

    let (received_tx, received) = mpsc::unbounded_channel();
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let _ = peers.send(MockPeer {
        uri,
        headers,
        received,
        commands: commands_tx,
    });

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Send(message)) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                }
                Some(PeerCommand::Drop) | None => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(message)) => {
                    let is_close = message.is_close();
                    let _ = received_tx.send(message);
                    if is_close {
                        let _ = sink.close().await;
                        break;
                    }
                }
                _ => break,
            }
        }
    }
}
