//! Client-side response plumbing.
//!
//! The handler spawns the request pipeline with a [`StreamWriter`] and awaits
//! the response head on a oneshot. The pipeline either answers once with a
//! buffered JSON body, or starts an SSE stream and keeps writing frames; the
//! first streamed write flips `stream_started`, after which errors must be
//! emitted as SSE `error` events to preserve the protocol.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use tollgate_transform::headers::Headers;

use crate::error::GatewayError;

/// Inbound protocol surface. The selector only knows the platform tag; the
/// surface drives wire concerns: error shape, keepalive frame and the
/// stream-done sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Anthropic,
    OpenAI,
    Gemini,
}

impl Surface {
    pub fn ping_frame(&self) -> Option<Bytes> {
        match self {
            // The Anthropic stream has a first-class ping event.
            Surface::Anthropic => Some(Bytes::from_static(
                b"event: ping\ndata: {\"type\": \"ping\"}\n\n",
            )),
            // OpenAI clients tolerate comment frames.
            Surface::OpenAI => Some(Bytes::from_static(b":\n\n")),
            Surface::Gemini => None,
        }
    }

    pub fn done_sentinel(&self) -> Option<&'static str> {
        match self {
            Surface::OpenAI => Some("[DONE]"),
            Surface::Anthropic | Surface::Gemini => None,
        }
    }
}

/// Response head plus body variant handed back to the axum handler.
pub enum ClientResponse {
    Json {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: Headers,
        body: mpsc::Receiver<Bytes>,
    },
}

const STREAM_CHANNEL_CAPACITY: usize = 32;

pub fn sse_response_headers() -> Headers {
    vec![
        ("content-type".to_string(), "text/event-stream".to_string()),
        ("cache-control".to_string(), "no-cache".to_string()),
        ("connection".to_string(), "keep-alive".to_string()),
        ("x-accel-buffering".to_string(), "no".to_string()),
    ]
}

pub struct StreamWriter {
    surface: Surface,
    head: Option<oneshot::Sender<ClientResponse>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
    stream_started: bool,
    client_gone: bool,
}

impl StreamWriter {
    pub fn new(surface: Surface) -> (Self, oneshot::Receiver<ClientResponse>) {
        let (head_tx, head_rx) = oneshot::channel();
        (
            Self {
                surface,
                head: Some(head_tx),
                body_tx: None,
                stream_started: false,
                client_gone: false,
            },
            head_rx,
        )
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    pub fn stream_started(&self) -> bool {
        self.stream_started
    }

    pub fn client_gone(&self) -> bool {
        self.client_gone
    }

    /// Answer with a buffered body. A no-op if the stream already started.
    pub fn respond_json(&mut self, status: u16, headers: Headers, body: Bytes) {
        if let Some(head) = self.head.take() {
            let _ = head.send(ClientResponse::Json {
                status,
                headers,
                body,
            });
        }
    }

    /// Open the response stream. Idempotent; later calls keep the original
    /// head.
    pub fn start_stream(&mut self, status: u16, headers: Headers) {
        if self.stream_started {
            return;
        }
        let Some(head) = self.head.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        if head
            .send(ClientResponse::Stream {
                status,
                headers,
                body: rx,
            })
            .is_err()
        {
            self.client_gone = true;
        }
        self.body_tx = Some(tx);
        self.stream_started = true;
    }

    /// Forward one frame. Once the client disconnects this keeps returning
    /// `Err` without tearing anything down, so the caller can drain upstream.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), ClientGone> {
        if self.client_gone {
            return Err(ClientGone);
        }
        let Some(tx) = &self.body_tx else {
            return Err(ClientGone);
        };
        if tx.send(frame).await.is_err() {
            self.client_gone = true;
            return Err(ClientGone);
        }
        Ok(())
    }

    /// Keepalive while waiting for admission. The first ping commits the
    /// response as a 200 SSE stream.
    pub async fn ping(&mut self) {
        let Some(frame) = self.surface.ping_frame() else {
            return;
        };
        if !self.stream_started {
            self.start_stream(200, sse_response_headers());
        }
        let _ = self.send(frame).await;
    }

    /// Emit an error in whichever form the current protocol state allows.
    pub async fn fail(&mut self, err: &GatewayError) {
        if self.stream_started {
            let frame = err.sse_event(self.surface);
            let _ = self.send(frame).await;
            self.body_tx = None;
            return;
        }
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        self.respond_json(err.status, headers, err.body_for(self.surface));
    }

    /// Close the body channel, ending the stream for the client.
    pub fn finish(&mut self) {
        self.body_tx = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;
