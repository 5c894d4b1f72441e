//! SSE tee: forward the upstream event stream to the client byte-for-byte
//! (modulo model-field patching) while extracting terminal usage metadata.

use std::time::Instant;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::usage::{merge_usage_event, Usage};
use crate::wire::StreamWriter;

/// Upper bound for one buffered SSE line. Oversized lines are forwarded
/// unparsed so the client still sees every byte.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ModelRewrite {
    /// Model name the upstream believes it is serving.
    pub upstream: String,
    /// Model name the caller asked for and must observe.
    pub requested: String,
}

#[derive(Debug, Default)]
pub struct TeeOutcome {
    pub usage: Usage,
    pub first_token_ms: Option<i64>,
    pub saw_done: bool,
    pub client_gone: bool,
}

/// Extract the payload of a `data:` line, tolerating a missing space after
/// the colon.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn patch_model_fields(event: &mut JsonValue, rewrite: &ModelRewrite) -> bool {
    let mut patched = false;
    if let Some(model) = event.get_mut("model") {
        if model.as_str() == Some(rewrite.upstream.as_str()) {
            *model = JsonValue::String(rewrite.requested.clone());
            patched = true;
        }
    }
    if let Some(model) = event.get_mut("response").and_then(|r| r.get_mut("model")) {
        if model.as_str() == Some(rewrite.upstream.as_str()) {
            *model = JsonValue::String(rewrite.requested.clone());
            patched = true;
        }
    }
    patched
}

struct LineHandler<'a> {
    writer: &'a mut StreamWriter,
    rewrite: Option<&'a ModelRewrite>,
    started_at: Instant,
    outcome: TeeOutcome,
}

impl LineHandler<'_> {
    async fn handle_line(&mut self, line: &[u8]) {
        let mut line = line;
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        let mut forwarded: Option<Bytes> = None;
        if let Ok(text) = std::str::from_utf8(line) {
            if let Some(payload) = data_payload(text) {
                if payload == "[DONE]" {
                    self.outcome.saw_done = true;
                } else if !payload.is_empty() {
                    if self.outcome.first_token_ms.is_none() {
                        self.outcome.first_token_ms =
                            Some(self.started_at.elapsed().as_millis() as i64);
                    }
                    if let Ok(mut event) = serde_json::from_str::<JsonValue>(payload) {
                        merge_usage_event(self.writer.surface(), &event, &mut self.outcome.usage);
                        if let Some(rewrite) = self.rewrite {
                            if patch_model_fields(&mut event, rewrite) {
                                let mut patched = Vec::with_capacity(payload.len() + 8);
                                patched.extend_from_slice(b"data: ");
                                patched.extend_from_slice(
                                    &serde_json::to_vec(&event).unwrap_or_default(),
                                );
                                patched.push(b'\n');
                                forwarded = Some(Bytes::from(patched));
                            }
                        }
                    }
                }
            }
        }

        let frame = forwarded.unwrap_or_else(|| {
            let mut raw = Vec::with_capacity(line.len() + 1);
            raw.extend_from_slice(line);
            raw.push(b'\n');
            Bytes::from(raw)
        });

        // A failed client write is remembered but never aborts the read side:
        // upstream must be drained to completion so usage can be metered.
        if !self.outcome.client_gone && self.writer.send(frame).await.is_err() {
            self.outcome.client_gone = true;
        }
    }
}

/// Pump the upstream byte stream to the client line by line, patching the
/// model field where rewriting is in effect and folding usage out of the
/// terminal events.
pub async fn tee_sse(
    mut upstream: mpsc::Receiver<Bytes>,
    writer: &mut StreamWriter,
    rewrite: Option<&ModelRewrite>,
    started_at: Instant,
) -> TeeOutcome {
    let mut handler = LineHandler {
        writer,
        rewrite,
        started_at,
        outcome: TeeOutcome::default(),
    };
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = upstream.recv().await {
        buffer.extend_from_slice(&chunk);
        loop {
            let Some(pos) = buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            handler.handle_line(&line[..line.len() - 1]).await;
        }
        if buffer.len() > MAX_LINE_BYTES {
            // Give up on framing this line; flush it through untouched.
            let raw = Bytes::from(std::mem::take(&mut buffer));
            if !handler.outcome.client_gone && handler.writer.send(raw).await.is_err() {
                handler.outcome.client_gone = true;
            }
        }
    }

    if !buffer.is_empty() {
        let line: Vec<u8> = std::mem::take(&mut buffer);
        handler.handle_line(&line).await;
    }

    handler.outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{sse_response_headers, ClientResponse, Surface, StreamWriter};

    async fn run_tee(
        surface: Surface,
        chunks: Vec<&'static [u8]>,
        rewrite: Option<ModelRewrite>,
    ) -> (TeeOutcome, Vec<u8>) {
        let (mut writer, head) = StreamWriter::new(surface);
        writer.start_stream(200, sse_response_headers());
        let ClientResponse::Stream { mut body, .. } = head.await.unwrap() else {
            panic!("expected stream");
        };
        let collector = tokio::spawn(async move {
            let mut bytes = Vec::new();
            while let Some(frame) = body.recv().await {
                bytes.extend_from_slice(&frame);
            }
            bytes
        });

        let (tx, rx) = mpsc::channel(8);
        for chunk in chunks {
            tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
        drop(tx);

        let outcome = tee_sse(rx, &mut writer, rewrite.as_ref(), Instant::now()).await;
        writer.finish();
        let bytes = collector.await.unwrap();
        (outcome, bytes)
    }

    #[tokio::test]
    async fn forwards_bytes_and_extracts_openai_usage() {
        let (outcome, bytes) = run_tee(
            Surface::OpenAI,
            vec![
                b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\"}\n\n",
                b"data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":11,\"output_tokens\":7,\"input_tokens_details\":{\"cached_tokens\":3}}}}\n\n",
                b"data: [DONE]\n\n",
            ],
            None,
        )
        .await;

        assert!(outcome.saw_done);
        assert!(!outcome.client_gone);
        assert_eq!(outcome.usage.input_tokens, 11);
        assert_eq!(outcome.usage.output_tokens, 7);
        assert_eq!(outcome.usage.cache_read_tokens, 3);
        assert!(outcome.first_token_ms.is_some());
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("response.output_text.delta"));
        assert!(text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn patches_model_in_both_positions() {
        let rewrite = ModelRewrite {
            upstream: "gpt-5.2".to_string(),
            requested: "my-alias".to_string(),
        };
        let (_, bytes) = run_tee(
            Surface::OpenAI,
            vec![
                b"data: {\"type\":\"response.created\",\"response\":{\"model\":\"gpt-5.2\"}}\n\n",
                b"data: {\"model\":\"gpt-5.2\"}\n\n",
            ],
            Some(rewrite),
        )
        .await;
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"my-alias\""));
        assert!(!text.contains("gpt-5.2"));
    }

    #[tokio::test]
    async fn missing_done_still_reports_usage() {
        let (outcome, _) = run_tee(
            Surface::OpenAI,
            vec![
                b"data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":2,\"output_tokens\":1}}}\n\n",
            ],
            None,
        )
        .await;
        assert!(!outcome.saw_done);
        assert_eq!(outcome.usage.input_tokens, 2);
    }

    #[tokio::test]
    async fn split_lines_across_chunks_are_reassembled() {
        let (outcome, bytes) = run_tee(
            Surface::Anthropic,
            vec![
                b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_t",
                b"okens\":5,\"output_tokens\":0}}}\n\n",
                b"event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":4}}\n\n",
            ],
            None,
        )
        .await;
        assert_eq!(outcome.usage.input_tokens, 5);
        assert_eq!(outcome.usage.output_tokens, 4);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("message_delta"));
    }

    #[tokio::test]
    async fn client_disconnect_keeps_draining_for_usage() {
        let (mut writer, head) = StreamWriter::new(Surface::OpenAI);
        writer.start_stream(200, sse_response_headers());
        let ClientResponse::Stream { body, .. } = head.await.unwrap() else {
            panic!("expected stream");
        };
        drop(body);

        let (tx, rx) = mpsc::channel(8);
        tx.send(Bytes::from_static(b"data: {\"type\":\"response.output_text.delta\"}\n\n"))
            .await
            .unwrap();
        tx.send(Bytes::from_static(
            b"data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":11,\"output_tokens\":7,\"input_tokens_details\":{\"cached_tokens\":3}}}}\n\n",
        ))
        .await
        .unwrap();
        tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await.unwrap();
        drop(tx);

        let outcome = tee_sse(rx, &mut writer, None, Instant::now()).await;
        assert!(outcome.client_gone);
        assert!(outcome.saw_done);
        assert_eq!(outcome.usage.input_tokens, 11);
        assert_eq!(outcome.usage.output_tokens, 7);
    }

    #[test]
    fn data_prefix_tolerates_missing_space() {
        assert_eq!(data_payload("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data: x"), Some("x"));
        assert_eq!(data_payload("event: ping"), None);
    }
}
