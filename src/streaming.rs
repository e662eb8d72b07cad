use axum::body::Bytes;
use axum::http::StatusCode;
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::fmt::Display;
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::error::error_body;
use crate::models::OpenAIStreamChunk;
use crate::translate::openai_chunk_to_generate_content;

pub type BodyChunk = Result<Bytes, Infallible>;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Done,
    Eof,
    ReadError,
    Cancelled,
    LineTooLong,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub end: StreamEnd,
    pub chunks: u64,
    pub diagnostics: u64,
}

/// Fires the completion signal exactly once, on finish or on drop.
struct Completion {
    outcome: StreamOutcome,
    signal: Option<oneshot::Sender<StreamOutcome>>,
}

impl Completion {
    fn new(signal: oneshot::Sender<StreamOutcome>) -> Self {
        Self {
            outcome: StreamOutcome {
                end: StreamEnd::Aborted,
                chunks: 0,
                diagnostics: 0,
            },
            signal: Some(signal),
        }
    }

    fn finish(&mut self, end: StreamEnd) {
        self.outcome.end = end;
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(signal) = self.signal.take() {
            let _ = signal.send(self.outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineEvent {
    Done,
    Chunk(Bytes),
    Diagnostic(Bytes),
}

/// Translates an OpenAI event stream into newline-delimited `GenerateContentResponse` objects.
#[derive(Clone, Copy, Debug)]
pub struct StreamTranscoder {
    buffer: usize,
    max_line_bytes: usize,
    dump_bodies: bool,
}

impl StreamTranscoder {
    pub fn new(buffer: usize, max_line_bytes: usize, dump_bodies: bool) -> Self {
        Self {
            buffer: buffer.max(1),
            max_line_bytes: max_line_bytes.max(1),
            dump_bodies,
        }
    }

    // The receiver resolves once the task has released both ends.
    pub fn spawn<S, E>(&self, upstream: S) -> (ReceiverStream<BodyChunk>, oneshot::Receiver<StreamOutcome>)
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<BodyChunk>(self.buffer);
        let (done_tx, done_rx) = oneshot::channel();
        let transcoder = *self;

        tokio::spawn(
            async move {
                let mut completion = Completion::new(done_tx);
                let end = transcoder
                    .transcode(Box::pin(upstream), tx, &mut completion.outcome)
                    .await;
                completion.finish(end);
            }
            .in_current_span(),
        );

        (ReceiverStream::new(rx), done_rx)
    }

    async fn transcode<S, E>(
        self,
        mut upstream: S,
        tx: mpsc::Sender<BodyChunk>,
        outcome: &mut StreamOutcome,
    ) -> StreamEnd
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut buffer: Vec<u8> = Vec::new();
        // no newline before this offset
        let mut scanned = 0;
        loop {
            let mut consumed = 0;
            while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let line_end = scanned + offset + 1;
                let flow = forward_line(&buffer[consumed..line_end], &tx, outcome, self.dump_bodies).await;
                consumed = line_end;
                scanned = line_end;
                if let ControlFlow::Break(end) = flow {
                    return end;
                }
            }
            buffer.drain(..consumed);
            scanned = buffer.len();

            if buffer.len() > self.max_line_bytes {
                tracing::warn!(pending = buffer.len(), limit = self.max_line_bytes, "stream line too long");
                let message = format!("stream line exceeds {} bytes", self.max_line_bytes);
                return end_with_diagnostic(&tx, outcome, message, StreamEnd::LineTooLong).await;
            }

            let next = tokio::select! {
                _ = tx.closed() => return StreamEnd::Cancelled,
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "upstream stream read error");
                    let message = format!("stream read error: {}", err);
                    return end_with_diagnostic(&tx, outcome, message, StreamEnd::ReadError).await;
                }
                None => {
                    if !buffer.is_empty()
                        && let ControlFlow::Break(end) =
                            forward_line(&buffer, &tx, outcome, self.dump_bodies).await
                    {
                        return end;
                    }
                    return StreamEnd::Eof;
                }
            }
        }
    }
}

async fn end_with_diagnostic(
    tx: &mpsc::Sender<BodyChunk>,
    outcome: &mut StreamOutcome,
    message: String,
    end: StreamEnd,
) -> StreamEnd {
    outcome.diagnostics += 1;
    if tx.send(Ok(diagnostic_line(message))).await.is_err() {
        return StreamEnd::Cancelled;
    }
    end
}

async fn forward_line(
    line: &[u8],
    tx: &mpsc::Sender<BodyChunk>,
    outcome: &mut StreamOutcome,
    dump_bodies: bool,
) -> ControlFlow<StreamEnd> {
    let out = match translate_line(line, dump_bodies) {
        None => return ControlFlow::Continue(()),
        Some(LineEvent::Done) => return ControlFlow::Break(StreamEnd::Done),
        Some(LineEvent::Chunk(out)) => {
            outcome.chunks += 1;
            out
        }
        Some(LineEvent::Diagnostic(out)) => {
            outcome.diagnostics += 1;
            out
        }
    };
    if tx.send(Ok(out)).await.is_err() {
        return ControlFlow::Break(StreamEnd::Cancelled);
    }
    ControlFlow::Continue(())
}

fn translate_line(line: &[u8], dump_bodies: bool) -> Option<LineEvent> {
    let text = String::from_utf8_lossy(line);
    let data = text.trim().strip_prefix(DATA_PREFIX)?.trim();
    if data.is_empty() {
        return None;
    }
    if dump_bodies {
        tracing::info!("upstream stream chunk: {}", data);
    }
    if data == DONE_SENTINEL {
        return Some(LineEvent::Done);
    }

    let chunk: OpenAIStreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(err) => {
            tracing::warn!(error = %err, raw = %data, "invalid stream chunk");
            return Some(LineEvent::Diagnostic(diagnostic_line(format!(
                "invalid chunk format, error: {}, raw: {}",
                err, data
            ))));
        }
    };

    match serde_json::to_vec(&openai_chunk_to_generate_content(chunk)) {
        Ok(mut out) => {
            out.push(b'\n');
            Some(LineEvent::Chunk(Bytes::from(out)))
        }
        Err(err) => Some(LineEvent::Diagnostic(diagnostic_line(format!(
            "failed to convert chunk, error: {}, raw: {}",
            err, data
        )))),
    }
}

fn diagnostic_line(message: String) -> Bytes {
    let body = error_body(StatusCode::INTERNAL_SERVER_ERROR, message.clone());
    let mut out = serde_json::to_vec(&body).unwrap_or_else(|_| message.into_bytes());
    out.push(b'\n');
    Bytes::from(out)
}
