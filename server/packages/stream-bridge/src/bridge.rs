use std::fmt::Display;
use std::time::Instant;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::decoder::LineDecoder;
use crate::protocol::{AgentEvent, ClientEvent};
use crate::signal::{completion_pair, BridgeFailure, CompletionSignal, CompletionWaiter};
use crate::translate::EventTranslator;

/// Output protocol requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// Translated client events.
    #[default]
    Events,
    /// Agent NDJSON forwarded verbatim.
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Line(String),
    Event(ClientEvent),
}

impl OutboundFrame {
    /// Synthetic terminal error in the shape the client expects.
    pub fn error(format: StreamFormat, message: &str) -> Self {
        match format {
            StreamFormat::Events => Self::Event(ClientEvent::error(message)),
            StreamFormat::Raw => {
                Self::Line(json!({ "type": "error", "message": message }).to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub lines: usize,
    pub continuity_id: Option<String>,
}

/// Registry entry for one execution awaiting its callback.
#[derive(Debug)]
pub struct StreamBridge {
    execution_id: String,
    format: StreamFormat,
    sink: Option<mpsc::Sender<OutboundFrame>>,
    signal: CompletionSignal,
    created_at: Instant,
}

impl StreamBridge {
    pub fn new(
        execution_id: impl Into<String>,
        format: StreamFormat,
        sink: mpsc::Sender<OutboundFrame>,
    ) -> (Self, CompletionWaiter) {
        let (signal, waiter) = completion_pair();
        (
            Self {
                execution_id: execution_id.into(),
                format,
                sink: Some(sink),
                signal,
                created_at: Instant::now(),
            },
            waiter,
        )
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn signal(&self) -> CompletionSignal {
        self.signal.clone()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_none()
    }

    /// Hands the output sink to a callback stream. Only the first call
    /// succeeds; the sink has a single writer for its whole life.
    pub fn attach(&mut self) -> Option<BridgeSink> {
        let sink = self.sink.take()?;
        Some(BridgeSink::new(self.execution_id.clone(), self.format, sink))
    }

    /// Writes one synthetic error frame, closes the sink and rejects the
    /// completion signal. Does nothing to the sink once a callback owns it.
    pub fn fail(&mut self, failure: BridgeFailure) -> bool {
        if let Some(sink) = self.sink.take() {
            let frame = OutboundFrame::error(self.format, &client_message(&failure));
            if sink.try_send(frame).is_err() {
                tracing::debug!(
                    execution_id = %self.execution_id,
                    "client output closed before error frame"
                );
            }
        }
        self.signal.reject(failure)
    }

    pub fn resolve(&self, outcome: BridgeOutcome) -> bool {
        self.signal.resolve(outcome)
    }

    pub fn reject(&self, failure: BridgeFailure) -> bool {
        self.signal.reject(failure)
    }
}

fn client_message(failure: &BridgeFailure) -> String {
    match failure {
        BridgeFailure::Timeout(_) => "The agent did not respond in time.".to_string(),
        BridgeFailure::Dispatch(message) => format!("Failed to start the agent: {message}"),
        BridgeFailure::Read(message) => format!("Agent stream interrupted: {message}"),
        BridgeFailure::Abandoned => "The agent stream was abandoned.".to_string(),
    }
}

/// Writer side of an attached bridge: decodes the callback body and
/// forwards it to the client.
///
/// The client stream stays open until the sink is dropped. A sink dropped
/// before `pump` returned writes one synthetic error frame on the way out.
#[derive(Debug)]
pub struct BridgeSink {
    execution_id: String,
    format: StreamFormat,
    sink: mpsc::Sender<OutboundFrame>,
    decoder: LineDecoder,
    translator: EventTranslator,
    outcome: BridgeOutcome,
    client_gone: bool,
    drained: bool,
}

impl BridgeSink {
    fn new(execution_id: String, format: StreamFormat, sink: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            execution_id,
            format,
            sink,
            decoder: LineDecoder::new(),
            translator: EventTranslator::new(),
            outcome: BridgeOutcome::default(),
            client_gone: false,
            drained: false,
        }
    }

    /// Drains `body` until it ends or fails.
    pub async fn pump<S, E>(&mut self, body: S) -> Result<BridgeOutcome, BridgeFailure>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let started = Instant::now();
        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    for line in self.decoder.push(&chunk) {
                        self.process_line(line).await;
                    }
                }
                Err(err) => {
                    let failure = BridgeFailure::Read(err.to_string());
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        error = %err,
                        lines = self.outcome.lines,
                        "callback body read failed"
                    );
                    self.forward(OutboundFrame::error(self.format, &client_message(&failure)))
                        .await;
                    self.drained = true;
                    return Err(failure);
                }
            }
        }

        if let Some(line) = self.decoder.finish() {
            self.process_line(line).await;
        }
        if self.format == StreamFormat::Events {
            for event in self.translator.finish() {
                self.forward(OutboundFrame::Event(event)).await;
            }
        }

        tracing::info!(
            execution_id = %self.execution_id,
            lines = self.outcome.lines,
            dropped_lines = self.decoder.dropped_lines(),
            continuity = self.outcome.continuity_id.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "callback stream completed"
        );
        self.drained = true;
        Ok(std::mem::take(&mut self.outcome))
    }

    async fn process_line(&mut self, line: String) {
        self.outcome.lines += 1;
        let event = AgentEvent::parse(&line);
        if let Some(continuity_id) = event.as_ref().and_then(AgentEvent::continuity_id) {
            self.outcome.continuity_id = Some(continuity_id.to_string());
        }
        match self.format {
            StreamFormat::Raw => self.forward(OutboundFrame::Line(line)).await,
            StreamFormat::Events => {
                let Some(event) = event else {
                    tracing::debug!(
                        execution_id = %self.execution_id,
                        "dropping unparsable agent line"
                    );
                    return;
                };
                for client_event in self.translator.translate(event) {
                    self.forward(OutboundFrame::Event(client_event)).await;
                }
            }
        }
    }

    async fn forward(&mut self, frame: OutboundFrame) {
        if self.client_gone {
            return;
        }
        if self.sink.send(frame).await.is_err() {
            // Keep draining so the continuity id is still observed.
            self.client_gone = true;
            tracing::info!(
                execution_id = %self.execution_id,
                "client disconnected; draining callback without forwarding"
            );
        }
    }
}

impl Drop for BridgeSink {
    fn drop(&mut self) {
        if self.drained {
            return;
        }
        tracing::warn!(
            execution_id = %self.execution_id,
            lines = self.outcome.lines,
            "callback stream dropped before it ended"
        );
        if self.client_gone {
            return;
        }
        let failure = BridgeFailure::Read("callback dropped".to_string());
        let frame = OutboundFrame::error(self.format, &client_message(&failure));
        if self.sink.try_send(frame).is_err() {
            tracing::debug!(
                execution_id = %self.execution_id,
                "client output full or closed before error frame"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(chunks: Vec<&'static str>) -> impl Stream<Item = Result<Bytes, String>> {
        stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(mut rx: mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn raw_format_forwards_lines_verbatim() {
        let (tx, rx) = mpsc::channel(16);
        let (mut bridge, _waiter) = StreamBridge::new("exec-1", StreamFormat::Raw, tx);
        let mut sink = bridge.attach().expect("first attach");
        let outcome = sink
            .pump(body(vec![
                "{\"type\":\"session-init\",\"continuityId\":\"c-1\"}\n{\"type\":\"te",
                "xt-delta\",\"text\":\"hi\"}\n{\"type\":\"mystery\"}",
            ]))
            .await
            .expect("pump should succeed");
        assert_eq!(outcome.lines, 3);
        assert_eq!(outcome.continuity_id.as_deref(), Some("c-1"));
        drop(sink);
        assert_eq!(
            collect(rx).await,
            vec![
                OutboundFrame::Line(
                    "{\"type\":\"session-init\",\"continuityId\":\"c-1\"}".to_string()
                ),
                OutboundFrame::Line("{\"type\":\"text-delta\",\"text\":\"hi\"}".to_string()),
                OutboundFrame::Line("{\"type\":\"mystery\"}".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn events_format_translates_and_finishes() {
        let (tx, rx) = mpsc::channel(16);
        let (mut bridge, _waiter) = StreamBridge::new("exec-1", StreamFormat::Events, tx);
        let mut sink = bridge.attach().expect("first attach");
        let outcome = sink
            .pump(body(vec![
                "{\"type\":\"text-delta\",\"text\":\"hi\"}\nnot json\n",
                "{\"type\":\"done\",\"continuityId\":\"c-2\"}\n",
            ]))
            .await
            .expect("pump should succeed");
        assert_eq!(outcome.continuity_id.as_deref(), Some("c-2"));
        drop(sink);
        let kinds: Vec<&str> = collect(rx)
            .await
            .iter()
            .map(|frame| match frame {
                OutboundFrame::Event(event) => event.kind(),
                OutboundFrame::Line(_) => "line",
            })
            .collect();
        assert_eq!(kinds, vec!["text-start", "text-delta", "text-end", "finish"]);
    }

    #[tokio::test]
    async fn empty_body_is_clean_completion() {
        let (tx, rx) = mpsc::channel(16);
        let (mut bridge, _waiter) = StreamBridge::new("exec-1", StreamFormat::Raw, tx);
        let mut sink = bridge.attach().expect("first attach");
        let outcome = sink.pump(body(Vec::new())).await.expect("empty body");
        assert_eq!(outcome, BridgeOutcome::default());
        drop(sink);
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn read_error_rejects_with_cause() {
        let (tx, rx) = mpsc::channel(16);
        let (mut bridge, _waiter) = StreamBridge::new("exec-1", StreamFormat::Events, tx);
        let mut sink = bridge.attach().expect("first attach");
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"text-delta\",\"text\":\"a\"}\n")),
            Err("connection reset".to_string()),
        ];
        let result = sink.pump(stream::iter(chunks)).await;
        assert_eq!(
            result,
            Err(BridgeFailure::Read("connection reset".to_string()))
        );
        drop(sink);
        let frames = collect(rx).await;
        let errors = frames
            .iter()
            .filter(|frame| matches!(frame, OutboundFrame::Event(ClientEvent::Error { .. })))
            .count();
        assert_eq!(errors, 1);
        assert!(matches!(
            frames.last(),
            Some(OutboundFrame::Event(ClientEvent::Error { .. }))
        ));
    }

    #[tokio::test]
    async fn client_stream_stays_open_until_sink_is_dropped() {
        let (tx, mut rx) = mpsc::channel(16);
        let (mut bridge, _waiter) = StreamBridge::new("exec-1", StreamFormat::Raw, tx);
        let mut sink = bridge.attach().expect("first attach");
        sink.pump(body(vec!["{\"type\":\"done\"}\n"]))
            .await
            .expect("pump should succeed");
        assert!(rx.recv().await.is_some());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        drop(sink);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn interrupted_pump_writes_one_error_frame() {
        let (tx, rx) = mpsc::channel(16);
        let (mut bridge, _waiter) = StreamBridge::new("exec-1", StreamFormat::Raw, tx);
        let mut sink = bridge.attach().expect("first attach");
        let stalled = body(vec!["{\"type\":\"text-delta\",\"text\":\"a\"}\n"])
            .chain(stream::pending());
        let interrupted =
            tokio::time::timeout(std::time::Duration::from_millis(50), sink.pump(stalled)).await;
        assert!(interrupted.is_err());
        drop(sink);

        let frames = collect(rx).await;
        assert_eq!(frames.len(), 2);
        match &frames[1] {
            OutboundFrame::Line(line) => {
                assert!(line.contains("\"type\":\"error\""));
                assert!(line.contains("callback dropped"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn attach_succeeds_once_and_fail_skips_attached_sink() {
        let (tx, mut rx) = mpsc::channel(16);
        let (mut bridge, waiter) = StreamBridge::new("exec-1", StreamFormat::Events, tx);
        let sink = bridge.attach().expect("first attach");
        assert!(bridge.attach().is_none());
        assert!(bridge.is_attached());
        assert!(bridge.fail(BridgeFailure::Dispatch("late".to_string())));
        assert!(rx.try_recv().is_err());
        drop(sink);
        assert!(matches!(waiter.wait().await, Err(BridgeFailure::Dispatch(_))));
    }

    #[tokio::test]
    async fn fail_before_attach_writes_one_error_and_closes() {
        let (tx, rx) = mpsc::channel(16);
        let (mut bridge, waiter) = StreamBridge::new("exec-1", StreamFormat::Raw, tx);
        assert!(bridge.fail(BridgeFailure::Timeout(std::time::Duration::from_secs(300))));
        assert!(!bridge.fail(BridgeFailure::Dispatch("again".to_string())));
        let frames = collect(rx).await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            OutboundFrame::Line(line) => assert!(line.contains("\"type\":\"error\"")),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(waiter.wait().await, Err(BridgeFailure::Timeout(_))));
    }
}
