use serde_json::Value;

use crate::protocol::{AgentEvent, ClientEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    Text,
    Reasoning,
}

#[derive(Debug)]
struct OpenSpan {
    kind: SpanKind,
    id: String,
}

/// Turns agent records into client events.
///
/// Text and reasoning deltas are grouped into spans; a span is closed before
/// any tool event so spans and tool calls never interleave.
#[derive(Debug, Default)]
pub struct EventTranslator {
    open: Option<OpenSpan>,
    next_span: u64,
    finished: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: AgentEvent) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        match event {
            AgentEvent::TextDelta { text } => self.delta(SpanKind::Text, text, &mut out),
            AgentEvent::ReasoningDelta { text } => {
                self.delta(SpanKind::Reasoning, text, &mut out)
            }
            AgentEvent::ToolStart {
                tool_call_id,
                tool_name,
                input,
            } => {
                self.close_span(&mut out);
                out.push(ClientEvent::ToolInputAvailable {
                    tool_call_id,
                    tool_name,
                    input,
                });
            }
            AgentEvent::ToolResult {
                tool_call_id,
                output,
                is_error,
            } => {
                self.close_span(&mut out);
                if is_error {
                    out.push(ClientEvent::ToolOutputError {
                        tool_call_id,
                        error_text: error_text(output),
                    });
                } else {
                    out.push(ClientEvent::ToolOutputAvailable {
                        tool_call_id,
                        output,
                    });
                }
            }
            AgentEvent::Error { message } => {
                self.close_span(&mut out);
                out.push(ClientEvent::error(message));
            }
            AgentEvent::SessionInit { .. } | AgentEvent::Done { .. } | AgentEvent::Unknown => {}
        }
        out
    }

    /// Closes any open span and emits the terminal `finish` marker once.
    pub fn finish(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.close_span(&mut out);
        out.push(ClientEvent::Finish);
        self.finished = true;
        out
    }

    fn delta(&mut self, kind: SpanKind, text: String, out: &mut Vec<ClientEvent>) {
        if text.is_empty() {
            return;
        }
        let current = self
            .open
            .as_ref()
            .filter(|span| span.kind == kind)
            .map(|span| span.id.clone());
        let id = match current {
            Some(id) => id,
            None => {
                self.close_span(out);
                self.open_span(kind, out)
            }
        };
        out.push(match kind {
            SpanKind::Text => ClientEvent::TextDelta { id, delta: text },
            SpanKind::Reasoning => ClientEvent::ReasoningDelta { id, delta: text },
        });
    }

    fn open_span(&mut self, kind: SpanKind, out: &mut Vec<ClientEvent>) -> String {
        self.next_span += 1;
        let id = match kind {
            SpanKind::Text => format!("text-{}", self.next_span),
            SpanKind::Reasoning => format!("reasoning-{}", self.next_span),
        };
        out.push(match kind {
            SpanKind::Text => ClientEvent::TextStart { id: id.clone() },
            SpanKind::Reasoning => ClientEvent::ReasoningStart { id: id.clone() },
        });
        self.open = Some(OpenSpan {
            kind,
            id: id.clone(),
        });
        id
    }

    fn close_span(&mut self, out: &mut Vec<ClientEvent>) {
        if let Some(span) = self.open.take() {
            out.push(match span.kind {
                SpanKind::Text => ClientEvent::TextEnd { id: span.id },
                SpanKind::Reasoning => ClientEvent::ReasoningEnd { id: span.id },
            });
        }
    }
}

fn error_text(output: Value) -> String {
    match output {
        Value::String(text) => text,
        Value::Null => "tool failed".to_string(),
        other => other.to_string(),
    }
}
