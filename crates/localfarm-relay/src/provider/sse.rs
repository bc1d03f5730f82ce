use serde_json::Value;

/// One decoded event of an OpenAI-style chat-completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A non-empty piece of assistant text.
    Delta(String),
    /// The `[DONE]` sentinel.
    Done,
    /// An in-band error object sent by the provider.
    Error(String),
    /// A `data:` payload that is not valid JSON.
    Malformed(String),
}

/// Incremental parser for SSE byte streams.
///
/// Bytes are buffered until a blank line closes a frame, so multi-byte
/// characters split across network chunks are decoded intact.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed arbitrary bytes and drain every complete event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();

        while let Some(split) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..split + 2).collect();
            let frame = String::from_utf8_lossy(&frame[..split]);
            if let Some(event) = extract_data_payload(&frame).and_then(|p| map_payload(&p)) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing frame the body ended without terminating.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let frame = String::from_utf8_lossy(&rest);
        extract_data_payload(&frame).and_then(|p| map_payload(&p))
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn map_payload(payload: &str) -> Option<SseEvent> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return Some(SseEvent::Malformed(e.to_string())),
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        return Some(SseEvent::Error(message));
    }

    value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(|content| SseEvent::Delta(content.to_owned()))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
