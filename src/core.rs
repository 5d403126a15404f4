//! Shared request and stream plumbing.
//!
//! - **Retry State**: [`RetryState`] for tracking HTTP retry attempts
//! - **NDJSON framing**: [`NdjsonDecoder`] splits a byte stream into lines
//! - **Record mapping**: [`map_event`] turns a `/responses` record into a [`StreamEvent`]

use reqwest::StatusCode;
use serde_json::{Map, Value};

use crate::errors::{Error, Result, RetryMetadata};
use crate::types::{
    StopReason, StreamErrorPayload, StreamEvent, StreamEventKind, ToolCall, ToolCallDelta, Usage,
};
use crate::workflow::ModelId;

/// Tracks retry state across attempts.
#[derive(Default)]
pub(crate) struct RetryState {
    pub(crate) attempts: u32,
    pub(crate) last_status: Option<u16>,
    pub(crate) last_error: Option<String>,
}

impl RetryState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&mut self, attempt: u32) {
        self.attempts = attempt;
    }

    pub(crate) fn record_status(&mut self, status: StatusCode) {
        self.last_status = Some(status.as_u16());
    }

    pub(crate) fn record_error(&mut self, err: &reqwest::Error) {
        self.last_error = Some(err.to_string());
    }

    pub(crate) fn metadata(&self) -> Option<RetryMetadata> {
        if self.attempts <= 1 {
            None
        } else {
            Some(RetryMetadata {
                attempts: self.attempts,
                last_status: self.last_status,
                last_error: self.last_error.clone(),
            })
        }
    }
}

/// One complete, non-blank NDJSON line.
#[derive(Clone, Debug)]
pub(crate) struct RawEvent {
    pub(crate) data: String,
}

/// Incremental NDJSON framer over raw body bytes.
///
/// Bytes are buffered until a `\n` arrives so multi-byte UTF-8 sequences split
/// across chunks decode correctly. Blank lines are skipped.
#[derive(Debug, Default)]
pub(crate) struct NdjsonDecoder {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` already known to hold no `\n`.
    scanned: usize,
}

impl NdjsonDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut line_start = 0;
        let mut scan = self.scanned;
        while let Some(offset) = self.buffer[scan..].iter().position(|b| *b == b'\n') {
            let end = scan + offset;
            if let Some(event) = decode_line(&self.buffer[line_start..end])? {
                events.push(event);
            }
            line_start = end + 1;
            scan = line_start;
        }
        self.buffer.drain(..line_start);
        self.scanned = self.buffer.len();
        Ok(events)
    }

    /// Flushes a final line that was not newline-terminated.
    pub(crate) fn finish(&mut self) -> Result<Option<RawEvent>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Result<Option<RawEvent>> {
    let text = std::str::from_utf8(line).map_err(|err| Error::StreamProtocol {
        message: format!("invalid UTF-8 in NDJSON line: {err}"),
        raw_data: Some(truncate_for_error(&String::from_utf8_lossy(line), 200)),
    })?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(RawEvent {
        data: trimmed.to_string(),
    }))
}

/// Truncate raw data for error messages (avoid huge payloads in logs).
pub(crate) fn truncate_for_error(data: &str, max_len: usize) -> String {
    if data.len() <= max_len {
        return data.to_string();
    }
    let mut cut = max_len;
    while !data.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} bytes total)", &data[..cut], data.len())
}

fn protocol_error(message: String, raw: &str) -> Error {
    Error::StreamProtocol {
        message,
        raw_data: Some(truncate_for_error(raw, 200)),
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn parse_stream_error(obj: &Map<String, Value>) -> StreamErrorPayload {
    let source = obj
        .get("error")
        .and_then(Value::as_object)
        .unwrap_or(obj);
    StreamErrorPayload {
        status: source
            .get("status")
            .or_else(|| obj.get("status"))
            .and_then(Value::as_u64)
            .map(|v| v as u16)
            .unwrap_or(0),
        code: str_field(source, "code").map(str::to_string),
        message: str_field(source, "message")
            .unwrap_or("stream error")
            .to_string(),
    }
}

/// Maps a raw NDJSON record to a StreamEvent.
///
/// Returns:
/// - `Ok(Some(event))` - Successfully parsed event
/// - `Ok(None)` - Expected skip (keepalive events)
/// - `Err(...)` - Parse/protocol error that should be surfaced
///
/// Records:
/// - `{"type":"start","request_id":"...","model":"..."}`
/// - `{"type":"update","delta":"..."}`
/// - `{"type":"reasoning","delta":"..."}`
/// - `{"type":"completion","content":"...","usage":{...},"stop_reason":"..."}`
/// - `{"type":"tool_use_delta","tool_call_delta":{...}}`
/// - `{"type":"error","code":"...","message":"...","status":...}`
pub(crate) fn map_event(raw: RawEvent, request_id: Option<String>) -> Result<Option<StreamEvent>> {
    let payload: Value = serde_json::from_str(&raw.data)
        .map_err(|e| protocol_error(format!("failed to parse NDJSON: {e}"), &raw.data))?;

    let obj = payload
        .as_object()
        .ok_or_else(|| protocol_error("NDJSON record is not an object".to_string(), &raw.data))?;

    let record_type = str_field(obj, "type").ok_or_else(|| {
        protocol_error("NDJSON record missing 'type' field".to_string(), &raw.data)
    })?;

    if record_type == "keepalive" {
        return Ok(None);
    }

    let kind = StreamEventKind::from_event_name(record_type);
    let mut event = StreamEvent::new(kind);
    event.event = record_type.to_string();
    event.request_id = request_id;

    event.response_id = str_field(obj, "response_id")
        .or_else(|| str_field(obj, "request_id"))
        .map(str::to_string);

    event.model = str_field(obj, "model")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ModelId::from);

    event.stop_reason = str_field(obj, "stop_reason").map(StopReason::from);

    if let Some(usage_value) = obj.get("usage") {
        event.usage = serde_json::from_value::<Usage>(usage_value.clone()).ok();
    }

    match kind {
        StreamEventKind::MessageDelta | StreamEventKind::ReasoningDelta => {
            event.text_delta = str_field(obj, "delta").map(str::to_string);
        }
        StreamEventKind::MessageStop => {
            event.text_delta = str_field(obj, "content").map(str::to_string);
        }
        StreamEventKind::Error => {
            event.error = Some(parse_stream_error(obj));
        }
        _ => {}
    }

    // Malformed tool payloads fail the stream rather than silently dropping calls.
    if let Some(delta) = obj.get("tool_call_delta") {
        event.tool_call_delta = Some(
            serde_json::from_value::<ToolCallDelta>(delta.clone()).map_err(|e| {
                protocol_error(format!("failed to parse tool_call_delta: {e}"), &raw.data)
            })?,
        );
    }
    if let Some(tool_calls_value) = obj.get("tool_calls") {
        event.tool_calls = Some(
            serde_json::from_value::<Vec<ToolCall>>(tool_calls_value.clone()).map_err(|e| {
                protocol_error(format!("failed to parse tool_calls: {e}"), &raw.data)
            })?,
        );
    }
    if let Some(tool_call_value) = obj.get("tool_call") {
        let call = serde_json::from_value::<ToolCall>(tool_call_value.clone())
            .map_err(|e| protocol_error(format!("failed to parse tool_call: {e}"), &raw.data))?;
        event.tool_calls = Some(vec![call]);
    }

    event.raw = raw.data;
    event.data = Some(payload);
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &str) -> Vec<RawEvent> {
        let mut decoder = NdjsonDecoder::new();
        let mut events = decoder.push(data.as_bytes()).unwrap();
        events.extend(decoder.finish().unwrap());
        events
    }

    #[test]
    fn consumes_ndjson_lines() {
        let data = r#"{"type":"start","request_id":"req-1","model":"gpt-4"}
{"type":"update","delta":"Hello"}
{"type":"completion","content":"Hello world","stop_reason":"end_turn","usage":{"input_tokens":1,"output_tokens":2}}
"#;
        let events = decode_all(data);
        assert_eq!(events.len(), 3);

        let start = map_event(events[0].clone(), None).unwrap().unwrap();
        assert_eq!(start.kind, StreamEventKind::MessageStart);
        assert_eq!(start.response_id, Some("req-1".to_string()));
        assert_eq!(start.model.as_ref().map(|m| m.as_str()), Some("gpt-4"));

        let update = map_event(events[1].clone(), None).unwrap().unwrap();
        assert_eq!(update.kind, StreamEventKind::MessageDelta);
        assert_eq!(update.text_delta, Some("Hello".to_string()));

        let completion = map_event(events[2].clone(), None).unwrap().unwrap();
        assert_eq!(completion.kind, StreamEventKind::MessageStop);
        assert_eq!(completion.text_delta, Some("Hello world".to_string()));
        assert_eq!(completion.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(completion.usage.as_ref().unwrap().input_tokens, 1);
    }

    #[test]
    fn skips_blank_lines_and_flushes_trailing_line() {
        let events = decode_all("\n\n{\"type\":\"start\"}\n   \n{\"type\":\"update\",\"delta\":\"x\"}");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "{\"type\":\"update\",\"delta\":\"x\"}");
    }

    #[test]
    fn holds_partial_lines_across_chunks() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(b"{\"type\":\"upd").unwrap().is_empty());
        let events = decoder.push(b"ate\",\"delta\":\"\xc3").unwrap();
        assert!(events.is_empty());
        let events = decoder.push(b"\xa9\"}\n").unwrap();
        assert_eq!(events.len(), 1);
        let evt = map_event(events[0].clone(), None).unwrap().unwrap();
        assert_eq!(evt.text_delta.as_deref(), Some("é"));
    }

    #[test]
    fn splits_byte_at_a_time_and_batched_chunks() {
        let long = format!("{{\"type\":\"update\",\"delta\":\"{}\"}}", "x".repeat(4096));
        let body = format!("{long}\n\n{long}\n{{\"type\":\"start\"}}\n{{\"type\":");

        let mut decoder = NdjsonDecoder::new();
        let mut lines = Vec::new();
        for byte in body.as_bytes() {
            lines.extend(decoder.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].data, long);
        assert_eq!(lines[2].data, "{\"type\":\"start\"}");
        assert_eq!(decoder.scanned, decoder.buffer.len());

        let tail = decoder.push(b"\"ping\"}\n").unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].data, "{\"type\":\"ping\"}");
        assert!(decoder.buffer.is_empty());

        let mut batched = NdjsonDecoder::new();
        assert_eq!(batched.push(body.as_bytes()).unwrap().len(), 3);
        assert_eq!(batched.finish().unwrap().map(|e| e.data), Some("{\"type\":".to_string()));
    }

    #[test]
    fn filters_keepalive_events() {
        let events = decode_all("{\"type\":\"keepalive\"}\n");
        assert_eq!(events.len(), 1);
        let evt = map_event(events[0].clone(), None).unwrap();
        assert!(evt.is_none(), "keepalive events should be filtered out");
    }

    #[test]
    fn maps_reasoning_and_error_records() {
        let events = decode_all(
            r#"{"type":"reasoning_delta","delta":"thinking"}
{"type":"error","code":"overloaded","message":"try later","status":529}
"#,
        );
        let reasoning = map_event(events[0].clone(), None).unwrap().unwrap();
        assert_eq!(reasoning.kind, StreamEventKind::ReasoningDelta);
        assert_eq!(reasoning.text_delta.as_deref(), Some("thinking"));

        let error = map_event(events[1].clone(), None).unwrap().unwrap();
        assert_eq!(error.kind, StreamEventKind::Error);
        let payload = error.error.unwrap();
        assert_eq!(payload.status, 529);
        assert_eq!(payload.code.as_deref(), Some("overloaded"));
        assert_eq!(payload.message, "try later");
    }

    #[test]
    fn parses_tool_use_events() {
        let data = r#"{"type":"tool_use_start","tool_call_delta":{"index":0,"id":"call_1","type":"function","function":{"name":"get_weather"}}}
{"type":"tool_use_delta","tool_call_delta":{"index":0,"function":{"arguments":"{\"location\":"}}}
{"type":"tool_use_stop","tool_calls":[{"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"location\":\"NYC\"}"}}]}
"#;
        let events = decode_all(data);
        assert_eq!(events.len(), 3);

        let start = map_event(events[0].clone(), None).unwrap().unwrap();
        assert_eq!(start.kind, StreamEventKind::ToolUseStart);
        let delta = start.tool_call_delta.unwrap();
        assert_eq!(delta.index, 0);
        assert_eq!(delta.id, Some("call_1".to_string()));

        let stop = map_event(events[2].clone(), None).unwrap().unwrap();
        assert_eq!(stop.kind, StreamEventKind::ToolUseStop);
        let tool_calls = stop.tool_calls.unwrap();
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].id, "call_1");
    }

    #[test]
    fn parses_single_tool_call_field() {
        let events = decode_all(
            r#"{"type":"tool_use_stop","tool_call":{"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{}"}}}
"#,
        );
        let stop = map_event(events[0].clone(), None).unwrap().unwrap();
        assert_eq!(stop.tool_calls.unwrap()[0].id, "call_1");
    }

    #[test]
    fn returns_error_on_invalid_json_or_missing_type() {
        let raw = RawEvent {
            data: "not valid json".to_string(),
        };
        assert!(matches!(map_event(raw, None), Err(Error::StreamProtocol { .. })));

        let raw = RawEvent {
            data: r#"{"foo":"bar"}"#.to_string(),
        };
        assert!(matches!(map_event(raw, None), Err(Error::StreamProtocol { .. })));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let data = "é".repeat(150);
        let out = truncate_for_error(&data, 201);
        assert!(out.ends_with("(300 bytes total)"));
    }
}
