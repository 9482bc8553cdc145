use std::collections::VecDeque;

use serde_json::Value;

use crate::error::StoryError;

/// How a streamed chapter body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `text/event-stream`: `data:` lines.
    EventStream,
    /// Newline-delimited or back-to-back concatenated JSON records.
    Ndjson,
    /// Plain text or HTML; the whole body is one fragment.
    Plain,
}

impl Transport {
    pub fn from_content_type(content_type: &str) -> Self {
        let lower = content_type.to_ascii_lowercase();
        if lower.contains("text/event-stream") {
            Self::EventStream
        } else if lower.starts_with("text/plain") || lower.starts_with("text/html") {
            Self::Plain
        } else {
            Self::Ndjson
        }
    }
}

/// Content carried by one parsed frame, if any.
///
/// `{"type":"item","content":…}` yields its content and a bare JSON string
/// yields itself. Everything else is a control or metadata frame.
pub fn fragment_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => {
            if obj.get("type").and_then(Value::as_str) != Some("item") {
                return None;
            }
            obj.get("content").and_then(Value::as_str).map(str::to_owned)
        }
        _ => None,
    }
}

/// Incremental demultiplexer from raw body bytes to content fragments.
///
/// The output does not depend on how the input bytes were split across
/// `feed` calls. Malformed input never panics; it is retried, emitted raw or
/// dropped at end of stream.
#[derive(Debug)]
pub struct FrameDecoder {
    transport: Transport,
    utf8: Vec<u8>,
    buffer: String,
    pending: String,
}

impl FrameDecoder {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            utf8: Vec::new(),
            buffer: String::new(),
            pending: String::new(),
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.decode_utf8(bytes);
        let mut out = Vec::new();
        match self.transport {
            Transport::EventStream => self.drain_event_lines(&mut out),
            Transport::Ndjson => self.drain_records(false, &mut out),
            Transport::Plain => {}
        }
        out
    }

    pub fn finish(&mut self) -> Vec<String> {
        if !self.utf8.is_empty() {
            let rest = std::mem::take(&mut self.utf8);
            self.buffer.push_str(&String::from_utf8_lossy(&rest));
        }

        let mut out = Vec::new();
        match self.transport {
            Transport::EventStream => {
                self.drain_event_lines(&mut out);
                let tail = std::mem::take(&mut self.buffer);
                event_line(&tail, &mut out);
            }
            Transport::Ndjson => {
                self.drain_records(true, &mut out);
                if !self.pending.trim().is_empty() {
                    tracing::debug!(
                        bytes = self.pending.len(),
                        "discarding unparseable trailing stream record"
                    );
                }
                self.pending.clear();
            }
            Transport::Plain => {
                let body = std::mem::take(&mut self.buffer);
                if !body.is_empty() {
                    out.push(body);
                }
            }
        }
        out
    }

    fn decode_utf8(&mut self, bytes: &[u8]) {
        self.utf8.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.utf8) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.utf8.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.utf8[..valid]) {
                        self.buffer.push_str(text);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.utf8.drain(..valid + bad);
                        }
                        None => {
                            self.utf8.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_event_lines(&mut self, out: &mut Vec<String>) {
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return;
        };
        let complete: String = self.buffer.drain(..=last_newline).collect();
        for line in complete.split('\n') {
            event_line(line, out);
        }
    }

    /// Cuts complete records off the front of the buffer.
    ///
    /// A record ends at a newline, or at a `}` that is followed (after
    /// optional spaces) by `{` outside a JSON string. When the characters
    /// that decide a `}` boundary have not arrived yet, scanning stops.
    fn drain_records(&mut self, at_end: bool, out: &mut Vec<String>) {
        let mut start = 0;
        loop {
            match next_record_end(&self.buffer[start..]) {
                RecordEnd::At { end, resume } => {
                    let candidate = self.buffer[start..start + end].to_owned();
                    self.push_candidate(&candidate, out);
                    start += resume;
                }
                RecordEnd::NeedMore => break,
            }
        }
        self.buffer.drain(..start);

        if at_end {
            let tail = std::mem::take(&mut self.buffer);
            self.push_candidate(&tail, out);
        }
    }

    fn push_candidate(&mut self, raw: &str, out: &mut Vec<String>) {
        let candidate = raw.trim();
        if candidate.is_empty() || candidate == "[DONE]" {
            return;
        }

        if self.pending.is_empty() {
            match serde_json::from_str::<Value>(candidate) {
                Ok(value) => out.extend(fragment_from_value(&value)),
                Err(_) => self.pending.push_str(candidate),
            }
            return;
        }

        let joined = format!("{}\n{}", self.pending, candidate);
        if let Ok(value) = serde_json::from_str::<Value>(&joined) {
            self.pending.clear();
            out.extend(fragment_from_value(&value));
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            tracing::debug!(
                bytes = self.pending.len(),
                "dropping stream record that never completed"
            );
            self.pending.clear();
            out.extend(fragment_from_value(&value));
            return;
        }
        self.pending = joined;
    }
}

enum RecordEnd {
    /// Record is `text[..end]`; the next one starts at `text[resume..]`.
    At { end: usize, resume: usize },
    NeedMore,
}

fn next_record_end(text: &str) -> RecordEnd {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\n' {
            return RecordEnd::At { end: i, resume: i + 1 };
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if b == b'}' {
            let mut j = i + 1;
            while j < bytes.len() && matches!(bytes[j], b' ' | b'\t' | b'\r') {
                j += 1;
            }
            if j == bytes.len() {
                return RecordEnd::NeedMore;
            }
            if bytes[j] == b'{' {
                return RecordEnd::At { end: i + 1, resume: j };
            }
        }
        i += 1;
    }
    RecordEnd::NeedMore
}

fn event_line(line: &str, out: &mut Vec<String>) {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(data) = line.strip_prefix("data:") else {
        return;
    };
    let data = data.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => out.extend(fragment_from_value(&value)),
        Err(_) => out.push(format!("{data}\n")),
    }
}

/// Async cursor over a streamed chapter response.
///
/// Dropping the stream drops the response, which closes the connection.
pub struct FragmentStream {
    response: Option<reqwest::Response>,
    decoder: FrameDecoder,
    queue: VecDeque<String>,
    fragments: usize,
}

impl FragmentStream {
    pub fn new(response: reqwest::Response) -> Self {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let transport = Transport::from_content_type(content_type);
        tracing::debug!(?transport, content_type, "opened chapter stream");
        Self {
            response: Some(response),
            decoder: FrameDecoder::new(transport),
            queue: VecDeque::new(),
            fragments: 0,
        }
    }

    pub fn transport(&self) -> Transport {
        self.decoder.transport()
    }

    pub async fn next(&mut self) -> Option<Result<String, StoryError>> {
        loop {
            if let Some(fragment) = self.queue.pop_front() {
                self.fragments += 1;
                return Some(Ok(fragment));
            }
            let response = self.response.as_mut()?;
            match response.chunk().await {
                Ok(Some(bytes)) => self.queue.extend(self.decoder.feed(&bytes)),
                Ok(None) => {
                    self.response = None;
                    self.queue.extend(self.decoder.finish());
                    tracing::debug!(
                        fragments = self.fragments + self.queue.len(),
                        "chapter stream ended"
                    );
                }
                Err(err) => {
                    self.response = None;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(transport: Transport, chunks: &[&[u8]]) -> Vec<String> {
        let mut decoder = FrameDecoder::new(transport);
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.feed(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    fn decode_split_everywhere(transport: Transport, input: &str) {
        let whole = decode_all(transport, &[input.as_bytes()]);
        let bytes = input.as_bytes();
        for cut in 0..=bytes.len() {
            let split = decode_all(transport, &[&bytes[..cut], &bytes[cut..]]);
            assert_eq!(split, whole, "cut at byte {cut}");
        }
        let single: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(transport, &single), whole);
    }

    #[test]
    fn content_type_selects_transport() {
        assert_eq!(
            Transport::from_content_type("text/event-stream; charset=utf-8"),
            Transport::EventStream
        );
        assert_eq!(Transport::from_content_type("application/x-ndjson"), Transport::Ndjson);
        assert_eq!(Transport::from_content_type("application/json"), Transport::Ndjson);
        assert_eq!(Transport::from_content_type(""), Transport::Ndjson);
        assert_eq!(Transport::from_content_type("Text/Plain"), Transport::Plain);
    }

    #[test]
    fn ndjson_item_lines_become_fragments() {
        let input = "{\"type\":\"item\",\"content\":\"Once \"}\n{\"type\":\"item\",\"content\":\"upon a time.\"}\n";
        assert_eq!(
            decode_all(Transport::Ndjson, &[input.as_bytes()]),
            vec!["Once ".to_owned(), "upon a time.".to_owned()]
        );
    }

    #[test]
    fn ndjson_skips_control_frames_and_done() {
        let input = "{\"type\":\"begin\"}\n\"bare\"\n[DONE]\n{\"type\":\"item\",\"content\":7}\n{\"type\":\"end\"}";
        assert_eq!(decode_all(Transport::Ndjson, &[input.as_bytes()]), vec!["bare".to_owned()]);
    }

    #[test]
    fn ndjson_splits_concatenated_objects() {
        let input = "{\"type\":\"item\",\"content\":\"a\"}  {\"type\":\"item\",\"content\":\"b\"}{\"type\":\"item\",\"content\":\"c\"}";
        assert_eq!(decode_all(Transport::Ndjson, &[input.as_bytes()]), vec!["a", "b", "c"]);
    }

    #[test]
    fn ndjson_braces_inside_strings_are_not_boundaries() {
        let input = "{\"type\":\"item\",\"content\":\"x}{y\"}\n";
        assert_eq!(decode_all(Transport::Ndjson, &[input.as_bytes()]), vec!["x}{y"]);
    }

    #[test]
    fn ndjson_multiline_record_is_joined() {
        let input = "{\n  \"type\": \"item\",\n  \"content\": \"pretty\"\n}\n{\"type\":\"item\",\"content\":\"next\"}\n";
        assert_eq!(decode_all(Transport::Ndjson, &[input.as_bytes()]), vec!["pretty", "next"]);
    }

    #[test]
    fn ndjson_garbage_is_dropped_when_a_good_record_follows() {
        let input = "not json at all\n{\"type\":\"item\",\"content\":\"ok\"}\ntrailing junk";
        assert_eq!(decode_all(Transport::Ndjson, &[input.as_bytes()]), vec!["ok"]);
    }

    #[test]
    fn ndjson_parses_tail_without_newline() {
        let mut decoder = FrameDecoder::new(Transport::Ndjson);
        assert!(decoder.feed(br#"{"type":"item","content":"tail"}"#).is_empty());
        assert_eq!(decoder.finish(), vec!["tail"]);
    }

    #[test]
    fn ndjson_is_split_invariant() {
        decode_split_everywhere(
            Transport::Ndjson,
            "{\"type\":\"item\",\"content\":\"Once \"}\r\n{\"type\":\"item\",\"content\":\"caf\u{e9} }{ \"} {\"type\":\"item\",\"content\":\"end\"}\n{\"type\":\"end\"}",
        );
        decode_split_everywhere(Transport::Ndjson, "{\n\"type\":\"item\",\n\"content\":\"a\"\n}\nbad\n\"s\"");
    }

    #[test]
    fn event_stream_extracts_data_lines() {
        let input = ": comment\nevent: token\ndata: {\"type\":\"item\",\"content\":\"Hi \"}\r\n\ndata:\"there\"\ndata: {\"type\":\"meta\"}\ndata: raw words\ndata: [DONE]\n";
        assert_eq!(
            decode_all(Transport::EventStream, &[input.as_bytes()]),
            vec!["Hi ", "there", "raw words\n"]
        );
    }

    #[test]
    fn event_stream_is_split_invariant() {
        decode_split_everywhere(
            Transport::EventStream,
            "data: {\"type\":\"item\",\"content\":\"\u{1f409} dragon\"}\n\ndata: plain\ndata: \"last\"",
        );
    }

    #[test]
    fn utf8_split_across_reads_is_reassembled() {
        let text = "{\"type\":\"item\",\"content\":\"na\u{ef}ve \u{2014} \u{1f30a}\"}\n";
        let bytes = text.as_bytes();
        let mut decoder = FrameDecoder::new(Transport::Ndjson);
        let mut out = Vec::new();
        for byte in bytes {
            out.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        out.extend(decoder.finish());
        assert_eq!(out, vec!["na\u{ef}ve \u{2014} \u{1f30a}"]);
    }

    #[test]
    fn invalid_utf8_becomes_replacement_character() {
        let out = decode_all(Transport::Plain, &[b"ab\xffcd", b"\xe2\x82"]);
        assert_eq!(out, vec!["ab\u{fffd}cd\u{fffd}"]);
    }

    #[test]
    fn plain_transport_emits_whole_body_once() {
        assert_eq!(
            decode_all(Transport::Plain, &[b"Once upon ", b"a time."]),
            vec!["Once upon a time."]
        );
        assert!(decode_all(Transport::Plain, &[]).is_empty());
    }

    #[test]
    fn malformed_input_never_panics() {
        let inputs: [&[u8]; 6] = [b"}}}{{{", b"\"unterminated", b"data:", b"{\"a\":}\n}{", b"\\\\\"}{", b"\xf0\x9f"];
        for transport in [Transport::Ndjson, Transport::EventStream, Transport::Plain] {
            for input in inputs {
                let _ = decode_all(transport, &[input, input]);
            }
        }
    }
}
