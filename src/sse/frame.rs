//! `text/event-stream` framing.
//!
//! Every frame is a block of `field: value` lines closed by a blank line. A
//! body spanning several lines becomes several `data:` lines, which a
//! conforming parser joins back with `\n`. CR and CRLF line breaks inside a
//! body therefore arrive as LF.

use bytes::{BufMut, Bytes, BytesMut};

use crate::event::Event;

/// Comment frame that keeps intermediaries from timing the response out
pub const HEARTBEAT: &[u8] = b": ping\n\n";

pub fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT)
}

/// Frame a published event. Non-UTF-8 bytes are replaced, SSE being a text
/// protocol.
pub fn encode_event(event: &Event) -> Bytes {
    let data = String::from_utf8_lossy(&event.body);
    encode_frame(None, event.event_type.as_deref(), &data)
}

/// Frame arbitrary data with an optional `id:` and `event:` line
pub fn encode_frame(id: Option<&str>, event_type: Option<&str>, data: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 32);

    if let Some(id) = id {
        put_field(&mut buf, "id", single_line(id));
    }
    if let Some(event_type) = event_type {
        put_field(&mut buf, "event", single_line(event_type));
    }
    for line in split_lines(data) {
        put_field(&mut buf, "data", line);
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

fn put_field(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_u8(b'\n');
}

/// Field values other than data may not contain line breaks; keep the
/// first line only.
fn single_line(value: &str) -> &str {
    value.split(['\r', '\n']).next().unwrap_or_default()
}

/// Split on CRLF, LF or lone CR. An empty body still yields one empty line,
/// so the frame carries an (empty) `data:` field.
fn split_lines(data: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut rest = data;
    while let Some(pos) = rest.find(['\r', '\n']) {
        lines.push(&rest[..pos]);
        let skip = if rest[pos..].starts_with("\r\n") { 2 } else { 1 };
        rest = &rest[pos + skip..];
    }
    lines.push(rest);
    lines
}


#[cfg(test)]
mod tests {
    use super::parser::parse;
    use super::*;
    use crate::event::{DeliveryMode, EventBuilder, EventDraft};

    fn text(bytes: &Bytes) -> &str {
        std::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_plain_event_framing() {
        let event = EventDraft::new("prices", r#"{"price":100}"#, DeliveryMode::Reliable).stamp(1);
        assert_eq!(text(&encode_event(&event)), "data: {\"price\":100}\n\n");
    }

    #[test]
    fn test_typed_event_framing() {
        let event = EventBuilder::new("prices")
            .body(r#"{"price":100}"#)
            .event_type("tick")
            .build()
            .stamp(1);
        assert_eq!(
            text(&encode_event(&event)),
            "event: tick\ndata: {\"price\":100}\n\n"
        );
    }

    #[test]
    fn test_multiline_body_uses_several_data_lines() {
        let frame = encode_frame(None, None, "{\n  \"a\": 1\n}");
        assert_eq!(text(&frame), "data: {\ndata:   \"a\": 1\ndata: }\n\n");
    }

    #[test]
    fn test_id_and_event_type_cannot_inject_lines() {
        let frame = encode_frame(Some("abc\ndata: evil"), Some("tick\r\nid: x"), "{}");
        assert_eq!(text(&frame), "id: abc\nevent: tick\ndata: {}\n\n");
    }

    #[test]
    fn test_heartbeat_is_a_comment() {
        assert_eq!(HEARTBEAT, b": ping\n\n");
        assert!(parse(text(&heartbeat())).is_empty());
    }

    #[test]
    fn test_json_bodies_round_trip_through_parser() {
        let bodies = [
            r#"{"price":100}"#,
            r#"{"nested":{"list":[1,2,3]},"s":"with: colon"}"#,
            "{\n  \"pretty\": true,\n  \"n\": null\n}",
            r#"{"unicode":"héllo ✓","empty":""}"#,
            r#"  {"leading":"space"}"#,
            "[]",
        ];

        for body in bodies {
            let event = EventDraft::new("t", body, DeliveryMode::Reliable).stamp(1);
            let parsed = parse(text(&encode_event(&event)));
            assert_eq!(parsed.len(), 1, "body: {}", body);
            assert_eq!(parsed[0].data.as_bytes(), body.as_bytes());
            assert_eq!(parsed[0].event_type, "message");
        }
    }

    #[test]
    fn test_id_line_sets_last_event_id() {
        let mut stream = String::new();
        stream.push_str(text(&encode_frame(Some("token-1"), Some("connected"), "{}")));
        stream.push_str(text(&heartbeat()));
        stream.push_str(text(&encode_frame(None, None, r#"{"x":1}"#)));

        let parsed = parse(&stream);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].event_type, "connected");
        // Persists to later events that carry no id
        assert_eq!(parsed[1].last_event_id, "token-1");
    }
}
