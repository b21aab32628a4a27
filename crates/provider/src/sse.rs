use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Response;

#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Split a server-sent-event byte stream into frames. Frames are separated
/// by a blank line; `data:` lines within a frame are joined with newlines.
/// The `[DONE]` marker and comment-only frames are dropped.
pub fn parse_sse_stream(response: Response) -> BoxStream<'static, Result<SseFrame>> {
    let bytes = response.bytes_stream();

    let stream = futures::stream::unfold((bytes, String::new()), |(mut bytes, mut buffer)| async {
        loop {
            if let Some(split) = find_frame_boundary(&buffer) {
                let raw = buffer[..split.frame_end].to_string();
                buffer.drain(..split.next_start);
                if let Some(frame) = parse_frame(&raw) {
                    return Some((Ok(frame), (bytes, buffer)));
                }
                continue;
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Some(Err(e)) => return Some((Err(e.into()), (bytes, buffer))),
                None => return None,
            }
        }
    });

    Box::pin(stream)
}

struct FrameBoundary {
    frame_end: usize,
    next_start: usize,
}

fn find_frame_boundary(buffer: &str) -> Option<FrameBoundary> {
    // Providers vary between \n\n and \r\n\r\n separators.
    let lf = buffer.find("\n\n");
    let crlf = buffer.find("\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some(FrameBoundary {
            frame_end: b,
            next_start: b + 4,
        }),
        (Some(a), _) => Some(FrameBoundary {
            frame_end: a,
            next_start: a + 2,
        }),
        (None, Some(b)) => Some(FrameBoundary {
            frame_end: b,
            next_start: b + 4,
        }),
        (None, None) => None,
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    if data == "[DONE]" {
        return None;
    }

    Some(SseFrame { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_multiline_data() {
        let frame = parse_frame("event: message_start\ndata: {\"a\":1,\ndata: \"b\":2}").unwrap();
        assert_eq!(frame.event.as_deref(), Some("message_start"));
        assert_eq!(frame.data, "{\"a\":1,\n\"b\":2}");
    }

    #[test]
    fn done_marker_and_comments_yield_nothing() {
        assert!(parse_frame("data: [DONE]").is_none());
        assert!(parse_frame(": keep-alive").is_none());
    }

    #[test]
    fn boundary_handles_crlf() {
        let b = find_frame_boundary("data: x\r\n\r\ndata: y").unwrap();
        assert_eq!(b.frame_end, 7);
        assert_eq!(b.next_start, 11);

        let b = find_frame_boundary("data: x\n\nrest").unwrap();
        assert_eq!(b.frame_end, 7);
        assert_eq!(b.next_start, 9);
    }
}
