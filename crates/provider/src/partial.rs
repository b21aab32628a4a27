use serde::de::DeserializeOwned;

/// Parse the leading JSON value out of a possibly truncated model response.
///
/// Streamed structured output arrives as an ever-growing prefix of one JSON
/// document. This repairs the prefix by cutting it back to the last point
/// where a complete value ended and closing the containers that were still
/// open there, so callers can observe partial documents as typed snapshots.
pub fn parse_partial_json<T: DeserializeOwned>(text: &str) -> Option<T> {
    let start = text.find(['{', '['])?;
    let candidate = &text[start..];

    if let Ok(value) = serde_json::from_str::<T>(candidate) {
        return Some(value);
    }

    let repaired = repair_prefix(candidate)?;
    serde_json::from_str(&repaired).ok()
}

#[derive(Clone, Copy, PartialEq)]
enum Frame {
    Object { value_pending: bool },
    Array,
}

/// Snapshots are only taken at shallow depth so a cut never lands inside
/// a collection element: a streamed list item becomes visible all at
/// once, never with half its fields.
const MAX_SNAPSHOT_DEPTH: usize = 2;

/// Cut `s` back to the last complete shallow boundary and close the
/// frames still open there.
fn repair_prefix(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // (cut index, open frames at that index)
    let mut snapshot: Option<(usize, Vec<Frame>)> = None;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;

        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                // A closing quote ends a value only in an array slot or an
                // object slot whose key has already been consumed.
                let is_value = match stack.last() {
                    Some(Frame::Array) => true,
                    Some(Frame::Object { value_pending }) => *value_pending,
                    None => true,
                };
                if is_value {
                    if let Some(Frame::Object { value_pending }) = stack.last_mut() {
                        *value_pending = false;
                    }
                    if stack.len() <= MAX_SNAPSHOT_DEPTH {
                        snapshot = Some((i + 1, stack.clone()));
                    }
                }
            }
            i += 1;
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => {
                stack.push(Frame::Object {
                    value_pending: false,
                });
                if stack.len() <= MAX_SNAPSHOT_DEPTH {
                    // An empty container is itself a valid cut.
                    snapshot = Some((i + 1, stack.clone()));
                }
            }
            '[' => {
                stack.push(Frame::Array);
                if stack.len() <= MAX_SNAPSHOT_DEPTH {
                    snapshot = Some((i + 1, stack.clone()));
                }
            }
            ':' => {
                if let Some(Frame::Object { value_pending }) = stack.last_mut() {
                    *value_pending = true;
                }
            }
            ',' => {
                // The value before the comma is complete.
                if let Some(Frame::Object { value_pending }) = stack.last_mut() {
                    *value_pending = false;
                }
                if stack.len() <= MAX_SNAPSHOT_DEPTH {
                    snapshot = Some((i, stack.clone()));
                }
            }
            '}' | ']' => {
                stack.pop();
                if let Some(Frame::Object { value_pending }) = stack.last_mut() {
                    *value_pending = false;
                }
                if stack.len() <= MAX_SNAPSHOT_DEPTH {
                    snapshot = Some((i + 1, stack.clone()));
                }
            }
            _ => {}
        }
        i += 1;
    }

    let (cut, open) = snapshot?;
    let mut repaired = s[..cut].to_string();
    for frame in open.iter().rev() {
        repaired.push(match frame {
            Frame::Object { .. } => '}',
            Frame::Array => ']',
        });
    }
    Some(repaired)
}
