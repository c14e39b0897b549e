//! Shaping of raw worker output for delivery over chat.

use super::approval::APPROVAL_MARKER;

/// Largest message part handed to the transport, in characters.
pub const MAX_PART_CHARS: usize = 4000;

/// Bytes of stderr carried by a failure report.
pub const MAX_ERROR_BYTES: usize = 500;

const NOISE_PREFIXES: &[&str] = &["YOLO mode is enabled", "Loaded cached credentials"];

/// Blank banner lines, credential notices and prompt lines, then trim.
///
/// Blanked lines keep their place and any `\r` terminator, so the shape of
/// the remaining output is untouched.
pub fn clean_output(raw: &str) -> String {
    raw.split('\n')
        .map(|line| {
            let body = line.strip_suffix('\r').unwrap_or(line);
            if is_noise(body) {
                &line[body.len()..]
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn is_noise(line: &str) -> bool {
    line.contains(APPROVAL_MARKER) || NOISE_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Split text into ordered parts of at most `max_chars` characters,
/// skipping parts that are pure whitespace.
pub fn split_parts(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect::<String>())
        .filter(|part| !part.trim().is_empty())
        .collect()
}

/// First `max` bytes of `s`, cut on a char boundary.
pub fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Escape text for HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Incremental UTF-8 decoder for byte streams read in arbitrary pieces.
///
/// Incomplete trailing sequences are held back until the next read; invalid
/// bytes are replaced.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
