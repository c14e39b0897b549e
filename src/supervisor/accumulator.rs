//! Bounded buffer for worker output.

/// Byte ceiling for each accumulated stream.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Appended once when stdout crosses the ceiling.
pub const TRUNCATION_MARKER: &str = "\n...[Output Truncated]";

/// Appends output chunks up to a byte ceiling.
///
/// Once a chunk would reach the ceiling the buffer is frozen: an optional
/// marker is appended exactly once and every later chunk is dropped.
#[derive(Debug, Clone)]
pub struct OutputAccumulator {
    buf: String,
    cap: usize,
    marker: Option<&'static str>,
    truncated: bool,
}

impl OutputAccumulator {
    pub fn new(cap: usize, marker: Option<&'static str>) -> Self {
        Self {
            buf: String::new(),
            cap,
            marker,
            truncated: false,
        }
    }

    /// Accumulator for user-visible output (marker on overflow).
    pub fn stdout() -> Self {
        Self::new(MAX_OUTPUT_BYTES, Some(TRUNCATION_MARKER))
    }

    /// Accumulator for diagnostics (silent overflow).
    pub fn stderr() -> Self {
        Self::new(MAX_OUTPUT_BYTES, None)
    }

    pub fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        if self.buf.len() + chunk.len() < self.cap {
            self.buf.push_str(chunk);
            return;
        }
        self.truncated = true;
        if let Some(marker) = self.marker {
            self.buf.push_str(marker);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.truncated = false;
    }
}
