//! Detection of the worker's interactive confirmation prompt.

/// Token the worker prints when it wants a yes/no answer on stdin.
pub const APPROVAL_MARKER: &str = "[y/N]";

/// Watches a stdout stream for [`APPROVAL_MARKER`] and fires once per task.
///
/// Only the last `marker.len() - 1` bytes of the stream are remembered, which
/// is enough to catch a marker split across chunk boundaries without keeping
/// the whole stream around.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    marker: &'static str,
    tail: String,
    sent: bool,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(APPROVAL_MARKER)
    }
}

impl ApprovalGate {
    pub fn new(marker: &'static str) -> Self {
        Self {
            marker,
            tail: String::new(),
            sent: false,
        }
    }

    /// Feed the next chunk. Returns `true` exactly once, on the chunk that
    /// completes the first occurrence of the marker.
    pub fn observe(&mut self, chunk: &str) -> bool {
        if self.sent {
            return false;
        }
        let mut window = std::mem::take(&mut self.tail);
        window.push_str(chunk);
        if window.contains(self.marker) {
            self.sent = true;
            return true;
        }
        self.tail = suffix(&window, self.marker.len().saturating_sub(1)).to_string();
        false
    }

    /// Whether the approval request has gone out for this task.
    pub fn sent(&self) -> bool {
        self.sent
    }

    /// Forget the scan window for a fresh process. The sent flag never reverts.
    pub fn rewire(&mut self) {
        self.tail.clear();
    }
}

/// At most `max` trailing bytes of `s`, cut on a char boundary.
fn suffix(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_for_repeated_markers() {
        let mut gate = ApprovalGate::default();
        assert!(!gate.observe("Running tool...\n"));
        assert!(gate.observe("Allow write_file? [y/N] "));
        assert!(!gate.observe("Allow shell? [y/N] "));
        assert!(gate.sent());
    }

    #[test]
    fn detects_marker_split_across_chunks() {
        let mut gate = ApprovalGate::default();
        let fired: Vec<bool> = ["Allow? [", "y", "/", "N", "] ", "[y/N]"]
            .iter()
            .map(|c| gate.observe(c))
            .collect();
        assert_eq!(fired, vec![false, false, false, false, true, false]);
    }

    #[test]
    fn ignores_near_misses() {
        let mut gate = ApprovalGate::default();
        assert!(!gate.observe("[y/n]"));
        assert!(!gate.observe("[Y/N"));
        assert!(!gate.observe(" y/N]"));
        assert!(!gate.sent());
    }

    #[test]
    fn tail_handles_multibyte_text() {
        let mut gate = ApprovalGate::default();
        assert!(!gate.observe("Überprüfung läuft… ["));
        assert!(gate.observe("y/N]"));
    }

    #[test]
    fn rewire_keeps_sent_flag() {
        let mut gate = ApprovalGate::default();
        gate.observe("[y/N]");
        gate.rewire();
        assert!(!gate.observe("[y/N]"));
        assert!(gate.sent());
    }
}
