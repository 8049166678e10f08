/// Line terminator used when splitting helper output and when writing to a
/// helper's stdin.
#[cfg(windows)]
pub const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_SEPARATOR: &str = "\n";

/// Turns arbitrarily chunked bytes into complete lines.
///
/// Chunks may cut a line (or a multi-byte character, or a two-byte
/// separator) anywhere; the unterminated tail is held back until the next
/// chunk or [`LineSplitter::finish`]. Lines are decoded lossily, so invalid
/// UTF-8 from a helper never stops the stream.
#[derive(Debug, Clone)]
pub struct LineSplitter {
    separator: Vec<u8>,
    pending: Vec<u8>,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::with_separator(LINE_SEPARATOR)
    }

    /// An empty separator falls back to `"\n"`.
    pub fn with_separator(separator: &str) -> Self {
        let separator = if separator.is_empty() {
            b"\n".to_vec()
        } else {
            separator.as_bytes().to_vec()
        };
        Self {
            separator,
            pending: Vec::new(),
        }
    }

    /// Returns every line completed by `chunk`, in arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // A separator may straddle the previous tail and this chunk.
        let resume = self.pending.len().saturating_sub(self.separator.len() - 1);
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut search_from = resume;
        while let Some(pos) = find(&self.pending[search_from..], &self.separator) {
            let end = search_from + pos;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + self.separator.len();
            search_from = start;
        }
        self.pending.drain(..start);
        lines
    }

    /// Emits the unterminated tail, if any, and resets the splitter.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}
