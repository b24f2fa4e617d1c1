/// Longest line the decoder buffers before dropping it.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental newline-delimited decoder.
///
/// Bytes are buffered rather than text so a multi-byte UTF-8 sequence split
/// across two chunks is reassembled before the line is decoded. A line
/// longer than the cap is discarded up to its terminating newline.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    discarding: bool,
    dropped: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            discarding: false,
            dropped: 0,
        }
    }

    /// Appends a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(offset) = rest.iter().position(|b| *b == b'\n') {
            let head = &rest[..offset];
            if self.discarding {
                self.discarding = false;
            } else if self.buffer.len() + head.len() > self.max_line {
                self.drop_line(self.buffer.len() + head.len());
            } else {
                self.buffer.extend_from_slice(head);
                if let Some(line) = decode_line(&self.buffer) {
                    lines.push(line);
                }
            }
            self.buffer.clear();
            rest = &rest[offset + 1..];
        }
        if !self.discarding {
            if self.buffer.len() + rest.len() > self.max_line {
                self.drop_line(self.buffer.len() + rest.len());
                self.buffer.clear();
                self.discarding = true;
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }
        lines
    }

    /// Flushes the trailing fragment left when the stream ended without a
    /// final newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        decode_line(&rest)
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Lines discarded for exceeding the cap.
    pub fn dropped_lines(&self) -> usize {
        self.dropped
    }

    fn drop_line(&mut self, seen_bytes: usize) {
        self.dropped += 1;
        tracing::warn!(
            seen_bytes,
            max_line_bytes = self.max_line,
            "dropping oversized agent output line"
        );
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    if line.trim().is_empty() {
        return None;
    }
    Some(line.into_owned())
}
