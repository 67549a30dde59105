//! Line framing for server-sent event bodies.

/// Splits an SSE byte stream into `data:` payloads, carrying partial lines
/// across chunks.
///
/// Each byte is searched for a line break once, however many chunks a long
/// line spans.
#[derive(Debug, Default)]
pub struct SseLines {
    carry: Vec<u8>,
    /// Prefix of `carry` known to hold no newline.
    scanned: usize,
}

impl SseLines {
    /// Payloads of every `data:` line completed by `chunk`, trimmed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        let mut consumed = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.carry[from..].iter().position(|b| *b == b'\n') {
            let end = from + pos;
            if let Some(data) = data_payload(&self.carry[consumed..end]) {
                payloads.push(data);
            }
            consumed = end + 1;
            from = consumed;
        }
        if consumed > 0 {
            self.carry.drain(..consumed);
        }
        self.scanned = self.carry.len();
        payloads
    }

    /// Payload of a trailing line that never saw its newline. Later calls
    /// return `None`.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.carry);
        data_payload(&rest)
    }
}

/// Accepts both `data: ` and `data:`.
fn data_payload(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?.trim();
    let data = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))?
        .trim();
    (!data.is_empty()).then(|| data.to_string())
}
