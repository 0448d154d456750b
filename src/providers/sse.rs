//! Server-sent-event framing shared by the provider stream parsers.

/// Incremental SSE decoder. Feed raw body chunks in; get back the `data:`
/// payload of every event completed so far.
#[derive(Debug, Default)]
pub struct SseDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(bytes);
        self.decode_utf8();
        self.drain_events()
    }

    /// Payload of a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let data = Self::event_data(&rest);
        (!data.is_empty()).then_some(data)
    }

    // Move as much valid UTF-8 as possible from the byte buffer into the text
    // buffer. A multi-byte char split across chunks stays in `byte_buf`.
    fn decode_utf8(&mut self) {
        let decoded = match std::str::from_utf8(&self.byte_buf) {
            Ok(s) => {
                let decoded = s.to_string();
                self.byte_buf.clear();
                decoded
            }
            Err(e) => {
                let cut = match e.error_len() {
                    // Genuinely invalid bytes: replace them and move on.
                    Some(len) => e.valid_up_to() + len,
                    None => e.valid_up_to(),
                };
                if cut == 0 {
                    return;
                }
                let taken: Vec<u8> = self.byte_buf.drain(..cut).collect();
                String::from_utf8_lossy(&taken).into_owned()
            }
        };

        self.buffer.push_str(&decoded.replace("\r\n", "\n"));
    }

    fn drain_events(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let event_text: String = self.buffer.drain(..event_end + 2).collect();
            let data = Self::event_data(&event_text);
            if !data.is_empty() {
                events.push(data);
            }
        }
        events
    }

    fn event_data(event_text: &str) -> String {
        event_text
            .lines()
            .filter_map(|line| {
                line.strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
