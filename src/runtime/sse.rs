/// Incremental server-sent-events parser.
///
/// Chunks accumulate in a line buffer; a trailing partial line waits for
/// the next chunk. `event:` lines name the stream's current event and
/// `data:` lines emit it. Dispatch of the payload happens upstream so one
/// bad frame never terminates the stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);
            if let Some(name) = line.strip_prefix("event: ") {
                self.current_event = Some(name.to_string());
            } else if let Some(data) = line.strip_prefix("data: ") {
                events.push(SseEvent {
                    name: self
                        .current_event
                        .clone()
                        .unwrap_or_else(|| "message".to_string()),
                    data: data.to_string(),
                });
            }
        }
        events
    }
}
