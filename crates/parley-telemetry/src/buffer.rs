use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::logging::{record_span_fields, CapturedEvent};

/// Recent formatted log lines, for rendering in the operator console.
///
/// When full, the oldest tenth of the buffer is dropped in one go.
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            let drop_count = (self.capacity / 10).max(1).min(lines.len());
            lines.drain(..drop_count);
        }
        lines.push_back(line);
    }

    /// The last `n` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// tracing layer that appends every event to a [`LogBuffer`].
pub struct BufferLayer {
    buffer: Arc<LogBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S> Layer<S> for BufferLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        self.buffer.push(CapturedEvent::capture(event, &ctx).to_line());
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        record_span_fields(attrs, id, &ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn push_and_recent() {
        let buffer = LogBuffer::new(10);
        for i in 0..4 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.recent(2), vec!["line 2", "line 3"]);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn full_buffer_drops_oldest_tenth() {
        let buffer = LogBuffer::new(20);
        for i in 0..20 {
            buffer.push(format!("{i}"));
        }
        assert_eq!(buffer.len(), 20);

        buffer.push("20".into());
        assert_eq!(buffer.len(), 19);
        let all = buffer.recent(100);
        assert_eq!(all.first().map(String::as_str), Some("2"));
        assert_eq!(all.last().map(String::as_str), Some("20"));
    }

    #[test]
    fn tiny_buffer_never_exceeds_capacity() {
        let buffer = LogBuffer::new(3);
        for i in 0..10 {
            buffer.push(format!("{i}"));
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.recent(1), vec!["9"]);
    }

    #[test]
    fn layer_captures_events_with_span_identity() {
        let buffer = Arc::new(LogBuffer::new(16));
        let subscriber = tracing_subscriber::registry().with(BufferLayer::new(Arc::clone(&buffer)));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("session", client_id = "127.0.0.1:9000");
            let _guard = span.enter();
            tracing::info!("client said hello");
        });

        let lines = buffer.recent(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("client said hello"));
        assert!(lines[0].contains("client_id=127.0.0.1:9000"));
    }
}
