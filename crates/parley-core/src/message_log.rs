use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::envelope::LogEntry;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Bounded in-memory message history.
///
/// Holds at most `capacity` entries; appending past the bound evicts the
/// oldest entries first. Guarded by its own lock, independent of the
/// session registry.
pub struct MessageLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl MessageLog {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
            capacity,
        }
    }

    /// Append an entry, returning how many old entries were evicted.
    pub fn append(&self, entry: LogEntry) -> usize {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        let mut evicted = 0;
        while entries.len() > self.capacity {
            entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Copy of all retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn entry(i: usize) -> LogEntry {
        Envelope::new(format!("t{i}"), "s", format!("m{i}")).into_log_entry("ip")
    }

    #[test]
    fn append_within_bound_keeps_everything() {
        let log = MessageLog::new(3);
        assert_eq!(log.append(entry(0)), 0);
        assert_eq!(log.append(entry(1)), 0);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn eviction_keeps_most_recent_in_order() {
        let log = MessageLog::new(3);
        for i in 0..7 {
            log.append(entry(i));
            assert!(log.len() <= 3);
        }
        let contents: Vec<String> = log.entries().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["m4", "m5", "m6"]);
    }

    #[test]
    fn append_reports_evictions() {
        let log = MessageLog::new(1);
        assert_eq!(log.append(entry(0)), 0);
        assert_eq!(log.append(entry(1)), 1);
        assert_eq!(log.entries()[0].content, "m1");
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let log = MessageLog::new(0);
        assert_eq!(log.capacity(), 1);
        log.append(entry(0));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn recent_returns_tail() {
        let log = MessageLog::new(10);
        for i in 0..5 {
            log.append(entry(i));
        }
        let tail: Vec<String> = log.recent(2).into_iter().map(|e| e.content).collect();
        assert_eq!(tail, vec!["m3", "m4"]);
        assert_eq!(log.recent(50).len(), 5);
        assert!(log.recent(0).is_empty());
    }

    #[test]
    fn concurrent_appends_respect_bound() {
        use std::sync::Arc;
        use std::thread;

        let log = Arc::new(MessageLog::new(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for i in 0..500 {
                        log.append(entry(i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 100);
    }
}
