//! Diagnostic trace ring buffer — a bounded, thread-safe record of every
//! frame sent or received, used for debugging protocol exchanges.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::codec::detect_label;

pub const DEFAULT_CAPACITY: usize = 200;
pub const MIN_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub timestamp: SystemTime,
    pub direction: Direction,
    pub endpoint_id: u32,
    pub endpoint_name: Option<String>,
    pub bytes: Vec<u8>,
    pub label: Option<&'static str>,
}

impl TraceEntry {
    fn to_json(&self) -> Value {
        let millis = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        json!({
            "timestamp_ms": millis,
            "direction": self.direction.as_str(),
            "endpoint_id": self.endpoint_id,
            "endpoint_name": self.endpoint_name,
            "bytes": self.bytes,
            "label": self.label,
        })
    }
}

/// Fixed-capacity ring of trace entries, serialized under a single mutex.
pub struct TraceBuffer {
    capacity: usize,
    entries: VecDeque<TraceEntry>,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(MIN_CAPACITY),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, direction: Direction, endpoint_id: u32, endpoint_name: Option<String>, bytes: Vec<u8>) {
        let label = detect_label(&bytes);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            timestamp: SystemTime::now(),
            direction,
            endpoint_id,
            endpoint_name,
            bytes,
            label,
        });
    }

    /// Oldest-to-newest snapshot.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last_entries(&self, n: usize) -> Vec<TraceEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn filter_by_direction(&self, direction: Direction) -> Vec<TraceEntry> {
        self.entries.iter().filter(|e| e.direction == direction).cloned().collect()
    }

    pub fn filter_by_endpoint(&self, endpoint_id: u32) -> Vec<TraceEntry> {
        self.entries.iter().filter(|e| e.endpoint_id == endpoint_id).cloned().collect()
    }

    pub fn filter_by_time_range(&self, start: SystemTime, end: SystemTime) -> Vec<TraceEntry> {
        self.entries
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Human-readable dump, one line per entry.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let hex: Vec<String> = entry.bytes.iter().map(|b| format!("{b:02X}")).collect();
            out.push_str(&format!(
                "[{}] {} endpoint={} {}: {}\n",
                entry
                    .timestamp
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0),
                entry.direction.as_str(),
                entry.endpoint_id,
                entry.label.unwrap_or("unknown"),
                hex.join(" ")
            ));
        }
        out
    }

    pub fn export_json(&self) -> Value {
        Value::Array(self.entries.iter().map(TraceEntry::to_json).collect())
    }
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

static GLOBAL_TRACE: OnceLock<Mutex<TraceBuffer>> = OnceLock::new();

/// Process-wide trace singleton, lazily initialized on first access.
/// Tests that want isolation should construct their own `TraceBuffer`
/// instead of reaching for this.
pub fn global_trace() -> &'static Mutex<TraceBuffer> {
    GLOBAL_TRACE.get_or_init(|| Mutex::new(TraceBuffer::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let mut trace = TraceBuffer::new(MIN_CAPACITY);
        for i in 0..(MIN_CAPACITY + 5) {
            trace.record(Direction::Send, 0, None, vec![i as u8]);
        }
        assert_eq!(trace.len(), MIN_CAPACITY);
        let entries = trace.entries();
        // the oldest surviving entry should be the 6th one recorded (index 5)
        assert_eq!(entries.first().unwrap().bytes, vec![5u8]);
        assert_eq!(entries.last().unwrap().bytes, vec![(MIN_CAPACITY + 4) as u8]);
    }

    #[test]
    fn capacity_floor_is_enforced() {
        let trace = TraceBuffer::new(1);
        assert_eq!(trace.capacity(), MIN_CAPACITY);
    }

    #[test]
    fn last_entries_returns_most_recent() {
        let mut trace = TraceBuffer::new(DEFAULT_CAPACITY);
        for i in 0..5 {
            trace.record(Direction::Receive, 1, None, vec![i]);
        }
        let last = trace.last_entries(2);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].bytes, vec![3]);
        assert_eq!(last[1].bytes, vec![4]);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut trace = TraceBuffer::new(DEFAULT_CAPACITY);
        trace.record(Direction::Send, 0, None, vec![1]);
        trace.clear();
        assert!(trace.is_empty());
    }
}
