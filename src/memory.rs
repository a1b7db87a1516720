//! In-process short-term notes, one capped deque per module key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const MAX_CAP: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

impl Note {
    pub fn now(note: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            note: note.into(),
        }
    }
}

#[derive(Debug)]
pub struct ShortTermMemory {
    inner: Mutex<HashMap<String, VecDeque<Note>>>,
    cap: usize,
}

impl Default for ShortTermMemory {
    fn default() -> Self {
        Self::with_capacity(50)
    }
}

impl ShortTermMemory {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap: cap.clamp(1, MAX_CAP),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Append under `module_key`, trimming the oldest entries beyond the cap.
    pub fn append(&self, module_key: &str, note: Note) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let q = map.entry(module_key.to_string()).or_default();
        q.push_back(note);
        while q.len() > self.cap {
            q.pop_front();
        }
    }

    pub fn note(&self, module_key: &str, text: impl Into<String>) {
        self.append(module_key, Note::now(text));
    }

    /// Last `n` notes for `module_key`, oldest first.
    pub fn recent(&self, module_key: &str, n: usize) -> Vec<Note> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(module_key) {
            Some(q) => {
                let start = q.len().saturating_sub(n);
                q.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, module_key: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(module_key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_trims_oldest() {
        let m = ShortTermMemory::with_capacity(3);
        for i in 0..5 {
            m.note("ingest", format!("n{i}"));
        }
        assert_eq!(m.len("ingest"), 3);
        let notes: Vec<_> = m.recent("ingest", 10).into_iter().map(|n| n.note).collect();
        assert_eq!(notes, vec!["n2", "n3", "n4"]);
    }

    #[test]
    fn keys_are_independent() {
        let m = ShortTermMemory::with_capacity(2);
        m.note("ingest", "a");
        m.note("analyze", "b");
        m.note("analyze", "c");
        assert_eq!(m.recent("ingest", 5).len(), 1);
        let last: Vec<_> = m.recent("analyze", 1).into_iter().map(|n| n.note).collect();
        assert_eq!(last, vec!["c"]);
        assert!(m.recent("report", 3).is_empty());
    }
}
