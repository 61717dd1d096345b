use std::collections::{BTreeMap, VecDeque, vec_deque};

/// Rows kept by default.
pub const DEFAULT_CAPACITY: usize = 5000;

/// One event, converted to physical units.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub event_id: u64,
    /// Register name to value, in physical units where the register has a known quantity.
    pub values: BTreeMap<String, f64>,
}

/// Fixed-capacity history of events; when full, the oldest row is evicted.
///
/// Rows are keyed by a monotonically increasing event id. A row whose id is not
/// greater than the last accepted id is a repeat of an event already recorded.
#[derive(Clone, Debug)]
pub struct History {
    rows: VecDeque<Row>,
    capacity: usize,
    last_event_id: Option<u64>,
    last_seen_id: Option<u64>,
}

impl History {
    pub fn new(capacity: usize) -> History {
        History {
            rows: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            last_event_id: None,
            last_seen_id: None,
        }
    }

    /// Offers the row of one streamed snapshot. Returns whether it was appended.
    ///
    /// A snapshot showing a new event id may have been read while the event was being
    /// written, so an event is only recorded from the next snapshot carrying the same id.
    pub fn record(&mut self, row: Row) -> bool {
        let settled = self.last_seen_id == Some(row.event_id);
        self.last_seen_id = Some(row.event_id);
        settled && self.push(row)
    }

    /// Appends `row` unless its event was already recorded. Returns whether it was appended.
    pub fn push(&mut self, row: Row) -> bool {
        if self.last_event_id.is_some_and(|last| row.event_id <= last) {
            return false;
        }
        self.last_event_id = Some(row.event_id);
        self.rows.push_back(row);
        self.evict();
        true
    }

    /// Changes the capacity; shrinking evicts the oldest rows.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict();
    }

    fn evict(&mut self) {
        while self.rows.len() > self.capacity {
            self.rows.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn latest(&self) -> Option<&Row> {
        self.rows.back()
    }

    /// Oldest row first.
    pub fn iter(&self) -> vec_deque::Iter<'_, Row> {
        self.rows.iter()
    }

    /// The values of `name` over all rows, oldest first. Rows without `name` are skipped.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = f64> + 'a {
        self.rows.iter().filter_map(move |row| row.values.get(name).copied())
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        History::new(DEFAULT_CAPACITY)
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a Row;
    type IntoIter = vec_deque::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use crate::history::{History, Row};

    fn row(event_id: u64) -> Row {
        Row {
            event_id,
            values: BTreeMap::from([("intensity".to_string(), event_id as f64 / 10.0)]),
        }
    }

    #[test]
    fn full_history_evicts_oldest() {
        let mut history = History::new(3);
        for id in 1..=5 {
            assert!(history.push(row(id)));
        }
        let ids: Vec<u64> = history.iter().map(|r| r.event_id).collect();
        assert_eq!(ids, [3, 4, 5]);
        assert_eq!(history.latest().unwrap().event_id, 5);
    }

    #[test]
    fn repeated_events_are_not_recorded() {
        let mut history = History::new(10);
        assert!(history.push(row(7)));
        assert!(!history.push(row(7)));
        assert!(!history.push(row(6)));
        assert!(history.push(row(8)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn events_are_recorded_once_settled() {
        let mut history = History::new(10);
        assert!(!history.record(row(1)));
        assert!(history.record(row(1)));
        assert!(!history.record(row(1)));

        // The id moves on every snapshot: nothing is consistent enough to record.
        for id in 2..=5 {
            assert!(!history.record(row(id)));
        }
        assert!(!history.record(row(6)));
        assert!(history.record(row(6)));

        let ids: Vec<u64> = history.iter().map(|r| r.event_id).collect();
        assert_eq!(ids, [1, 6]);
    }

    #[test]
    fn shrinking_keeps_newest() {
        let mut history = History::new(10);
        for id in 1..=6 {
            history.push(row(id));
        }
        history.resize(2);
        let ids: Vec<u64> = (&history).into_iter().map(|r| r.event_id).collect();
        assert_eq!(ids, [5, 6]);

        history.resize(4);
        history.push(row(7));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn column_extracts_one_register() {
        let mut history = History::new(10);
        history.push(row(10));
        history.push(row(20));
        let values: Vec<f64> = history.column("intensity").collect();
        assert_eq!(values, [1.0, 2.0]);
        assert_eq!(history.column("missing").count(), 0);
    }
}
