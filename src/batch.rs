//! Split a datapoint collection into size-bounded chunks.
//!
//! A broker message holds the datapoints of one event type, and the broker
//! caps message size, so a large collection is shipped in several rounds.
//! Round `i` carries the `i`-th run of `batch_size` datapoints of every event
//! type. Runs are aligned by ordinal position, not by timestamp: when two
//! event types differ in density their chunks cover different time spans.
use crate::datapoint::{DatapointCollection, EventType, Timestamp};
use serde_json::Value;
use std::collections::btree_map;
use std::collections::BTreeMap;

/// Default number of datapoints per event type per chunk.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// The datapoints of one event type within a chunk.
pub type ChunkSeries<'a> = BTreeMap<Timestamp, &'a Value>;

/// One round of datapoints, borrowed from the collection it was cut from.
///
/// Every event type of the source collection that holds at least one
/// datapoint has an entry, empty once that event type is exhausted.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk<'a> {
    index: usize,
    points: BTreeMap<&'a str, ChunkSeries<'a>>,
}

impl<'a> Chunk<'a> {
    /// Position of this chunk in its sequence, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The datapoints of `event_type`, if the event type is present.
    pub fn get(&self, event_type: &str) -> Option<&ChunkSeries<'a>> {
        self.points.get(event_type)
    }

    /// Iterate event types and their datapoints, event types in order.
    pub fn iter(&self) -> btree_map::Iter<&'a str, ChunkSeries<'a>> {
        self.points.iter()
    }

    /// Greatest timestamp of `event_type` in this chunk.
    pub fn max_timestamp(&self, event_type: &str) -> Option<Timestamp> {
        self.points
            .get(event_type)
            .and_then(|series| series.keys().next_back().cloned())
    }

    /// Total number of datapoints across all event types.
    pub fn len(&self) -> usize {
        self.points.values().map(|series| series.len()).sum()
    }

    /// True when no event type has a datapoint in this chunk.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazy sequence of chunks over a `DatapointCollection`.
///
/// Chunks are cut on demand; cloning the iterator restarts from where the
/// clone was taken.
#[derive(Clone, Debug)]
pub struct Chunks<'a> {
    streams: Vec<(&'a str, btree_map::Iter<'a, Timestamp, Value>)>,
    batch_size: usize,
    index: usize,
    total: usize,
}

impl<'a> Chunks<'a> {
    /// Create a chunk sequence over `points` with at most `batch_size`
    /// datapoints per event type per chunk.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is 0.
    pub fn new(points: &'a DatapointCollection, batch_size: usize) -> Chunks<'a> {
        assert!(batch_size != 0, "batch size must be non-zero");
        let mut max: usize = 0;
        let streams = points
            .iter()
            .filter(|&(_, series)| !series.is_empty())
            .map(|(event_type, series)| {
                max = max.max(series.len());
                (event_type.as_str(), series.iter())
            })
            .collect();
        Chunks {
            streams: streams,
            batch_size: batch_size,
            index: 0,
            total: (max + batch_size - 1) / batch_size,
        }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.index >= self.total {
            return None;
        }
        let batch_size = self.batch_size;
        let points = self.streams
            .iter_mut()
            .map(|&mut (event_type, ref mut stream)| {
                let series: ChunkSeries = stream
                    .by_ref()
                    .take(batch_size)
                    .map(|(ts, value)| (*ts, value))
                    .collect();
                (event_type, series)
            })
            .collect();
        let chunk = Chunk {
            index: self.index,
            points: points,
        };
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for Chunks<'a> {}

/// Convenience for `Chunks::new`.
pub fn chunks(points: &DatapointCollection, batch_size: usize) -> Chunks {
    Chunks::new(points, batch_size)
}

/// Event types of `points` that hold no datapoints at all.
pub fn barren_event_types(points: &DatapointCollection) -> Vec<&EventType> {
    points
        .iter()
        .filter(|&(_, series)| series.is_empty())
        .map(|(event_type, _)| event_type)
        .collect()
}
