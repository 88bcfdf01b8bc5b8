//! Named client streams.
//!
//! Stream ids are chosen by clients and are global to the server.  Starting an
//! id that is already live replaces the previous entry.  Data frames are not
//! checked against the registry; they pass straight through as events.

use std::collections::HashMap;

use relay_core::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: String,
    pub owner: ConnectionId,
    pub stream_type: String,
    /// Unix milliseconds.
    pub started_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<String, StreamInfo>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stream, returning the entry it replaced, if any.
    pub fn start(&mut self, info: StreamInfo) -> Option<StreamInfo> {
        self.streams.insert(info.stream_id.clone(), info)
    }

    /// Removes a stream.  `None` if it was not live.
    pub fn end(&mut self, stream_id: &str) -> Option<StreamInfo> {
        self.streams.remove(stream_id)
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamInfo> {
        self.streams.get(stream_id)
    }

    /// Removes and returns every stream owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: ConnectionId) -> Vec<StreamInfo> {
        let ids: Vec<String> = self
            .streams
            .values()
            .filter(|s| s.owner == owner)
            .map(|s| s.stream_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.streams.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
