use std::collections::HashMap;
use std::sync::Arc;

use crate::logbuffer::LogBuffer;
use crate::Result;

/// Key of a shared IPC log: canonical channel string plus stream id.
pub type IpcStreamKey = (String, u32);

/// A shared IPC log buffer and its reference counts.
///
/// On the IPC medium every publication of a (channel, stream) appends to the
/// same log buffer — the multi-producer claim path coordinates them — and
/// every subscription reads it through its own position slot. The log is the
/// transport; there is nothing to poll.
pub struct SharedLogEntry {
    pub log: Arc<LogBuffer>,
    pub session_id: u32,
    pub publishers: usize,
    pub subscribers: usize,
    /// Nanosecond timestamp of the moment the last reference closed; drives
    /// the linger countdown.
    pub closed_at_ns: Option<u64>,
}

impl SharedLogEntry {
    pub fn is_unreferenced(&self) -> bool {
        self.publishers == 0 && self.subscribers == 0
    }
}

/// Registry of shared IPC logs, keyed by channel and stream.
#[derive(Default)]
pub struct SharedLogMap {
    entries: HashMap<IpcStreamKey, SharedLogEntry>,
}

impl SharedLogMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &IpcStreamKey) -> Option<&SharedLogEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &IpcStreamKey) -> Option<&mut SharedLogEntry> {
        self.entries.get_mut(key)
    }

    /// Look up the log for a stream, creating it through `create` on first
    /// use. Reopening a stream that was lingering cancels the countdown.
    pub fn get_or_create_with(
        &mut self,
        key: IpcStreamKey,
        create: impl FnOnce() -> Result<(Arc<LogBuffer>, u32)>,
    ) -> Result<&mut SharedLogEntry> {
        use std::collections::hash_map::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.closed_at_ns = None;
                Ok(entry)
            }
            Entry::Vacant(vacant) => {
                let (log, session_id) = create()?;
                Ok(vacant.insert(SharedLogEntry {
                    log,
                    session_id,
                    publishers: 0,
                    subscribers: 0,
                    closed_at_ns: None,
                }))
            }
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&IpcStreamKey, &mut SharedLogEntry)> {
        self.entries.iter_mut()
    }

    /// Remove entries whose linger expired; the removed logs are reported so
    /// the caller can delete their files.
    pub fn reap_expired(&mut self, now_ns: u64, linger_ns: u64) -> Vec<(IpcStreamKey, Arc<LogBuffer>)> {
        let expired: Vec<IpcStreamKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.is_unreferenced()
                    && entry
                        .closed_at_ns
                        .is_some_and(|closed| now_ns.saturating_sub(closed) >= linger_ns)
            })
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                self.entries
                    .remove(&key)
                    .map(|entry| (key, entry.log))
            })
            .collect()
    }
}
