//! Scalar run log
//!
//! Every value the classifier logs goes three places: a `tracing` event, a
//! `metrics` gauge labelled with the key, and the in-memory history kept here.
//! Step values are also accumulated so the epoch mean can be emitted once the
//! epoch for that split ends.

use scsims_core::Tag;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Whether a value was logged per step or per epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogScope {
    Step,
    Epoch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub key: String,
    pub value: f64,
    pub scope: LogScope,
    pub epoch: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunLog {
    entries: Vec<LogEntry>,
    pending: BTreeMap<String, (f64, usize)>,
    epoch: usize,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Record a per-step value and fold it into the running epoch mean
    pub fn log_step(&mut self, key: &str, value: f64) {
        debug!(key, value, epoch = self.epoch, "step");
        metrics::gauge!("scsims_step_value", "key" => key.to_string()).set(value);

        let slot = self.pending.entry(key.to_string()).or_insert((0.0, 0));
        slot.0 += value;
        slot.1 += 1;
        self.push(key, value, LogScope::Step);
    }

    /// Record an epoch-level value
    pub fn log_epoch(&mut self, key: &str, value: f64) {
        info!(key, value, epoch = self.epoch, "epoch");
        metrics::gauge!("scsims_epoch_value", "key" => key.to_string()).set(value);
        self.push(key, value, LogScope::Epoch);
    }

    fn push(&mut self, key: &str, value: f64, scope: LogScope) {
        self.entries.push(LogEntry {
            key: key.to_string(),
            value,
            scope,
            epoch: self.epoch,
        });
    }

    /// Log and return the epoch means of every step value logged under `tag`
    pub fn flush_epoch(&mut self, tag: Tag) -> BTreeMap<String, f64> {
        let prefix = format!("{}_", tag.as_str());
        let keys: Vec<String> = self
            .pending
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();

        let mut means = BTreeMap::new();
        for key in keys {
            if let Some((sum, count)) = self.pending.remove(&key) {
                let mean = sum / count.max(1) as f64;
                self.log_epoch(&key, mean);
                means.insert(key, mean);
            }
        }
        means
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Most recent epoch-level value for `key`
    pub fn last_epoch_value(&self, key: &str) -> Option<f64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.scope == LogScope::Epoch && e.key == key)
            .map(|e| e.value)
    }

    /// Every value logged for `key` at `scope`, oldest first
    pub fn values(&self, key: &str, scope: LogScope) -> Vec<f64> {
        self.entries
            .iter()
            .filter(|e| e.scope == scope && e.key == key)
            .map(|e| e.value)
            .collect()
    }
}
