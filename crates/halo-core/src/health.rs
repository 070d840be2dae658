use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quality buckets derived from probe round-trip latency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityClass {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityClass {
    /// Pure classification of an average round-trip time in milliseconds.
    pub fn from_latency_ms(avg_ms: u64) -> Self {
        match avg_ms {
            0..=49 => Self::Excellent,
            50..=149 => Self::Good,
            150..=299 => Self::Fair,
            _ => Self::Poor,
        }
    }
}

/// Trailing window of probe round-trip samples. Capped at
/// [`LatencyWindow::CAPACITY`]; older samples fall off the front.
#[derive(Clone, Debug, Default)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
}

impl LatencyWindow {
    pub const CAPACITY: usize = 10;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, rtt_ms: u64) {
        if self.samples.len() == Self::CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average_ms(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    /// Quality of the current window. An empty window reads as `Good`:
    /// no evidence either way, and the UI should not alarm on startup.
    pub fn quality(&self) -> QualityClass {
        match self.average_ms() {
            Some(avg) => QualityClass::from_latency_ms(avg),
            None => QualityClass::Good,
        }
    }
}

/// Snapshot of connection health. Mutated only by the health monitor;
/// everything else reads copies.
#[derive(Clone, Debug)]
pub struct ConnectionHealth {
    pub is_healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub latency_ms: u64,
    pub reconnect_count: u32,
    pub quality: QualityClass,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            is_healthy: false,
            last_probe_at: None,
            latency_ms: 0,
            reconnect_count: 0,
            quality: QualityClass::Good,
        }
    }
}
