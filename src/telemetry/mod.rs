//! Per-request latency measurements.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// The four stage latencies recorded for each request, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Latencies {
    pub hash_ms: f64,
    pub lookup_ms: f64,
    /// Zero on cache hits.
    pub generation_ms: f64,
    pub total_ms: f64,
}

/// Stage timer that fills a [`Latencies`] as the request progresses.
#[derive(Debug)]
pub struct Stopwatch {
    started: Instant,
    stage: Instant,
    latencies: Latencies,
}

impl Stopwatch {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            stage: now,
            latencies: Latencies::default(),
        }
    }

    fn lap(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.stage);
        self.stage = now;
        millis(elapsed)
    }

    pub fn hashed(&mut self) {
        self.latencies.hash_ms = self.lap();
    }

    pub fn looked_up(&mut self) {
        self.latencies.lookup_ms = self.lap();
    }

    pub fn generated(&mut self) {
        self.latencies.generation_ms = self.lap();
    }

    /// Close the total and return the measurements.
    pub fn finish(mut self) -> Latencies {
        self.latencies.total_ms = millis(self.started.elapsed());
        self.latencies
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
