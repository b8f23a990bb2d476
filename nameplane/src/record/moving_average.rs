use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Bounded window of samples and their mean.
///
/// Serialized as the plain list of samples, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovingAverage {
    samples: VecDeque<u64>,
}

impl MovingAverage {
    /// An empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a sample, evicting the oldest ones beyond `window`.
    pub fn push(&mut self, sample: u64, window: usize) {
        self.samples.push_back(sample);
        while self.samples.len() > window.max(1) {
            self.samples.pop_front();
        }
    }

    /// Mean of the window, `0.0` when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was pushed yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
