//! N+1 proxy-resolution detection.
//!
//! Resolving proxies of one association one-by-one across many entities
//! issues one store query per entity. The tracker counts single resolutions
//! per (entity type, property) and warns once a threshold is reached.
//!
//! # Example
//!
//! ```ignore
//! // This will trigger a warning:
//! for book in &books {
//!     book.reference("author")?.unwrap().resolve(&mut session)?;  // N queries!
//! }
//!
//! // This is the fix:
//! session.resolve_all(&books, "author")?;  // 1 query
//! ```

use std::collections::HashMap;

/// Counts single proxy resolutions.
#[derive(Debug)]
pub struct N1QueryTracker {
    /// (target type, property) -> resolution count
    counts: HashMap<(String, String), usize>,
    threshold: usize,
    enabled: bool,
}

impl Default for N1QueryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about N+1 detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct N1Stats {
    /// Total number of single resolutions recorded
    pub total_loads: usize,
    /// Number of distinct associations resolved
    pub relationships_loaded: usize,
    /// Number of associations at or over the threshold
    pub potential_n1: usize,
}

impl N1QueryTracker {
    /// Create a tracker with the default threshold (3).
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            threshold: 3,
            enabled: true,
        }
    }

    /// Tracker configured from an optional threshold; `None` disables it.
    #[must_use]
    pub fn from_threshold(threshold: Option<usize>) -> Self {
        match threshold {
            Some(threshold) => Self::new().with_threshold(threshold),
            None => {
                let mut tracker = Self::new();
                tracker.disable();
                tracker
            }
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Record one single-proxy resolution.
    pub fn record_load(&mut self, target_type: &str, property: &str) {
        if !self.enabled {
            return;
        }
        let count = self
            .counts
            .entry((target_type.to_string(), property.to_string()))
            .or_insert(0);
        *count += 1;

        if *count == self.threshold {
            tracing::warn!(
                target: "docmodel::n1",
                target_type,
                property,
                loads = *count,
                threshold = self.threshold,
                "N+1 resolution pattern detected; consider Session::resolve_all() for batch loading"
            );
        }
    }

    /// Reset all counts.
    pub fn reset(&mut self) {
        self.counts.clear();
    }

    pub fn count_for(&self, target_type: &str, property: &str) -> usize {
        self.counts
            .get(&(target_type.to_string(), property.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            relationships_loaded: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|c| **c >= self.threshold)
                .count(),
        }
    }
}
