//! Endpoint rotator: chooses which path receives the next probing
//! request, tracks endpoint health, and (optionally) infers a
//! per-endpoint rate limit from any 429 it sees.
//!
//! Rotation policy is a tagged variant rather than a trait object, per
//! the specification's design note preferring sum types over dynamic
//! dispatch for a small, closed set of strategies.

use crate::error::{DetectError, DetectResult};
use crate::header_analyzer::HeaderAnalyzer;
use crate::models::EndpointEntry;
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::time::Duration;

/// Selection policy for an [`EndpointRotator`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RotationPolicy {
    /// Uniform over endpoints, optionally excluding the last-used one to
    /// avoid back-to-back repeats.
    Random {
        /// Exclude the last-selected endpoint from the draw when more
        /// than one candidate remains.
        avoid_stutter: bool,
    },
    /// Cycle through endpoints in order, advancing one index every `n`
    /// calls to `next`.
    Sequential {
        /// Calls to `next` per index advance. Must be `>= 1`.
        n: u32,
    },
    /// Roulette-wheel selection over normalized weights.
    Weighted {
        /// Scale weights by recent latency performance.
        performance_adaptive: bool,
        /// Strength of the latency adjustment: `weight * (1 + alpha / mean_latency_secs)`.
        alpha: f64,
        /// Number of recent latency samples retained per endpoint.
        latency_window_size: usize,
    },
    /// Avoids extending a run of the same endpoint and avoids completing
    /// a recently-seen 2-gram, with a randomization factor to break
    /// ties and prevent the filter from ever starving selection.
    PatternAvoiding {
        /// Maximum allowed consecutive picks of the same endpoint.
        max_consecutive_same: u32,
        /// How many past selections are considered when detecting
        /// repeated 2-grams.
        gram_window: usize,
        /// Probability of ignoring the pattern filter on any given call,
        /// keeping the rotator from becoming stuck when every candidate
        /// would complete some pattern.
        randomization_factor: f64,
    },
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::Random {
            avoid_stutter: true,
        }
    }
}

/// Read-only snapshot of rotation activity, safe to hand out while the
/// rotator itself stays under single-writer mutation.
#[derive(Debug, Clone, Default)]
pub struct RotationMetrics {
    /// Selection count per endpoint index.
    pub selection_counts: Vec<u64>,
    /// Total calls to `next`.
    pub total_selections: u64,
}

/// Chooses the next endpoint path and tracks health, latency, and
/// per-endpoint inferred limits.
pub struct EndpointRotator {
    policy: RotationPolicy,
    endpoints: Vec<EndpointEntry>,
    history: VecDeque<usize>,
    sequential_index: usize,
    sequential_count: u32,
    selection_counts: Vec<u64>,
    infer_per_endpoint_limits: bool,
}

impl EndpointRotator {
    /// Build a rotator over `endpoints` using `policy`. `endpoints` may be
    /// empty at construction; an empty set only becomes an error on
    /// `next()`, matching the boundary behavior in the specification.
    pub fn new(endpoints: Vec<EndpointEntry>, policy: RotationPolicy, infer_per_endpoint_limits: bool) -> Self {
        let selection_counts = vec![0; endpoints.len()];
        Self {
            policy,
            endpoints,
            history: VecDeque::new(),
            sequential_index: 0,
            sequential_count: 0,
            selection_counts,
            infer_per_endpoint_limits,
        }
    }

    /// Read-only activity snapshot.
    pub fn metrics(&self) -> RotationMetrics {
        RotationMetrics {
            selection_counts: self.selection_counts.clone(),
            total_selections: self.selection_counts.iter().sum(),
        }
    }

    /// Current endpoint entries, for inspection (e.g. in tests or
    /// diagnostics). Read-only.
    pub fn endpoints(&self) -> &[EndpointEntry] {
        &self.endpoints
    }

    fn healthy_indices(&self) -> Vec<usize> {
        let healthy: Vec<usize> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.healthy)
            .map(|(i, _)| i)
            .collect();
        if healthy.is_empty() {
            log_all_unhealthy();
            (0..self.endpoints.len()).collect()
        } else {
            healthy
        }
    }

    /// Choose the next endpoint path.
    pub fn next(&mut self) -> DetectResult<String> {
        if self.endpoints.is_empty() {
            return Err(DetectError::configuration("rotator has no endpoints"));
        }

        let candidates = self.healthy_indices();
        let index = match self.policy.clone() {
            RotationPolicy::Random { avoid_stutter } => self.select_random(&candidates, avoid_stutter),
            RotationPolicy::Sequential { n } => self.select_sequential(&candidates, n.max(1)),
            RotationPolicy::Weighted {
                performance_adaptive,
                alpha,
                ..
            } => self.select_weighted(&candidates, performance_adaptive, alpha),
            RotationPolicy::PatternAvoiding {
                max_consecutive_same,
                gram_window,
                randomization_factor,
            } => self.select_pattern_avoiding(&candidates, max_consecutive_same, gram_window, randomization_factor),
        };

        self.history.push_back(index);
        if self.history.len() > 64 {
            self.history.pop_front();
        }
        self.selection_counts[index] += 1;
        Ok(self.endpoints[index].path.clone())
    }

    fn select_random(&self, candidates: &[usize], avoid_stutter: bool) -> usize {
        let last = self.history.back().copied();
        let pool: Vec<usize> = if avoid_stutter && candidates.len() > 1 {
            candidates
                .iter()
                .copied()
                .filter(|i| Some(*i) != last)
                .collect()
        } else {
            candidates.to_vec()
        };
        let pool = if pool.is_empty() { candidates.to_vec() } else { pool };
        pool[fastrand::usize(..pool.len())]
    }

    fn select_sequential(&mut self, candidates: &[usize], n: u32) -> usize {
        self.sequential_count += 1;
        if self.sequential_count > n {
            self.sequential_count = 1;
            self.sequential_index = (self.sequential_index + 1) % self.endpoints.len();
        }
        if candidates.contains(&self.sequential_index) {
            self.sequential_index
        } else {
            candidates[self.sequential_index % candidates.len()]
        }
    }

    fn select_weighted(&self, candidates: &[usize], performance_adaptive: bool, alpha: f64) -> usize {
        let weights: Vec<f64> = candidates
            .iter()
            .map(|&i| {
                let entry = &self.endpoints[i];
                if performance_adaptive {
                    if let Some(mean) = entry.mean_latency() {
                        let mean_secs = mean.as_secs_f64().max(f64::EPSILON);
                        entry.weight * (1.0 + alpha / mean_secs)
                    } else {
                        entry.weight
                    }
                } else {
                    entry.weight
                }
            })
            .collect();

        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return candidates[fastrand::usize(..candidates.len())];
        }
        let mut draw = fastrand::f64() * total;
        for (position, weight) in weights.iter().enumerate() {
            draw -= weight;
            if draw <= 0.0 {
                return candidates[position];
            }
        }
        *candidates.last().unwrap()
    }

    fn select_pattern_avoiding(
        &self,
        candidates: &[usize],
        max_consecutive_same: u32,
        gram_window: usize,
        randomization_factor: f64,
    ) -> usize {
        if fastrand::f64() < randomization_factor {
            return candidates[fastrand::usize(..candidates.len())];
        }

        let recent: Vec<usize> = self
            .history
            .iter()
            .rev()
            .take(gram_window.max(1))
            .copied()
            .collect();

        let run_len = recent
            .iter()
            .take_while(|&&i| Some(i) == recent.first().copied())
            .count();
        let last = recent.first().copied();

        let completes_gram = |candidate: usize| -> bool {
            let Some(prev) = last else { return false };
            recent.windows(2).any(|w| w[0] == candidate && w[1] == prev)
        };

        let filtered: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| {
                let would_extend_run = last == Some(i) && run_len as u32 >= max_consecutive_same;
                !would_extend_run && !completes_gram(i)
            })
            .collect();

        let pool = if filtered.is_empty() { candidates.to_vec() } else { filtered };
        pool[fastrand::usize(..pool.len())]
    }

    /// Record the outcome of a request issued to `path`: latency, and
    /// either a successful status, a server error, or a transport
    /// failure. Any 5xx or transport failure marks the endpoint
    /// unhealthy; any success resets it to healthy. When this rotator
    /// infers per-endpoint limits and `status` is 429, `headers` is run
    /// through the header analyzer and the result stored against the
    /// endpoint.
    pub fn record_outcome(
        &mut self,
        path: &str,
        status: Option<u16>,
        latency: Duration,
        transport_failed: bool,
        headers: Option<&HeaderMap>,
    ) {
        let Some(entry) = self.endpoints.iter_mut().find(|e| e.path == path) else {
            return;
        };

        let window_cap = match &self.policy {
            RotationPolicy::Weighted { latency_window_size, .. } => (*latency_window_size).max(1),
            _ => 32,
        };
        entry.latency_window.push_back(latency);
        while entry.latency_window.len() > window_cap {
            entry.latency_window.pop_front();
        }

        if transport_failed || status.is_some_and(|s| (500..600).contains(&s)) {
            entry.healthy = false;
        } else if status.is_some_and(|s| (200..300).contains(&s)) {
            entry.healthy = true;
        }

        if self.infer_per_endpoint_limits && status == Some(429) {
            if let Some(headers) = headers {
                if let Some(limit) = HeaderAnalyzer::analyze(headers).into_iter().next() {
                    entry.rate_limit = Some(limit);
                }
            }
        }
    }

    /// Add an endpoint at runtime. Only meaningful when the caller's
    /// configuration allows dynamic endpoints; the rotator itself does
    /// not gate this, the caller does.
    pub fn add_endpoint(&mut self, entry: EndpointEntry) {
        self.endpoints.push(entry);
        self.selection_counts.push(0);
    }

    /// Remove an endpoint by path, if present.
    pub fn remove_endpoint(&mut self, path: &str) {
        if let Some(position) = self.endpoints.iter().position(|e| e.path == path) {
            self.endpoints.remove(position);
            self.selection_counts.remove(position);
            self.history.retain(|&i| i != position);
            for i in self.history.iter_mut() {
                if *i > position {
                    *i -= 1;
                }
            }
            if self.sequential_index >= self.endpoints.len() {
                self.sequential_index = 0;
            }
        }
    }
}

fn log_all_unhealthy() {
    crate::logging::log_warn!("all endpoints unhealthy, falling back to offering all of them");
}
