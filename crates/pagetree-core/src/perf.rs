//! Per-phase performance accounting for the result envelope.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use pagetree_llm::DispatchStats;

/// Timing and call counts for one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseReport {
    pub seconds: f64,
    pub llm_calls: u32,
    pub llm_retries: u32,
}

/// The `performance` block of the output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub total_seconds: f64,
    pub phases: HashMap<String, PhaseReport>,
    pub total_llm_calls: u32,
    pub total_llm_retries: u32,
    pub total_tokens: u64,
    /// True when the run was cancelled or degraded and the tree is the best
    /// effort produced so far.
    pub partial: bool,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// Collects phase timings during a run and merges in the dispatcher's LLM
/// stats at the end.
#[derive(Debug)]
pub struct PerformanceMonitor {
    started: Instant,
    phase_seconds: HashMap<String, f64>,
    current: Option<(String, Instant)>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            phase_seconds: HashMap::new(),
            current: None,
        }
    }

    /// Begin timing a phase, closing the previous one if still open.
    pub fn start_phase(&mut self, name: &str) {
        self.finish_phase();
        info!(phase = name, "phase started");
        self.current = Some((name.to_string(), Instant::now()));
    }

    /// Close the currently open phase, if any.
    pub fn finish_phase(&mut self) {
        if let Some((name, started)) = self.current.take() {
            let elapsed = started.elapsed().as_secs_f64();
            info!(phase = %name, seconds = elapsed, "phase finished");
            *self.phase_seconds.entry(name).or_default() += elapsed;
        }
    }

    /// Produce the final report, folding in LLM stats per phase tag.
    pub fn report(mut self, llm_stats: &DispatchStats, partial: bool) -> PerformanceReport {
        self.finish_phase();

        let mut phases: HashMap<String, PhaseReport> = HashMap::new();
        for (name, seconds) in &self.phase_seconds {
            phases.insert(
                name.clone(),
                PhaseReport {
                    seconds: *seconds,
                    ..Default::default()
                },
            );
        }
        for (name, stats) in &llm_stats.by_phase {
            let entry = phases.entry(name.clone()).or_default();
            entry.llm_calls = stats.calls;
            entry.llm_retries = stats.retries;
        }

        PerformanceReport {
            total_seconds: self.started.elapsed().as_secs_f64(),
            phases,
            total_llm_calls: llm_stats.total_calls(),
            total_llm_retries: llm_stats.total_retries(),
            total_tokens: llm_stats.total_tokens(),
            partial,
            generated_at: chrono::Utc::now(),
        }
    }
}
