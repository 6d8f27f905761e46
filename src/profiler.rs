/// Hotness profiler.
///
/// Counts function calls and loop back-edges, flags functions that cross
/// the configured thresholds, and keeps a small amount of reporting state.
/// The JIT bridge reads hot candidates from here; whether a candidate is
/// actually compiled is decided solely by `jit::can_jit`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::value::FuncId;

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub hot_call_threshold: u32,
    pub hot_loop_threshold: u32,
}

#[derive(Debug, Default, Clone)]
pub struct FuncProfile {
    pub name: String,
    pub calls: u64,
    pub back_edges: u64,
    /// Per back-edge-target counters (keyed by target pc).
    pub loop_targets: HashMap<usize, u64>,
}

pub struct Profiler {
    config: ProfilerConfig,
    /// Executed-instruction counter across the whole VM run.
    instructions: AtomicU64,
    profiles: Mutex<HashMap<FuncId, FuncProfile>>,
    /// Functions that crossed a threshold and have not yet been handed to
    /// the compiler.
    pending_hot: Mutex<Vec<FuncId>>,
    hot: Mutex<Vec<FuncId>>,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Profiler {
            config,
            instructions: AtomicU64::new(0),
            profiles: Mutex::new(HashMap::new()),
            pending_hot: Mutex::new(Vec::new()),
            hot: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn count_instructions(&self, n: u64) {
        self.instructions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn instructions(&self) -> u64 {
        self.instructions.load(Ordering::Relaxed)
    }

    /// Record one call. Returns true when the function just became hot.
    pub fn record_call(&self, func: FuncId, name: &str) -> bool {
        let mut profiles = self.profiles.lock();
        let p = profiles.entry(func).or_insert_with(|| FuncProfile { name: name.to_string(), ..FuncProfile::default() });
        p.calls += 1;
        if p.calls == self.config.hot_call_threshold as u64 {
            drop(profiles);
            self.mark_hot(func);
            return true;
        }
        false
    }

    /// Record one loop back-edge landing at `target`. Returns true when the
    /// enclosing function just became hot through that loop.
    pub fn record_back_edge(&self, func: FuncId, target: usize, name: &str) -> bool {
        let mut profiles = self.profiles.lock();
        let p = profiles.entry(func).or_insert_with(|| FuncProfile { name: name.to_string(), ..FuncProfile::default() });
        p.back_edges += 1;
        let count = p.loop_targets.entry(target).or_insert(0);
        *count += 1;
        if *count == self.config.hot_loop_threshold as u64 {
            drop(profiles);
            self.mark_hot(func);
            return true;
        }
        false
    }

    fn mark_hot(&self, func: FuncId) {
        let mut hot = self.hot.lock();
        if !hot.contains(&func) {
            hot.push(func);
            self.pending_hot.lock().push(func);
        }
    }

    pub fn is_hot(&self, func: FuncId) -> bool {
        self.hot.lock().contains(&func)
    }

    /// Drain functions awaiting a compilation attempt.
    pub fn take_pending_hot(&self) -> Vec<FuncId> {
        std::mem::take(&mut *self.pending_hot.lock())
    }

    /// Top-N most-called functions, for the report.
    pub fn top_calls(&self, n: usize) -> Vec<FuncProfile> {
        let profiles = self.profiles.lock();
        let mut entries: Vec<FuncProfile> = profiles.values().cloned().collect();
        entries.sort_by(|a, b| b.calls.cmp(&a.calls));
        entries.truncate(n);
        entries
    }

    pub fn report(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "=== Profile ===");
        let _ = writeln!(out, "  instructions: {}", self.instructions());
        let _ = writeln!(out, "  {:<24} {:>10} {:>12}", "function", "calls", "back-edges");
        for p in self.top_calls(10) {
            let _ = writeln!(out, "  {:<24} {:>10} {:>12}", p.name, p.calls, p.back_edges);
        }
        let hot = self.hot.lock();
        let _ = writeln!(out, "  hot functions: {}", hot.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler() -> Profiler {
        Profiler::new(ProfilerConfig { hot_call_threshold: 3, hot_loop_threshold: 5 })
    }

    #[test]
    fn function_becomes_hot_at_call_threshold() {
        let p = profiler();
        assert!(!p.record_call(0, "fib"));
        assert!(!p.record_call(0, "fib"));
        assert!(p.record_call(0, "fib"));
        assert!(p.is_hot(0));
        // Crossing again does not re-trigger.
        assert!(!p.record_call(0, "fib"));
        assert_eq!(p.take_pending_hot(), vec![0]);
        assert!(p.take_pending_hot().is_empty());
    }

    #[test]
    fn loop_back_edges_trigger_hotness() {
        let p = profiler();
        for _ in 0..4 {
            assert!(!p.record_back_edge(1, 7, "spin"));
        }
        assert!(p.record_back_edge(1, 7, "spin"));
        assert!(p.is_hot(1));
    }

    #[test]
    fn distinct_loop_targets_count_separately() {
        let p = profiler();
        for _ in 0..3 {
            p.record_back_edge(2, 4, "two-loops");
            p.record_back_edge(2, 9, "two-loops");
        }
        // Neither target crossed the threshold of 5 on its own.
        assert!(!p.is_hot(2));
    }

    #[test]
    fn top_calls_sorted() {
        let p = profiler();
        p.record_call(0, "a");
        p.record_call(1, "b");
        p.record_call(1, "b");
        let top = p.top_calls(2);
        assert_eq!(top[0].name, "b");
        assert_eq!(top[0].calls, 2);
    }
}
