//! Contexts: pools of executors that accept matching jobs.

use std::sync::atomic::{AtomicU32, Ordering};

use glob::Pattern;
use parking_lot::RwLock;

/// A pool of executors with a capacity and a set of job-name patterns.
///
/// Shared as `Arc<Context>` between the scheduler's context list and
/// every run bound to it. A reload updates capacity and patterns in
/// place, so busy accounting stays consistent for runs that started
/// before the reload even if the context's config file disappears.
#[derive(Debug)]
pub struct Context {
    name: String,
    executors: AtomicU32,
    busy: AtomicU32,
    job_patterns: RwLock<Vec<Pattern>>,
}

impl Context {
    pub fn new(name: impl Into<String>, executors: u32, job_patterns: Vec<Pattern>) -> Self {
        Self {
            name: name.into(),
            executors: AtomicU32::new(executors),
            busy: AtomicU32::new(0),
            job_patterns: RwLock::new(job_patterns),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executors(&self) -> u32 {
        self.executors.load(Ordering::Relaxed)
    }

    pub fn busy(&self) -> u32 {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn has_capacity(&self) -> bool {
        self.busy() < self.executors()
    }

    /// True if any of this context's patterns matches the job name.
    pub fn matches_job(&self, job: &str) -> bool {
        self.job_patterns.read().iter().any(|p| p.matches(job))
    }

    /// Apply a reloaded definition, preserving the busy count.
    pub fn update(&self, executors: u32, job_patterns: Vec<Pattern>) {
        self.executors.store(executors, Ordering::Relaxed);
        *self.job_patterns.write() = job_patterns;
    }

    /// Mark one executor busy when a run starts.
    pub fn acquire(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one executor when a run finishes.
    pub fn release(&self) {
        let prev = self.busy.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "busy count underflow on context {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(ptns: &[&str]) -> Vec<Pattern> {
        ptns.iter().map(|p| Pattern::new(p).unwrap()).collect()
    }

    #[test]
    fn capacity_accounting() {
        let ctx = Context::new("default", 2, vec![]);
        assert!(ctx.has_capacity());
        ctx.acquire();
        ctx.acquire();
        assert_eq!(ctx.busy(), 2);
        assert!(!ctx.has_capacity());
        ctx.release();
        assert!(ctx.has_capacity());
    }

    #[test]
    fn job_pattern_matching() {
        let ctx = Context::new("heavy", 1, patterns(&["*-big", "release"]));
        assert!(ctx.matches_job("build-big"));
        assert!(ctx.matches_job("release"));
        assert!(!ctx.matches_job("small"));
    }

    #[test]
    fn update_preserves_busy() {
        let ctx = Context::new("default", 1, vec![]);
        ctx.acquire();
        ctx.update(4, patterns(&["foo*"]));
        assert_eq!(ctx.busy(), 1);
        assert_eq!(ctx.executors(), 4);
        assert!(ctx.matches_job("foobar"));
    }
}
