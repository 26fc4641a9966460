//! Static configuration for a job name.

use glob::Pattern;

/// Metadata parsed from `cfg/jobs/<name>.conf`.
///
/// An empty `context_patterns` set stands for the implicit `default`
/// context: a job with no explicit CONTEXTS (or no conf file at all)
/// only runs on a context named `default`, unless some context claims
/// it through its own JOBS patterns.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub context_patterns: Vec<Pattern>,
    pub description: Option<String>,
    /// Seconds before a running build is sent an abort signal; 0 = none.
    pub timeout: u64,
}

impl JobSpec {
    /// True if this job may run on the named context.
    pub fn matches_context(&self, context: &str) -> bool {
        if self.context_patterns.is_empty() {
            context == "default"
        } else {
            self.context_patterns.iter().any(|p| p.matches(context))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patterns_mean_default_only() {
        let spec = JobSpec::default();
        assert!(spec.matches_context("default"));
        assert!(!spec.matches_context("heavy"));
    }

    #[test]
    fn explicit_patterns_replace_the_default() {
        let spec = JobSpec {
            context_patterns: vec![Pattern::new("build-*").unwrap()],
            ..JobSpec::default()
        };
        assert!(spec.matches_context("build-x86"));
        assert!(!spec.matches_context("default"));
    }
}
