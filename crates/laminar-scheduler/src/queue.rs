//! The run queue and the multi-index active set.

use std::collections::{BTreeSet, HashMap, VecDeque};

use laminar_core::Run;
use tokio::task::JoinHandle;

/// FIFO of runs submitted but not yet matched to a context.
/// Front insertion is allowed; the most recent front-insert wins the
/// front slot.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    runs: VecDeque<Run>,
}

impl RunQueue {
    pub fn push_back(&mut self, run: Run) {
        self.runs.push_back(run);
    }

    pub fn push_front(&mut self, run: Run) {
        self.runs.push_front(run);
    }

    pub fn remove(&mut self, index: usize) -> Option<Run> {
        self.runs.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&Run> {
        self.runs.get(index)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Run> {
        self.runs.iter()
    }
}

/// A running run plus the lifecycle tasks attached to it.
#[derive(Debug)]
pub(crate) struct ActiveRun {
    pub run: Run,
    pub timeout_task: Option<JoinHandle<()>>,
}

/// Currently running runs, indexed by identity, by job name and by
/// start time. All mutations go through this container so the indexes
/// stay consistent.
#[derive(Debug, Default)]
pub(crate) struct ActiveSet {
    runs: HashMap<(String, i64), ActiveRun>,
    by_job: HashMap<String, BTreeSet<i64>>,
    by_start: BTreeSet<(i64, String, i64)>,
}

impl ActiveSet {
    /// Insert a started run. The run must have `started_at` set.
    pub fn insert(&mut self, active: ActiveRun) {
        let name = active.run.name.clone();
        let number = active.run.number;
        let started = active.run.started_at.unwrap_or(0);
        self.by_job.entry(name.clone()).or_default().insert(number);
        self.by_start.insert((started, name.clone(), number));
        self.runs.insert((name, number), active);
    }

    pub fn remove(&mut self, name: &str, number: i64) -> Option<ActiveRun> {
        let active = self.runs.remove(&(name.to_string(), number))?;
        if let Some(numbers) = self.by_job.get_mut(name) {
            numbers.remove(&number);
            if numbers.is_empty() {
                self.by_job.remove(name);
            }
        }
        let started = active.run.started_at.unwrap_or(0);
        self.by_start.remove(&(started, name.to_string(), number));
        Some(active)
    }

    pub fn get(&self, name: &str, number: i64) -> Option<&Run> {
        self.runs.get(&(name.to_string(), number)).map(|a| &a.run)
    }

    pub fn get_mut(&mut self, name: &str, number: i64) -> Option<&mut Run> {
        self.runs.get_mut(&(name.to_string(), number)).map(|a| &mut a.run)
    }

    /// Runs in start-time order.
    pub fn iter_by_start(&self) -> impl Iterator<Item = &Run> {
        self.by_start.iter().filter_map(|(_, name, number)| self.get(name, *number))
    }

    /// Build numbers of this job's active runs, ascending.
    pub fn job_numbers(&self, name: &str) -> Vec<i64> {
        self.by_job
            .get(name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Lowest active build number for a job, if any run is active.
    pub fn min_build(&self, name: &str) -> Option<i64> {
        self.by_job.get(name).and_then(|set| set.iter().next().copied())
    }

    pub fn identities(&self) -> Vec<(String, i64)> {
        self.runs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
