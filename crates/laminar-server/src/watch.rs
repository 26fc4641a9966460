//! Configuration hot-reload wiring.

use std::path::Path;
use std::time::Duration;

use laminar_scheduler::SchedulerHandle;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tracing::{info, warn};

/// Watch the `cfg/` tree and feed reload commands to the scheduler.
/// The returned debouncer must be kept alive for the watch to run.
pub fn watch_config(home: &Path, handle: SchedulerHandle) -> anyhow::Result<Debouncer<RecommendedWatcher>> {
    let mut debouncer = new_debouncer(
        Duration::from_millis(500),
        move |result: DebounceEventResult| match result {
            Ok(_) => {
                info!("configuration changed, reloading");
                handle.reload();
            }
            Err(e) => warn!(error = %e, "configuration watcher error"),
        },
    )?;

    let cfg = home.join("cfg");
    debouncer.watcher().watch(&cfg.join("contexts"), RecursiveMode::Recursive)?;
    debouncer.watcher().watch(&cfg.join("jobs"), RecursiveMode::Recursive)?;
    // groups.conf lives directly under cfg/
    debouncer.watcher().watch(&cfg, RecursiveMode::NonRecursive)?;
    Ok(debouncer)
}
