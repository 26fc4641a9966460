//! The dispatcher: queue intake, context matching and run lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use laminar_config::LoadedConfig;
use laminar_core::event::{ArtifactPayload, CompletedPayload, Event, QueuedPayload, StartedPayload};
use laminar_core::{Context, ExitStatus, JobSpec, LaunchSpec, Launcher, Run, RunState};
use laminar_db::{BuildStore, CompletedBuild, QueuedBuild};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::notifier::{Notifier, Scope, Subscription};
use crate::queue::{ActiveRun, ActiveSet, RunQueue};
use crate::status::StatusRequest;
use crate::workspace::Workspace;
use crate::{Error, Result, Settings};

/// Submission options for one queued run.
#[derive(Debug, Default)]
pub struct QueueOptions {
    /// Insert at the front of the queue instead of the back.
    pub front: bool,
    pub reason: Option<String>,
    /// `(job, number)` of the build that triggered this one.
    pub parent: Option<(String, i64)>,
}

/// Identity handed back to a queue caller for later status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRun {
    pub name: String,
    pub number: i64,
}

/// Log bytes of a run; `complete` is false while it is still running.
#[derive(Debug, Clone)]
pub struct LogTail {
    pub output: Vec<u8>,
    pub complete: bool,
}

pub(crate) enum Command {
    Queue {
        name: String,
        params: HashMap<String, String>,
        opts: QueueOptions,
        reply: oneshot::Sender<Result<QueuedRun>>,
    },
    Abort { name: String, number: i64, reply: oneshot::Sender<bool> },
    AbortAll,
    Reload,
    SetParam { name: String, number: i64, key: String, value: String, reply: oneshot::Sender<bool> },
    LogTail { name: String, number: i64, reply: oneshot::Sender<Option<LogTail>> },
    Status { request: StatusRequest, reply: oneshot::Sender<Result<serde_json::Value>> },
    Subscribe { scope: Scope, reply: oneshot::Sender<Subscription> },
    Unsubscribe { id: u64 },
    Output { name: String, number: i64, chunk: Bytes },
    Finished { name: String, number: i64, status: ExitStatus },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Clonable front door to the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    pub async fn queue(
        &self,
        name: impl Into<String>,
        params: HashMap<String, String>,
        opts: QueueOptions,
    ) -> Result<QueuedRun> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Queue { name: name.into(), params, opts, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Abort an active run; returns whether it was found active.
    pub async fn abort(&self, name: impl Into<String>, number: i64) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Abort { name: name.into(), number, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn abort_all(&self) {
        let _ = self.tx.send(Command::AbortAll);
    }

    /// Re-read the configuration tree; may unstick queued runs.
    pub fn reload(&self) {
        let _ = self.tx.send(Command::Reload);
    }

    pub async fn set_param(
        &self,
        name: impl Into<String>,
        number: i64,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::SetParam {
            name: name.into(),
            number,
            key: key.into(),
            value: value.into(),
            reply,
        };
        if self.tx.send(cmd).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn log_tail(&self, name: impl Into<String>, number: i64) -> Option<LogTail> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::LogTail { name: name.into(), number, reply }).ok()?;
        rx.await.unwrap_or(None)
    }

    pub async fn status(&self, request: StatusRequest) -> Result<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Status { request, reply }).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn subscribe(&self, scope: Scope) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Subscribe { scope, reply }).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(Command::Unsubscribe { id });
    }

    /// Abort every active run and resolve once the active set has
    /// drained. Queued runs are discarded; their rows stay QUEUED.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// The scheduler actor. All state is owned here and mutated only while
/// processing one mailbox command at a time.
pub struct Scheduler {
    pub(crate) settings: Settings,
    pub(crate) store: Arc<dyn BuildStore>,
    launcher: Arc<dyn Launcher>,
    pub(crate) workspace: Workspace,
    pub(crate) notifier: Notifier,
    pub(crate) queue: RunQueue,
    pub(crate) active: ActiveSet,
    pub(crate) contexts: Vec<Arc<Context>>,
    pub(crate) job_specs: HashMap<String, JobSpec>,
    pub(crate) groups: Vec<(String, String)>,
    pub(crate) build_numbers: HashMap<String, i64>,
    keep_rundirs: i64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutting_down: bool,
    shutdown_replies: Vec<oneshot::Sender<()>>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Scheduler {
    pub fn new(
        settings: Settings,
        store: Arc<dyn BuildStore>,
        launcher: Arc<dyn Launcher>,
    ) -> (SchedulerHandle, Scheduler) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let workspace = Workspace::new(settings.home());
        let scheduler = Scheduler {
            settings,
            store,
            launcher,
            workspace,
            notifier: Notifier::default(),
            queue: RunQueue::default(),
            active: ActiveSet::default(),
            contexts: Vec::new(),
            job_specs: HashMap::new(),
            groups: Vec::new(),
            build_numbers: HashMap::new(),
            keep_rundirs: 0,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            shutting_down: false,
            shutdown_replies: Vec::new(),
        };
        (SchedulerHandle { tx: cmd_tx }, scheduler)
    }

    /// Seed the build counters, load the configuration and process the
    /// mailbox until shutdown.
    pub async fn run(mut self) -> Result<()> {
        self.build_numbers = self.store.build_numbers().await?;
        self.reload().await;
        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle(cmd).await;
            if self.shutting_down && self.active.is_empty() {
                break;
            }
        }
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        Ok(())
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Queue { name, params, opts, reply } => {
                let _ = reply.send(self.queue_run(name, params, opts).await);
            }
            Command::Abort { name, number, reply } => {
                let _ = reply.send(self.abort_run(&name, number).await);
            }
            Command::AbortAll => self.abort_all_active().await,
            Command::Reload => self.reload().await,
            Command::SetParam { name, number, key, value, reply } => {
                let found = match self.active.get_mut(&name, number) {
                    Some(run) => {
                        run.params.insert(key, value);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            Command::LogTail { name, number, reply } => {
                let _ = reply.send(self.log_tail(&name, number).await);
            }
            Command::Status { request, reply } => {
                let _ = reply.send(self.status_snapshot(&request).await);
            }
            Command::Subscribe { scope, reply } => {
                let _ = reply.send(self.notifier.subscribe(scope));
            }
            Command::Unsubscribe { id } => self.notifier.unsubscribe(id),
            Command::Output { name, number, chunk } => {
                if let Some(run) = self.active.get_mut(&name, number) {
                    run.log.extend_from_slice(&chunk);
                    self.notifier.notify_log(&name, number, chunk, false);
                }
            }
            Command::Finished { name, number, status } => {
                self.finish_run(&name, number, status).await;
            }
            Command::Shutdown { reply } => {
                info!(active = self.active.len(), queued = self.queue.len(), "shutting down");
                self.shutting_down = true;
                self.shutdown_replies.push(reply);
                self.abort_all_active().await;
            }
        }
    }

    /// Queue a run. The build number is committed only after the store
    /// accepted the row; a failed insert leaves no trace.
    async fn queue_run(
        &mut self,
        name: String,
        params: HashMap<String, String>,
        opts: QueueOptions,
    ) -> Result<QueuedRun> {
        if !self.settings.recipe(&name).is_file() {
            return Err(Error::UnknownJob(name));
        }

        let number = self.build_numbers.get(&name).copied().unwrap_or(0) + 1;
        let queued_at = now();
        let queued = QueuedBuild {
            name: name.clone(),
            number,
            queued_at,
            reason: opts.reason.clone(),
            parent_job: opts.parent.as_ref().map(|(job, _)| job.clone()),
            parent_build: opts.parent.as_ref().map(|(_, build)| *build),
        };
        self.store.insert_queued(&queued).await?;
        self.build_numbers.insert(name.clone(), number);

        // make sure the job is matchable even without a conf file
        self.job_specs.entry(name.clone()).or_default();

        let mut run = Run::new(name.clone(), number, params, queued_at);
        run.reason = opts.reason;
        run.parent = opts.parent;
        run.timeout = self.job_specs.get(&name).map(|s| s.timeout).unwrap_or(0);
        let reason = run.reason().to_string();

        let queue_index = if opts.front {
            self.queue.push_front(run);
            0
        } else {
            self.queue.push_back(run);
            self.queue.len() - 1
        };

        self.notifier.notify_event(&Event::JobQueued(QueuedPayload {
            name: name.clone(),
            number,
            result: RunState::Queued,
            queue_index,
            reason,
        }));

        self.assign_new_jobs().await;
        Ok(QueuedRun { name, number })
    }

    /// True iff the context has a free executor and either side's
    /// patterns admit the pairing.
    fn can_queue(&self, ctx: &Context, run: &Run) -> bool {
        if !ctx.has_capacity() {
            return false;
        }
        if ctx.matches_job(&run.name) {
            return true;
        }
        match self.job_specs.get(&run.name) {
            Some(spec) => spec.matches_context(ctx.name()),
            None => ctx.name() == "default",
        }
    }

    /// Walk the queue front-to-back; the first willing context takes
    /// each run. After every start the scan resumes at the new front,
    /// and the loop ends after a full pass that starts nothing.
    async fn assign_new_jobs(&mut self) {
        if self.shutting_down {
            // draining: queued runs stay QUEUED in the store
            return;
        }
        'scan: loop {
            for index in 0..self.queue.len() {
                let matched = match self.queue.get(index) {
                    Some(run) => self.contexts.iter().find(|ctx| self.can_queue(ctx, run)).cloned(),
                    None => None,
                };
                if let Some(ctx) = matched {
                    if let Some(run) = self.queue.remove(index) {
                        self.start_run(run, ctx, index).await;
                    }
                    continue 'scan;
                }
            }
            if !self.queue.is_empty() {
                debug!(queued = self.queue.len(), "queued runs are waiting for capacity or a matching context");
            }
            break;
        }
    }

    async fn start_run(&mut self, mut run: Run, ctx: Arc<Context>, queue_index: usize) {
        let name = run.name.clone();
        let number = run.number;
        let started_at = now();

        let last_result = match self.store.last_result(&name).await {
            Ok(result) => RunState::from_db(result),
            Err(e) => {
                warn!(job = %name, error = %e, "could not read last result");
                RunState::Unknown
            }
        };

        run.started_at = Some(started_at);
        run.context = Some(ctx.clone());

        // the row update is issued before the event so no client ever
        // observes more progress than the store
        if let Err(e) = self.store.mark_started(&name, number, ctx.name(), started_at).await {
            warn!(job = %name, number, error = %e, "could not record run start");
        }
        ctx.acquire();

        let spec = LaunchSpec {
            job: name.clone(),
            number,
            context: ctx.name().to_string(),
            rundir: self.workspace.rundir(&name, number),
            archive_dir: self.workspace.archive_dir(&name, number),
            recipe: self.settings.recipe(&name),
            params: run.params.clone(),
            last_result,
        };

        let mut timeout_task = None;
        match self.launcher.spawn(spec).await {
            Ok(handle) => {
                run.handle = Some(handle.clone());

                // Drain the output stream, then wait for the reap.
                // Both feed back through the mailbox, which keeps chunk
                // order and guarantees the completion is processed last.
                let launcher = self.launcher.clone();
                let cmd_tx = self.cmd_tx.clone();
                let drain_handle = handle.clone();
                let drain_name = name.clone();
                tokio::spawn(async move {
                    match launcher.output(&drain_handle).await {
                        Ok(mut stream) => {
                            while let Some(chunk) = stream.next().await {
                                let cmd = Command::Output {
                                    name: drain_name.clone(),
                                    number,
                                    chunk,
                                };
                                if cmd_tx.send(cmd).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(job = %drain_name, number, error = %e, "could not read run output");
                        }
                    }
                    let status = match launcher.wait(&drain_handle).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(job = %drain_name, number, error = %e, "could not reap run");
                            ExitStatus::Failed
                        }
                    };
                    let _ = cmd_tx.send(Command::Finished { name: drain_name, number, status });
                });

                if run.timeout > 0 {
                    let launcher = self.launcher.clone();
                    let timeout_handle = handle;
                    let timeout_name = name.clone();
                    let secs = run.timeout;
                    timeout_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                        debug!(job = %timeout_name, number, "timeout elapsed, aborting run");
                        let _ = launcher.abort(&timeout_handle).await;
                    }));
                }

                info!(job = %name, number, context = %ctx.name(), "started run");
            }
            Err(e) => {
                // a spawn failure still travels the completion path so
                // the record is persisted and subscribers see closure
                error!(job = %name, number, error = %e, "failed to launch run");
                run.log.extend_from_slice(format!("failed to launch: {e}\n").as_bytes());
                let cmd = Command::Finished {
                    name: name.clone(),
                    number,
                    status: ExitStatus::Failed,
                };
                let _ = self.cmd_tx.send(cmd);
            }
        }

        let etc = match self.store.last_runtime(&name).await {
            Ok(Some(runtime)) => Some(now() + runtime),
            Ok(None) => None,
            Err(e) => {
                warn!(job = %name, error = %e, "could not estimate completion time");
                None
            }
        };
        self.notifier.notify_event(&Event::JobStarted(StartedPayload {
            name: name.clone(),
            number,
            queued: run.queued_at,
            started: started_at,
            queue_index,
            reason: run.reason().to_string(),
            etc,
        }));

        self.active.insert(ActiveRun { run, timeout_task });
    }

    async fn finish_run(&mut self, name: &str, number: i64, status: ExitStatus) {
        let Some(mut active) = self.active.remove(name, number) else {
            return;
        };
        if let Some(task) = active.timeout_task.take() {
            task.abort();
        }
        let mut run = active.run;
        let completed_at = now();
        let result = status.as_run_state();
        run.completed_at = Some(completed_at);
        run.result = Some(result);
        let artifacts = self.workspace.collect_artifacts(name, number);

        let completed = CompletedBuild {
            name,
            number,
            completed_at,
            result: result.as_db(),
            output: &run.log,
            artifacts: &artifacts,
        };
        if let Err(e) = self.store.complete(&completed).await {
            // the run still leaves the active set; the stored record
            // may lag what subscribers are told
            error!(job = %name, number, error = %e, "could not persist completed run");
        }

        info!(job = %name, number, result = %result, "run completed");

        let artifact_payloads = artifacts
            .iter()
            .map(|a| ArtifactPayload {
                url: format!("{}{}/{}/{}", self.settings.archive_url, name, number, a.filename),
                filename: a.filename.clone(),
                size: a.filesize,
            })
            .collect();
        self.notifier.notify_event(&Event::JobCompleted(CompletedPayload {
            name: name.to_string(),
            number,
            queued: run.queued_at,
            started: run.started_at.unwrap_or(0),
            completed: completed_at,
            result,
            reason: run.reason().to_string(),
            artifacts: artifact_payloads,
        }));
        self.notifier.notify_log(name, number, Bytes::new(), true);

        if let Some(ctx) = run.context.as_ref() {
            ctx.release();
        }

        self.workspace.update_latest(name, number);
        // Count back from the oldest still-active run of this job so
        // its rundir survives, or from the latest known build number
        // when none are active.
        let oldest = self
            .active
            .min_build(name)
            .map(|min| min - 1)
            .unwrap_or_else(|| self.build_numbers.get(name).copied().unwrap_or(number));
        self.workspace.prune_rundirs(name, oldest - self.keep_rundirs);

        // capacity was freed
        self.assign_new_jobs().await;
    }

    async fn abort_run(&mut self, name: &str, number: i64) -> bool {
        let Some(run) = self.active.get(name, number) else {
            return false;
        };
        if let Some(handle) = run.handle.clone() {
            if let Err(e) = self.launcher.abort(&handle).await {
                warn!(job = %name, number, error = %e, "could not signal run");
            }
        }
        true
    }

    async fn abort_all_active(&mut self) {
        for (name, number) in self.active.identities() {
            self.abort_run(&name, number).await;
        }
    }

    async fn log_tail(&self, name: &str, number: i64) -> Option<LogTail> {
        if let Some(run) = self.active.get(name, number) {
            return Some(LogTail { output: run.log.clone(), complete: false });
        }
        match self.store.output(name, number).await {
            Ok(output) => output.map(|output| LogTail { output, complete: true }),
            Err(e) => {
                warn!(job = %name, number, error = %e, "could not fetch stored output");
                None
            }
        }
    }

    /// Re-read `cfg/` and reconcile. Contexts keep their identity (and
    /// busy count) across a reload; a context whose file disappeared is
    /// dropped from the list but stays alive through any run bound to
    /// it. A reload may also unstick queued runs.
    async fn reload(&mut self) {
        self.keep_rundirs = std::env::var("LAMINAR_KEEP_RUNDIRS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let loaded = laminar_config::load(self.settings.home());
        self.apply_config(loaded);
        self.assign_new_jobs().await;
    }

    fn apply_config(&mut self, loaded: LoadedConfig) {
        let mut next: Vec<Arc<Context>> = Vec::new();
        for file in &loaded.contexts {
            let existing = self.contexts.iter().find(|c| c.name() == file.name).cloned();
            match (&file.config, existing) {
                (Some(cfg), Some(ctx)) => {
                    ctx.update(cfg.executors, cfg.job_patterns.clone());
                    next.push(ctx);
                }
                (Some(cfg), None) => {
                    next.push(Arc::new(Context::new(
                        &file.name,
                        cfg.executors,
                        cfg.job_patterns.clone(),
                    )));
                }
                // unparseable file: the prior definition stays in effect
                (None, Some(ctx)) => next.push(ctx),
                (None, None) => {}
            }
        }
        if next.is_empty() {
            // take care not to drop and recreate the implicit default
            match self.contexts.iter().find(|c| c.name() == "default").cloned() {
                Some(default) => next.push(default),
                None => {
                    info!("creating a default context with 6 executors");
                    next.push(Arc::new(Context::new("default", 6, Vec::new())));
                }
            }
        }
        self.contexts = next;

        let mut specs = HashMap::new();
        for file in loaded.jobs {
            match file.config {
                Some(cfg) => {
                    specs.insert(file.name, JobSpec {
                        context_patterns: cfg.context_patterns,
                        description: cfg.description,
                        timeout: cfg.timeout,
                    });
                }
                None => {
                    // unparseable file: the prior definition stays
                    if let Some(prev) = self.job_specs.remove(&file.name) {
                        specs.insert(file.name, prev);
                    }
                }
            }
        }
        self.job_specs = specs;

        if let Some(groups) = loaded.groups {
            self.groups = groups;
        }
    }
}
