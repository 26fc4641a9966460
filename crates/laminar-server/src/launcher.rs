//! Local build launcher over `tokio::process`.
//!
//! Runs the job's `.run` recipe with cwd set to its scratch directory,
//! streams merged stdout/stderr, and kills the child on abort. The
//! scheduler only ever sees the `Launcher` trait surface.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use laminar_core::{Error, ExitStatus, LaunchSpec, Launcher, Result, RunHandle};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

struct LocalProc {
    output_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    done_rx: Option<oneshot::Receiver<ExitStatus>>,
    abort_tx: mpsc::UnboundedSender<()>,
}

#[derive(Default)]
pub struct LocalLauncher {
    procs: Mutex<HashMap<(String, i64), LocalProc>>,
}

impl LocalLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, tx: mpsc::UnboundedSender<Bytes>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn spawn(&self, spec: LaunchSpec) -> Result<RunHandle> {
        tokio::fs::create_dir_all(&spec.rundir).await?;
        tokio::fs::create_dir_all(&spec.archive_dir).await?;

        let mut child = Command::new(&spec.recipe)
            .current_dir(&spec.rundir)
            .envs(&spec.params)
            .env("JOB", &spec.job)
            .env("RUN", spec.number.to_string())
            .env("CONTEXT", &spec.context)
            .env("LAST_RESULT", spec.last_result.to_string())
            .env("ARCHIVE", &spec.archive_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (abort_tx, mut abort_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let mut pumps = Vec::new();
            if let Some(stdout) = child.stdout.take() {
                pumps.push(tokio::spawn(pump(stdout, out_tx.clone())));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.push(tokio::spawn(pump(stderr, out_tx.clone())));
            }
            // the output stream ends when both pumps drop their sender
            drop(out_tx);

            let mut aborted = false;
            let status = tokio::select! {
                status = child.wait() => status,
                Some(_) = abort_rx.recv() => {
                    aborted = true;
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            for pump_task in pumps {
                let _ = pump_task.await;
            }
            let exit = match status {
                Ok(status) if status.success() => ExitStatus::Success,
                Ok(_) if aborted => ExitStatus::Aborted,
                Ok(status) => {
                    debug!(?status, "build exited unsuccessfully");
                    ExitStatus::Failed
                }
                Err(_) => ExitStatus::Failed,
            };
            let _ = done_tx.send(exit);
        });

        self.procs.lock().insert(
            (spec.job.clone(), spec.number),
            LocalProc {
                output_rx: Some(out_rx),
                done_rx: Some(done_rx),
                abort_tx,
            },
        );
        Ok(RunHandle { job: spec.job, number: spec.number, launcher_id: pid })
    }

    async fn output(&self, handle: &RunHandle) -> Result<BoxStream<'static, Bytes>> {
        let rx = self
            .procs
            .lock()
            .get_mut(&(handle.job.clone(), handle.number))
            .and_then(|p| p.output_rx.take())
            .ok_or_else(|| Error::Launch(format!("no output for {} #{}", handle.job, handle.number)))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed())
    }

    async fn wait(&self, handle: &RunHandle) -> Result<ExitStatus> {
        let key = (handle.job.clone(), handle.number);
        let rx = self
            .procs
            .lock()
            .get_mut(&key)
            .and_then(|p| p.done_rx.take())
            .ok_or_else(|| Error::Launch(format!("unknown run {} #{}", handle.job, handle.number)))?;
        let exit = rx.await.unwrap_or(ExitStatus::Failed);
        self.procs.lock().remove(&key);
        Ok(exit)
    }

    async fn abort(&self, handle: &RunHandle) -> Result<()> {
        if let Some(process) = self.procs.lock().get(&(handle.job.clone(), handle.number)) {
            let _ = process.abort_tx.send(());
        }
        Ok(())
    }
}
