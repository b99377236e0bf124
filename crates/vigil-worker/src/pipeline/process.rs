//! Pipeline backed by an external process per camera.
//!
//! The process gets the camera source on its command line and reports
//! [`PipelineSignal`]s as NDJSON on stdout. Stderr is forwarded to the log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

use vigil_core::protocol::{LeaseRef, SourceDescriptor, StartParams, decode_line};

use super::{Pipeline, PipelineError, PipelineHandle, PipelineSignal, TaggedSignal};

/// Launches `command` once per started camera.
pub struct ProcessPipeline {
    command: PathBuf,
    /// Arguments placed before the per-camera ones.
    args: Vec<String>,
    source_types: Vec<String>,
    terminate_timeout: Duration,
    children: Arc<RwLock<HashMap<String, Child>>>,
}

impl ProcessPipeline {
    pub fn new(command: PathBuf, source_types: Vec<String>) -> Self {
        Self {
            command,
            args: Vec::new(),
            source_types,
            terminate_timeout: Duration::from_secs(5),
            children: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Number of pipeline processes currently owned.
    pub async fn active_count(&self) -> usize {
        self.children.read().await.len()
    }

    fn build_command(&self, lease: &LeaseRef, source: &SourceDescriptor, params: &StartParams) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--camera")
            .arg(&lease.camera_id)
            .arg("--generation")
            .arg(lease.generation.to_string())
            .arg("--source")
            .arg(&source.uri)
            .arg("--model")
            .arg(&params.model_version);
        let mut extra: Vec<_> = params.extra.iter().collect();
        extra.sort();
        for (key, value) in extra {
            cmd.arg("--param").arg(format!("{key}={value}"));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Pipeline for ProcessPipeline {
    async fn start(
        &self,
        lease: &LeaseRef,
        source: &SourceDescriptor,
        params: &StartParams,
        signals: mpsc::Sender<TaggedSignal>,
    ) -> Result<PipelineHandle, PipelineError> {
        if !self.source_types.iter().any(|kind| *kind == source.kind) {
            return Err(PipelineError::UnsupportedSource(source.kind.clone()));
        }

        info!(
            camera_id = %lease.camera_id,
            generation = lease.generation,
            command = %self.command.display(),
            "Spawning pipeline process"
        );
        let mut child = self
            .build_command(lease, source, params)
            .spawn()
            .map_err(|e| PipelineError::SpawnFailed {
                reason: e.to_string(),
            })?;

        let handle_id = uuid::Uuid::new_v4().to_string();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;
        let id = handle_id.clone();
        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(handle_id = %id, error = %e, "Pipeline stdout read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let signal = match decode_line::<PipelineSignal>(&line) {
                    Ok(signal) => signal,
                    Err(e) => {
                        debug!(handle_id = %id, error = %e, "Skipping unparseable pipeline output");
                        continue;
                    }
                };
                let tagged = TaggedSignal {
                    handle_id: id.clone(),
                    signal,
                };
                if signals.send(tagged).await.is_err() {
                    return;
                }
            }
            // Output ended: the process is gone. A deliberate stop has already
            // dropped this handle, so the agent ignores the signal then.
            let _ = signals
                .send(TaggedSignal {
                    handle_id: id,
                    signal: PipelineSignal::UnrecoverableFault {
                        detail: "pipeline process exited".into(),
                    },
                })
                .await;
        });

        if let Some(stderr) = child.stderr.take() {
            let id = handle_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(handle_id = %id, "pipeline stderr: {}", line);
                }
            });
        }

        self.children.write().await.insert(handle_id.clone(), child);
        Ok(PipelineHandle {
            id: handle_id,
            lease: lease.clone(),
        })
    }

    async fn stop(&self, handle: PipelineHandle) -> Result<(), PipelineError> {
        let Some(mut child) = self.children.write().await.remove(&handle.id) else {
            debug!(handle_id = %handle.id, "Pipeline already gone");
            return Ok(());
        };

        // Ask for a graceful exit first.
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid belongs to a child we spawned and still own.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(handle_id = %handle.id, pid, error = %err, "Failed to send SIGTERM");
                }
            }
        }

        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(handle_id = %handle.id, camera_id = %handle.lease.camera_id, ?status, "Pipeline exited");
            }
            Ok(Err(e)) => {
                warn!(handle_id = %handle.id, error = %e, "Error waiting for pipeline");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(handle_id = %handle.id, "Pipeline ignored SIGTERM, killing");
                child.kill().await.ok();
            }
        }
        Ok(())
    }
}
