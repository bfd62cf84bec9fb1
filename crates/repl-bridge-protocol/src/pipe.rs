//! Headless interpreter sessions on plain pipes.

use std::{io, process::Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use repl_bridge_core::{
    Capabilities, LaunchSpec, ProcessControl, ProcessSpawner, SessionContext, SpawnError,
    SpawnedSession,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::{Mutex, mpsc, oneshot},
};

const READ_BUF_SIZE: usize = 8192;

/// Spawns interpreters in their own process group with piped stdio.
///
/// Nothing echoes input on a pipe, so sessions from this spawner can only
/// use the side-log channel.
#[derive(Debug, Default, Clone)]
pub struct PipedSpawner;

impl PipedSpawner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

struct PipedControl {
    stdin: Mutex<ChildStdin>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl ProcessControl for PipedControl {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(data).await?;
        stdin.flush().await
    }

    fn resize(&self, _cols: u16, _rows: u16) -> io::Result<()> {
        Ok(())
    }

    fn kill(&self) -> io::Result<()> {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessSpawner for PipedSpawner {
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        ctx: &SessionContext,
    ) -> Result<SpawnedSession, SpawnError> {
        tracing::info!(
            session = %ctx.session_id,
            program = %spec.program.display(),
            cwd = %spec.cwd.display(),
            "Spawning interpreter on pipes"
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.group_spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                SpawnError::ExecutableNotFound(spec.program.display().to_string())
            }
            _ => SpawnError::SpawnFailed(e.to_string()),
        })?;

        let pid = child.id();
        let inner = child.inner();
        let stdin = inner
            .stdin
            .take()
            .ok_or_else(|| SpawnError::SpawnFailed("stdin not piped".into()))?;
        let stdout = inner
            .stdout
            .take()
            .ok_or_else(|| SpawnError::SpawnFailed("stdout not piped".into()))?;
        let stderr = inner
            .stderr
            .take()
            .ok_or_else(|| SpawnError::SpawnFailed("stderr not piped".into()))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(stdout, output_tx.clone()));
        tokio::spawn(read_loop(stderr, output_tx));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let session_id = ctx.session_id;
        tokio::spawn(async move {
            let code = wait_or_kill(&mut child, kill_rx).await;
            tracing::info!(session = %session_id, ?code, "Interpreter exited");
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedSession {
            control: Box::new(PipedControl {
                stdin: Mutex::new(stdin),
                kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            }),
            output: output_rx,
            exit: exit_rx,
            capabilities: Capabilities {
                echoes_input: false,
                resizable: false,
            },
            pid,
        })
    }
}

async fn wait_or_kill(child: &mut AsyncGroupChild, kill_rx: oneshot::Receiver<()>) -> Option<i32> {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill process group: {e}");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!("Failed to wait for interpreter: {e}");
            None
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Bytes>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!("Pipe read ended: {e}");
                break;
            }
        }
    }
}
