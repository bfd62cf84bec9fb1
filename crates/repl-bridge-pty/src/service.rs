//! Interpreter sessions attached to a pseudo-terminal.

use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use repl_bridge_core::{
    Capabilities, LaunchSpec, ProcessControl, ProcessSpawner, SessionContext, SpawnError,
    SpawnedSession,
};
use tokio::sync::{mpsc, oneshot};

const READ_BUF_SIZE: usize = 8192;

/// Spawns interpreters inside a PTY, so the process behaves exactly as
/// it would for a human at a terminal (prompts, echo, readline).
#[derive(Debug, Default, Clone)]
pub struct PtySpawner;

impl PtySpawner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

struct PtyControl {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

#[async_trait]
impl ProcessControl for PtyControl {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        // PTY writes block once the kernel buffer is full.
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(io::Error::other)?
    }

    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(io::Error::other)
    }

    fn kill(&self) -> io::Result<()> {
        self.killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
    }
}

#[async_trait]
impl ProcessSpawner for PtySpawner {
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        ctx: &SessionContext,
    ) -> Result<SpawnedSession, SpawnError> {
        tracing::info!(
            session = %ctx.session_id,
            program = %spec.program.display(),
            cwd = %spec.cwd.display(),
            "Spawning interpreter in PTY"
        );

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::SpawnFailed(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        // portable-pty starts from an empty environment.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::SpawnFailed(format!("clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::SpawnFailed(format!("take writer: {e}")))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || read_loop(reader, &output_tx));

        let (exit_tx, exit_rx) = oneshot::channel();
        let session_id = ctx.session_id;
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).ok(),
                Err(e) => {
                    tracing::error!(session = %session_id, "Failed to wait for interpreter: {e}");
                    None
                }
            };
            tracing::info!(session = %session_id, ?code, "Interpreter exited");
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedSession {
            control: Box::new(PtyControl {
                writer: Arc::new(Mutex::new(writer)),
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
            }),
            output: output_rx,
            exit: exit_rx,
            capabilities: Capabilities {
                echoes_input: true,
                resizable: true,
            },
            pid,
        })
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: &mpsc::UnboundedSender<Bytes>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            // EIO is how Linux reports a PTY whose child has gone away.
            Err(e) => {
                tracing::debug!("PTY read ended: {e}");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use repl_bridge_core::{ChannelPreference, Language, SessionKey};

    use super::*;

    #[tokio::test]
    async fn test_pty_write_reaches_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SessionContext::new(
            SessionKey::new(Language::R, dir.path()),
            dir.path(),
            ChannelPreference::Scrape,
        );
        let spec = LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "read line; echo \"got:$line\"".into()],
            env: Vec::new(),
            cwd: dir.path().to_path_buf(),
            cols: 80,
            rows: 24,
        };
        let mut session = PtySpawner::new().spawn(&spec, &ctx).await.unwrap();
        assert!(session.capabilities.echoes_input);
        session.control.resize(100, 30).unwrap();

        session.control.write(b"hi\n").await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            let mut out = Vec::new();
            while let Some(chunk) = session.output.recv().await {
                out.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&out).contains("got:hi") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(seen);
        let _ = session.control.kill();
    }
}
