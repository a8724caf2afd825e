//! Subprocess plumbing shared by the Docker and Podman runtimes.

use crate::config::RuntimeKind;
use crate::constants::{
    ARTIFACTS_MOUNT, BASE_ENV_ALLOWLIST, CONTEXT_CHANNEL_DEPTH, CONTEXT_CHUNK_SIZE,
    STAGING_REPOSITORY,
};
use crate::context::ContextSnapshot;
use crate::error::{ForgeError, Result};
use crate::logging::short_digest;
use crate::runtime::{CancelSignal, ImageInfo};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// A runtime CLI binary with a fixed, allow-listed environment.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    kind: RuntimeKind,
    env: BTreeMap<String, String>,
    cancel: CancelSignal,
}

impl CliRuntime {
    /// `extra_env` names runtime-specific variables forwarded in addition to
    /// the base allow-list.
    pub fn new(
        kind: RuntimeKind,
        extra_env: &[&str],
        lookup: &dyn Fn(&str) -> Option<String>,
        cancel: CancelSignal,
    ) -> Self {
        let env = BASE_ENV_ALLOWLIST
            .iter()
            .chain(extra_env)
            .filter_map(|key| lookup(key).map(|value| (key.to_string(), value)))
            .collect();
        Self { kind, env, cancel }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    /// Add a fixed variable, e.g. `DOCKER_BUILDKIT=1`.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(self.kind.binary());
        cmd.args(args)
            .env_clear()
            .envs(&self.env)
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        match args.first() {
            Some(sub) => format!("{} {}", self.kind.binary(), sub),
            None => self.kind.binary().to_string(),
        }
    }

    fn spawn(&self, mut cmd: Command, args: &[String]) -> Result<Child> {
        cmd.spawn().map_err(|e| {
            ForgeError::Other(
                anyhow::Error::new(e).context(format!("failed to start {}", self.describe(args))),
            )
        })
    }

    fn check(&self, args: &[String], status: ExitStatus) -> Result<()> {
        if status.success() {
            Ok(())
        } else {
            Err(ForgeError::Process {
                command: self.describe(args),
                code: status.code(),
            })
        }
    }

    /// Run with output passed through to the operator's terminal.
    pub async fn run(&self, args: &[String]) -> Result<()> {
        tracing::debug!(runtime = %self.kind, args = ?args, "Running");
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let mut child = self.spawn(cmd, args)?;

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = self.cancel.cancelled() => None,
        };
        match status {
            Some(status) => self.check(args, status),
            None => {
                let _ = child.kill().await;
                Err(ForgeError::Cancelled)
            }
        }
    }

    /// Run with the normalized context tar streamed to stdin. The tar is
    /// produced on a blocking thread and pumped through a bounded channel,
    /// so the context is never held in memory as a whole.
    pub async fn run_with_context(&self, args: &[String], input: &ContextSnapshot) -> Result<()> {
        tracing::debug!(runtime = %self.kind, args = ?args, bytes = input.total_size(), "Running with context");
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let mut child = self.spawn(cmd, args)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForgeError::Other(anyhow::anyhow!("child stdin was not piped")))?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CONTEXT_CHANNEL_DEPTH);
        let snapshot = input.clone();
        let producer = tokio::task::spawn_blocking(move || {
            snapshot.write_tar(ChannelWriter::new(tx))
        });

        let pump = async move {
            while let Some(chunk) = rx.recv().await {
                stdin.write_all(&chunk).await?;
            }
            stdin.shutdown().await?;
            Ok::<(), io::Error>(())
        };

        let finished = tokio::select! {
            done = async {
                let pumped = pump.await;
                let status = child.wait().await;
                (pumped, status)
            } => Some(done),
            _ = self.cancel.cancelled() => None,
        };

        let Some((pumped, status)) = finished else {
            let _ = child.kill().await;
            return Err(ForgeError::Cancelled);
        };

        // a failing builder closes stdin early; its exit status is the
        // meaningful error, not the broken pipe
        self.check(args, status?)?;

        // a builder that exited cleanly may stop reading before the end
        match pumped {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!(runtime = %self.kind, "Builder closed stdin before the context ended");
            }
            other => other?,
        }
        let produced = producer
            .await
            .map_err(|e| ForgeError::Other(anyhow::anyhow!("context writer panicked: {}", e)))?;
        match produced {
            Err(ForgeError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    }

    /// Build under `staging` alone and move `tags` onto the image only after
    /// the streamed context matched its records. The staging tag is removed
    /// either way.
    pub async fn build_staged(
        &self,
        args: &[String],
        input: &ContextSnapshot,
        staging: &str,
        tags: &[String],
    ) -> Result<()> {
        let mut result = self.run_with_context(args, input).await;
        if result.is_ok() {
            for tag in tags {
                if let Err(e) = self.tag(staging, tag).await {
                    result = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = self.untag(staging).await {
            tracing::debug!(runtime = %self.kind, tag = staging, error = %e, "Staging tag not removed");
        }
        result
    }

    /// `image inspect`, mapping "no such image" to `None`.
    pub async fn inspect(&self, reference: &str) -> Result<Option<ImageInfo>> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            reference.to_string(),
        ];
        let mut cmd = self.command(&args);
        cmd.stdin(Stdio::null());

        let output = tokio::select! {
            output = cmd.output() => output.map_err(|e| {
                ForgeError::Other(anyhow::Error::new(e).context(format!(
                    "failed to start {}",
                    self.describe(&args)
                )))
            })?,
            _ = self.cancel.cancelled() => return Err(ForgeError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image(&stderr) {
                return Ok(None);
            }
            tracing::warn!(runtime = %self.kind, reference, stderr = %stderr.trim(), "image inspect failed");
            return Err(ForgeError::Process {
                command: "image inspect".to_string(),
                code: output.status.code(),
            });
        }

        let infos: Vec<ImageInfo> = serde_json::from_slice(&output.stdout)?;
        Ok(infos.into_iter().next())
    }

    pub async fn pull(&self, src: &str, as_tag: &str) -> Result<()> {
        self.run(&["pull".to_string(), src.to_string()]).await?;
        if src != as_tag {
            self.tag(src, as_tag).await?;
        }
        Ok(())
    }

    pub async fn tag(&self, src: &str, as_tag: &str) -> Result<()> {
        self.run(&["tag".to_string(), src.to_string(), as_tag.to_string()])
            .await
    }

    /// Drop one tag. The image itself goes once nothing else references it.
    pub async fn untag(&self, tag: &str) -> Result<()> {
        self.run(&["image".to_string(), "rm".to_string(), tag.to_string()])
            .await
    }

    pub async fn push(&self, tag: &str) -> Result<()> {
        self.run(&["push".to_string(), tag.to_string()]).await
    }

    pub async fn run_script(&self, image: &str, mount: &Path, script: &str) -> Result<()> {
        self.run(&run_script_args(image, mount, script)).await
    }
}

/// A tag unique to one build attempt of the context with `digest`.
pub fn staging_tag(digest: &str) -> String {
    format!(
        "{}:{}-{:08x}",
        STAGING_REPOSITORY,
        short_digest(digest),
        rand::random::<u32>()
    )
}

/// `run` arguments for an extraction script. The image's entrypoint is
/// replaced so the script runs regardless of how the image is configured.
pub fn run_script_args(image: &str, mount: &Path, script: &str) -> Vec<String> {
    vec![
        "run".to_string(),
        "--rm".to_string(),
        "--entrypoint".to_string(),
        "/bin/sh".to_string(),
        "-v".to_string(),
        format!("{}:{}", mount.display(), ARTIFACTS_MOUNT),
        image.to_string(),
        "-c".to_string(),
        script.to_string(),
    ]
}

/// Arguments shared by every runtime's `build`: dockerfile, tags, labels and
/// build args (sorted by key), then `-` for a context on stdin.
pub fn build_args(
    dockerfile: &str,
    tags: &[String],
    labels: &BTreeMap<String, String>,
    build_args: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec!["-f".to_string(), dockerfile.to_string()];
    for tag in tags {
        args.push("-t".to_string());
        args.push(tag.clone());
    }
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("-".to_string());
    args
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such image")
        || stderr.contains("image not known")
        || stderr.contains("no such object")
}

/// `Write` adapter that forwards fixed-size chunks into a tokio channel from
/// a blocking thread. A closed receiver surfaces as `BrokenPipe`.
pub struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CONTEXT_CHUNK_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CONTEXT_CHUNK_SIZE));
        self.tx
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "context reader went away"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CONTEXT_CHUNK_SIZE - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == CONTEXT_CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
