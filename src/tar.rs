//! Uploads, as a `tar` stream piped from a local process into a remote one.
//!
//! ```text
//! tar -C . -czf - <src> | ssh <host> 'tar -C "<dst>" -xzf -'
//! ```

use super::Error;

use core::pin::Pin;
use core::task::{Context, Poll};

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process;

/// Command that unpacks a tar stream read from stdin into `dst` on the target host.
pub fn remote_tar_command(dst: &str) -> String {
    format!("tar -C \"{}\" -xzf -", dst)
}

/// A local tar producer for one upload, spawned when the task that consumes it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarSource {
    cwd: PathBuf,
    path: String,
    excludes: Vec<String>,
}

impl TarSource {
    /// Archive `path`, relative to `cwd`, skipping the comma-separated `exclude` patterns.
    pub fn new(cwd: impl AsRef<Path>, path: impl Into<String>, exclude: &str) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            path: path.into(),
            excludes: exclude
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    /// Arguments passed to the local `tar`.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self
            .excludes
            .iter()
            .map(|e| format!("--exclude={}", e).into())
            .collect();
        args.extend(["-C", ".", "-czf", "-"].iter().map(OsString::from));
        args.push(self.path.clone().into());
        args
    }

    /// Start `tar` and stream its stdout.
    pub fn spawn(&self) -> Result<TarStream, Error> {
        let mut child = process::Command::new("tar")
            .args(self.args())
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TaskStart {
                host: String::from("localhost"),
                command: format!("tar {}", self.path),
                source: e,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| Error::ChildIo {
            stream: "tar stdout",
            source: io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"),
        })?;

        tracing::debug!(path = %self.path, "tar started");
        Ok(TarStream {
            stdout,
            child,
            path: self.path.clone(),
        })
    }
}

/// The archive produced by a running local `tar`.
///
/// The `tar` process is killed if the stream is dropped before it exits. `tar` still writes a
/// well-formed archive when it cannot read its source, so once the stream is exhausted call
/// [`finish`](TarStream::finish) to learn whether the archive is complete.
#[pin_project]
#[derive(Debug)]
pub struct TarStream {
    #[pin]
    stdout: process::ChildStdout,
    child: process::Child,
    path: String,
}

impl TarStream {
    /// Reap `tar` and fail unless it exited successfully.
    pub async fn finish(self) -> Result<(), Error> {
        let TarStream {
            stdout,
            mut child,
            path,
        } = self;
        drop(stdout);

        let status = child.wait().await.map_err(|source| Error::ChildIo {
            stream: "tar",
            source,
        })?;
        if !status.success() {
            return Err(Error::Archive { path, status });
        }
        tracing::debug!(%path, "tar finished");
        Ok(())
    }
}

impl AsyncRead for TarStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        self.project().stdout.poll_read(cx, buf)
    }
}
