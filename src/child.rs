use super::Error;

use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process;
use tokio::sync::Mutex;

/// ETX, what a terminal sends for ^C.
const INTERRUPT_BYTE: u8 = 0x03;

/// The local process behind one session of a client: a shell for localhost, or an `ssh`
/// channel multiplexed over the master connection for a remote host.
#[derive(Debug)]
pub(crate) struct Channel {
    child: Option<process::Child>,
}

impl Channel {
    /// Spawn `cmd` with piped stdout/stderr, and stdin piped if `stdin` is set.
    pub(crate) fn spawn(
        cmd: &mut process::Command,
        stdin: bool,
    ) -> io::Result<(
        Self,
        Option<ChildInput>,
        Option<process::ChildStdout>,
        Option<process::ChildStderr>,
    )> {
        cmd.stdin(if stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // the terminal's ^C goes to the runner only, which forwards it explicitly
        .process_group(0)
        // dropping the channel disconnects it, but does not kill a remote process
        .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let input = child.stdin.take().map(ChildInput::new);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok((Self { child: Some(child) }, input, stdout, stderr))
    }

    pub(crate) fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "channel already reaped",
            )),
        }
    }

    /// Kill the process and everything it started, then reap it.
    pub(crate) async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                // SAFETY: kill(2) has no memory-safety preconditions.
                unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            }
            let _ = child.kill().await;
        }
    }
}

/// Turn the exit status of a session into a result.
///
/// Over ssh, 255 is what `ssh` itself exits with when the transport fails, so it is reported
/// as a disconnect rather than as the remote command's status.
pub(crate) fn check_status(host: &str, status: ExitStatus, over_ssh: bool) -> Result<(), Error> {
    if status.success() {
        return Ok(());
    }

    match (status.code(), status.signal()) {
        (Some(255), _) if over_ssh => Err(Error::Disconnected {
            host: host.to_owned(),
        }),
        (Some(code), _) => Err(Error::RemoteExit {
            host: host.to_owned(),
            status: code,
        }),
        (None, Some(sig)) => Err(Error::RemoteExit {
            host: host.to_owned(),
            status: 128 + sig,
        }),
        (None, None) => Err(Error::RemoteExit {
            host: host.to_owned(),
            status: 1,
        }),
    }
}

/// Standard input of a running session.
///
/// Cloning yields another handle to the same pipe, so that the stdin fan-out and interrupt
/// forwarding can both write to it.
#[derive(Debug, Clone)]
pub struct ChildInput(Arc<Mutex<Option<process::ChildStdin>>>);

impl ChildInput {
    fn new(stdin: process::ChildStdin) -> Self {
        Self(Arc::new(Mutex::new(Some(stdin))))
    }

    /// Write all of `buf`, failing if the input was already closed.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.0.lock().await;
        match guard.as_mut() {
            Some(stdin) => {
                stdin.write_all(buf).await?;
                stdin.flush().await
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdin already closed",
            )),
        }
    }

    /// Close the input, signalling EOF to the process.
    pub async fn close(&self) -> io::Result<()> {
        if let Some(mut stdin) = self.0.lock().await.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }
}

/// Forwards an interrupt to the session a client is running.
///
/// Obtained from a client right after [`run`](crate::Client::run); stays valid until the
/// session is reaped.
#[derive(Debug, Clone)]
pub struct Interrupter {
    target: Target,
    label: String,
}

#[derive(Debug, Clone)]
enum Target {
    /// A local process group, led by the session's process.
    Group(u32),
    /// A remote command, interrupted from a second channel over the same transport.
    ///
    /// Signalling the local `ssh` would only make the mux client hang up on its channel.
    Remote {
        program: OsString,
        args: Vec<OsString>,
        tty: Option<ChildInput>,
    },
}

impl Interrupter {
    pub(crate) fn group(pid: u32, label: &str) -> Self {
        Self {
            target: Target::Group(pid),
            label: label.to_owned(),
        }
    }

    /// `via` runs the interrupt on the remote host; `tty` is the input of a session that has a
    /// pseudo-terminal, where ^C is delivered as well.
    pub(crate) fn remote(via: &process::Command, tty: Option<ChildInput>, label: &str) -> Self {
        let via = via.as_std();
        Self {
            target: Target::Remote {
                program: via.get_program().to_owned(),
                args: via.get_args().map(OsString::from).collect(),
                tty,
            },
            label: label.to_owned(),
        }
    }

    /// Best-effort: SIGINT the whole process group of a local session, or of the remote
    /// command of a remote one.
    pub async fn interrupt(&self) {
        tracing::debug!(host = %self.label, "forwarding interrupt");
        match self.target {
            Target::Group(pid) => {
                // SAFETY: kill(2) has no memory-safety preconditions.
                let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGINT) };
                if rc != 0 {
                    tracing::debug!(
                        host = %self.label,
                        "kill: {}",
                        io::Error::last_os_error()
                    );
                }
            }
            Target::Remote {
                ref program,
                ref args,
                ref tty,
            } => {
                if let Some(input) = tty {
                    let _ = input.write_all(&[INTERRUPT_BYTE]).await;
                }
                let sent = process::Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .process_group(0)
                    .output()
                    .await;
                match sent {
                    Ok(out) if out.status.success() => {}
                    Ok(out) => tracing::debug!(
                        host = %self.label,
                        status = %out.status,
                        "remote interrupt: {}",
                        String::from_utf8_lossy(&out.stderr).trim()
                    ),
                    Err(e) => tracing::debug!(host = %self.label, "remote interrupt: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert!(check_status("h", ExitStatus::from_raw(0), true).is_ok());

        // wait(2) encoding: exit code in the high byte
        let e = check_status("h", ExitStatus::from_raw(3 << 8), true).unwrap_err();
        assert!(matches!(e, Error::RemoteExit { status: 3, .. }));

        let e = check_status("h", ExitStatus::from_raw(255 << 8), true).unwrap_err();
        assert!(matches!(e, Error::Disconnected { .. }));

        let e = check_status("h", ExitStatus::from_raw(255 << 8), false).unwrap_err();
        assert!(matches!(e, Error::RemoteExit { status: 255, .. }));

        // killed by SIGTERM
        let e = check_status("h", ExitStatus::from_raw(15), false).unwrap_err();
        assert!(matches!(e, Error::RemoteExit { status: 143, .. }));
    }

    #[tokio::test]
    async fn input_close_is_eof() {
        let mut cmd = process::Command::new("cat");
        let (mut channel, input, stdout, _stderr) = Channel::spawn(&mut cmd, true).unwrap();
        let input = input.unwrap();
        input.write_all(b"hello").await.unwrap();
        input.close().await.unwrap();
        assert!(input.write_all(b"again").await.is_err());

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stdout.unwrap(), &mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello");
        assert!(channel.wait().await.unwrap().success());
    }
}
