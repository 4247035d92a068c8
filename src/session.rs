use super::{Credentials, Error, HostSpec, SessionOptions};

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Stdio;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process;

/// An established ssh transport to one host.
///
/// Behind the scenes this is an OpenSSH `ControlMaster` running in the background. Every
/// [`channel`](Session::channel) is a new `ssh` invocation multiplexed over the master's control
/// socket, so authentication happens exactly once per host.
///
/// When the `Session` is dropped, the master is told to exit and any errors are silently
/// ignored. To disconnect and be alerted to errors, use [`close`](Session::close).
#[derive(Debug)]
pub struct Session {
    ctl: Option<TempDir>,
    ctl_path: Box<Path>,
    addr: Box<str>,
    master_log: Box<Path>,
}

impl Session {
    /// Start a master connection to `spec`.
    ///
    /// If `proxy` is given, it is used as the `ProxyCommand` that carries the transport, see
    /// [`Bastion`](crate::Bastion).
    pub async fn connect(
        spec: &HostSpec,
        options: &SessionOptions,
        credentials: &Credentials,
        proxy: Option<&str>,
    ) -> Result<Self, Error> {
        let dir = options.build_tempdir()?;
        let ctl_path = dir.path().join("master");
        let log = dir.path().join("log");

        let mut init = process::Command::new("ssh");

        init.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .arg("-E")
            .arg(&log)
            .arg("-S")
            .arg(&ctl_path)
            .arg("-M")
            .arg("-f")
            .arg("-N")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(options.known_hosts_check.as_option());

        if let Some(ref timeout) = options.connect_timeout {
            init.arg("-o").arg(format!("ConnectTimeout={}", timeout));
        }

        if let Some(ref interval) = options.server_alive_interval {
            init.arg("-o")
                .arg(format!("ServerAliveInterval={}", interval));
        }

        if let Some(ref k) = options.keyfile {
            // if the operator gives a keyfile, _only_ use that keyfile
            init.arg("-o").arg("IdentitiesOnly=yes");
            init.arg("-i").arg(k);
        } else {
            init.args(credentials.ssh_args());
        }

        if let Some(ref config_file) = options.config_file {
            init.arg("-F").arg(config_file);
        }

        if let Some(proxy) = proxy {
            init.arg("-o").arg(format!("ProxyCommand={}", proxy));
        }

        init.arg("-p")
            .arg(spec.port.to_string())
            .arg("-l")
            .arg(&spec.user)
            .arg(&spec.host);

        tracing::debug!(host = %spec, bastion = proxy.is_some(), "starting ssh master");

        // we spawn and immediately wait, because the process is supposed to fork.
        // note that we cannot use .output, since it _also_ tries to read all of stderr.
        // if the call _didn't_ error, then the backgrounded ssh client may still hold onto
        // that handle, and it's still running, so that read would hang indefinitely.
        let connect_err = |e: io::Error| Error::Connect {
            user: spec.user.clone(),
            host: spec.address(),
            source: e,
        };
        let mut child = init.spawn().map_err(connect_err)?;
        let stderr = child.stderr.take();
        let status = child.wait().await.map_err(connect_err)?;

        if !status.success() {
            let mut err = String::new();
            if let Some(mut stderr) = stderr {
                stderr
                    .read_to_string(&mut err)
                    .await
                    .map_err(connect_err)?;
            }
            if err.trim().is_empty() {
                err = fs::read_to_string(&log).unwrap_or_default();
            }
            return Err(Error::interpret_ssh_error(
                &spec.user,
                &spec.address(),
                &err,
            ));
        }

        Ok(Self {
            ctl: Some(dir),
            ctl_path: ctl_path.into_boxed_path(),
            addr: spec.host.as_str().into(),
            master_log: log.into_boxed_path(),
        })
    }

    pub(crate) fn ctl_path(&self) -> &Path {
        &self.ctl_path
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// Name of this transport's control directory, unique among the transports open on this
    /// machine.
    pub(crate) fn token(&self) -> String {
        self.ctl_path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from(".fanout"))
    }

    fn new_std_cmd(&self, args: &[impl AsRef<OsStr>]) -> std::process::Command {
        let mut cmd = std::process::Command::new("ssh");
        cmd.stdin(Stdio::null())
            .arg("-S")
            .arg(&*self.ctl_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .args(args)
            .arg(&*self.addr);
        cmd
    }

    fn new_cmd(&self, args: &[impl AsRef<OsStr>]) -> process::Command {
        self.new_std_cmd(args).into()
    }

    /// Check the status of the master connection.
    pub async fn check(&self) -> Result<(), Error> {
        let check = self
            .new_cmd(&["-O", "check"])
            .output()
            .await
            .map_err(Error::Ssh)?;

        if let Some(255) = check.status.code() {
            if let Some(master_error) = self.discover_master_error() {
                Err(master_error)
            } else {
                Err(Error::Disconnected {
                    host: self.addr.to_string(),
                })
            }
        } else {
            Ok(())
        }
    }

    /// Build the local `ssh` process that runs `command` in a new channel of this transport.
    ///
    /// `command` is handed to the remote login shell as-is. If `tty` is set, a pseudo-terminal
    /// is forced for the channel.
    pub(crate) fn channel(&self, command: &str, tty: bool) -> process::Command {
        // NOTE: we pass -p 9 nine here (the "discard" port) to ensure that ssh does not
        // succeed in establishing a _new_ connection if the master connection has failed.
        let mut cmd = self.new_cmd(&[if tty { "-tt" } else { "-T" }, "-p", "9"]);
        cmd.arg("--").arg(command);
        cmd
    }

    /// Terminate the master connection.
    pub async fn close(mut self) -> Result<(), Error> {
        let mut exit_cmd = self.new_cmd(&["-O", "exit"]);

        // Take self.ctl so that drop would do nothing
        let ctl = match self.ctl.take() {
            Some(ctl) => ctl,
            None => return Err(Error::AlreadyClosed(self.addr.to_string())),
        };

        let exit = exit_cmd.output().await.map_err(Error::Ssh)?;

        if let Some(master_error) = self.discover_master_error() {
            return Err(master_error);
        }

        // the -O exit command failed, but the master did not log an error either. the most
        // likely cause is the remote end cleanly closing the connection, which is what we
        // asked for.
        if !exit.status.success() {
            let exit_err = String::from_utf8_lossy(&exit.stderr);
            tracing::debug!(host = %self.addr, "ssh -O exit: {}", exit_err.trim());
        }

        ctl.close().map_err(Error::Cleanup)?;

        Ok(())
    }

    fn discover_master_error(&self) -> Option<Error> {
        let err = match fs::read_to_string(&self.master_log) {
            Ok(err) => err,
            Err(e) => return Some(Error::Master(e)),
        };
        let mut stderr = err.trim();

        stderr = stderr.strip_prefix("ssh: ").unwrap_or(stderr);

        if stderr.starts_with("Warning: Permanently added ") {
            stderr = stderr.split_once('\n').map(|x| x.1.trim()).unwrap_or("");
        }

        if stderr.is_empty() {
            return None;
        }

        let kind = if stderr.contains("Connection to") && stderr.contains("closed by remote host") {
            io::ErrorKind::ConnectionAborted
        } else {
            io::ErrorKind::Other
        };

        Some(Error::Master(io::Error::new(kind, stderr)))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Keep tempdir alive until the master is gone
        let _ctl = match self.ctl.take() {
            Some(ctl) => ctl,
            // close must have already been called.
            None => return,
        };

        let _res = self
            .new_std_cmd(&["-O", "exit"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}
