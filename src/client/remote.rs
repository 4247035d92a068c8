use super::super::child::{check_status, Interrupter};
use super::super::{Bastion, Credentials, Error, HostSpec, Session, SessionOptions};
use super::{with_env, Process, State};

use std::sync::Arc;

/// Runs tasks on a host reached over ssh.
///
/// One transport is established by `connect` and reused by every `run`; each run opens a new
/// channel over it.
#[derive(Debug)]
pub struct RemoteClient {
    env: String,
    options: Arc<SessionOptions>,
    credentials: Arc<Credentials>,
    bastion: Option<Arc<Bastion>>,
    label: String,
    session: Option<Session>,
    state: State,
    process: Process,
    runs: u64,
}

impl RemoteClient {
    /// A client whose commands are prefixed with `env`.
    ///
    /// If `bastion` is given, the transport is dialed through it instead of directly.
    pub fn new(
        env: impl Into<String>,
        options: Arc<SessionOptions>,
        credentials: Arc<Credentials>,
        bastion: Option<Arc<Bastion>>,
    ) -> Self {
        Self {
            env: env.into(),
            options,
            credentials,
            bastion,
            label: String::new(),
            session: None,
            state: State::Unconnected,
            process: Process::default(),
            runs: 0,
        }
    }

    pub(crate) async fn connect(&mut self, host: &str) -> Result<(), Error> {
        if self.state != State::Unconnected {
            return Err(Error::AlreadyConnected(self.label.clone()));
        }

        let spec = HostSpec::parse(host)?;
        self.label = spec.to_string();

        let proxy = match self.bastion {
            Some(ref bastion) => {
                bastion.check().await?;
                tracing::debug!(host = %self.label, bastion = %bastion.spec(), "dialing through");
                Some(bastion.dial_through())
            }
            None => None,
        };
        let session = Session::connect(
            &spec,
            &self.options,
            &self.credentials,
            proxy.as_deref(),
        )
        .await?;

        self.session = Some(session);
        self.state = State::Connected;
        tracing::debug!(host = %self.label, "connected");
        Ok(())
    }

    pub(crate) async fn run(&mut self, command: &str, stdin: bool, tty: bool) -> Result<(), Error> {
        let session = match (self.state, self.session.as_ref()) {
            (State::Connected, Some(session)) => session,
            (State::SessionOpen, _) => return Err(Error::AlreadySessionOpen(self.label.clone())),
            (State::Running, _) => return Err(Error::AlreadyRunning(self.label.clone())),
            _ => return Err(Error::NotConnected(self.label.clone())),
        };

        self.state = State::SessionOpen;
        let pidfile = format!("{}-{}.pid", session.token(), self.runs);
        self.runs += 1;
        let mut cmd = session.channel(&guarded(&pidfile, &with_env(&self.env, command)), tty);

        if let Err(source) = self.process.start(&mut cmd, stdin) {
            self.state = State::Connected;
            return Err(Error::TaskStart {
                host: self.label.clone(),
                command: command.to_owned(),
                source,
            });
        }

        let tty_input = if tty { self.process.stdin.clone() } else { None };
        self.process.interrupt = Some(Interrupter::remote(
            &session.channel(&interrupt_command(&pidfile), false),
            tty_input,
            &self.label,
        ));
        self.state = State::Running;
        tracing::debug!(host = %self.label, command, tty, "channel open");
        Ok(())
    }

    pub(crate) async fn wait(&mut self) -> Result<(), Error> {
        if self.state != State::Running {
            return Err(Error::NotRunning(self.label.clone()));
        }

        let status = self.process.wait().await;
        self.state = State::Connected;
        let status = status.map_err(|source| Error::ChildIo {
            stream: "ssh channel",
            source,
        })?;

        tracing::debug!(host = %self.label, %status, "channel closed");
        check_status(&self.label, status, true)
    }

    pub(crate) async fn close(&mut self) -> Result<(), Error> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Err(Error::AlreadyClosed(self.label.clone())),
        };

        self.process.kill().await;
        self.process = Process::default();
        self.state = State::Closed;
        tracing::debug!(host = %self.label, "closing");
        session.close().await
    }

    pub(crate) fn interrupter(&self) -> Option<Interrupter> {
        self.process.interrupter()
    }

    pub(crate) fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }
}

/// Wrap `command` so that [`interrupt_command`] can reach it from another channel.
///
/// The remote login shell leads the process group of its session; it records its pid, runs
/// `command` in a subshell, and survives the interrupt so the command's own exit status comes
/// back: 130 when the interrupt killed it, or whatever it exits with if it handles SIGINT.
fn guarded(pidfile: &str, command: &str) -> String {
    format!(
        "__fanout_pid=\"${{TMPDIR:-/tmp}}/{}\"; echo $$ > \"$__fanout_pid\"; trap : INT; (\n{}\n); \
         __fanout_status=$?; rm -f \"$__fanout_pid\"; exit $__fanout_status",
        pidfile, command
    )
}

/// SIGINT the process group of the command [`guarded`] with the same `pidfile`, if it still runs.
fn interrupt_command(pidfile: &str) -> String {
    format!(
        "__fanout_pid=\"${{TMPDIR:-/tmp}}/{}\"; test -f \"$__fanout_pid\" && \
         kill -s INT -- -\"$(cat \"$__fanout_pid\")\"",
        pidfile
    )
}

#[cfg(test)]
mod tests {
    use super::super::Client;
    use super::*;

    use std::time::{Duration, Instant};

    fn client() -> Client {
        RemoteClient::new(
            "",
            Arc::new(SessionOptions::default()),
            Arc::new(Credentials::Default),
            None,
        )
        .into()
    }

    #[tokio::test]
    async fn unconnected_guards() {
        let mut c = client();
        assert!(matches!(
            c.run("true", false, false).await,
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(c.wait().await, Err(Error::NotRunning(_))));
        assert!(matches!(c.close().await, Err(Error::AlreadyClosed(_))));
        assert!(c.interrupter().is_none());
    }

    /// Run `command` guarded, the way sshd would: in a shell leading its own process group.
    /// Interrupt it from the side once it runs if `interrupt` is set. Returns the exit status and
    /// whether the pid file was left behind.
    async fn guarded_locally(command: &str, interrupt: bool) -> (i32, bool) {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = tmp.path().join("t-0.pid");

        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(guarded("t-0.pid", command))
            .env("TMPDIR", tmp.path())
            .process_group(0)
            .spawn()
            .unwrap();

        if interrupt {
            while !pidfile.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            let sent = tokio::process::Command::new("bash")
                .arg("-c")
                .arg(interrupt_command("t-0.pid"))
                .env("TMPDIR", tmp.path())
                .status()
                .await
                .unwrap();
            assert!(sent.success());
        }

        let status = child.wait().await.unwrap();
        (status.code().unwrap(), pidfile.exists())
    }

    #[tokio::test]
    async fn guarded_command_keeps_its_status() {
        assert_eq!(guarded_locally("exit 3", false).await, (3, false));
        assert_eq!(guarded_locally("true", false).await, (0, false));
    }

    #[tokio::test]
    async fn interrupt_reaches_the_guarded_command() {
        let start = Instant::now();
        assert_eq!(guarded_locally("sleep 30", true).await, (130, false));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn guarded_command_may_handle_the_interrupt() {
        assert_eq!(
            guarded_locally("trap 'exit 15' INT; while :; do sleep 0.1; done", true).await,
            (15, false)
        );
    }

    #[tokio::test]
    async fn interrupt_after_exit_is_harmless() {
        let tmp = tempfile::tempdir().unwrap();
        let status = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(interrupt_command("gone.pid"))
            .env("TMPDIR", tmp.path())
            .status()
            .await
            .unwrap();
        // `test -f` fails; nothing is signalled
        assert_eq!(status.code(), Some(1));
    }

    #[tokio::test]
    async fn bad_destination_is_rejected_before_dialing() {
        let mut c = client();
        assert!(c.connect("ssh://user@host:notaport").await.is_err());
        assert_eq!(c.state(), State::Unconnected);
    }
}
