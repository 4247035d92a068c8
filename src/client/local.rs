use super::super::child::{check_status, Interrupter};
use super::super::{current_user, Error};
use super::{with_env, Process, State};

use tokio::process;

/// Runs tasks in a local `bash`.
///
/// There is no transport to speak of: `connect` only records the user, and every `run` spawns
/// a fresh shell with the client's environment exports prepended.
#[derive(Debug)]
pub struct LocalhostClient {
    env: String,
    label: String,
    state: State,
    process: Process,
}

impl LocalhostClient {
    /// A client whose commands are prefixed with `env`, usually an
    /// [`EnvList::as_export`](crate::EnvList::as_export) rendering.
    pub fn new(env: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            label: String::from("localhost"),
            state: State::Unconnected,
            process: Process::default(),
        }
    }

    pub(crate) async fn connect(&mut self, _host: &str) -> Result<(), Error> {
        if self.state != State::Unconnected {
            return Err(Error::AlreadyConnected(self.label.clone()));
        }
        self.label = format!("{}@localhost", current_user());
        self.state = State::Connected;
        tracing::debug!(host = %self.label, "connected");
        Ok(())
    }

    pub(crate) async fn run(&mut self, command: &str, stdin: bool, _tty: bool) -> Result<(), Error> {
        match self.state {
            State::Connected => {}
            State::SessionOpen => return Err(Error::AlreadySessionOpen(self.label.clone())),
            State::Running => return Err(Error::AlreadyRunning(self.label.clone())),
            State::Unconnected | State::Closed => {
                return Err(Error::NotConnected(self.label.clone()))
            }
        }

        self.state = State::SessionOpen;
        let mut cmd = process::Command::new("bash");
        cmd.arg("-c").arg(with_env(&self.env, command));

        if let Err(source) = self.process.start(&mut cmd, stdin) {
            self.state = State::Connected;
            return Err(Error::TaskStart {
                host: self.label.clone(),
                command: command.to_owned(),
                source,
            });
        }

        self.process.interrupt = self
            .process
            .id()
            .map(|pid| Interrupter::group(pid, &self.label));
        self.state = State::Running;
        tracing::debug!(host = %self.label, command, "started");
        Ok(())
    }

    pub(crate) async fn wait(&mut self) -> Result<(), Error> {
        if self.state != State::Running {
            return Err(Error::NotRunning(self.label.clone()));
        }

        let status = self.process.wait().await;
        self.state = State::Connected;
        let status = status.map_err(|source| Error::ChildIo {
            stream: "bash",
            source,
        })?;

        tracing::debug!(host = %self.label, %status, "finished");
        check_status(&self.label, status, false)
    }

    pub(crate) async fn close(&mut self) -> Result<(), Error> {
        if self.state == State::Closed {
            return Err(Error::AlreadyClosed(self.label.clone()));
        }
        self.process.kill().await;
        self.process = Process::default();
        self.state = State::Closed;
        Ok(())
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
