//! Uniform handles for running shell tasks on a host: over ssh, or on localhost.

use super::child::{Channel, ChildInput, Interrupter};
use super::Error;

use std::io;
use std::process::ExitStatus;

use tokio::process::{self, ChildStderr, ChildStdout};

mod local;
pub use local::LocalhostClient;

mod remote;
pub use remote::RemoteClient;

macro_rules! delegate {
    ($impl:expr, $var:ident, $then:block) => {{
        match $impl {
            Client::Remote($var) => $then,
            Client::Local($var) => $then,
        }
    }};
}

/// Lifecycle of a client.
///
/// `connect` and `close` govern the transport; `run` and `wait` govern a session nested in
/// it, which can repeat any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No transport yet.
    Unconnected,
    /// Transport up, no session.
    Connected,
    /// A session is being opened.
    SessionOpen,
    /// A session is running a command.
    Running,
    /// Transport torn down.
    Closed,
}

/// A host that tasks can be run on.
#[derive(Debug)]
pub enum Client {
    /// A host reached over ssh.
    Remote(RemoteClient),
    /// The machine this runs on.
    Local(LocalhostClient),
}

impl From<RemoteClient> for Client {
    fn from(c: RemoteClient) -> Self {
        Client::Remote(c)
    }
}

impl From<LocalhostClient> for Client {
    fn from(c: LocalhostClient) -> Self {
        Client::Local(c)
    }
}

impl Client {
    /// Establish the transport to `host` (`[user@]host[:port]`).
    pub async fn connect(&mut self, host: &str) -> Result<(), Error> {
        delegate!(self, imp, { imp.connect(host).await })
    }

    /// Start `command` in a new session, prefixed with the client's environment exports.
    ///
    /// If `stdin` is set, the session's input is piped and available through
    /// [`stdin`](Client::stdin); otherwise it reads from `/dev/null`.
    pub async fn run(&mut self, command: &str, stdin: bool, tty: bool) -> Result<(), Error> {
        delegate!(self, imp, { imp.run(command, stdin, tty).await })
    }

    /// Wait for the running session's process to exit, then close the session.
    pub async fn wait(&mut self) -> Result<(), Error> {
        delegate!(self, imp, { imp.wait().await })
    }

    /// Tear down the transport.
    pub async fn close(&mut self) -> Result<(), Error> {
        delegate!(self, imp, { imp.close().await })
    }

    /// Forward an interrupt to the running session, if any.
    pub async fn signal(&self) {
        if let Some(i) = self.interrupter() {
            i.interrupt().await;
        }
    }

    /// A handle that forwards interrupts to the running session, usable while the client is
    /// being waited on.
    pub fn interrupter(&self) -> Option<Interrupter> {
        delegate!(self, imp, { imp.interrupter() })
    }

    /// Kill the local end of the running session without reaping it.
    pub(crate) async fn kill(&mut self) {
        delegate!(self, imp, { imp.process_mut().kill().await })
    }

    /// Input of the running session, if it was requested.
    pub fn stdin(&mut self) -> &mut Option<ChildInput> {
        delegate!(self, imp, { &mut imp.process_mut().stdin })
    }

    /// Output of the running session.
    pub fn stdout(&mut self) -> &mut Option<ChildStdout> {
        delegate!(self, imp, { &mut imp.process_mut().stdout })
    }

    /// Error output of the running session.
    pub fn stderr(&mut self) -> &mut Option<ChildStderr> {
        delegate!(self, imp, { &mut imp.process_mut().stderr })
    }

    /// Display label (`user@host`) and its length.
    pub fn prefix(&self) -> (&str, usize) {
        let label = delegate!(self, imp, { imp.label() });
        (label, label.len())
    }

    /// Where the client is in its lifecycle.
    pub fn state(&self) -> State {
        delegate!(self, imp, { imp.state() })
    }
}

/// The session currently open on a client: its process and whatever streams have not been
/// handed out yet.
#[derive(Debug, Default)]
pub(crate) struct Process {
    channel: Option<Channel>,
    pub(crate) stdin: Option<ChildInput>,
    pub(crate) stdout: Option<ChildStdout>,
    pub(crate) stderr: Option<ChildStderr>,
    pub(crate) interrupt: Option<Interrupter>,
}

impl Process {
    fn start(&mut self, cmd: &mut process::Command, stdin: bool) -> io::Result<()> {
        let (channel, input, stdout, stderr) = Channel::spawn(cmd, stdin)?;
        self.channel = Some(channel);
        self.stdin = input;
        self.stdout = stdout;
        self.stderr = stderr;
        self.interrupt = None;
        Ok(())
    }

    pub(crate) fn id(&self) -> Option<u32> {
        self.channel.as_ref().and_then(Channel::id)
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        // close our end of stdin first, so the process cannot block on us while we wait on it
        if let Some(stdin) = self.stdin.take() {
            let _ = stdin.close().await;
        }
        let channel = self.channel.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no session to wait on")
        })?;
        // the channel stays in place until reaped, so a cancelled wait can still be killed
        let status = channel.wait().await;
        self.channel = None;
        self.interrupt = None;
        self.stdout = None;
        self.stderr = None;
        status
    }

    async fn kill(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.kill().await;
        }
        self.stdin = None;
        self.interrupt = None;
    }

    fn interrupter(&self) -> Option<Interrupter> {
        self.channel.as_ref()?;
        self.interrupt.clone()
    }
}

/// `env` and `command` joined into the text a shell runs.
pub(crate) fn with_env(env: &str, command: &str) -> String {
    if env.is_empty() {
        command.to_owned()
    } else {
        format!("{} {}", env, command)
    }
}
