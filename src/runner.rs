//! Running commands across a network.

use super::child::{ChildInput, Interrupter};
use super::prefix::{copy_prefixed, render, Output};
use super::task::{build_tasks, Task, TaskClients, TaskInput};
use super::{
    current_user, Bastion, Client, Command, Credentials, EnvList, Error, LocalhostClient, Network,
    RemoteClient, SessionOptions,
};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, select, try_join_all, Either};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Exit status that does not fail a run unless configured otherwise.
///
/// Commands that get interrupted on purpose, for instance by a forwarded `SIGTERM`, commonly
/// exit with it.
///
/// A forwarded ^C reaches the whole process group of every running command. A command that
/// does not handle it exits with 130 (`128 + SIGINT`), which ends the run with that status; a
/// command that traps it and exits with the recoverable status lets the run go on.
pub const DEFAULT_RECOVERABLE_EXIT: i32 = 15;

const INPUT_CHUNK: usize = 32 * 1024;

/// Knobs for a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Exit status of a host that is logged instead of failing the run.
    pub recoverable_exit: i32,
    /// Start every output line with the host's label.
    pub prefix: bool,
    /// Color the labels.
    pub color: bool,
    /// Trace every command with `set -x`.
    pub debug: bool,
    /// Variables applied over both the global and the network environment.
    pub overrides: EnvList,
    /// Transport options for remote hosts.
    pub session: SessionOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            recoverable_exit: DEFAULT_RECOVERABLE_EXIT,
            prefix: true,
            color: false,
            debug: false,
            overrides: EnvList::new(),
            session: SessionOptions::default(),
        }
    }
}

/// Runs commands on every host of a network.
///
/// Commands, and the tasks they are made of, run strictly one after the other; each task runs
/// on all of its hosts at once.
pub struct Runner {
    options: RunOptions,
    output: Output,
    input: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("options", &self.options)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// A runner writing to this process's stdout/stderr and reading its stdin.
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            output: Output::default(),
            input: Box::new(tokio::io::stdin()),
        }
    }

    /// Send host output to `output` instead.
    pub fn output(&mut self, output: Output) -> &mut Self {
        self.output = output;
        self
    }

    /// Feed tasks that take stdin from `input` instead.
    pub fn input(&mut self, input: impl AsyncRead + Send + Unpin + 'static) -> &mut Self {
        self.input = Box::new(input);
        self
    }

    /// Run `commands`, in order, on `network`.
    ///
    /// `env` is the global environment; the network's environment and the configured overrides
    /// are applied over it. Every host is connected before anything runs, and every connection
    /// is closed before returning. The first failure on any host ends the run.
    pub async fn run(
        &mut self,
        network: &Network,
        env: &EnvList,
        commands: &[Command],
    ) -> Result<(), Error> {
        if commands.is_empty() {
            return Err(Error::NoCommands);
        }
        if network.hosts.is_empty() {
            return Err(Error::NoHosts(network.name.clone()));
        }

        let env = self.environment(network, env).await?;

        let options = Arc::new(self.options.session.clone());
        let credentials = Arc::new(Credentials::discover());
        tracing::debug!(?credentials, "credentials");

        let bastion = match network.bastion {
            Some(ref bastion) => Some(Arc::new(
                Bastion::connect(bastion, &options, &credentials).await?,
            )),
            None => None,
        };

        let mut clients: Vec<Client> = network
            .hosts
            .iter()
            .map(|host| {
                let mut env = env.clone();
                env.set("FANOUT_HOST", host.as_str());
                if host == "localhost" {
                    LocalhostClient::new(env.as_export()).into()
                } else {
                    RemoteClient::new(
                        env.as_export(),
                        options.clone(),
                        credentials.clone(),
                        bastion.clone(),
                    )
                    .into()
                }
            })
            .collect();

        let connected = join_all(
            clients
                .iter_mut()
                .zip(&network.hosts)
                .map(|(client, host)| client.connect(host)),
        )
        .await;
        if let Some(e) = connected.into_iter().find_map(Result::err) {
            return Err(e);
        }

        let interrupts = Interrupts::default();
        let listener = interrupts.listen();

        let result = self.run_commands(&mut clients, &env, commands, &interrupts).await;

        listener.abort();
        let closed = join_all(clients.iter_mut().map(Client::close)).await;
        for (client, closed) in clients.iter().zip(closed) {
            if let Err(e) = closed {
                tracing::warn!(host = %client.prefix().0, "close: {}", e);
            }
        }
        drop(clients);

        if let Some(bastion) = bastion.and_then(|b| Arc::try_unwrap(b).ok()) {
            let label = bastion.spec().to_string();
            if let Err(e) = bastion.close().await {
                tracing::warn!(bastion = %label, "close: {}", e);
            }
        }

        self.output.flush().await;
        result
    }

    /// The resolved run environment, without the per-host `FANOUT_HOST`.
    async fn environment(&self, network: &Network, global: &EnvList) -> Result<EnvList, Error> {
        let mut env = global.clone();
        env.extend(&network.env);
        env.extend(&self.options.overrides);
        env.resolve_values().await?;

        env.set("FANOUT_NETWORK", network.name.as_str());
        env.set("FANOUT_USER", current_user());
        env.set("FANOUT_TIME", chrono::Local::now().to_rfc3339());
        env.set(
            "FANOUT_ENV",
            self.options
                .overrides
                .iter()
                .map(|v| format!("-e {}", v))
                .collect::<Vec<_>>()
                .join(" "),
        );
        Ok(env)
    }

    async fn run_commands(
        &mut self,
        clients: &mut [Client],
        env: &EnvList,
        commands: &[Command],
        interrupts: &Interrupts,
    ) -> Result<(), Error> {
        let width = clients.iter().map(|c| c.prefix().1).max().unwrap_or(0);

        for cmd in commands {
            let tasks = build_tasks(cmd, clients.len(), env, self.options.debug).await?;
            for task in tasks {
                if interrupts.interrupted.swap(false, Ordering::SeqCst) {
                    return Err(Error::Interrupted);
                }
                tracing::debug!(command = %cmd.name, run = %task.run, "task");
                self.run_task(clients, task, width, interrupts).await?;
            }
        }
        Ok(())
    }

    async fn run_task(
        &mut self,
        clients: &mut [Client],
        task: Task,
        width: usize,
        interrupts: &Interrupts,
    ) -> Result<(), Error> {
        let Task {
            run,
            input,
            clients: assigned,
            tty,
        } = task;

        let mut adhoc = Vec::new();
        let indices = match assigned {
            TaskClients::Hosts(indices) => indices,
            TaskClients::Local(client) => {
                adhoc.push(*client);
                vec![0]
            }
        };
        let pool: &mut [Client] = if adhoc.is_empty() {
            clients
        } else {
            &mut adhoc
        };
        let mut selected: Vec<(usize, &mut Client)> = pool
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| indices.contains(i))
            .collect();

        try_join_all(
            selected
                .iter_mut()
                .map(|(_, client)| client.run(&run, input.is_some(), tty)),
        )
        .await?;

        let mut prefixes = Vec::with_capacity(selected.len());
        let mut copies = Vec::with_capacity(2 * selected.len());
        let mut writers = Vec::new();
        let mut targets = Vec::new();
        for (i, client) in selected.iter_mut() {
            let label = client.prefix().0.to_owned();
            let prefix = if self.options.prefix {
                render(&label, *i, width, self.options.color)
            } else {
                String::new()
            };

            if let Some(stdout) = client.stdout().take() {
                copies.push(tokio::spawn(copy_prefixed(
                    stdout,
                    self.output.stdout(),
                    prefix.clone(),
                    "stdout",
                )));
            }
            if let Some(stderr) = client.stderr().take() {
                copies.push(tokio::spawn(copy_prefixed(
                    stderr,
                    self.output.stderr(),
                    prefix.clone(),
                    "stderr",
                )));
            }
            if let Some(stdin) = client.stdin().clone() {
                writers.push((label.clone(), stdin));
            }
            if let Some(interrupter) = client.interrupter() {
                targets.push(interrupter);
            }
            prefixes.push(prefix);
        }

        interrupts.install(targets).await;

        // a tar feed ends once its hosts are gone; the operator's stdin might never
        let settle_feed = matches!(input, Some(TaskInput::Tar(_)));
        let reader = &mut self.input;
        let feed = async move {
            match input {
                Some(TaskInput::Tar(source)) => match source.spawn() {
                    Ok(mut archive) => {
                        // if every host hung up early, their own exits tell why
                        if fan_out(&mut archive, writers).await {
                            archive.finish().await?;
                        }
                    }
                    Err(e) => {
                        close_all(writers).await;
                        return Err(e);
                    }
                },
                Some(TaskInput::Stdin) => {
                    fan_out(reader, writers).await;
                }
                None => {}
            }
            Ok(())
        };

        let copied = Box::pin(join_all(copies));

        // once every output is closed, stdin has nobody left to feed
        let (copied, fed) = match select(Box::pin(feed), copied).await {
            Either::Left((fed, copied)) => (copied.await, fed),
            Either::Right((copied, feed)) if settle_feed => (copied, feed.await),
            Either::Right((copied, _feed)) => (copied, Ok(())),
        };
        for res in copied {
            match res {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("copying output: {}", e),
                Err(e) => tracing::warn!("output task: {}", e),
            }
        }

        let recoverable = self.options.recoverable_exit;
        let mut failure = fed.err();
        if failure.is_none() {
            let mut waits: FuturesUnordered<_> = selected
                .iter_mut()
                .enumerate()
                .map(|(k, (_, client))| async move { (k, client.wait().await) })
                .collect();

            while let Some((k, result)) = waits.next().await {
                match result {
                    Ok(()) => {}
                    Err(Error::RemoteExit { ref host, status }) if status == recoverable => {
                        tracing::warn!(%host, status, "exit status treated as recoverable");
                        self.output
                            .report(&format!("{}exit {}", prefixes[k], status))
                            .await;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        interrupts.clear().await;

        if let Some(e) = failure {
            // siblings still in flight are not waited for
            for (_, client) in selected.iter_mut() {
                client.kill().await;
            }
            return Err(e);
        }

        for client in adhoc.iter_mut() {
            if let Err(e) = client.close().await {
                tracing::warn!(host = %client.prefix().0, "close: {}", e);
            }
        }
        Ok(())
    }
}

/// Copy `reader` to every writer until it is exhausted, then close them all.
///
/// A writer that fails is dropped from the set; the others keep being fed. Returns whether
/// `reader` was read to its end.
async fn fan_out<R>(reader: &mut R, mut writers: Vec<(String, ChildInput)>) -> bool
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0; INPUT_CHUNK];
    let mut exhausted = false;
    while !writers.is_empty() {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                exhausted = true;
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("reading task input: {}", e);
                break;
            }
        };

        let chunk = &buf[..n];
        let written = join_all(writers.iter().map(|(_, w)| w.write_all(chunk))).await;
        let mut written = written.into_iter();
        writers.retain(|(host, _)| match written.next() {
            Some(Err(e)) => {
                tracing::warn!(%host, "writing stdin: {}", e);
                false
            }
            _ => true,
        });
    }
    close_all(writers).await;
    exhausted
}

async fn close_all(writers: Vec<(String, ChildInput)>) {
    for (host, w) in writers {
        if let Err(e) = w.close().await {
            tracing::debug!(%host, "closing stdin: {}", e);
        }
    }
}

/// Forwards the operator's ^C to whatever task is running.
#[derive(Debug, Default)]
struct Interrupts {
    targets: Arc<Mutex<Option<Vec<Interrupter>>>>,
    interrupted: Arc<AtomicBool>,
}

impl Interrupts {
    fn listen(&self) -> JoinHandle<()> {
        let targets = self.targets.clone();
        let interrupted = self.interrupted.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let current = targets.lock().await.clone();
                match current {
                    Some(targets) => {
                        join_all(targets.iter().map(Interrupter::interrupt)).await;
                    }
                    None => {
                        tracing::debug!("interrupted between tasks");
                        interrupted.store(true, Ordering::SeqCst);
                    }
                }
            }
        })
    }

    async fn install(&self, targets: Vec<Interrupter>) {
        *self.targets.lock().await = Some(targets);
    }

    async fn clear(&self) {
        *self.targets.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_feeds_every_writer() {
        let mut client_a = Client::from(LocalhostClient::new(""));
        let mut client_b = Client::from(LocalhostClient::new(""));
        let mut writers = Vec::new();
        for client in [&mut client_a, &mut client_b] {
            client.connect("localhost").await.unwrap();
            client.run("cat", true, false).await.unwrap();
            writers.push(("localhost".to_owned(), client.stdin().clone().unwrap()));
        }

        let mut input: &[u8] = b"line\n";
        assert!(fan_out(&mut input, writers).await);

        for client in [&mut client_a, &mut client_b] {
            let mut out = String::new();
            client
                .stdout()
                .take()
                .unwrap()
                .read_to_string(&mut out)
                .await
                .unwrap();
            assert_eq!(out, "line\n");
            client.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn overrides_win_and_reserved_vars_are_set() {
        let mut global = EnvList::new();
        global.set("A", "global");
        global.set("B", "global");
        let mut network = Network {
            name: "net".into(),
            hosts: vec!["localhost".into()],
            ..Default::default()
        };
        network.env.set("B", "network");
        network.env.set("C", "$B-c");

        let mut options = RunOptions::default();
        options.overrides.set("A", "cli");
        let runner = Runner::new(options);

        let env = runner.environment(&network, &global).await.unwrap();
        assert_eq!(env.get("A"), Some("cli"));
        assert_eq!(env.get("B"), Some("network"));
        assert_eq!(env.get("C"), Some("network-c"));
        assert_eq!(env.get("FANOUT_NETWORK"), Some("net"));
        assert_eq!(env.get("FANOUT_ENV"), Some("-e A=cli"));
        assert!(env.get("FANOUT_TIME").is_some());
    }
}
