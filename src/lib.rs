//! Run shell commands on a fleet of hosts at once, through OpenSSH.
//!
//! This crate drives the OpenSSH remote login client (`ssh` on most machines) to run the same
//! commands on every host of a [`Network`], streaming their combined output back with every line
//! labelled by the host it came from. Since everything goes through the `ssh` command, all your
//! existing configuration (e.g., in `.ssh/config`) continues to work as expected.
//!
//! A run has three layers:
//!
//!  - A [`Client`] is a handle on one host. It is either a [`RemoteClient`], which holds an ssh
//!    [`Session`], or a [`LocalhostClient`], which runs commands in a local shell. A client is
//!    [connected](Client::connect) once and then [runs](Client::run) any number of commands, one
//!    at a time, until it is [closed](Client::close).
//!  - A [`Command`] is turned into [`Task`]s by [`build_tasks`]: uploads, a script, a local
//!    command and a remote command, each fanned out to all hosts, to the first host only
//!    (`once`), or to consecutive groups of hosts (`serial`).
//!  - The [`Runner`] connects every host of the network, then runs the tasks strictly in order,
//!    each on all of its hosts in parallel. The first host that fails ends the run.
//!
//! Behind the scenes, every remote host gets an ssh [`ControlMaster`] connection, so
//! authentication happens once per host, and every command is a new channel multiplexed over it.
//! Hosts may also be reached through a [`Bastion`], in which case their connections are tunneled
//! through the bastion's own master connection.
//!
//! # Authentication
//!
//! This crate supports only password-less authentication schemes. An ssh agent is used when
//! `SSH_AUTH_SOCK` points to one; otherwise every standard private key under `~/.ssh` is offered.
//! See [`Credentials`].
//!
//! # Environment
//!
//! Remote shells keep no state between commands, so the run's [`EnvList`] is rendered as a
//! series of `export` statements that is prepended to every command. Values are evaluated by a
//! local shell first, in order, so later variables may refer to earlier ones.
//!
//! # Errors
//!
//! `ssh` exits with status 255 when the connection fails, which is indistinguishable from a
//! remote command that exits with 255 itself. Such exits are reported as
//! [`Error::Disconnected`]; every other nonzero status is an [`Error::RemoteExit`] carrying the
//! status, which [`Error::exit_code`] hands back to the operator.
//!
//! # Examples
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), fanout::Error> {
//! use fanout::{Command, EnvList, Network, RunOptions, Runner};
//!
//! let network = Network {
//!     name: "staging".into(),
//!     hosts: vec!["deploy@web1".into(), "deploy@web2".into()],
//!     ..Default::default()
//! };
//! let mut env = EnvList::new();
//! env.set("APP", "api");
//!
//! let commands = [Command::run("status", "systemctl status $APP")];
//! Runner::new(RunOptions::default())
//!     .run(&network, &env, &commands)
//!     .await?;
//! # Ok(()) }
//! ```
//!
//!   [`ControlMaster`]: https://en.wikibooks.org/wiki/OpenSSH/Cookbook/Multiplexing

#![warn(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rust_2018_idioms,
    unreachable_pub
)]

mod builder;
pub use builder::{KnownHosts, SessionOptions};

mod credentials;
pub use credentials::Credentials;

mod host;
pub use host::{current_user, HostSpec, DEFAULT_PORT};

mod error;
pub use error::Error;

mod session;
pub use session::Session;

mod bastion;
pub use bastion::Bastion;

mod child;
pub use child::{ChildInput, Interrupter};

mod client;
pub use client::{Client, LocalhostClient, RemoteClient, State};

mod env;
pub use env::{EnvList, EnvVar};

mod tar;
pub use tar::{remote_tar_command, TarSource, TarStream};

mod prefix;
pub use prefix::{render, Output, COLORS, RESET_COLOR};

mod network;
pub use network::{parse_inventory, Network};

mod config;
pub use config::{Command, Fanfile, Upload, DEFAULT_FANFILE};

mod task;
pub use task::{build_tasks, Task, TaskClients, TaskInput};

mod runner;
pub use runner::{RunOptions, Runner, DEFAULT_RECOVERABLE_EXIT};
