use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fanout::{
    EnvList, Error, Fanfile, KnownHosts, RunOptions, Runner, SessionOptions,
    DEFAULT_FANFILE, DEFAULT_RECOVERABLE_EXIT,
};
use regex::Regex;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: fanout [OPTIONS] <NETWORK> <TARGET/COMMAND>...";

/// Run commands on every host of a network, in parallel, over ssh.
#[derive(Debug, Parser)]
#[command(name = "fanout", version)]
struct Args {
    /// Fanfile to read networks and commands from.
    #[arg(short = 'f', long = "file", value_name = "FILE", default_value = DEFAULT_FANFILE)]
    file: PathBuf,

    /// Set an environment variable, overriding the Fanfile.
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_var)]
    env: Vec<(String, String)>,

    /// Only run on hosts matching this regex.
    #[arg(long, value_name = "REGEX")]
    only: Option<Regex>,

    /// Skip hosts matching this regex.
    #[arg(long, value_name = "REGEX")]
    except: Option<Regex>,

    /// Trace every command with `set -x`, and log debug information.
    #[arg(short = 'D', long)]
    debug: bool,

    /// Do not start output lines with the host they came from.
    #[arg(long)]
    disable_prefix: bool,

    /// Exit status of a host that is reported but does not fail the run.
    #[arg(long, value_name = "STATUS", default_value_t = DEFAULT_RECOVERABLE_EXIT)]
    recoverable_exit: i32,

    /// Host key policy: strict, add or accept.
    #[arg(long, value_name = "POLICY", default_value = "add")]
    known_hosts: KnownHosts,

    /// Seconds to wait for a host to accept the connection.
    #[arg(long, value_name = "SECONDS")]
    connect_timeout: Option<u64>,

    /// Private key to authenticate with, instead of the agent or the default keys.
    #[arg(short = 'i', long, value_name = "FILE")]
    identity: Option<PathBuf>,

    /// Alternative ssh configuration file.
    #[arg(short = 'F', long, value_name = "FILE")]
    ssh_config: Option<PathBuf>,

    /// Network to run on.
    network: Option<String>,

    /// Targets or commands to run, in order.
    commands: Vec<String>,
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_owned(), v.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_env("FANOUT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(args: Args) -> Result<(), Error> {
    let conf = Fanfile::load(&args.file)?;

    let name = match args.network {
        Some(name) => name,
        None => {
            return Err(Error::Config(format!(
                "{}\n\n{}",
                USAGE,
                conf.network_usage()
            )))
        }
    };
    let mut network = conf.network(&name)?;
    network.resolve_inventory().await?;
    if network.hosts.is_empty() {
        return Err(Error::NoHosts(name));
    }
    network.filter_hosts(args.only.as_ref(), args.except.as_ref())?;

    if args.commands.is_empty() {
        return Err(Error::Config(format!(
            "{}\n\n{}",
            USAGE,
            conf.command_usage()
        )));
    }
    let commands = conf.commands(&args.commands)?;

    let mut overrides = EnvList::new();
    for (key, value) in args.env {
        overrides.set(key, value);
    }

    let mut session = SessionOptions::default();
    session.known_hosts_check(args.known_hosts);
    if let Some(secs) = args.connect_timeout {
        session.connect_timeout(Duration::from_secs(secs));
    }
    if let Some(ref identity) = args.identity {
        session.keyfile(identity);
    }
    if let Some(ref config) = args.ssh_config {
        session.config_file(config);
    }

    let options = RunOptions {
        recoverable_exit: args.recoverable_exit,
        prefix: !args.disable_prefix,
        color: std::io::stdout().is_terminal(),
        debug: args.debug,
        overrides,
        session,
    };

    Runner::new(options)
        .run(&network, &conf.env, &commands)
        .await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
