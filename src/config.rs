//! The Fanfile: networks, commands and targets, read from YAML.
//!
//! ```yaml
//! env:
//!   NAME: api
//!   IMAGE: registry/$NAME
//!
//! networks:
//!   staging:
//!     hosts:
//!       - deploy@10.0.0.1
//!       - deploy@10.0.0.2:2222
//!     bastion: jump@bastion.example.com
//!
//! commands:
//!   ping:
//!     desc: Print uname and current date/time
//!     run: uname -a; date
//!   upload:
//!     upload:
//!       - src: ./dist
//!         dst: /tmp/$NAME
//!         exclude: "*.log"
//!   restart:
//!     run: sudo systemctl restart $NAME
//!     serial: 2
//!
//! targets:
//!   deploy:
//!     - upload
//!     - restart
//! ```

use super::{EnvList, Error, Network};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

/// Path the Fanfile is read from unless told otherwise.
pub const DEFAULT_FANFILE: &str = "./Fanfile.yml";

/// A copy of a local path to every host of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Upload {
    /// Local path, relative to the working directory; expanded with the run's environment.
    pub src: String,
    /// Directory on the host to unpack into.
    pub dst: String,
    /// Comma-separated `tar --exclude` patterns.
    #[serde(default)]
    pub exclude: String,
}

/// A named unit of work.
///
/// Each of `upload`, `script`, `local` and `run` that is set becomes one or more tasks, in that
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Command {
    /// Name, as used on the command line.
    #[serde(skip)]
    pub name: String,
    /// One-line description shown in the usage listing.
    pub desc: String,
    /// Paths to copy to the hosts.
    pub upload: Vec<Upload>,
    /// Local script whose content is run on the hosts. Only the first word names the file.
    pub script: Option<String>,
    /// Shell text run once on this machine.
    pub local: Option<String>,
    /// Shell text run on the hosts.
    pub run: Option<String>,
    /// Feed this process's stdin to the hosts.
    pub stdin: bool,
    /// Run on the first host only.
    pub once: bool,
    /// Run on at most this many hosts at a time; 0 means all at once.
    pub serial: usize,
}

impl Command {
    /// A command that runs `run` on every host.
    pub fn run(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: Some(run.into()),
            ..Default::default()
        }
    }

    /// Reject commands that are ambiguous or have nothing to do.
    pub fn validate(&self) -> Result<(), Error> {
        if self.once && self.serial > 0 {
            return Err(Error::Config(format!(
                "command {}: once and serial cannot be combined",
                self.name
            )));
        }

        let empty = |s: &Option<String>| s.as_deref().map_or(true, |s| s.trim().is_empty());
        if self.upload.is_empty() && empty(&self.script) && empty(&self.local) && empty(&self.run)
        {
            return Err(Error::Config(format!(
                "command {}: nothing to do, set one of upload, script, local or run",
                self.name
            )));
        }

        for upload in &self.upload {
            if upload.src.trim().is_empty() || upload.dst.trim().is_empty() {
                return Err(Error::Config(format!(
                    "command {}: upload needs both src and dst",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// A parsed and validated Fanfile.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Fanfile {
    /// Environment shared by every network.
    pub env: EnvList,
    /// Networks by name.
    pub networks: BTreeMap<String, Network>,
    /// Commands by name.
    pub commands: BTreeMap<String, Command>,
    /// Targets by name: ordered lists of command names.
    pub targets: BTreeMap<String, Vec<String>>,
}

impl FromStr for Fanfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut conf: Fanfile =
            serde_yaml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;

        for (name, network) in conf.networks.iter_mut() {
            network.name = name.clone();
        }
        for (name, command) in conf.commands.iter_mut() {
            command.name = name.clone();
            command.validate()?;
        }
        for (name, commands) in &conf.targets {
            for c in commands {
                if !conf.commands.contains_key(c) {
                    return Err(Error::Config(format!(
                        "target {}: unknown command {}",
                        name, c
                    )));
                }
            }
        }

        Ok(conf)
    }
}

impl Fanfile {
    /// Read and parse the Fanfile at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "loaded fanfile");
        data.parse()
    }

    /// The network called `name`.
    pub fn network(&self, name: &str) -> Result<Network, Error> {
        self.networks.get(name).cloned().ok_or_else(|| {
            Error::Config(format!(
                "unknown network {}\n\n{}",
                name,
                self.network_usage()
            ))
        })
    }

    /// Expand command line arguments into the commands to run, in order.
    ///
    /// A target expands into its commands; a name that is not a target must be a command.
    pub fn commands<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Command>, Error> {
        let mut commands = Vec::new();
        for name in names {
            let name = name.as_ref();
            if let Some(target) = self.targets.get(name) {
                for c in target {
                    commands.push(self.command(c)?);
                }
            } else {
                commands.push(self.command(name)?);
            }
        }

        if commands.is_empty() {
            return Err(Error::NoCommands);
        }
        Ok(commands)
    }

    fn command(&self, name: &str) -> Result<Command, Error> {
        self.commands.get(name).cloned().ok_or_else(|| {
            Error::Config(format!(
                "unknown command/target {}\n\n{}",
                name,
                self.command_usage()
            ))
        })
    }

    /// Listing of the networks and their static hosts.
    pub fn network_usage(&self) -> String {
        let mut out = String::from("Networks:\n");
        for (name, network) in &self.networks {
            let _ = writeln!(out, "- {}", name);
            for host in &network.hosts {
                let _ = writeln!(out, "    - {}", host);
            }
            if let Some(ref inventory) = network.inventory {
                let _ = writeln!(out, "    + inventory: {}", inventory);
            }
        }
        out
    }

    /// Listing of the targets and commands.
    pub fn command_usage(&self) -> String {
        let width = self
            .targets
            .keys()
            .chain(self.commands.keys())
            .map(String::len)
            .max()
            .unwrap_or(0);

        let mut out = String::from("Targets:\n");
        for (name, commands) in &self.targets {
            let _ = writeln!(out, "- {:width$}  {}", name, commands.join(" "), width = width);
        }
        out.push_str("\nCommands:\n");
        for (name, command) in &self.commands {
            let _ = writeln!(out, "- {:width$}  {}", name, command.desc, width = width);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FANFILE: &str = r#"
env:
  NAME: api
  IMAGE: registry/$NAME

networks:
  local:
    hosts:
      - localhost
  staging:
    hosts: [a@web1, a@web2]
    env:
      NAME: api-staging
    bastion: jump@bastion

commands:
  ping:
    desc: Ping every host
    run: echo pong
  upload:
    upload:
      - src: ./dist
        dst: /tmp
        exclude: "*.log,tmp"
  migrate:
    run: ./migrate
    once: true
  restart:
    run: systemctl restart api
    serial: 2

targets:
  deploy:
    - upload
    - migrate
    - restart
"#;

    #[test]
    fn parse() {
        let conf: Fanfile = FANFILE.parse().unwrap();

        let keys: Vec<_> = conf.env.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["NAME", "IMAGE"]);

        let staging = conf.network("staging").unwrap();
        assert_eq!(staging.name, "staging");
        assert_eq!(staging.hosts, vec!["a@web1", "a@web2"]);
        assert_eq!(staging.bastion.as_deref(), Some("jump@bastion"));
        assert_eq!(staging.env.get("NAME"), Some("api-staging"));

        let upload = &conf.commands["upload"].upload[0];
        assert_eq!(upload.src, "./dist");
        assert_eq!(upload.exclude, "*.log,tmp");
        assert_eq!(conf.commands["restart"].serial, 2);
        assert!(conf.commands["migrate"].once);
    }

    #[test]
    fn targets_expand_in_order() {
        let conf: Fanfile = FANFILE.parse().unwrap();
        let names: Vec<_> = conf
            .commands(&["deploy", "ping"])
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["upload", "migrate", "restart", "ping"]);
    }

    #[test]
    fn unknown_names() {
        let conf: Fanfile = FANFILE.parse().unwrap();

        let err = conf.network("prod").unwrap_err().to_string();
        assert!(err.contains("unknown network prod"));
        assert!(err.contains("- staging"));

        let err = conf.commands(&["nope"]).unwrap_err().to_string();
        assert!(err.contains("unknown command/target nope"));
        assert!(err.contains("Ping every host"));

        let none: [&str; 0] = [];
        assert!(matches!(conf.commands(&none), Err(Error::NoCommands)));
    }

    #[test]
    fn once_and_serial_rejected() {
        let err = "commands:\n  x:\n    run: a\n    once: true\n    serial: 2\n"
            .parse::<Fanfile>()
            .unwrap_err();
        assert!(err.to_string().contains("once and serial"));
    }

    #[test]
    fn empty_command_rejected() {
        let err = "commands:\n  x:\n    desc: nothing\n"
            .parse::<Fanfile>()
            .unwrap_err();
        assert!(err.to_string().contains("nothing to do"));
    }

    #[test]
    fn target_with_unknown_command_rejected() {
        let err = "commands:\n  x:\n    run: a\ntargets:\n  t: [x, y]\n"
            .parse::<Fanfile>()
            .unwrap_err();
        assert!(err.to_string().contains("unknown command y"));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!("commands:\n  x:\n    runn: a\n".parse::<Fanfile>().is_err());
    }
}
