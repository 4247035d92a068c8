use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::{Builder, TempDir};

use super::Error;

/// Transport options shared by every remote client of a run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub(crate) keyfile: Option<PathBuf>,
    pub(crate) connect_timeout: Option<String>,
    pub(crate) server_alive_interval: Option<u64>,
    pub(crate) known_hosts_check: KnownHosts,
    pub(crate) control_dir: Option<PathBuf>,
    pub(crate) config_file: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keyfile: None,
            connect_timeout: None,
            server_alive_interval: None,
            known_hosts_check: KnownHosts::Add,
            control_dir: None,
            config_file: None,
        }
    }
}

impl SessionOptions {
    /// Set the keyfile to use (`ssh -i`), bypassing agent and key discovery.
    ///
    /// Defaults to `None`.
    pub fn keyfile(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.keyfile = Some(p.as_ref().to_path_buf());
        self
    }

    /// See [`KnownHosts`].
    ///
    /// Default `KnownHosts::Add`.
    pub fn known_hosts_check(&mut self, k: KnownHosts) -> &mut Self {
        self.known_hosts_check = k;
        self
    }

    /// Set the connection timeout (`ssh -o ConnectTimeout`).
    ///
    /// This value is specified in seconds. Any sub-second duration remainder will be ignored.
    /// Defaults to `None`.
    pub fn connect_timeout(&mut self, d: Duration) -> &mut Self {
        self.connect_timeout = Some(d.as_secs().to_string());
        self
    }

    /// Set the timeout interval after which if no data has been received from the server, ssh
    /// will request a response from the server (`ssh -o ServerAliveInterval`).
    ///
    /// Defaults to `None`.
    pub fn server_alive_interval(&mut self, d: Duration) -> &mut Self {
        self.server_alive_interval = Some(d.as_secs());
        self
    }

    /// Set the directory in which the temporary directories holding control sockets are
    /// created.
    ///
    /// If not set, the system temporary directory is used.
    pub fn control_directory(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.control_dir = Some(p.as_ref().to_path_buf());
        self
    }

    /// Set an alternative per-user configuration file (`ssh -F`).
    ///
    /// Defaults to `None`.
    pub fn config_file(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.config_file = Some(p.as_ref().to_path_buf());
        self
    }

    pub(crate) fn build_tempdir(&self) -> Result<TempDir, Error> {
        let mut builder = Builder::new();
        builder.prefix(".fanout-connection");
        match self.control_dir {
            Some(ref dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(Error::Master)
    }
}

/// Specifies how the host's key fingerprint should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHosts {
    /// The host's fingerprint must match what is in the known hosts file.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=yes`.
    Strict,
    /// Strict, but if the host is not already in the known hosts file, it will be added.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=accept-new`.
    Add,
    /// Accept whatever key the server provides and add it to the known hosts file.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=no`.
    Accept,
}

impl KnownHosts {
    pub(crate) fn as_option(&self) -> &'static str {
        match *self {
            KnownHosts::Strict => "StrictHostKeyChecking=yes",
            KnownHosts::Add => "StrictHostKeyChecking=accept-new",
            KnownHosts::Accept => "StrictHostKeyChecking=no",
        }
    }
}

impl std::str::FromStr for KnownHosts {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(KnownHosts::Strict),
            "add" => Ok(KnownHosts::Add),
            "accept" => Ok(KnownHosts::Accept),
            other => Err(format!(
                "unknown known-hosts policy {:?} (expected strict, add or accept)",
                other
            )),
        }
    }
}

#[test]
fn known_hosts() {
    assert_eq!("add".parse::<KnownHosts>(), Ok(KnownHosts::Add));
    assert_eq!(
        KnownHosts::Accept.as_option(),
        "StrictHostKeyChecking=no"
    );
    assert!("sometimes".parse::<KnownHosts>().is_err());
}

#[test]
fn tempdir_in_control_dir() {
    let parent = tempfile::tempdir().unwrap();
    let mut opts = SessionOptions::default();
    opts.control_directory(parent.path());
    let dir = opts.build_tempdir().unwrap();
    assert!(dir.path().starts_with(parent.path()));
}
