use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Errors that occur while connecting to, or running tasks on, a fleet of hosts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Failed to establish the initial connection to a host.
    #[error("Connect(\"{user}@{host}\"): {source}")]
    Connect {
        /// The user the connection was attempted as.
        user: String,
        /// The host (and port) that was dialed.
        host: String,
        /// What ssh reported.
        #[source]
        source: io::Error,
    },

    /// The master connection of an established transport failed.
    #[error("the master connection failed")]
    Master(#[source] io::Error),

    /// Failed to run the `ssh` command locally.
    #[error("the local ssh command could not be executed")]
    Ssh(#[source] io::Error),

    /// The connection to the remote host was severed.
    ///
    /// This is a best-effort error: ssh exits with 255 both when the transport fails and when
    /// the remote process itself exits with 255.
    #[error("the connection to {host} was terminated")]
    Disconnected {
        /// Label of the client whose transport went away.
        host: String,
    },

    /// Failed to remove the temporary directory holding the control socket.
    #[error("failed to remove temporary ssh session directory")]
    Cleanup(#[source] io::Error),

    /// IO error while reading from or writing to a child's standard streams.
    #[error("failure while accessing standard I/O of {stream}")]
    ChildIo {
        /// Which stream failed.
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    /// `run` was called on a client that has no transport.
    #[error("{0}: not connected")]
    NotConnected(String),

    /// `connect` was called twice on the same client.
    #[error("{0}: already connected")]
    AlreadyConnected(String),

    /// `run` was called while a session opened by an earlier `run` is still open.
    #[error("{0}: session already open")]
    AlreadySessionOpen(String),

    /// `run` was called while a command is still running.
    #[error("{0}: command already running")]
    AlreadyRunning(String),

    /// `wait` was called without a running command.
    #[error("{0}: trying to wait on a stopped command")]
    NotRunning(String),

    /// `close` was called on a transport that was already torn down.
    #[error("{0}: trying to close an already closed connection")]
    AlreadyClosed(String),

    /// A session for a resolved command could not be started.
    #[error("{host}: Run(\"{command}\"): {source}")]
    TaskStart {
        /// Label of the client the command was started on.
        host: String,
        /// The command text (without the environment prefix).
        command: String,
        #[source]
        source: io::Error,
    },

    /// The remote (or local) process exited with a nonzero status.
    #[error("{host}: exit {status}")]
    RemoteExit {
        /// Label of the client whose process failed.
        host: String,
        /// The exit status.
        status: i32,
    },

    /// Resolving an environment variable through the local shell failed.
    #[error("resolving env var {key} failed: {reason}")]
    Resolution {
        /// The variable whose value could not be resolved.
        key: String,
        /// Why.
        reason: String,
    },

    /// The inventory script of a network failed.
    #[error("inventory of network {network} failed: {reason}")]
    Inventory {
        /// Name of the network.
        network: String,
        /// Why.
        reason: String,
    },

    /// The local `tar` producing an upload failed, so the hosts did not get all of it.
    #[error("archiving {path} for upload failed: {status}")]
    Archive {
        /// The upload source.
        path: String,
        /// How `tar` exited.
        status: ExitStatus,
    },

    /// A command's script could not be read.
    #[error("reading script {} failed: {source}", .path.display())]
    Script {
        /// Path of the script.
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration is invalid.
    #[error("{0}")]
    Config(String),

    /// Nothing to run.
    #[error("no commands to be run")]
    NoCommands,

    /// The network resolved to an empty host list.
    #[error("no hosts defined for network {0}")]
    NoHosts(String),

    /// The operator interrupted the run between tasks.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// The process exit status that reports this error to the operator.
    ///
    /// Mirrors the status of a failing remote process when there is one.
    pub fn exit_code(&self) -> i32 {
        match *self {
            Error::RemoteExit { status, .. } => status,
            Error::Interrupted => 130,
            _ => 1,
        }
    }

    pub(crate) fn interpret_ssh_error(user: &str, host: &str, stderr: &str) -> Self {
        // we want to turn the string-only ssh error into something a little more "handleable".
        // format is:
        //
        //     ssh: ssh error: io error
        let mut stderr = stderr.trim();
        stderr = stderr.strip_prefix("ssh: ").unwrap_or(stderr);
        if stderr.starts_with("Warning: Permanently added ") {
            // added to hosts file -- let's ignore that message
            stderr = stderr.split_once('\n').map(|x| x.1.trim()).unwrap_or("");
        }
        let mut kind = io::ErrorKind::ConnectionAborted;
        let mut err = stderr.splitn(2, ": ");
        if let Some(ssh_error) = err.next() {
            if ssh_error.starts_with("Could not resolve") {
                kind = io::ErrorKind::Other;
            }

            if let Some(io_error) = err.next() {
                match io_error {
                    "Network is unreachable" => {
                        kind = io::ErrorKind::Other;
                    }
                    "Connection refused" => {
                        kind = io::ErrorKind::ConnectionRefused;
                    }
                    e if ssh_error.starts_with("connect to host")
                        && (e == "Connection timed out" || e == "Operation timed out") =>
                    {
                        kind = io::ErrorKind::TimedOut;
                    }
                    e if ssh_error.starts_with("connect to host") && e == "Permission denied" => {
                        // macOS flavour of "network is unreachable"
                        kind = io::ErrorKind::Other;
                    }
                    e if e.contains("Permission denied (") => {
                        kind = io::ErrorKind::PermissionDenied;
                    }
                    _ => {}
                }
            }
        }

        Error::Connect {
            user: user.to_owned(),
            host: host.to_owned(),
            source: io::Error::new(kind, stderr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{io, Error};

    #[test]
    fn parse_error() {
        let err = "ssh: Warning: Permanently added \'login.csail.mit.edu,128.52.131.0\' (ECDSA) to the list of known hosts.\r\nopenssh-tester@login.csail.mit.edu: Permission denied (publickey,gssapi-keyex,gssapi-with-mic,password,keyboard-interactive).";
        let err = Error::interpret_ssh_error("openssh-tester", "login.csail.mit.edu:22", err);
        let target = io::Error::new(io::ErrorKind::PermissionDenied, "openssh-tester@login.csail.mit.edu: Permission denied (publickey,gssapi-keyex,gssapi-with-mic,password,keyboard-interactive).");
        if let Error::Connect { user, host, source } = err {
            assert_eq!(user, "openssh-tester");
            assert_eq!(host, "login.csail.mit.edu:22");
            assert_eq!(source.kind(), target.kind());
            assert_eq!(format!("{}", source), format!("{}", target));
        } else {
            unreachable!("{:?}", err);
        }
    }

    #[test]
    fn parse_refused() {
        let err = "ssh: connect to host 10.0.0.7 port 2222: Connection refused\n";
        match Error::interpret_ssh_error("deploy", "10.0.0.7:2222", err) {
            Error::Connect { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused)
            }
            e => unreachable!("{:?}", e),
        }

        let err = "ssh: connect to host 10.0.0.7 port 22: Operation timed out";
        match Error::interpret_ssh_error("deploy", "10.0.0.7:22", err) {
            Error::Connect { source, .. } => assert_eq!(source.kind(), io::ErrorKind::TimedOut),
            e => unreachable!("{:?}", e),
        }
    }

    #[test]
    fn error_sanity() {
        use std::error::Error as _;

        let ioe = || io::Error::new(io::ErrorKind::Other, "test");
        let expect = ioe();

        let e = Error::Master(ioe());
        assert!(!format!("{}", e).is_empty());
        let e = e
            .source()
            .expect("source failed")
            .downcast_ref::<io::Error>()
            .expect("source not io");
        assert_eq!(e.kind(), expect.kind());
        assert_eq!(format!("{}", e), format!("{}", expect));

        let e = Error::TaskStart {
            host: "deploy@web1".into(),
            command: "uptime".into(),
            source: ioe(),
        };
        assert_eq!(format!("{}", e), "deploy@web1: Run(\"uptime\"): test");
        assert!(e.source().is_some());

        let e = Error::Disconnected {
            host: "deploy@web1".into(),
        };
        assert!(!format!("{}", e).is_empty());
        assert!(e.source().is_none());
    }

    #[test]
    fn exit_codes() {
        let e = Error::RemoteExit {
            host: "deploy@web1".into(),
            status: 42,
        };
        assert_eq!(e.exit_code(), 42);
        assert_eq!(format!("{}", e), "deploy@web1: exit 42");
        assert_eq!(Error::Interrupted.exit_code(), 130);
        assert_eq!(Error::NoCommands.exit_code(), 1);
    }
}
