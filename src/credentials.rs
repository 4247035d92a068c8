use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Private key files looked for under `~/.ssh` when no agent is available.
const KEY_FILES: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519", "id_dsa"];

/// Signing material presented to every remote host of a run.
///
/// Resolved once by the runner and shared with every remote client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Use the ssh agent listening on this socket.
    Agent(PathBuf),
    /// Present all of these private keys, and only these.
    Keys(Vec<PathBuf>),
    /// Leave it to ssh's own defaults and configuration.
    Default,
}

impl Credentials {
    /// Look for a running agent, then for the standard private key files.
    pub fn discover() -> Self {
        let sock = env::var_os("SSH_AUTH_SOCK");
        Self::discover_from(sock.as_deref().map(Path::new), dirs::home_dir().as_deref())
    }

    pub(crate) fn discover_from(agent: Option<&Path>, home: Option<&Path>) -> Self {
        if let Some(sock) = agent {
            if !sock.as_os_str().is_empty() && sock.exists() {
                tracing::debug!(socket = %sock.display(), "using ssh agent");
                return Credentials::Agent(sock.to_path_buf());
            }
        }

        let keys: Vec<PathBuf> = match home {
            Some(home) => KEY_FILES
                .iter()
                .map(|name| home.join(".ssh").join(name))
                .filter(|p| p.is_file())
                .collect(),
            None => Vec::new(),
        };

        if keys.is_empty() {
            tracing::debug!("no ssh agent or private keys found, using ssh defaults");
            Credentials::Default
        } else {
            tracing::debug!(count = keys.len(), "using private key files");
            Credentials::Keys(keys)
        }
    }

    /// Arguments that make `ssh` authenticate with these credentials.
    pub(crate) fn ssh_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        match self {
            Credentials::Agent(sock) => {
                let mut opt = OsString::from("IdentityAgent=");
                opt.push(sock);
                args.push("-o".into());
                args.push(opt);
            }
            Credentials::Keys(keys) => {
                args.push("-o".into());
                args.push("IdentitiesOnly=yes".into());
                for k in keys {
                    args.push("-i".into());
                    args.push(k.into());
                }
            }
            Credentials::Default => {}
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_wins() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join(".ssh")).unwrap();
        std::fs::write(home.path().join(".ssh/id_rsa"), "key").unwrap();

        // any existing path stands in for the socket
        let sock = home.path().join(".ssh/id_rsa");
        let creds = Credentials::discover_from(Some(&sock), Some(home.path()));
        assert_eq!(creds, Credentials::Agent(sock));
    }

    #[test]
    fn falls_back_to_all_keys() {
        let home = tempfile::tempdir().unwrap();
        let ssh = home.path().join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        std::fs::write(ssh.join("id_rsa"), "key").unwrap();
        std::fs::write(ssh.join("id_ed25519"), "key").unwrap();

        let missing = home.path().join("no-agent");
        let creds = Credentials::discover_from(Some(&missing), Some(home.path()));
        assert_eq!(
            creds,
            Credentials::Keys(vec![ssh.join("id_rsa"), ssh.join("id_ed25519")])
        );

        let args = creds.ssh_args();
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 2);
        assert_eq!(args[1], "IdentitiesOnly=yes");
    }

    #[test]
    fn nothing_found() {
        let home = tempfile::tempdir().unwrap();
        let creds = Credentials::discover_from(None, Some(home.path()));
        assert_eq!(creds, Credentials::Default);
        assert!(creds.ssh_args().is_empty());
    }
}
