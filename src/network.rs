use super::{EnvList, Error};

use std::process::Stdio;

use regex::Regex;
use serde::Deserialize;
use tokio::process;

/// A named group of hosts that share an environment and, optionally, a bastion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Network {
    /// Name, as used on the command line.
    #[serde(skip)]
    pub name: String,
    /// Hosts, as `[user@]host[:port]`; `localhost` runs locally.
    pub hosts: Vec<String>,
    /// Environment of this network, applied over the global one.
    pub env: EnvList,
    /// Shell command whose output lines are additional hosts.
    pub inventory: Option<String>,
    /// Jump host every other host is dialed through.
    pub bastion: Option<String>,
}

impl Network {
    /// Run the inventory command, if any, and append the hosts it prints.
    ///
    /// The command runs under `/bin/sh`, in this process's environment, behind the network's
    /// environment exports: values are evaluated in order and may refer to earlier ones.
    pub async fn resolve_inventory(&mut self) -> Result<(), Error> {
        let inventory = match self.inventory {
            Some(ref inventory) if !inventory.trim().is_empty() => inventory,
            _ => return Ok(()),
        };

        let failed = |reason: String| Error::Inventory {
            network: self.name.clone(),
            reason,
        };

        let exports = self.env.as_export();
        let script = if exports.is_empty() {
            inventory.clone()
        } else {
            format!("{} {}", exports, inventory)
        };

        let output = process::Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !output.status.success() {
            return Err(failed(output.status.to_string()));
        }

        let hosts = parse_inventory(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(network = %self.name, count = hosts.len(), "inventory resolved");
        self.hosts.extend(hosts);
        Ok(())
    }

    /// Keep the hosts that match `only` and do not match `except`.
    ///
    /// Fails if no host is left.
    pub fn filter_hosts(
        &mut self,
        only: Option<&Regex>,
        except: Option<&Regex>,
    ) -> Result<(), Error> {
        if only.is_none() && except.is_none() {
            return Ok(());
        }

        self.hosts.retain(|h| {
            only.map_or(true, |re| re.is_match(h)) && !except.map_or(false, |re| re.is_match(h))
        });

        if self.hosts.is_empty() {
            let mut filters = Vec::new();
            if let Some(re) = only {
                filters.push(format!("--only '{}'", re));
            }
            if let Some(re) = except {
                filters.push(format!("--except '{}'", re));
            }
            return Err(Error::Config(format!(
                "no hosts of network {} left after {}",
                self.name,
                filters.join(" ")
            )));
        }
        Ok(())
    }
}

/// Hosts listed in inventory output: one per line, skipping blank lines and `#` comments.
pub fn parse_inventory(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn network(hosts: &[&str]) -> Network {
        Network {
            name: "test".into(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn inventory_lines() {
        assert_eq!(
            parse_inventory("server0\n\n# comment\nserver2\n"),
            vec!["server0", "server2"]
        );
        assert!(parse_inventory("").is_empty());
    }

    #[tokio::test]
    async fn inventory_appends_to_static_hosts() {
        let mut n = network(&["static"]);
        n.env.set("PREFIX", "server");
        n.inventory = Some(r#"printf '%s0\n\n# comment\n%s2\n' "$PREFIX" "$PREFIX""#.into());
        n.resolve_inventory().await.unwrap();
        assert_eq!(n.hosts, vec!["static", "server0", "server2"]);
    }

    #[tokio::test]
    async fn inventory_sees_evaluated_exports() {
        let mut n = network(&[]);
        n.env.set("ROLE", "web");
        n.env.set("HOST", "$ROLE-$(echo 1)");
        n.inventory = Some(r#"echo "$HOST"; echo "$ROLE-2""#.into());
        n.resolve_inventory().await.unwrap();
        assert_eq!(n.hosts, vec!["web-1", "web-2"]);
    }

    #[tokio::test]
    async fn failing_inventory() {
        let mut n = network(&[]);
        n.inventory = Some("exit 2".into());
        match n.resolve_inventory().await {
            Err(Error::Inventory { network, .. }) => assert_eq!(network, "test"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn filters() {
        let mut n = network(&["web1", "web2", "db1"]);
        let only = Regex::new("^web").unwrap();
        let except = Regex::new("2$").unwrap();
        n.filter_hosts(Some(&only), Some(&except)).unwrap();
        assert_eq!(n.hosts, vec!["web1"]);

        let mut n = network(&["web1", "db1"]);
        n.filter_hosts(None, Some(&Regex::new("db").unwrap()))
            .unwrap();
        assert_eq!(n.hosts, vec!["web1"]);

        let mut n = network(&["web1"]);
        assert!(n
            .filter_hosts(Some(&Regex::new("^db").unwrap()), None)
            .is_err());
    }
}
