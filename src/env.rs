use super::Error;

use std::fmt;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use tokio::process;

/// One environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Value, possibly a shell expression until resolved.
    pub value: String,
}

impl EnvVar {
    /// The variable as a shell export statement.
    pub fn as_export(&self) -> String {
        format!("export {}=\"{}\";", self.key, self.value)
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Ordered list of environment variables.
///
/// Order is preserved so that later variables can reference earlier ones, both when
/// [resolving](EnvList::resolve_values) values and in the rendered [export
/// prefix](EnvList::as_export).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvList(Vec<EnvVar>);

impl EnvList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, overwriting an existing entry in place or appending a new one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|v| v.key == key) {
            Some(existing) => existing.value = value,
            None => self.0.push(EnvVar { key, value }),
        }
    }

    /// Value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Set every entry of `other` on this list, in order.
    pub fn extend(&mut self, other: &EnvList) {
        for v in other.iter() {
            self.set(v.key.clone(), v.value.clone());
        }
    }

    /// Iterate over the entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as `export K1="V1"; export K2="V2"; ...`, in list order.
    ///
    /// Remote shells keep no state between runs, so this is prepended to every command.
    pub fn as_export(&self) -> String {
        self.0.iter().map(EnvVar::as_export).collect::<Vec<_>>().join(" ")
    }

    /// Evaluate every value through a local shell, in order.
    ///
    /// Each value is echoed by a fresh shell that has every previously resolved entry exported,
    /// so `B: $(echo $A y)` sees the resolved `A`.
    pub async fn resolve_values(&mut self) -> Result<(), Error> {
        for i in 0..self.0.len() {
            let mut exports = String::new();
            for prev in &self.0[..i] {
                exports.push_str(&prev.as_export());
            }

            let var = &self.0[i];
            let resolved = echo(&exports, &var.key, &var.value).await?;
            tracing::debug!(key = %var.key, value = %resolved, "resolved env var");
            self.0[i].value = resolved;
        }
        Ok(())
    }

    /// Expand `value` through a local shell that has this whole list exported.
    pub async fn expand(&self, value: &str) -> Result<String, Error> {
        echo(&self.as_export(), value, value).await
    }
}

async fn echo(exports: &str, key: &str, value: &str) -> Result<String, Error> {
    let script = format!("{}echo -n {};", exports, value);
    let output = process::Command::new("bash")
        .arg("-c")
        .arg(&script)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Resolution {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::Resolution {
            key: key.to_owned(),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl<'de> Deserialize<'de> for EnvList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvListVisitor;

        impl<'de> Visitor<'de> for EnvListVisitor {
            type Value = EnvList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of environment variables")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<EnvList, E> {
                Ok(EnvList::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<EnvList, A::Error> {
                let mut env = EnvList::new();
                while let Some((key, value)) =
                    map.next_entry::<serde_yaml::Value, serde_yaml::Value>()?
                {
                    env.set(scalar(&key), scalar(&value));
                }
                Ok(env)
            }
        }

        deserializer.deserialize_any(EnvListVisitor)
    }
}

fn scalar(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_default(),
    }
}
