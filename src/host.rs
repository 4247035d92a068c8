use super::Error;

use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;
use std::io;

/// Port ssh listens on unless the host spec says otherwise.
pub const DEFAULT_PORT: u16 = 22;

/// A parsed `[ssh://][user@]host[:port]` destination.
///
/// IPv6 addresses take a port only in brackets, `[::1]:2222`; a bare `::1` uses the default
/// port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Login user; defaults to the identity of the current process.
    pub user: String,
    /// Host name or address, without the port.
    pub host: String,
    /// Port; defaults to [`DEFAULT_PORT`].
    pub port: u16,
}

impl HostSpec {
    /// Parse a destination, applying the default user and port.
    pub fn parse(destination: &str) -> Result<Self, Error> {
        let mut rest = destination.trim();
        rest = rest.strip_prefix("ssh://").unwrap_or(rest);

        let mut user = None;
        if let Some(at) = rest.rfind('@') {
            user = Some(&rest[..at]);
            rest = &rest[(at + 1)..];
        }
        let user = match user {
            Some(u) if !u.is_empty() => u.to_owned(),
            _ => current_user(),
        };

        let invalid = |reason: &str| Error::Connect {
            user: user.clone(),
            host: destination.to_owned(),
            source: io::Error::new(io::ErrorKind::InvalidInput, reason.to_owned()),
        };

        if rest.contains('/') {
            return Err(invalid("unexpected slash in the host URL"));
        }

        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid("invalid port"));
        let port;
        if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed bracket in the host"))?;
            port = match after {
                "" => DEFAULT_PORT,
                after => match after.strip_prefix(':') {
                    Some(p) => parse_port(p)?,
                    None => return Err(invalid("unexpected text after the bracketed host")),
                },
            };
            rest = host;
        } else if rest.matches(':').count() > 1 {
            port = DEFAULT_PORT;
        } else if let Some((host, p)) = rest.split_once(':') {
            port = parse_port(p)?;
            rest = host;
        } else {
            port = DEFAULT_PORT;
        }

        if rest.is_empty() {
            return Err(invalid("empty host name"));
        }

        Ok(Self {
            user,
            host: rest.to_owned(),
            port,
        })
    }

    /// `host:port`, as reported in connection errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.bracketed(), self.port)
    }

    fn bracketed(&self) -> Cow<'_, str> {
        if self.host.contains(':') {
            Cow::Owned(format!("[{}]", self.host))
        } else {
            Cow::Borrowed(&self.host)
        }
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_PORT {
            write!(f, "{}@{}", self.user, self.host)
        } else {
            write!(f, "{}@{}:{}", self.user, self.bracketed(), self.port)
        }
    }
}

/// Name of the user this process runs as.
pub fn current_user() -> String {
    for var in ["USER", "LOGNAME"] {
        if let Ok(user) = std::env::var(var) {
            if !user.is_empty() {
                return user;
            }
        }
    }

    // SAFETY: getpwuid returns either null or a pointer to a static passwd entry, which we copy
    // out of before anything else can call into the passwd database.
    unsafe {
        let pw = libc::getpwuid(libc::getuid());
        if !pw.is_null() && !(*pw).pw_name.is_null() {
            return CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned();
        }
    }

    String::from("root")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let h = HostSpec::parse("ssh://test-user@127.0.0.1:2222").unwrap();
        assert_eq!(h.user, "test-user");
        assert_eq!(h.host, "127.0.0.1");
        assert_eq!(h.port, 2222);

        let h = HostSpec::parse("test-user@opensshtest").unwrap();
        assert_eq!(h.user, "test-user");
        assert_eq!(h.host, "opensshtest");
        assert_eq!(h.port, 22);

        let h = HostSpec::parse("opensshtest:2200").unwrap();
        assert_eq!(h.user, current_user());
        assert_eq!(h.port, 2200);
        assert_eq!(h.address(), "opensshtest:2200");
    }

    #[test]
    fn display_hides_default_port() {
        let h = HostSpec::parse("deploy@web1").unwrap();
        assert_eq!(h.to_string(), "deploy@web1");
        let h = HostSpec::parse("deploy@web1:2222").unwrap();
        assert_eq!(h.to_string(), "deploy@web1:2222");
    }

    #[test]
    fn ipv6() {
        let h = HostSpec::parse("deploy@::1").unwrap();
        assert_eq!(h.user, "deploy");
        assert_eq!(h.host, "::1");
        assert_eq!(h.port, 22);
        assert_eq!(h.to_string(), "deploy@::1");
        assert_eq!(h.address(), "[::1]:22");

        let h = HostSpec::parse("ssh://deploy@[fe80::1]:2222").unwrap();
        assert_eq!(h.host, "fe80::1");
        assert_eq!(h.port, 2222);
        assert_eq!(h.to_string(), "deploy@[fe80::1]:2222");

        let h = HostSpec::parse("[::1]").unwrap();
        assert_eq!(h.host, "::1");
        assert_eq!(h.port, 22);

        assert!(HostSpec::parse("[::1").is_err());
        assert!(HostSpec::parse("[::1]2222").is_err());
        assert!(HostSpec::parse("[]:22").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            HostSpec::parse("deploy@web1/path"),
            Err(Error::Connect { .. })
        ));
        assert!(HostSpec::parse("web1:notaport").is_err());
        assert!(HostSpec::parse("deploy@").is_err());
    }
}
