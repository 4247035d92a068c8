use super::{Credentials, Error, HostSpec, Session, SessionOptions};

use std::borrow::Cow;

/// A jump host whose established transport carries the transports of other hosts.
///
/// Dialing "through" the bastion opens a stdio-forwarded channel (`ssh -W`) over the bastion's
/// master connection and runs a fresh ssh handshake with the target over that channel. Only one
/// level of jumping is supported: the bastion itself is always dialed directly.
#[derive(Debug)]
pub struct Bastion {
    spec: HostSpec,
    session: Session,
}

impl Bastion {
    /// Connect to the jump host at `destination`.
    pub async fn connect(
        destination: &str,
        options: &SessionOptions,
        credentials: &Credentials,
    ) -> Result<Self, Error> {
        let spec = HostSpec::parse(destination)?;
        let session = Session::connect(&spec, options, credentials, None).await?;
        tracing::debug!(bastion = %spec, "bastion connected");
        Ok(Self { spec, session })
    }

    /// The `ProxyCommand` that dials a target through this bastion.
    ///
    /// `%h` and `%p` are expanded by the target's `ssh` into its host and port.
    pub fn dial_through(&self) -> String {
        let ctl = self.session.ctl_path().to_string_lossy();
        format!(
            "ssh -S {} -o BatchMode=yes -W %h:%p {}",
            shell_escape::escape(Cow::Borrowed(&*ctl)),
            shell_escape::escape(Cow::Borrowed(self.session.addr())),
        )
    }

    /// Fail with the bastion's own error if its transport is gone, instead of letting every
    /// host dialed through it fail with an opaque proxy error.
    pub async fn check(&self) -> Result<(), Error> {
        self.session.check().await
    }

    /// The host this bastion is connected to.
    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Tear down the bastion's transport.
    ///
    /// Every transport dialed through it stops working.
    pub async fn close(self) -> Result<(), Error> {
        self.session.close().await
    }
}
