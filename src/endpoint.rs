// where a flow gets forwarded. the remote given on the command line resolves
// once at startup into a pair of independent overrides, either of which may be
// "keep the original". whatever the overrides leave open is filled in per
// flow from the kernel's record of the pre-NAT destination, which is how the
// editor runs behind a firewall redirect without being told the real server

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use anyhow::Context;
use tokio::net::lookup_host;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteSpec {
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
}

impl RemoteSpec {
    // the literal host "0" and port 0 select transparent derivation. a host
    // that resolves only to wildcard addresses counts as "0" as well
    pub async fn resolve(host: &str, port: u16) -> anyhow::Result<Self> {
        let addr = if host == "0" {
            None
        } else {
            let candidates = lookup_host((host, port))
                .await
                .with_context(|| format!("cannot resolve remote host {host:?}"))?
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                anyhow::bail!("no address candidate for remote host {host:?}")
            }
            debug!("remote host {host:?} resolved to {candidates:?}");
            candidates
                .into_iter()
                .map(|candidate| candidate.ip())
                .find(|ip| !ip.is_unspecified())
        };
        Ok(Self {
            addr,
            port: (port != 0).then_some(port),
        })
    }

    pub fn is_fixed(&self) -> bool {
        self.addr.is_some() && self.port.is_some()
    }

    // the forwarding target of one flow. `original` queries the kernel record
    // for the accepting socket and is consulted only when an override is
    // missing, a fully fixed remote wins unconditionally
    pub fn target_for(
        &self,
        original: impl FnOnce() -> anyhow::Result<SocketAddr>,
    ) -> anyhow::Result<SocketAddr> {
        if let (Some(addr), Some(port)) = (self.addr, self.port) {
            return Ok(SocketAddr::new(addr, port));
        }
        let mut target = original()?;
        if let Some(addr) = self.addr {
            target.set_ip(addr)
        }
        if let Some(port) = self.port {
            target.set_port(port)
        }
        Ok(target)
    }
}

impl fmt::Display for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.port) {
            (Some(addr), Some(port)) => write!(f, "fixed forwarding to {addr}:{port}"),
            (Some(addr), None) => write!(f, "transparent forwarding with fixed host {addr}"),
            (None, Some(port)) => write!(f, "transparent forwarding with fixed port {port}"),
            (None, None) => write!(f, "fully transparent forwarding"),
        }
    }
}

// the destination the client believed it was talking to. netfilter records
// the pre-NAT address on redirected sockets; where that record is missing or
// the platform has none, the socket's own local name is the best answer (a
// non-redirected socket received the traffic at its real destination)
pub fn original_destination(
    socket: &impl std::os::fd::AsFd,
    local: SocketAddr,
) -> SocketAddr {
    #[cfg(target_os = "linux")]
    {
        use std::net::{Ipv4Addr, Ipv6Addr};

        use nix::sys::socket::{getsockopt, sockopt};

        let queried = match local {
            SocketAddr::V4(_) => getsockopt(socket, sockopt::OriginalDst).ok().map(|sin| {
                SocketAddr::from((
                    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    u16::from_be(sin.sin_port),
                ))
            }),
            SocketAddr::V6(_) => getsockopt(socket, sockopt::Ip6tOriginalDst)
                .ok()
                .map(|sin6| {
                    SocketAddr::from((
                        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                        u16::from_be(sin6.sin6_port),
                    ))
                }),
        };
        if let Some(destination) = queried {
            return destination;
        }
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original() -> anyhow::Result<SocketAddr> {
        Ok(([192, 0, 2, 7], 443).into())
    }

    #[test]
    fn fixed_remote_never_queries() {
        let remote = RemoteSpec {
            addr: Some([10, 0, 0, 1].into()),
            port: Some(80),
        };
        let target = remote
            .target_for(|| anyhow::bail!("queried the kernel record"))
            .unwrap();
        assert_eq!(target, SocketAddr::from(([10, 0, 0, 1], 80)))
    }

    #[test]
    fn port_override_keeps_original_host() {
        let remote = RemoteSpec {
            addr: None,
            port: Some(8080),
        };
        let target = remote.target_for(original).unwrap();
        assert_eq!(target, SocketAddr::from(([192, 0, 2, 7], 8080)))
    }

    #[test]
    fn host_override_keeps_original_port() {
        let remote = RemoteSpec {
            addr: Some([10, 0, 0, 1].into()),
            port: None,
        };
        let target = remote.target_for(original).unwrap();
        assert_eq!(target, SocketAddr::from(([10, 0, 0, 1], 443)))
    }

    #[test]
    fn fully_transparent_uses_original() {
        let remote = RemoteSpec::default();
        assert_eq!(remote.target_for(original).unwrap(), original().unwrap())
    }

    #[tokio::test]
    async fn resolve_zero_is_transparent() {
        let remote = RemoteSpec::resolve("0", 0).await.unwrap();
        assert_eq!(remote, RemoteSpec::default());
        let remote = RemoteSpec::resolve("0", 25).await.unwrap();
        assert_eq!(remote.addr, None);
        assert_eq!(remote.port, Some(25))
    }

    #[tokio::test]
    async fn resolve_literal_address() {
        let remote = RemoteSpec::resolve("127.0.0.1", 9).await.unwrap();
        assert_eq!(remote.addr, Some([127, 0, 0, 1].into()));
        assert_eq!(remote.port, Some(9));
        assert!(remote.is_fixed());
        // a wildcard address is no forwarding target, it demotes to
        // transparent mode
        let remote = RemoteSpec::resolve("0.0.0.0", 9).await.unwrap();
        assert_eq!(remote.addr, None)
    }
}
