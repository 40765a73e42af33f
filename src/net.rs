// socket construction. everything that needs options tokio does not expose
// goes through socket2 here, then converts into the tokio types
// out-of-band data is forced inline on every socket the editor reads, urgent
// bytes are payload like any other and must flow through the rules

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Context;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use crate::endpoint::RemoteSpec;

pub const LISTEN_BACKLOG: i32 = 16;

// the listener family follows the resolved remote: an explicit remote pins
// the family (v6 with V6ONLY so the two spaces never alias), no explicit
// remote means a dual-stack wildcard that accepts both
fn listen_addr(port: u16, remote: &RemoteSpec) -> (SocketAddr, Option<bool>) {
    match remote.addr {
        Some(addr) if addr.is_ipv4() => ((Ipv4Addr::UNSPECIFIED, port).into(), None),
        Some(_) => ((Ipv6Addr::UNSPECIFIED, port).into(), Some(true)),
        None => ((Ipv6Addr::UNSPECIFIED, port).into(), Some(false)),
    }
}

fn bound_socket(ty: Type, local: SocketAddr, only_v6: Option<bool>) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::for_address(local), ty, None)?;
    if let Some(only_v6) = only_v6 {
        socket.set_only_v6(only_v6)?
    }
    socket.set_reuse_address(true)?;
    socket.set_out_of_band_inline(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&local.into())
        .with_context(|| format!("cannot bind {local}"))?;
    Ok(socket)
}

pub fn listen_tcp(port: u16, remote: &RemoteSpec) -> anyhow::Result<TcpListener> {
    let (local, only_v6) = listen_addr(port, remote);
    let socket = bound_socket(Type::STREAM, local, only_v6)?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

pub fn listen_udp(port: u16, remote: &RemoteSpec) -> anyhow::Result<UdpSocket> {
    let (local, only_v6) = listen_addr(port, remote);
    Ok(UdpSocket::from_std(
        bound_socket(Type::DGRAM, local, only_v6)?.into(),
    )?)
}

pub async fn connect_tcp(target: SocketAddr) -> anyhow::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, None)?;
    socket.set_out_of_band_inline(true)?;
    socket.set_nonblocking(true)?;
    let stream = TcpSocket::from_std_stream(socket.into())
        .connect(target)
        .await
        .with_context(|| format!("cannot connect {target}"))?;
    Ok(stream)
}

// connecting pins the peer: `recv` on the returned socket only ever yields
// datagrams from `target`, replies from anyone else are dropped by the kernel
pub async fn connect_udp(target: SocketAddr) -> anyhow::Result<UdpSocket> {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket
        .connect(target)
        .await
        .with_context(|| format!("cannot connect {target}"))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_family_follows_remote() {
        let fixed_v4 = RemoteSpec {
            addr: Some([127, 0, 0, 1].into()),
            port: Some(1),
        };
        let listener = listen_tcp(0, &fixed_v4).unwrap();
        assert!(listener.local_addr().unwrap().is_ipv4());

        let transparent = RemoteSpec::default();
        let listener = listen_tcp(0, &transparent).unwrap();
        assert!(listener.local_addr().unwrap().is_ipv6());
        let socket = listen_udp(0, &transparent).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv6())
    }

    #[tokio::test]
    async fn connected_udp_filters_other_peers() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = connect_udp(target.local_addr().unwrap()).await.unwrap();
        // the socket is bound to the wildcard, address it over loopback
        let local = SocketAddr::from(([127, 0, 0, 1], socket.local_addr().unwrap().port()));

        other.send_to(b"noise", local).await.unwrap();
        target.send_to(b"reply", local).await.unwrap();
        let mut buf = [0; 16];
        let len = socket.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"reply")
    }
}
