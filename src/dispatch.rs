// the forwarding dispatcher. one `Dispatch` owns every flow's mutable state
// and is driven strictly sequentially by a `Session`, so per-flow rule
// counters and the shared rewrite scratch buffer need no synchronization.
// sockets live in spawned tasks that feed raw chunks in through the session
// channel and drain rewritten chunks out through one unbounded channel per
// direction, one consumer per channel keeps each direction in order
// a flow discovered dead while handling an event is swept before the next
// event is taken. sweeping drops the egress senders, the io tasks flush what
// was already queued, then exit and close their sockets
// udp has no connections, so a flow is synthesized per source address and
// retired by an idle timer. tcp flows live until either side closes

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, info, warn};

use crate::{
    endpoint::{original_destination, RemoteSpec},
    event::{OnEvent, SendEvent, Session, SessionSender, Timer, TimerId},
    net::{connect_tcp, connect_udp, listen_tcp, listen_udp},
    rule::RuleSet,
};

pub const MAX_CHUNK_LEN: usize = 100_000;

pub const UDP_TIMEOUT: Duration = Duration::from_secs(30);

pub type FlowId = u32;

#[derive(Debug)]
pub enum Event {
    Incoming(TcpStream, SocketAddr),
    Datagram(SocketAddr, Bytes),
    FromClient(FlowId, Bytes),
    FromServer(FlowId, Bytes),
    Closed(FlowId),
    Expire(FlowId),
}

// states order by how dead the flow is, everything at `Disconnected` or past
// it gets swept
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowState {
    Unreplied,
    Established,
    Disconnected,
    TimedOut,
}

// how rewritten server traffic gets back to the client. a tcp flow owns its
// accepted stream, a udp flow borrows the shared listener and is identified
// by its return address
#[derive(Debug)]
enum ClientHalf {
    Tcp { chunks: UnboundedSender<Bytes> },
    Udp { peer: SocketAddr },
}

#[derive(Debug)]
struct Flow {
    client: ClientHalf,
    forward: UnboundedSender<Bytes>,
    state: FlowState,
    last_activity: Instant,
    live: Vec<i32>,
    expire: Option<TimerId>,
}

#[derive(Debug)]
struct UdpContext {
    socket: Arc<UdpSocket>,
    egress: UnboundedSender<(FlowId, SocketAddr, Bytes)>,
}

#[derive(Debug)]
pub struct Dispatch {
    rules: RuleSet,
    remote: RemoteSpec,
    udp_timeout: Duration,
    sender: SessionSender<Event>,
    // present only when serving udp
    udp: Option<UdpContext>,
    flows: HashMap<FlowId, Flow>,
    // udp pseudo-connection identity, one flow per source address
    peers: HashMap<SocketAddr, FlowId>,
    next_id: FlowId,
    // rewrite output buffer shared by all flows, sound only because the
    // session drives one event at a time
    scratch: Vec<u8>,
}

impl Dispatch {
    fn new(
        rules: RuleSet,
        remote: RemoteSpec,
        udp_timeout: Duration,
        sender: SessionSender<Event>,
        udp: Option<UdpContext>,
    ) -> Self {
        Self {
            rules,
            remote,
            udp_timeout,
            sender,
            udp,
            flows: Default::default(),
            peers: Default::default(),
            next_id: 0,
            scratch: Vec::with_capacity(MAX_CHUNK_LEN),
        }
    }

    fn install(&mut self, client: ClientHalf, forward: UnboundedSender<Bytes>) -> FlowId {
        let id = self.next_id;
        self.next_id += 1;
        let flow = Flow {
            client,
            forward,
            state: FlowState::Unreplied,
            last_activity: Instant::now(),
            live: self.rules.initial_counts(),
            expire: None,
        };
        self.flows.insert(id, flow);
        id
    }

    fn on_incoming(&mut self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        if let Err(err) = socket2::SockRef::from(&stream).set_out_of_band_inline(true) {
            warn!("{peer} cannot force out-of-band data inline {err}")
        }
        let target = self.remote.target_for(|| {
            Ok(original_destination(&stream, stream.local_addr()?))
        });
        let target = match target {
            Ok(target) => target,
            // this flow is lost, the listener keeps serving
            Err(err) => {
                warn!("{peer} dropped, no forwarding target {err:#}");
                return Ok(());
            }
        };
        let (client_sender, client_chunks) = unbounded_channel();
        let (forward_sender, forward_chunks) = unbounded_channel();
        let id = self.install(ClientHalf::Tcp { chunks: client_sender }, forward_sender);
        info!("{peer} -> {target} tcp flow {id}");
        tokio::spawn(stream_io(
            stream,
            id,
            client_chunks,
            Event::FromClient,
            self.sender.clone(),
        ));
        tokio::spawn(forward_tcp_io(target, id, forward_chunks, self.sender.clone()));
        Ok(())
    }

    fn on_datagram(
        &mut self,
        peer: SocketAddr,
        chunk: Bytes,
        timer: &mut dyn Timer<Event>,
    ) -> anyhow::Result<()> {
        let id = match self.peers.get(&peer) {
            Some(&id) => Some(id),
            None => self.new_udp_flow(peer, timer)?,
        };
        if let Some(id) = id {
            self.client_to_server(id, &chunk)
        }
        self.sweep(timer)
    }

    fn new_udp_flow(
        &mut self,
        peer: SocketAddr,
        timer: &mut dyn Timer<Event>,
    ) -> anyhow::Result<Option<FlowId>> {
        let udp = self
            .udp
            .as_ref()
            .ok_or(anyhow::anyhow!("datagram without a udp listener"))?;
        let target = self.remote.target_for(|| {
            Ok(original_destination(
                udp.socket.as_ref(),
                udp.socket.local_addr()?,
            ))
        });
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                warn!("{peer} dropped, no forwarding target {err:#}");
                return Ok(None);
            }
        };
        let (forward_sender, forward_chunks) = unbounded_channel();
        let id = self.install(ClientHalf::Udp { peer }, forward_sender);
        self.peers.insert(peer, id);
        info!("{peer} -> {target} udp flow {id}");
        tokio::spawn(forward_udp_io(target, id, forward_chunks, self.sender.clone()));
        let expire = timer.set(self.udp_timeout, Event::Expire(id))?;
        self.flows
            .get_mut(&id)
            .ok_or(anyhow::anyhow!("vanished flow {id}"))?
            .expire = Some(expire);
        Ok(Some(id))
    }

    // client -> server. rewrite, then hand off to whatever drains into the
    // forward socket. a closed channel means that socket is gone
    fn client_to_server(&mut self, id: FlowId, chunk: &[u8]) {
        let Self {
            rules,
            flows,
            scratch,
            ..
        } = self;
        let Some(flow) = flows.get_mut(&id) else {
            return;
        };
        rules.rewrite(chunk, &mut flow.live, scratch);
        flow.last_activity = Instant::now();
        if flow.forward.send(Bytes::copy_from_slice(scratch)).is_err() {
            flow.state = flow.state.max(FlowState::Disconnected)
        }
    }

    // server -> client. the first delivery is what graduates the flow from
    // `Unreplied` to `Established`
    fn server_to_client(&mut self, id: FlowId, chunk: &[u8]) {
        let Self {
            rules,
            flows,
            scratch,
            udp,
            ..
        } = self;
        let Some(flow) = flows.get_mut(&id) else {
            return;
        };
        rules.rewrite(chunk, &mut flow.live, scratch);
        flow.last_activity = Instant::now();
        let delivered = match &flow.client {
            ClientHalf::Tcp { chunks } => chunks.send(Bytes::copy_from_slice(scratch)).is_ok(),
            ClientHalf::Udp { peer } => udp.as_ref().is_some_and(|udp| {
                udp.egress
                    .send((id, *peer, Bytes::copy_from_slice(scratch)))
                    .is_ok()
            }),
        };
        flow.state = if delivered {
            flow.state.max(FlowState::Established)
        } else {
            flow.state.max(FlowState::Disconnected)
        }
    }

    fn on_expire(&mut self, id: FlowId, timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        let Self {
            flows, udp_timeout, ..
        } = self;
        if let Some(flow) = flows.get_mut(&id) {
            let idle = flow.last_activity.elapsed();
            if idle >= *udp_timeout {
                debug!("flow {id} idle for {idle:?}, timed out");
                flow.state = flow.state.max(FlowState::TimedOut);
                flow.expire = None
            } else {
                flow.expire = Some(timer.set(*udp_timeout - idle, Event::Expire(id))?)
            }
        }
        self.sweep(timer)
    }

    fn sweep(&mut self, timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        let dead = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.state >= FlowState::Disconnected)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in dead {
            let Some(flow) = self.flows.remove(&id) else {
                continue;
            };
            if let ClientHalf::Udp { peer } = &flow.client {
                self.peers.remove(peer);
            }
            if let Some(expire) = flow.expire {
                timer.unset(expire)?
            }
            info!("flow {id} swept in state {:?}", flow.state)
        }
        Ok(())
    }
}

impl OnEvent<Event> for Dispatch {
    fn on_event(&mut self, event: Event, timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        match event {
            Event::Incoming(stream, peer) => self.on_incoming(stream, peer),
            Event::Datagram(peer, chunk) => self.on_datagram(peer, chunk, timer),
            Event::FromClient(id, chunk) => {
                self.client_to_server(id, &chunk);
                self.sweep(timer)
            }
            Event::FromServer(id, chunk) => {
                self.server_to_client(id, &chunk);
                self.sweep(timer)
            }
            Event::Closed(id) => {
                if let Some(flow) = self.flows.get_mut(&id) {
                    flow.state = flow.state.max(FlowState::Disconnected)
                }
                self.sweep(timer)
            }
            Event::Expire(id) => self.on_expire(id, timer),
        }
    }
}

async fn recv_loop(
    read: &mut OwnedReadHalf,
    id: FlowId,
    ingress: fn(FlowId, Bytes) -> Event,
    sender: &mut SessionSender<Event>,
) -> anyhow::Result<()> {
    let mut buf = vec![0; MAX_CHUNK_LEN];
    loop {
        let len = read.read(&mut buf).await?;
        if len == 0 {
            return Ok(());
        }
        sender.send(ingress(id, Bytes::copy_from_slice(&buf[..len])))?
    }
}

async fn send_loop(
    write: &mut OwnedWriteHalf,
    chunks: &mut UnboundedReceiver<Bytes>,
) -> anyhow::Result<()> {
    while let Some(chunk) = chunks.recv().await {
        write.write_all(&chunk).await?
    }
    Ok(())
}

// both directions of one tcp socket. returns when either direction finishes:
// on peer close or error, or once the dispatcher dropped the flow and the
// remaining queued chunks are flushed. dropping the halves closes the socket
async fn stream_io(
    stream: TcpStream,
    id: FlowId,
    mut chunks: UnboundedReceiver<Bytes>,
    ingress: fn(FlowId, Bytes) -> Event,
    mut sender: SessionSender<Event>,
) {
    let (mut read, mut write) = stream.into_split();
    let result = tokio::select! {
        result = recv_loop(&mut read, id, ingress, &mut sender) => result,
        result = send_loop(&mut write, &mut chunks) => result,
    };
    if let Err(err) = result {
        debug!("flow {id} {err}")
    }
    let _ = sender.send(Event::Closed(id));
}

async fn forward_tcp_io(
    target: SocketAddr,
    id: FlowId,
    chunks: UnboundedReceiver<Bytes>,
    mut sender: SessionSender<Event>,
) {
    match connect_tcp(target).await {
        Ok(stream) => stream_io(stream, id, chunks, Event::FromServer, sender).await,
        Err(err) => {
            warn!("flow {id} {err:#}");
            let _ = sender.send(Event::Closed(id));
        }
    }
}

async fn udp_recv_loop(
    socket: &UdpSocket,
    id: FlowId,
    sender: &mut SessionSender<Event>,
) -> anyhow::Result<()> {
    let mut buf = vec![0; MAX_CHUNK_LEN];
    loop {
        let len = socket.recv(&mut buf).await?;
        sender.send(Event::FromServer(id, Bytes::copy_from_slice(&buf[..len])))?
    }
}

async fn udp_send_loop(
    socket: &UdpSocket,
    chunks: &mut UnboundedReceiver<Bytes>,
) -> anyhow::Result<()> {
    while let Some(chunk) = chunks.recv().await {
        socket.send(&chunk).await?;
    }
    Ok(())
}

async fn forward_udp_io(
    target: SocketAddr,
    id: FlowId,
    mut chunks: UnboundedReceiver<Bytes>,
    mut sender: SessionSender<Event>,
) {
    let socket = match connect_udp(target).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!("flow {id} {err:#}");
            let _ = sender.send(Event::Closed(id));
            return;
        }
    };
    let result = tokio::select! {
        result = udp_recv_loop(&socket, id, &mut sender) => result,
        result = udp_send_loop(&socket, &mut chunks) => result,
    };
    if let Err(err) = result {
        debug!("flow {id} {err}")
    }
    let _ = sender.send(Event::Closed(id));
}

async fn tcp_accept_session(
    listener: TcpListener,
    mut sender: SessionSender<Event>,
) -> anyhow::Result<()> {
    loop {
        // an accept can fail for one connection without the listener being
        // broken (the peer reset mid-handshake, descriptors ran out). only
        // that connection is lost, the listener keeps serving
        match listener.accept().await {
            Ok((stream, peer)) => sender.send(Event::Incoming(stream, peer))?,
            Err(err) => warn!("listener {err}"),
        }
    }
}

async fn udp_recv_session(
    socket: Arc<UdpSocket>,
    mut sender: SessionSender<Event>,
) -> anyhow::Result<()> {
    let mut buf = vec![0; MAX_CHUNK_LEN];
    loop {
        // a reply that bounced off a vanished client surfaces here as an
        // error on the next receive (icmp unreachable). the listener has to
        // outlive any single client, so errors are not fatal
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                sender.send(Event::Datagram(peer, Bytes::copy_from_slice(&buf[..len])))?
            }
            Err(err) => warn!("listener {err}"),
        }
    }
}

// the one consumer of client-bound udp traffic, all flows funnel through it
// so replies leave in the order the dispatcher produced them. a send failure
// kills only the flow it belongs to, the listener itself stays up
async fn udp_send_session(
    socket: Arc<UdpSocket>,
    mut egress: UnboundedReceiver<(FlowId, SocketAddr, Bytes)>,
    mut sender: SessionSender<Event>,
) -> anyhow::Result<()> {
    while let Some((id, peer, chunk)) = egress.recv().await {
        if let Err(err) = socket.send_to(&chunk, peer).await {
            debug!("flow {id} {peer} {err}");
            sender.send(Event::Closed(id))?
        }
    }
    anyhow::bail!("udp egress channel closed")
}

#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

pub async fn serve(
    listener: Listener,
    rules: RuleSet,
    remote: RemoteSpec,
    udp_timeout: Duration,
) -> anyhow::Result<()> {
    let mut session = Session::new();
    match listener {
        Listener::Tcp(listener) => {
            let mut dispatch =
                Dispatch::new(rules, remote, udp_timeout, session.sender(), None);
            tokio::select! {
                result = tcp_accept_session(listener, session.sender()) => result?,
                result = session.run(&mut dispatch) => result?,
            }
        }
        Listener::Udp(socket) => {
            let socket = Arc::new(socket);
            let (egress_sender, egress) = unbounded_channel();
            let udp = UdpContext {
                socket: socket.clone(),
                egress: egress_sender,
            };
            let mut dispatch =
                Dispatch::new(rules, remote, udp_timeout, session.sender(), Some(udp));
            tokio::select! {
                result = udp_recv_session(socket.clone(), session.sender()) => result?,
                result = udp_send_session(socket, egress, session.sender()) => result?,
                result = session.run(&mut dispatch) => result?,
            }
        }
    }
    anyhow::bail!("unreachable")
}

pub async fn serve_tcp(
    port: u16,
    rules: RuleSet,
    remote: RemoteSpec,
) -> anyhow::Result<()> {
    let listener = listen_tcp(port, &remote)?;
    info!("listening on {} tcp", listener.local_addr()?);
    serve(Listener::Tcp(listener), rules, remote, UDP_TIMEOUT).await
}

pub async fn serve_udp(
    port: u16,
    rules: RuleSet,
    remote: RemoteSpec,
) -> anyhow::Result<()> {
    let socket = listen_udp(port, &remote)?;
    info!("listening on {} udp", socket.local_addr()?);
    serve(Listener::Udp(socket), rules, remote, UDP_TIMEOUT).await
}
