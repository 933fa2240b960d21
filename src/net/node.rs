use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

use super::{
    address::Address,
    config::NodeConfig,
    connection::{Connection, ConnectionEvent, Direction, FrameSettings, Handle},
    error::{NodeError, RouteError},
    ip_addr_to_socket_addr,
    registry::PeerRegistry,
    router::{Action, Router, RoutingEntry},
    uri::Uri,
    wire::{Packet, PacketFlags, CHANNEL_RPC_CALL, CHANNEL_RPC_REPLY, SERVICE_ROUTING, SERVICE_RPC},
};
use crate::rpc::{
    codec::Arguments,
    dispatch::{panic_message, Dispatcher, Handler, RpcMessage},
    error::CallError,
    promise::{Promise, PromiseId},
};

/// A directly connected peer as seen at one point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: Address,
    pub handle: Handle,
    /// Set for peers we dialled.
    pub locator: Option<Uri>,
    pub direction: Option<Direction>,
    pub direct: bool,
}

/// Work posted to the routing lane.
enum Command {
    Call {
        id: PromiseId,
        target: Address,
        payload: Vec<u8>,
    },
    Reply {
        target: Address,
        payload: Vec<u8>,
    },
    Send {
        target: Address,
        service: u16,
        channel: u16,
        payload: Vec<u8>,
        result: oneshot::Sender<Result<(), RouteError>>,
    },
    Broadcast {
        service: u16,
        channel: u16,
        payload: Vec<u8>,
    },
    Blacklist(Address),
    Whitelist(Address),
    Cleanup,
}

/// Read-only copy of the routing table, republished by the lane whenever
/// the table changes. Readers may see a slightly stale view.
#[derive(Default)]
struct RouteSnapshot {
    generation: u64,
    by_handle: HashMap<Handle, Address>,
    direct: Vec<(Address, RoutingEntry)>,
}

#[derive(Default)]
struct Subscriptions {
    channels: Mutex<HashMap<(u16, u16), Vec<mpsc::UnboundedSender<Packet>>>>,
}

impl Subscriptions {
    fn add(&self, service: u16, channel: u16) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry((service, channel))
            .or_default()
            .push(tx);
        rx
    }

    fn dispatch(&self, packet: Packet) -> bool {
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(&(packet.service, packet.channel)) else {
            return false;
        };
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            let _ = tx.send(packet.clone());
        }
        !subscribers.is_empty()
    }
}

/// State shared between the node handle and its tasks.
struct Shared {
    config: NodeConfig,
    address: Address,
    settings: FrameSettings,
    registry: PeerRegistry,
    dispatcher: Dispatcher,
    subscriptions: Subscriptions,
    routes: RwLock<RouteSnapshot>,
}

impl Shared {
    fn dial(&self, locator: Uri, events: &mpsc::UnboundedSender<ConnectionEvent>) -> Handle {
        let handle = self.registry.allocate_handle();
        let connection = Connection::new(handle, Direction::Outgoing, self.settings, events.clone());
        self.registry
            .add_connection(Some(locator.clone()), connection.clone());
        debug!(%handle, %locator, "dialling peer");
        connection.connect(locator);
        handle
    }

    fn maintenance_tick(
        &self,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
        commands: &mpsc::UnboundedSender<Command>,
        last_cleanup: &mut Instant,
    ) {
        for locator in self.registry.peers_to_connect() {
            self.dial(locator, events);
        }

        if last_cleanup.elapsed() >= self.config.cleanup_interval {
            *last_cleanup = Instant::now();
            let timed_out = self.dispatcher.pending().sweep();
            let _ = commands.send(Command::Cleanup);
            debug!(
                timed_out,
                pending = self.dispatcher.pending().len(),
                connections = self.registry.len(),
                "cleanup"
            );
        }
    }
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    ports: Vec<u16>,
    tasks: Vec<JoinHandle<()>>,
}

/// One overlay node.
///
/// A started node runs three kinds of tasks: one acceptor per listening
/// port, a maintenance loop re-dialling persistent peers, and the routing
/// lane. The lane exclusively owns the [`Router`] and handles every
/// connection event and outbound packet in order.
pub struct Node {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Node {
    /// A node with a fresh random address.
    pub fn new(config: NodeConfig) -> Self {
        Self::with_address(config, Address::random())
    }

    pub fn with_address(config: NodeConfig, address: Address) -> Self {
        let settings = FrameSettings::from(&config);
        let dispatcher = Dispatcher::new(config.call_timeout);
        Self {
            shared: Arc::new(Shared {
                config,
                address,
                settings,
                registry: PeerRegistry::new(),
                dispatcher,
                subscriptions: Subscriptions::default(),
                routes: RwLock::new(RouteSnapshot::default()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Address {
        self.shared.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.shared.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Binds one listener per port, marks `peers` persistent and starts the
    /// node's tasks. Port 0 binds an ephemeral port; see
    /// [`listening_ports`](Node::listening_ports).
    pub async fn start(
        &self,
        ports: &[u16],
        peers: impl IntoIterator<Item = Uri>,
    ) -> Result<(), NodeError> {
        if self.is_running() {
            return Err(NodeError::AlreadyRunning);
        }

        let mut listeners = Vec::with_capacity(ports.len());
        for &port in ports {
            let addr = ip_addr_to_socket_addr(self.shared.config.listen_ip, port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| NodeError::Bind { port, source })?;
            let bound = listener
                .local_addr()
                .map_err(|source| NodeError::Bind { port, source })?
                .port();
            listeners.push((bound, listener));
        }

        for peer in peers {
            self.shared.registry.add_persistent_peer(peer);
        }

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }
        *self.shared.routes.write() = RouteSnapshot::default();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let span = debug_span!("node", address = %format_args!("{:#}", self.shared.address));

        let lane = Lane {
            shared: self.shared.clone(),
            router: Router::new(
                self.shared.address,
                self.shared.config.default_ttl,
                self.shared.config.echo_cache_ttl,
            ),
            commands: commands_tx.clone(),
        };
        let mut tasks = vec![tokio::spawn(
            lane.run(events_rx, commands_rx).instrument(span.clone()),
        )];

        let mut bound_ports = Vec::with_capacity(listeners.len());
        for (port, listener) in listeners {
            info!(port, "listening");
            bound_ports.push(port);
            tasks.push(tokio::spawn(
                accept_loop(self.shared.clone(), listener, events_tx.clone())
                    .instrument(debug_span!(parent: &span, "acceptor", port)),
            ));
        }

        tasks.push(tokio::spawn(
            maintain(self.shared.clone(), events_tx.clone(), commands_tx.clone())
                .instrument(span.clone()),
        ));

        info!(
            address = %self.shared.address,
            ports = ?bound_ports,
            persistent = self.shared.registry.persistent_peers().len(),
            "node started"
        );
        *running = Some(Running {
            commands: commands_tx,
            events: events_tx,
            ports: bound_ports,
            tasks,
        });
        Ok(())
    }

    /// Halts the acceptors, the maintenance loop and the routing lane, then
    /// closes every connection. Calls in flight on those connections fail
    /// with [`CallError::Unreachable`]; other pending calls are left to their
    /// deadline.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        for task in &running.tasks {
            task.abort();
        }
        let connections = self.shared.registry.drain();
        for connection in &connections {
            connection.close();
            self.shared.dispatcher.pending().fail_handle(
                connection.handle(),
                CallError::Unreachable("node stopped".to_string()),
            );
        }
        *self.shared.routes.write() = RouteSnapshot::default();
        info!(closed = connections.len(), "node stopped");
    }

    /// Fails every call still pending, then stops the node.
    pub fn shutdown(&self) {
        let failed = self
            .shared
            .dispatcher
            .pending()
            .fail_all(CallError::Shutdown);
        self.stop();
        info!(failed, "node shut down");
    }

    /// Ports actually bound by the last successful [`start`](Node::start).
    pub fn listening_ports(&self) -> Vec<u16> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.ports.clone())
            .unwrap_or_default()
    }

    /// Keeps a connection to `locator` up, dialling it again whenever it is
    /// missing. Takes effect on the next maintenance tick.
    pub fn add_persistent_peer(&self, locator: Uri) -> bool {
        self.shared.registry.add_persistent_peer(locator)
    }

    pub fn remove_persistent_peer(&self, locator: &Uri) -> bool {
        self.shared.registry.remove_persistent_peer(locator)
    }

    /// Dials `locator` once, without re-dialling it later. Must be called
    /// from within the runtime the node was started on.
    pub fn connect(&self, locator: Uri) -> Result<Handle, NodeError> {
        let events = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.events.clone())
            .ok_or(NodeError::NotRunning)?;
        Ok(self.shared.dial(locator, &events))
    }

    /// Exposes `handler` to remote callers under `(protocol, function)`.
    pub fn expose<Args, H>(&self, protocol: u64, function: u64, handler: H) -> bool
    where
        Args: 'static,
        H: Handler<Args>,
    {
        self.shared
            .dispatcher
            .functions()
            .expose(protocol, function, handler)
    }

    /// Calls `(protocol, function)` on the node at `target`. Never blocks;
    /// every outcome, including an unreachable target, arrives through the
    /// returned promise.
    pub fn call(
        &self,
        target: Address,
        protocol: u64,
        function: u64,
        args: impl Arguments,
    ) -> Promise {
        let dispatcher = &self.shared.dispatcher;
        let promise = dispatcher.make_promise(target, protocol, function);
        let payload = match dispatcher
            .call_message(&promise, &args)
            .and_then(|message| message.encode())
        {
            Ok(payload) => payload,
            Err(error) => {
                dispatcher.fail(promise.id(), error.into());
                return promise;
            }
        };
        let posted = self.command(Command::Call {
            id: promise.id(),
            target,
            payload,
        });
        if let Err(error) = posted {
            dispatcher.fail(promise.id(), CallError::Unreachable(error.to_string()));
        }
        promise
    }

    /// Sends an application packet to `target`. Services 0 and 1 are used by
    /// the node itself and are refused here.
    pub async fn send(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Vec<u8>,
    ) -> Result<(), RouteError> {
        check_service(service)?;
        let (tx, rx) = oneshot::channel();
        self.command(Command::Send {
            target,
            service,
            channel,
            payload,
            result: tx,
        })?;
        rx.await.map_err(|_| RouteError::NotRunning)?
    }

    /// Floods a packet to every node reachable through direct peers.
    pub fn broadcast(&self, service: u16, channel: u16, payload: Vec<u8>) -> Result<(), RouteError> {
        check_service(service)?;
        self.command(Command::Broadcast {
            service,
            channel,
            payload,
        })
    }

    /// Packets delivered to this node on `(service, channel)`.
    pub fn subscribe(&self, service: u16, channel: u16) -> mpsc::UnboundedReceiver<Packet> {
        self.shared.subscriptions.add(service, channel)
    }

    /// Drops any connection to `address` and refuses traffic to or from it.
    pub fn blacklist(&self, address: Address) -> Result<(), RouteError> {
        self.command(Command::Blacklist(address))
    }

    pub fn whitelist(&self, address: Address) -> Result<(), RouteError> {
        self.command(Command::Whitelist(address))
    }

    /// Snapshot of the peers reachable over a direct connection.
    pub fn direct_peers(&self) -> Vec<PeerInfo> {
        let routes = self.shared.routes.read();
        let registry = &self.shared.registry;
        routes
            .direct
            .iter()
            .map(|(address, entry)| PeerInfo {
                address: *address,
                handle: entry.handle,
                locator: registry.locator_of(entry.handle),
                direction: registry
                    .lookup_by_handle(entry.handle)
                    .map(|connection| connection.direction()),
                direct: entry.direct,
            })
            .collect()
    }

    /// The address announced on `handle`, once the peer completed the
    /// routing handshake.
    pub fn handle_to_direct_address(&self, handle: Handle) -> Option<Address> {
        self.shared.routes.read().by_handle.get(&handle).copied()
    }

    /// The address of the peer currently connected at `locator`.
    pub fn uri_to_direct_address(&self, locator: &Uri) -> Option<Address> {
        let connection = self.shared.registry.lookup_by_locator(locator)?;
        self.handle_to_direct_address(connection.handle())
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.dispatcher.pending().len()
    }

    fn command(&self, command: Command) -> Result<(), RouteError> {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(RouteError::NotRunning)?;
        running
            .commands
            .send(command)
            .map_err(|_| RouteError::NotRunning)
    }
}

fn check_service(service: u16) -> Result<(), RouteError> {
    match service {
        SERVICE_ROUTING | SERVICE_RPC => Err(RouteError::ReservedService(service)),
        _ => Ok(()),
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The routing lane: the only place the router is touched.
struct Lane {
    shared: Arc<Shared>,
    router: Router,
    commands: mpsc::UnboundedSender<Command>,
}

impl Lane {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        debug!("routing lane started");
        loop {
            select! {
                Some(event) = events.recv() => self.on_event(event),
                Some(command) = commands.recv() => self.on_command(command),
                else => break,
            }
            self.publish();
        }
        debug!("routing lane stopped");
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { handle } => {
                self.shared.registry.mark_connected(handle);
                let handshake = self.router.handshake(handle);
                self.execute(handshake);
            }
            ConnectionEvent::ConnectFailed { handle, error } => {
                self.forget(handle, error.to_string());
            }
            ConnectionEvent::Left { handle, error } => {
                let reason = error.map_or_else(|| "connection closed".to_string(), |e| e.to_string());
                self.forget(handle, reason);
            }
            ConnectionEvent::Message { handle, payload } => match Packet::decode(&payload) {
                Ok(packet) => {
                    for action in self.router.route(handle, packet) {
                        self.execute(action);
                    }
                }
                Err(error) => {
                    warn!(%handle, %error, "undecodable packet, closing connection");
                    self.close(handle);
                }
            },
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Call {
                id,
                target,
                payload,
            } => {
                let packet = self.router.format_packet(
                    target,
                    SERVICE_RPC,
                    CHANNEL_RPC_CALL,
                    PacketFlags::new(false, false, true),
                    payload,
                );
                match self.router.send(packet) {
                    Ok(Action::Send(handle, packet)) => {
                        self.shared.dispatcher.pending().associate(id, handle);
                        if !self.transmit(handle, &packet) {
                            self.shared.dispatcher.fail(
                                id,
                                CallError::Unreachable(format!("connection {} is gone", handle)),
                            );
                        }
                    }
                    Ok(action) => self.execute(action),
                    Err(error) => {
                        debug!(%id, %error, "call cannot be routed");
                        self.shared
                            .dispatcher
                            .fail(id, CallError::Unreachable(error.to_string()));
                    }
                }
            }
            Command::Reply { target, payload } => {
                let packet = self.router.format_packet(
                    target,
                    SERVICE_RPC,
                    CHANNEL_RPC_REPLY,
                    PacketFlags::new(false, false, false),
                    payload,
                );
                match self.router.send(packet) {
                    Ok(action) => self.execute(action),
                    Err(error) => debug!(%error, "reply cannot be routed, dropping"),
                }
            }
            Command::Send {
                target,
                service,
                channel,
                payload,
                result,
            } => {
                let packet = self.router.format_packet(
                    target,
                    service,
                    channel,
                    PacketFlags::new(false, false, false),
                    payload,
                );
                let outcome = self.router.send(packet).map(|action| self.execute(action));
                let _ = result.send(outcome);
            }
            Command::Broadcast {
                service,
                channel,
                payload,
            } => {
                for action in self.router.broadcast(service, channel, payload) {
                    self.execute(action);
                }
            }
            Command::Blacklist(address) => {
                for handle in self.router.blacklist(address) {
                    self.close(handle);
                }
            }
            Command::Whitelist(address) => {
                self.router.whitelist(&address);
            }
            Command::Cleanup => {
                let registry = &self.shared.registry;
                self.router.cleanup(|handle| {
                    registry
                        .lookup_by_handle(handle)
                        .map_or(false, |connection| !connection.is_closed())
                });
            }
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Send(handle, packet) => {
                self.transmit(handle, &packet);
            }
            Action::Deliver(packet) => self.deliver(packet),
            Action::Disconnect(handle) => self.close(handle),
        }
    }

    fn transmit(&self, handle: Handle, packet: &Packet) -> bool {
        let Some(connection) = self.shared.registry.lookup_by_handle(handle) else {
            debug!(%handle, "no connection for handle, dropping packet");
            return false;
        };
        match connection.send(packet.encode()) {
            Ok(()) => true,
            Err(error) => {
                debug!(%handle, %error, "could not queue packet");
                false
            }
        }
    }

    fn deliver(&mut self, packet: Packet) {
        if packet.service != SERVICE_RPC {
            let (service, channel) = (packet.service, packet.channel);
            if !self.shared.subscriptions.dispatch(packet) {
                trace!(service, channel, "no subscriber for packet");
            }
            return;
        }

        match RpcMessage::decode(&packet.payload) {
            Ok(RpcMessage::Call {
                id,
                protocol,
                function,
                args,
            }) => {
                let shared = self.shared.clone();
                let commands = self.commands.clone();
                let caller = packet.sender;
                trace!(%id, protocol, function, "serving call");
                tokio::task::spawn_blocking(move || {
                    let reply = shared.dispatcher.serve(id, protocol, function, &args);
                    match reply.encode() {
                        Ok(payload) => {
                            let _ = commands.send(Command::Reply {
                                target: caller,
                                payload,
                            });
                        }
                        Err(error) => warn!(%id, %error, "could not encode reply"),
                    }
                });
            }
            Ok(RpcMessage::Reply { id, result }) => {
                if !self.shared.dispatcher.resolve(id, packet.sender, result) {
                    debug!(%id, "reply for an unknown, settled or foreign call");
                }
            }
            Err(error) => {
                warn!(sender = %format_args!("{:#}", packet.sender), %error, "malformed rpc message, dropping");
            }
        }
    }

    fn close(&self, handle: Handle) {
        if let Some(connection) = self.shared.registry.lookup_by_handle(handle) {
            connection.close();
        }
    }

    fn forget(&mut self, handle: Handle, reason: String) {
        self.shared.registry.remove_connection(handle);
        self.router.remove_handle(handle);
        self.shared
            .dispatcher
            .pending()
            .fail_handle(handle, CallError::Unreachable(reason));
    }

    fn publish(&self) {
        let generation = self.router.generation();
        if self.shared.routes.read().generation == generation {
            return;
        }
        let snapshot = RouteSnapshot {
            generation,
            by_handle: self.router.handle_addresses().collect(),
            direct: self.router.direct_peers(),
        };
        *self.shared.routes.write() = snapshot;
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let handle = shared.registry.allocate_handle();
                debug!(%handle, %remote, "accepted connection");
                let connection =
                    Connection::new(handle, Direction::Incoming, shared.settings, events.clone());
                shared.registry.add_connection(None, connection.clone());
                connection.accept(stream);
            }
            Err(error) => {
                warn!(%error, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn maintain(
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let mut last_cleanup = Instant::now();
    run_ticks(shared.config.maintenance_interval, || {
        shared.maintenance_tick(&events, &commands, &mut last_cleanup)
    })
    .await
}

/// Runs `tick` once per `period`, forever. A tick that panics is logged and
/// the loop carries on with the next one.
async fn run_ticks(period: Duration, mut tick: impl FnMut()) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(&mut tick)) {
            error!(reason = %panic_message(&*panic), "maintenance tick failed");
        }
    }
}
