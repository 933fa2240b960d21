use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    hash::Hash,
    time::{Duration, Instant},
};

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, trace, warn};

use super::{
    address::Address,
    connection::Handle,
    error::RouteError,
    wire::{
        Packet, PacketFlags, CHANNEL_ROUTING_REPLY, CHANNEL_ROUTING_REQUEST, SERVICE_ROUTING,
    },
};

/// How a known address is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingEntry {
    pub handle: Handle,
    /// The address announced itself on this very connection.
    pub direct: bool,
}

/// What the owner of the router has to do with a packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Hand the packet to local consumers.
    Deliver(Packet),
    /// Write the packet to the connection behind the handle.
    Send(Handle, Packet),
    /// Drop the connection behind the handle.
    Disconnect(Handle),
}

type EchoKey = (Address, u16, u16, u16);

/// Routing table, blacklist and echo cache of one node.
///
/// The router does no I/O. It turns packets into [`Action`]s and is owned by
/// the node's routing lane, so it needs no locking.
pub struct Router {
    address: Address,
    default_ttl: u8,
    echo_ttl: Duration,
    counter: u16,
    generation: u64,
    routes: HashMap<Address, RoutingEntry>,
    handle_addresses: HashMap<Handle, Address>,
    blacklist: HashSet<Address>,
    echoes: ExpiringSet<EchoKey>,
}

impl Router {
    pub fn new(address: Address, default_ttl: u8, echo_ttl: Duration) -> Self {
        Self {
            address,
            default_ttl,
            echo_ttl,
            counter: 0,
            generation: 0,
            routes: HashMap::new(),
            handle_addresses: HashMap::new(),
            blacklist: HashSet::new(),
            echoes: ExpiringSet::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Builds a packet originating at this node, stamped with the next
    /// message counter and the default TTL.
    pub fn format_packet(
        &mut self,
        target: Address,
        service: u16,
        channel: u16,
        flags: PacketFlags,
        payload: Vec<u8>,
    ) -> Packet {
        self.counter = self.counter.wrapping_add(1);
        Packet {
            flags,
            ttl: self.default_ttl,
            service,
            channel,
            counter: self.counter,
            sender: self.address,
            target,
            payload,
        }
    }

    /// The routing request sent on every fresh connection so the peer learns
    /// which address sits behind it.
    pub fn handshake(&mut self, handle: Handle) -> Action {
        let packet = self.direct_packet(CHANNEL_ROUTING_REQUEST);
        trace!(%handle, "sending routing request");
        Action::Send(handle, packet)
    }

    /// Decides what happens to a packet that arrived on `handle`.
    pub fn route(&mut self, handle: Handle, mut packet: Packet) -> Vec<Action> {
        trace!(
            %handle,
            sender = %format_args!("{:#}", packet.sender),
            target = %format_args!("{:#}", packet.target),
            service = packet.service,
            channel = packet.channel,
            direct = packet.is_direct(),
            broadcast = packet.is_broadcast(),
            ttl = packet.ttl,
            "routing packet"
        );

        if self.blacklist.contains(&packet.sender) {
            if packet.is_direct() {
                info!(%handle, sender = %format_args!("{:#}", packet.sender), "blacklisted peer announced itself, disconnecting");
                return vec![Action::Disconnect(handle)];
            }
            trace!("dropping packet from blacklisted sender");
            return Vec::new();
        }

        if packet.is_direct() {
            return self.route_direct(handle, packet);
        }

        if packet.is_broadcast() {
            return self.route_broadcast(handle, packet);
        }

        if packet.target == self.address {
            return vec![Action::Deliver(packet)];
        }

        if packet.ttl <= 1 {
            debug!(target = %format_args!("{:#}", packet.target), "packet ran out of hops, dropping");
            return Vec::new();
        }
        packet.ttl -= 1;

        match self.lookup(&packet.target) {
            Some(entry) if entry.handle != handle => vec![Action::Send(entry.handle, packet)],
            _ => {
                debug!(target = %format_args!("{:#}", packet.target), "no route for packet, dropping");
                Vec::new()
            }
        }
    }

    /// Routes a packet originating at this node. Unlike forwarded traffic a
    /// missing route is reported to the caller.
    pub fn send(&mut self, packet: Packet) -> Result<Action, RouteError> {
        if packet.target == self.address {
            return Ok(Action::Deliver(packet));
        }
        if self.blacklist.contains(&packet.target) {
            return Err(RouteError::Blacklisted(packet.target));
        }
        match self.lookup(&packet.target) {
            Some(entry) => Ok(Action::Send(entry.handle, packet)),
            None => Err(RouteError::NoRoute(packet.target)),
        }
    }

    /// Floods a packet originating at this node to every direct peer.
    pub fn broadcast(&mut self, service: u16, channel: u16, payload: Vec<u8>) -> Vec<Action> {
        let packet = self.format_packet(
            Address::from_bytes([0; 32]),
            service,
            channel,
            PacketFlags::new(false, true, false),
            payload,
        );
        self.register_echo(&packet);
        self.flood(&packet, None)
    }

    pub fn lookup(&self, address: &Address) -> Option<RoutingEntry> {
        self.routes.get(address).copied()
    }

    pub fn handle_to_direct_address(&self, handle: Handle) -> Option<Address> {
        self.handle_addresses.get(&handle).copied()
    }

    /// Every handle that completed the routing handshake, with the address
    /// it announced.
    pub fn handle_addresses(&self) -> impl Iterator<Item = (Handle, Address)> + '_ {
        self.handle_addresses
            .iter()
            .map(|(handle, address)| (*handle, *address))
    }

    /// Bumped whenever the routing table changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every address reachable over a direct connection, one entry each.
    pub fn direct_peers(&self) -> Vec<(Address, RoutingEntry)> {
        self.routes
            .iter()
            .filter(|(_, entry)| entry.direct)
            .map(|(address, entry)| (*address, *entry))
            .collect()
    }

    /// Forgets everything learned over `handle`. If another connection to
    /// the same address is known, the route moves over to it.
    pub fn remove_handle(&mut self, handle: Handle) {
        let Some(address) = self.handle_addresses.remove(&handle) else {
            return;
        };
        self.generation += 1;
        if self.routes.get(&address).map(|entry| entry.handle) != Some(handle) {
            return;
        }
        let replacement = self
            .handle_addresses
            .iter()
            .find(|(_, other)| **other == address)
            .map(|(handle, _)| *handle);
        match replacement {
            Some(other) => {
                debug!(address = %format_args!("{:#}", address), from = %handle, to = %other, "route moved to another connection");
                self.routes.insert(
                    address,
                    RoutingEntry {
                        handle: other,
                        direct: true,
                    },
                );
            }
            None => {
                debug!(address = %format_args!("{:#}", address), %handle, "route removed");
                self.routes.remove(&address);
            }
        }
    }

    /// Refuses all traffic to and from `address`. Returns the handles whose
    /// connections must be dropped.
    pub fn blacklist(&mut self, address: Address) -> Vec<Handle> {
        if self.blacklist.insert(address) {
            warn!(address = %format_args!("{:#}", address), "address blacklisted");
        }
        self.routes.remove(&address);
        self.generation += 1;
        let handles: Vec<Handle> = self
            .handle_addresses
            .iter()
            .filter(|(_, other)| **other == address)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &handles {
            self.handle_addresses.remove(handle);
        }
        handles
    }

    /// Lifts a blacklist entry. Returns false if the address was not listed.
    pub fn whitelist(&mut self, address: &Address) -> bool {
        let removed = self.blacklist.remove(address);
        if removed {
            info!(address = %format_args!("{:#}", address), "address whitelisted");
        }
        removed
    }

    pub fn is_blacklisted(&self, address: &Address) -> bool {
        self.blacklist.contains(address)
    }

    /// Ages out echo cache entries and routes whose connection is gone.
    pub fn cleanup(&mut self, is_live: impl Fn(Handle) -> bool) {
        self.echoes.remove_expired();
        let stale: Vec<Handle> = self
            .handle_addresses
            .keys()
            .copied()
            .filter(|handle| !is_live(*handle))
            .collect();
        for handle in stale {
            self.remove_handle(handle);
        }
        trace!(
            routes = self.routes.len(),
            echoes = self.echoes.len(),
            "router cleanup done"
        );
    }

    fn route_direct(&mut self, handle: Handle, packet: Packet) -> Vec<Action> {
        if packet.service != SERVICE_ROUTING {
            return vec![Action::Deliver(packet)];
        }
        match packet.channel {
            CHANNEL_ROUTING_REQUEST => {
                self.associate(handle, packet.sender);
                vec![Action::Send(
                    handle,
                    self.direct_packet(CHANNEL_ROUTING_REPLY),
                )]
            }
            CHANNEL_ROUTING_REPLY => {
                self.associate(handle, packet.sender);
                Vec::new()
            }
            channel => {
                debug!(%handle, channel, "unknown routing channel, ignoring");
                Vec::new()
            }
        }
    }

    fn route_broadcast(&mut self, handle: Handle, mut packet: Packet) -> Vec<Action> {
        if packet.sender == self.address || self.is_echo(&packet) {
            trace!("dropping broadcast echo");
            return Vec::new();
        }
        self.register_echo(&packet);

        let mut actions = Vec::new();
        if packet.ttl > 1 {
            let mut forwarded = packet.clone();
            forwarded.ttl -= 1;
            actions = self.flood(&forwarded, Some(handle));
        }
        packet.ttl = packet.ttl.saturating_sub(1);
        actions.push(Action::Deliver(packet));
        actions
    }

    fn flood(&self, packet: &Packet, except: Option<Handle>) -> Vec<Action> {
        self.routes
            .values()
            .filter(|entry| entry.direct && Some(entry.handle) != except)
            .map(|entry| Action::Send(entry.handle, packet.clone()))
            .collect()
    }

    fn associate(&mut self, handle: Handle, address: Address) {
        if address == self.address {
            warn!(%handle, "peer announced our own address, ignoring");
            return;
        }
        self.handle_addresses.insert(handle, address);
        self.generation += 1;
        self.routes.insert(
            address,
            RoutingEntry {
                handle,
                direct: true,
            },
        );
        info!(%handle, address = %format_args!("{:#}", address), "associated handle with address");
    }

    fn direct_packet(&mut self, channel: u16) -> Packet {
        self.format_packet(
            Address::from_bytes([0; 32]),
            SERVICE_ROUTING,
            channel,
            PacketFlags::new(true, false, false),
            Vec::new(),
        )
    }

    fn echo_key(packet: &Packet) -> EchoKey {
        (packet.sender, packet.service, packet.channel, packet.counter)
    }

    fn is_echo(&self, packet: &Packet) -> bool {
        self.echoes.contains(&Self::echo_key(packet))
    }

    fn register_echo(&mut self, packet: &Packet) {
        self.echoes.insert(Self::echo_key(packet), self.echo_ttl);
    }
}

/// A set whose members disappear once their time to live has passed.
struct ExpiringSet<T> {
    /// Membership checks.
    set: HashSet<T>,
    /// Members ordered by expiry, soonest first.
    queue: BinaryHeap<(Reverse<Instant>, T)>,
}

impl<T: Copy + Eq + Hash + Ord> ExpiringSet<T> {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            queue: BinaryHeap::new(),
        }
    }

    fn insert(&mut self, value: T, ttl: Duration) {
        if self.set.insert(value) {
            self.queue.push((Reverse(Instant::now() + ttl), value));
        }
    }

    fn contains(&self, value: &T) -> bool {
        self.set.contains(value)
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn remove_expired(&mut self) {
        let now = Instant::now();
        while let Some((Reverse(expiry), value)) = self.queue.peek().copied() {
            if expiry > now {
                break;
            }
            self.queue.pop();
            self.set.remove(&value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::{CHANNEL_RPC_CALL, DEFAULT_TTL, SERVICE_RPC};

    fn router(seed: &[u8]) -> Router {
        Router::new(Address::derive(seed), DEFAULT_TTL, Duration::from_secs(600))
    }

    fn handle(raw: u64) -> Handle {
        Handle::new(raw)
    }

    /// Runs the routing handshake between `a` (on handle `ha`) and `b` (on
    /// handle `hb`).
    fn handshake(a: &mut Router, ha: Handle, b: &mut Router, hb: Handle) {
        let Action::Send(_, request) = a.handshake(ha) else {
            panic!("handshake must send");
        };
        let replies = b.route(hb, request);
        let [Action::Send(_, reply)] = &replies[..] else {
            panic!("expected a routing reply, got {:?}", replies);
        };
        assert!(a.route(ha, reply.clone()).is_empty());
    }

    fn rpc_packet(from: &mut Router, target: Address) -> Packet {
        from.format_packet(
            target,
            SERVICE_RPC,
            CHANNEL_RPC_CALL,
            PacketFlags::new(false, false, true),
            b"call".to_vec(),
        )
    }

    #[test]
    fn handshake_associates_both_sides() {
        let mut a = router(b"a");
        let mut b = router(b"b");
        handshake(&mut a, handle(1), &mut b, handle(7));

        assert_eq!(a.handle_to_direct_address(handle(1)), Some(b.address()));
        assert_eq!(b.handle_to_direct_address(handle(7)), Some(a.address()));
        assert_eq!(a.direct_peers().len(), 1);
        assert_eq!(b.direct_peers().len(), 1);
    }

    #[test]
    fn local_target_is_delivered() {
        let mut a = router(b"a");
        let mut b = router(b"b");
        let packet = rpc_packet(&mut a, b.address());
        assert_eq!(
            b.route(handle(1), packet.clone()),
            vec![Action::Deliver(packet)]
        );
    }

    #[test]
    fn forwards_with_decremented_ttl_or_drops() {
        let mut a = router(b"a");
        let mut b = router(b"b");
        let mut c = router(b"c");
        handshake(&mut b, handle(2), &mut c, handle(3));

        let packet = rpc_packet(&mut a, c.address());
        let actions = b.route(handle(1), packet.clone());
        let [Action::Send(to, forwarded)] = &actions[..] else {
            panic!("expected a forward, got {:?}", actions);
        };
        assert_eq!(*to, handle(2));
        assert_eq!(forwarded.ttl, packet.ttl - 1);

        let unknown = rpc_packet(&mut a, Address::derive(b"nobody"));
        assert!(b.route(handle(1), unknown).is_empty());

        let mut expiring = rpc_packet(&mut a, c.address());
        expiring.ttl = 1;
        assert!(b.route(handle(1), expiring).is_empty());
    }

    #[test]
    fn local_sends_report_missing_routes() {
        let mut a = router(b"a");
        let mut b = router(b"b");
        let nobody = Address::derive(b"nobody");
        let packet = rpc_packet(&mut a, nobody);
        assert_eq!(a.send(packet), Err(RouteError::NoRoute(nobody)));

        handshake(&mut a, handle(1), &mut b, handle(2));
        let packet = rpc_packet(&mut a, b.address());
        assert!(matches!(a.send(packet), Ok(Action::Send(h, _)) if h == handle(1)));

        let own_address = a.address();
        let own = rpc_packet(&mut a, own_address);
        assert!(matches!(a.send(own), Ok(Action::Deliver(_))));
    }

    #[test]
    fn blacklist_drops_routes_until_whitelisted() {
        let mut a = router(b"a");
        let mut b = router(b"b");
        handshake(&mut a, handle(1), &mut b, handle(2));

        assert_eq!(a.blacklist(b.address()), vec![handle(1)]);
        assert!(a.is_blacklisted(&b.address()));
        assert!(a.direct_peers().is_empty());

        let packet = rpc_packet(&mut a, b.address());
        assert_eq!(a.send(packet), Err(RouteError::Blacklisted(b.address())));

        let Action::Send(_, request) = b.handshake(handle(2)) else {
            unreachable!()
        };
        assert_eq!(a.route(handle(4), request), vec![Action::Disconnect(handle(4))]);

        assert!(a.whitelist(&b.address()));
        assert!(!a.whitelist(&b.address()));
        handshake(&mut a, handle(5), &mut b, handle(6));
        assert_eq!(a.lookup(&b.address()).map(|e| e.handle), Some(handle(5)));
    }

    #[test]
    fn broadcasts_flood_once_and_suppress_echoes() {
        let mut a = router(b"a");
        let mut b = router(b"b");
        let mut c = router(b"c");
        let mut d = router(b"d");
        handshake(&mut b, handle(1), &mut a, handle(10));
        handshake(&mut b, handle(2), &mut c, handle(20));
        handshake(&mut b, handle(3), &mut d, handle(30));

        let actions = a.broadcast(9, 1, b"news".to_vec());
        let [Action::Send(_, packet)] = &actions[..] else {
            panic!("expected one flood, got {:?}", actions);
        };

        let actions = b.route(handle(1), packet.clone());
        let sent_to: HashSet<Handle> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(h, _) => Some(*h),
                _ => None,
            })
            .collect();
        assert_eq!(sent_to, [handle(2), handle(3)].into_iter().collect());
        assert!(actions.iter().any(|a| matches!(a, Action::Deliver(_))));

        assert!(b.route(handle(2), packet.clone()).is_empty());
        assert!(a.route(handle(10), packet.clone()).is_empty());
    }

    #[test]
    fn removing_a_handle_falls_back_to_a_second_connection() {
        let mut a = router(b"a");
        let mut b = router(b"b");
        handshake(&mut a, handle(1), &mut b, handle(2));
        handshake(&mut a, handle(3), &mut b, handle(4));

        a.remove_handle(handle(3));
        assert_eq!(a.lookup(&b.address()).map(|e| e.handle), Some(handle(1)));
        a.remove_handle(handle(1));
        assert!(a.lookup(&b.address()).is_none());
    }

    #[test]
    fn cleanup_forgets_dead_handles_and_expired_echoes() {
        let mut a = Router::new(Address::derive(b"a"), DEFAULT_TTL, Duration::ZERO);
        let mut b = router(b"b");
        handshake(&mut a, handle(1), &mut b, handle(2));
        a.broadcast(9, 1, Vec::new());
        assert_eq!(a.echoes.len(), 1);

        a.cleanup(|_| false);
        assert_eq!(a.echoes.len(), 0);
        assert!(a.direct_peers().is_empty());
        assert!(a.handle_to_direct_address(handle(1)).is_none());
    }
}
