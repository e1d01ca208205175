//! Tunnel registry: the shared index of live tunnels
//!
//! Two maps under one mutex: `hostname → targets` for routing inbound
//! connections, and `connection → state` for per-connection bookkeeping
//! (open sessions, owned tunnel references, origin-port counter). The mutex
//! is only ever held across map edits; every network-facing operation
//! happens outside it.
//!
//! The registry is generic over the control-connection handle (`H`) and the
//! session-channel identifier (`C`), keeping it a pure data structure; the
//! SSH server instantiates it with its transport's types.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tracing::{debug, info};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one tunnel-control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next connection id.
    pub fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live tunneled destination. Identity is by allocation: two targets with
/// identical fields are distinct entries.
pub struct Target<H> {
    pub key_id: String,
    pub owner: ConnId,
    /// Handle for opening channels on the owning control connection.
    pub handle: H,
    /// Destination address echoed back to the client on channel open.
    pub bind_addr: String,
    /// The port the client named in its forward request.
    pub bind_port: u32,
    origin_port: Arc<AtomicU16>,
}

impl<H> Target<H> {
    /// Next synthetic origin port for labeling channel opens. Shared across
    /// all of the owning connection's targets; wraps at 2^16.
    pub fn next_origin_port(&self) -> u16 {
        self.origin_port.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Bookkeeping entry tying an endpoint hostname to the target registered
/// under it. Owned by the registering connection; enumerated at teardown.
struct TunnelRef<H> {
    hostname: String,
    target: Arc<Target<H>>,
}

struct ConnectionState<H, C> {
    key_id: String,
    handle: H,
    sessions: HashSet<C>,
    tunnels: Vec<TunnelRef<H>>,
    ever_had_session: bool,
    origin_port: Arc<AtomicU16>,
}

/// Outcome of removing a session channel from a connection.
#[derive(Debug, Clone, Copy)]
pub struct SessionEnd {
    /// No session channels remain; the caller should close the connection.
    pub last: bool,
}

/// Outcome of tearing down a connection record.
pub struct ClosedConnection {
    pub key_id: String,
    /// How many endpoint registrations were removed with it.
    pub tunnels: usize,
}

/// The shared tunnel index.
pub struct TunnelRegistry<H, C> {
    inner: Mutex<Inner<H, C>>,
}

struct Inner<H, C> {
    conns: HashMap<ConnId, ConnectionState<H, C>>,
    endpoints: HashMap<String, Vec<Arc<Target<H>>>>,
}

impl<H, C> TunnelRegistry<H, C>
where
    H: Clone,
    C: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                conns: HashMap::new(),
                endpoints: HashMap::new(),
            }),
        }
    }

    /// Create the connection record. A no-op if it already exists.
    pub fn register_connection(&self, conn: ConnId, key_id: String, handle: H) {
        let mut inner = self.inner.lock().unwrap();
        inner.conns.entry(conn).or_insert_with(|| {
            debug!(%conn, %key_id, "connection registered");
            ConnectionState {
                key_id,
                handle,
                sessions: HashSet::new(),
                tunnels: Vec::new(),
                ever_had_session: false,
                origin_port: Arc::new(AtomicU16::new(0)),
            }
        });
    }

    /// Add a session channel to the connection. Returns `true` when this is
    /// the first session the connection has ever opened.
    pub fn start_session(&self, conn: ConnId, channel: C) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.conns.get_mut(&conn) else {
            return false;
        };
        state.sessions.insert(channel);
        let first = !state.ever_had_session;
        state.ever_had_session = true;
        first
    }

    /// Remove a session channel. Returns `None` when the connection record
    /// is already gone. The caller performs the channel close and, when
    /// `last` is set, schedules the connection close, both outside the lock.
    pub fn end_session(&self, conn: ConnId, channel: C) -> Option<SessionEnd> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.conns.get_mut(&conn)?;
        state.sessions.remove(&channel);
        Some(SessionEnd {
            last: state.sessions.is_empty(),
        })
    }

    /// Snapshot of the connection's currently open session channels.
    pub fn session_channels(&self, conn: ConnId) -> Vec<C> {
        let inner = self.inner.lock().unwrap();
        inner
            .conns
            .get(&conn)
            .map(|state| state.sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Register one target per hostname for a forwarded port, all under a
    /// single lock acquisition.
    pub fn register_tunnel(&self, conn: ConnId, hostnames: &[String], bind_addr: &str, bind_port: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.conns.get(&conn) else {
            return;
        };
        let key_id = state.key_id.clone();
        let handle = state.handle.clone();
        let origin_port = state.origin_port.clone();
        for hostname in hostnames {
            let target = Arc::new(Target {
                key_id: key_id.clone(),
                owner: conn,
                handle: handle.clone(),
                bind_addr: bind_addr.to_string(),
                bind_port,
                origin_port: origin_port.clone(),
            });
            inner.insert_endpoint_target(hostname, target);
        }
    }

    /// Remove the connection's registrations for a canceled forward. Each
    /// hostname is resolved to the matching owned tunnel reference by value
    /// (hostname + bind address + bind port); absent entries are ignored.
    pub fn unregister_tunnel(&self, conn: ConnId, hostnames: &[String], bind_addr: &str, bind_port: u32) {
        let mut inner = self.inner.lock().unwrap();
        for hostname in hostnames {
            let target = inner.conns.get(&conn).and_then(|state| {
                state
                    .tunnels
                    .iter()
                    .find(|r| {
                        r.hostname == *hostname
                            && r.target.bind_addr == bind_addr
                            && r.target.bind_port == bind_port
                    })
                    .map(|r| r.target.clone())
            });
            if let Some(target) = target {
                inner.remove_endpoint_target(hostname, &target);
            }
        }
    }

    /// Pick a target for a hostname, uniformly at random among the current
    /// replicas. The bucket is copied out so the lock is not held across the
    /// channel open that follows.
    pub fn pick_target(&self, hostname: &str) -> Option<Arc<Target<H>>> {
        let candidates = {
            let inner = self.inner.lock().unwrap();
            inner.endpoints.get(hostname)?.clone()
        };
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    /// Tear down a connection: remove every endpoint entry it owns, then
    /// delete the record. Idempotent; the caller closes the underlying
    /// transport afterwards.
    pub fn close_connection(&self, conn: ConnId) -> Option<ClosedConnection> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.conns.remove(&conn)?;
        let tunnels = state.tunnels.len();
        for tunnel in &state.tunnels {
            inner.remove_endpoint_target(&tunnel.hostname, &tunnel.target);
        }
        Some(ClosedConnection {
            key_id: state.key_id,
            tunnels,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }
}

impl<H, C> Default for TunnelRegistry<H, C>
where
    H: Clone,
    C: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<H, C> Inner<H, C> {
    fn insert_endpoint_target(&mut self, hostname: &str, target: Arc<Target<H>>) {
        info!(owner = %target.owner, key_id = %target.key_id, hostname, "tunnel up");
        self.endpoints
            .entry(hostname.to_string())
            .or_default()
            .push(target.clone());
        if let Some(state) = self.conns.get_mut(&target.owner) {
            state.tunnels.push(TunnelRef {
                hostname: hostname.to_string(),
                target,
            });
        }
    }

    fn remove_endpoint_target(&mut self, hostname: &str, target: &Arc<Target<H>>) {
        if let Some(bucket) = self.endpoints.get_mut(hostname) {
            let before = bucket.len();
            bucket.retain(|t| !Arc::ptr_eq(t, target));
            if bucket.len() < before {
                info!(owner = %target.owner, key_id = %target.key_id, hostname, "tunnel down");
            }
            if bucket.is_empty() {
                self.endpoints.remove(hostname);
            }
        }
        if let Some(state) = self.conns.get_mut(&target.owner) {
            state
                .tunnels
                .retain(|r| !(r.hostname == hostname && Arc::ptr_eq(&r.target, target)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestRegistry = TunnelRegistry<(), u32>;

    fn registry_with_conn(key_id: &str) -> (TestRegistry, ConnId) {
        let registry = TestRegistry::new();
        let conn = ConnId::next();
        registry.register_connection(conn, key_id.to_string(), ());
        (registry, conn)
    }

    #[test]
    fn pick_target_on_unknown_hostname_returns_none() {
        let registry = TestRegistry::new();
        assert!(registry.pick_target("nosuch.example.test").is_none());
    }

    #[test]
    fn pick_target_on_singleton_returns_it() {
        let (registry, conn) = registry_with_conn("k1");
        registry.register_tunnel(conn, &["h.example.test".into()], "localhost", 1);

        for _ in 0..10 {
            let target = registry.pick_target("h.example.test").unwrap();
            assert_eq!(target.key_id, "k1");
            assert_eq!(target.bind_port, 1);
        }
    }

    #[test]
    fn register_then_unregister_restores_empty_index() {
        let (registry, conn) = registry_with_conn("k1");
        let hostnames = vec!["a.example.test".to_string(), "b.example.test".to_string()];

        registry.register_tunnel(conn, &hostnames, "localhost", 7);
        assert_eq!(registry.endpoint_count(), 2);

        registry.unregister_tunnel(conn, &hostnames, "localhost", 7);
        assert_eq!(registry.endpoint_count(), 0);
        assert!(registry.pick_target("a.example.test").is_none());
    }

    #[test]
    fn repeated_unregister_is_a_noop() {
        let (registry, conn) = registry_with_conn("k1");
        let hostnames = vec!["a.example.test".to_string()];

        registry.register_tunnel(conn, &hostnames, "localhost", 7);
        registry.unregister_tunnel(conn, &hostnames, "localhost", 7);
        registry.unregister_tunnel(conn, &hostnames, "localhost", 7);
        assert_eq!(registry.endpoint_count(), 0);
    }

    #[test]
    fn unregister_only_removes_matching_bind_port() {
        let (registry, conn) = registry_with_conn("k1");
        let hostnames = vec!["a.example.test".to_string()];

        registry.register_tunnel(conn, &hostnames, "localhost", 7);
        registry.unregister_tunnel(conn, &hostnames, "localhost", 8);
        assert_eq!(registry.endpoint_count(), 1);
    }

    #[test]
    fn close_connection_removes_all_owned_targets() {
        let (registry, conn) = registry_with_conn("k1");
        registry.register_tunnel(conn, &["a.example.test".into()], "localhost", 1);
        registry.register_tunnel(conn, &["b.example.test".into()], "localhost", 2);

        let closed = registry.close_connection(conn).unwrap();
        assert_eq!(closed.key_id, "k1");
        assert_eq!(closed.tunnels, 2);
        assert_eq!(registry.endpoint_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn close_connection_is_idempotent() {
        let (registry, conn) = registry_with_conn("k1");
        assert!(registry.close_connection(conn).is_some());
        assert!(registry.close_connection(conn).is_none());
    }

    #[test]
    fn close_connection_leaves_other_replicas_routable() {
        let (registry, conn_a) = registry_with_conn("ka");
        let conn_b = ConnId::next();
        registry.register_connection(conn_b, "kb".to_string(), ());

        let hostnames = vec!["shared.example.test".to_string()];
        registry.register_tunnel(conn_a, &hostnames, "localhost", 1);
        registry.register_tunnel(conn_b, &hostnames, "localhost", 1);

        registry.close_connection(conn_a);
        let target = registry.pick_target("shared.example.test").unwrap();
        assert_eq!(target.key_id, "kb");
    }

    #[test]
    fn pick_target_is_roughly_uniform_over_replicas() {
        let (registry, conn_a) = registry_with_conn("ka");
        let conn_b = ConnId::next();
        registry.register_connection(conn_b, "kb".to_string(), ());

        let hostnames = vec!["alice.gh.example.test".to_string()];
        registry.register_tunnel(conn_a, &hostnames, "localhost", 1);
        registry.register_tunnel(conn_b, &hostnames, "localhost", 1);

        let picks_a = (0..1000)
            .filter(|_| registry.pick_target("alice.gh.example.test").unwrap().key_id == "ka")
            .count();
        assert!((350..=650).contains(&picks_a), "picks_a = {picks_a}");
    }

    #[test]
    fn first_session_is_reported_once() {
        let (registry, conn) = registry_with_conn("k1");
        assert!(registry.start_session(conn, 1));
        assert!(!registry.start_session(conn, 2));

        registry.end_session(conn, 1);
        registry.end_session(conn, 2);
        assert!(!registry.start_session(conn, 3));
    }

    #[test]
    fn ending_last_session_reports_last() {
        let (registry, conn) = registry_with_conn("k1");
        registry.start_session(conn, 1);
        registry.start_session(conn, 2);

        assert!(!registry.end_session(conn, 1).unwrap().last);
        assert!(registry.end_session(conn, 2).unwrap().last);
    }

    #[test]
    fn end_session_after_close_returns_none() {
        let (registry, conn) = registry_with_conn("k1");
        registry.start_session(conn, 1);
        registry.close_connection(conn);
        assert!(registry.end_session(conn, 1).is_none());
    }

    #[test]
    fn origin_ports_increment_and_wrap() {
        let (registry, conn) = registry_with_conn("k1");
        registry.register_tunnel(conn, &["a.example.test".into()], "localhost", 1);
        let target = registry.pick_target("a.example.test").unwrap();

        assert_eq!(target.next_origin_port(), 1);
        assert_eq!(target.next_origin_port(), 2);
        for _ in 0..(u16::MAX as u32 - 2) {
            target.next_origin_port();
        }
        assert_eq!(target.next_origin_port(), 0);
        assert_eq!(target.next_origin_port(), 1);
    }

    #[test]
    fn origin_port_counter_is_shared_per_connection() {
        let (registry, conn) = registry_with_conn("k1");
        registry.register_tunnel(conn, &["a.example.test".into()], "localhost", 1);
        registry.register_tunnel(conn, &["b.example.test".into()], "localhost", 2);

        let a = registry.pick_target("a.example.test").unwrap();
        let b = registry.pick_target("b.example.test").unwrap();
        assert_eq!(a.next_origin_port(), 1);
        assert_eq!(b.next_origin_port(), 2);
    }
}
