//! The service directory. One coarse mutex guards three views that must
//! stay consistent: the name → endpoint directory, the name → live
//! connection map, and the connection → endpoint reverse index.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use busbar_network::Socket;
use busbar_proto::Endpoint;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Registration failures; the display strings travel to the client verbatim
/// as the response's error text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("empty name is not allowed.")]
    EmptyName,
    #[error("can not get host ip for receiver service.")]
    NoHostIp,
    #[error("Register without service port can only be registered once.")]
    PortZeroTaken,
}

/// Bidirectional prefix match: either side being a prefix of the other
/// makes a group send reach both `app.sub` and `app.sub.inner` style names
/// without a glob syntax.
pub fn is_prefix_matching(left: &str, right: &str) -> bool {
    left.starts_with(right) || right.starts_with(left)
}

#[derive(Default)]
struct Inner {
    /// The directory: every registered (name, endpoint) pair.
    services: BTreeMap<String, Vec<Endpoint>>,
    /// Who is currently live for each name.
    conns_by_service: BTreeMap<String, HashMap<u64, Arc<Socket>>>,
    /// Connection id → the endpoint it registered with, for O(1) cleanup.
    service_by_conn: HashMap<u64, Endpoint>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Registers `host` under `name` for `conn`.
    ///
    /// A known (name, endpoint) pair only refreshes the endpoint state. A
    /// port-0 endpoint is a "reachable only via this connection" row and
    /// may exist at most once per name across live connections.
    pub fn register(
        &self,
        name: &str,
        host: Endpoint,
        conn: &Arc<Socket>,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut inner = self.inner.lock().unwrap();
        if host.port == 0
            && inner.conns_by_service.get(name).is_some_and(|conns| !conns.is_empty())
        {
            debug!(name, ip = %host.ip, "registry: rejecting second port-0 registration");
            return Err(RegistryError::PortZeroTaken);
        }
        if let Some(endpoints) = inner.services.get_mut(name) {
            if let Some(known) = endpoints.iter_mut().find(|e| e.same_host(&host)) {
                known.state = host.state;
                debug!(name, state = host.state, "registry: refreshed endpoint state");
                return Ok(());
            }
            endpoints.push(host.clone());
            debug!(name, ip = %host.ip, port = host.port, "registry: endpoint added");
        } else {
            inner.services.insert(name.to_string(), vec![host.clone()]);
            debug!(name, ip = %host.ip, port = host.port, "registry: service added");
        }
        inner
            .conns_by_service
            .entry(name.to_string())
            .or_default()
            .insert(conn.id(), Arc::clone(conn));
        inner.service_by_conn.insert(conn.id(), host);
        Ok(())
    }

    /// Drops one (name, endpoint) pair from the directory. Live-connection
    /// rows are untouched; those die with their connection.
    pub fn unregister(&self, name: &str, host: &Endpoint) {
        let mut inner = self.inner.lock().unwrap();
        unregister_locked(&mut inner, name, host);
    }

    /// Tears down everything a closed connection backed: its row in every
    /// name it registered, and the matching directory endpoints.
    pub fn on_connection_closed(&self, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let host = inner.service_by_conn.remove(&conn_id);
        let mut names = Vec::new();
        inner.conns_by_service.retain(|name, conns| {
            if conns.remove(&conn_id).is_some() {
                names.push(name.clone());
            }
            !conns.is_empty()
        });
        if let Some(host) = host {
            for name in &names {
                unregister_locked(&mut inner, name, &host);
            }
        } else if !names.is_empty() {
            debug!(conn_id, "registry: closed connection had no endpoint recorded");
        }
    }

    /// Random endpoint registered under exactly `name`.
    pub fn lookup(&self, name: &str) -> Option<Endpoint> {
        let inner = self.inner.lock().unwrap();
        let endpoints = inner.services.get(name)?;
        Some(endpoints[rand::rng().random_range(0..endpoints.len())].clone())
    }

    /// Whether any live connection would receive a send to `dest`.
    pub fn has_match(&self, dest: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .conns_by_service
            .iter()
            .any(|(name, conns)| is_prefix_matching(name, dest) && !conns.is_empty())
    }

    /// Destination set for a targeted send: every name prefix-matching
    /// `dest` contributes one randomly selected live connection, deduped
    /// across names.
    pub fn resolve_connections(&self, dest: &str) -> Vec<Arc<Socket>> {
        let inner = self.inner.lock().unwrap();
        let mut picked: HashMap<u64, Arc<Socket>> = HashMap::new();
        for (name, conns) in &inner.conns_by_service {
            if is_prefix_matching(name, dest)
                && let Some(conn) = random_conn(conns)
            {
                picked.insert(conn.id(), conn);
            }
        }
        picked.into_values().collect()
    }

    /// One representative live connection per service name.
    pub fn broadcast_targets(&self) -> Vec<Arc<Socket>> {
        let inner = self.inner.lock().unwrap();
        inner.conns_by_service.values().filter_map(|conns| random_conn(conns)).collect()
    }

    /// Registered service names containing `pattern` as a substring.
    pub fn query_services(&self, pattern: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.services.keys().filter(|name| name.contains(pattern)).cloned().collect()
    }

    pub fn is_conn_registered(&self, conn_id: u64) -> bool {
        self.inner.lock().unwrap().service_by_conn.contains_key(&conn_id)
    }

    /// Any registered client at all; drives the accept loop's idle-quit.
    pub fn has_clients(&self) -> bool {
        !self.inner.lock().unwrap().conns_by_service.is_empty()
    }
}

fn unregister_locked(inner: &mut Inner, name: &str, host: &Endpoint) {
    let Some(endpoints) = inner.services.get_mut(name) else { return };
    let Some(pos) = endpoints.iter().position(|e| e.same_host(host)) else {
        debug!(name, ip = %host.ip, port = host.port, "registry: unregister target not found");
        return;
    };
    endpoints.remove(pos);
    debug!(name, ip = %host.ip, port = host.port, "registry: endpoint removed");
    if endpoints.is_empty() {
        inner.services.remove(name);
    }
}

fn random_conn(conns: &HashMap<u64, Arc<Socket>>) -> Option<Arc<Socket>> {
    if conns.is_empty() {
        return None;
    }
    let pick = rand::rng().random_range(0..conns.len());
    conns.values().nth(pick).cloned()
}

#[cfg(test)]
mod tests {
    use std::os::{fd::IntoRawFd, unix::net::UnixStream};

    use super::*;

    /// Registry keys off connection identity only, so any live fd works.
    fn test_conn() -> (Arc<Socket>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let sock =
            Socket::from_accepted(ours.into_raw_fd(), "127.0.0.1:0".parse().unwrap()).unwrap();
        (sock, theirs)
    }

    fn ep(ip: &str, port: u16) -> Endpoint {
        Endpoint::new(ip, port)
    }

    #[test]
    fn register_lookup_unregister() {
        let reg = Registry::default();
        let (conn, _peer) = test_conn();
        reg.register("svc.a", ep("10.0.0.1", 8000), &conn).unwrap();

        assert_eq!(reg.lookup("svc.a").unwrap().port, 8000);
        assert!(reg.is_conn_registered(conn.id()));
        assert!(reg.has_clients());

        reg.unregister("svc.a", &ep("10.0.0.1", 8000));
        assert!(reg.lookup("svc.a").is_none());
        // directory removal leaves the live-connection row alone
        assert!(reg.is_conn_registered(conn.id()));
    }

    #[test]
    fn empty_name_is_rejected() {
        let reg = Registry::default();
        let (conn, _peer) = test_conn();
        assert_eq!(
            reg.register("", ep("10.0.0.1", 1), &conn),
            Err(RegistryError::EmptyName)
        );
        assert!(!reg.has_clients());
    }

    #[test]
    fn duplicate_endpoint_only_refreshes_state() {
        let reg = Registry::default();
        let (conn, _peer) = test_conn();
        reg.register("svc", ep("10.0.0.1", 8000), &conn).unwrap();
        let mut again = ep("10.0.0.1", 8000);
        again.state = 7;
        reg.register("svc", again, &conn).unwrap();

        let got = reg.lookup("svc").unwrap();
        assert_eq!(got.state, 7);
        assert_eq!(reg.resolve_connections("svc").len(), 1);
    }

    #[test]
    fn port_zero_name_is_unique_across_connections() {
        let reg = Registry::default();
        let (a, _pa) = test_conn();
        let (b, _pb) = test_conn();
        reg.register("solo", ep("10.0.0.1", 0), &a).unwrap();
        assert_eq!(
            reg.register("solo", ep("10.0.0.2", 0), &b),
            Err(RegistryError::PortZeroTaken)
        );
        // the port-0 row is still a directory entry (port 0 = via broker)
        assert_eq!(reg.lookup("solo").unwrap().port, 0);
    }

    #[test]
    fn close_cleans_every_name_the_connection_backed() {
        let reg = Registry::default();
        let (conn, _peer) = test_conn();
        reg.register("svc.a", ep("10.0.0.1", 8000), &conn).unwrap();
        reg.register("svc.b", ep("10.0.0.1", 8000), &conn).unwrap();

        reg.on_connection_closed(conn.id());
        assert!(reg.lookup("svc.a").is_none());
        assert!(reg.lookup("svc.b").is_none());
        assert!(!reg.is_conn_registered(conn.id()));
        assert!(!reg.has_clients());
    }

    #[test]
    fn prefix_fanout_matches_both_directions() {
        let reg = Registry::default();
        let (a, _pa) = test_conn();
        let (b, _pb) = test_conn();
        let (c, _pc) = test_conn();
        reg.register("svc.a", ep("10.0.0.1", 1), &a).unwrap();
        reg.register("svc.a.inner", ep("10.0.0.2", 2), &b).unwrap();
        reg.register("other", ep("10.0.0.3", 3), &c).unwrap();

        let ids: Vec<u64> =
            reg.resolve_connections("svc.a").iter().map(|s| s.id()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id()) && ids.contains(&b.id()));

        // identical name matches itself; empty dest matches everyone
        assert_eq!(reg.resolve_connections("other").len(), 1);
        assert_eq!(reg.resolve_connections("").len(), 3);
        assert!(reg.has_match("svc"));
        assert!(!reg.has_match("nope"));
    }

    #[test]
    fn broadcast_picks_one_per_name() {
        let reg = Registry::default();
        let (a, _pa) = test_conn();
        let (b, _pb) = test_conn();
        let (b2, _pb2) = test_conn();
        reg.register("svc.a", ep("10.0.0.1", 1), &a).unwrap();
        reg.register("svc.b", ep("10.0.0.2", 2), &b).unwrap();
        reg.register("svc.b", ep("10.0.0.3", 3), &b2).unwrap();

        let targets = reg.broadcast_targets();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().any(|s| s.id() == a.id()));
        assert!(targets.iter().any(|s| s.id() == b.id() || s.id() == b2.id()));
    }

    #[test]
    fn query_is_a_substring_search() {
        let reg = Registry::default();
        let (a, _pa) = test_conn();
        let (b, _pb) = test_conn();
        reg.register("alpha.worker", ep("10.0.0.1", 1), &a).unwrap();
        reg.register("beta.worker", ep("10.0.0.2", 2), &b).unwrap();

        assert_eq!(reg.query_services("worker").len(), 2);
        assert_eq!(reg.query_services("alpha"), vec!["alpha.worker".to_string()]);
        assert_eq!(reg.query_services("zzz").len(), 0);
    }
}
