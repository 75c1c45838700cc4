use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::message::ClientId;

pub const DEFAULT_MAX_CLIENTS: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcceptError {
    #[error("server full ({max} clients)")]
    Full { max: usize },
    #[error("no client id left")]
    IdsExhausted,
}

/// One peer as seen by a server binding. `K` is the binding's native address,
/// `H` the transport handle it owns for the peer.
#[derive(Debug)]
pub struct Connection<K, H> {
    pub client_id: ClientId,
    pub key: K,
    pub state: ConnectionState,
    pub handle: H,
    pub last_receive_time: Instant,
}

impl<K, H> Connection<K, H> {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

/// Authoritative set of a server's peers.
///
/// Ids are the lowest free value starting at 1, so an id comes back into use
/// only after the connection holding it has been removed.
#[derive(Debug)]
pub struct ConnectionManager<K, H> {
    clients_by_key: HashMap<K, ClientId>,
    clients: BTreeMap<ClientId, Connection<K, H>>,
    max_clients: usize,
}

impl<K: Eq + Hash + Clone, H> ConnectionManager<K, H> {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients_by_key: HashMap::new(),
            clients: BTreeMap::new(),
            max_clients,
        }
    }

    /// Returns the id the next accepted peer would get.
    pub fn check_capacity(&self) -> Result<ClientId, AcceptError> {
        if self.clients.len() >= self.max_clients {
            return Err(AcceptError::Full {
                max: self.max_clients,
            });
        }
        self.next_free_id().ok_or(AcceptError::IdsExhausted)
    }

    /// Registers a new peer in the `Connecting` state.
    pub fn accept(&mut self, key: K, handle: H) -> Result<ClientId, AcceptError> {
        let client_id = self.check_capacity()?;
        self.clients_by_key.insert(key.clone(), client_id);
        self.clients.insert(
            client_id,
            Connection {
                client_id,
                key,
                state: ConnectionState::Connecting,
                handle,
                last_receive_time: Instant::now(),
            },
        );
        Ok(client_id)
    }

    fn next_free_id(&self) -> Option<ClientId> {
        (1..=ClientId::MAX).find(|id| !self.clients.contains_key(id))
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Connection<K, H>> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut Connection<K, H>> {
        self.clients.get_mut(&client_id)
    }

    pub fn get_by_key(&self, key: &K) -> Option<&Connection<K, H>> {
        self.clients_by_key
            .get(key)
            .and_then(|id| self.clients.get(id))
    }

    pub fn get_by_key_mut(&mut self, key: &K) -> Option<&mut Connection<K, H>> {
        match self.clients_by_key.get(key) {
            Some(id) => self.clients.get_mut(id),
            None => None,
        }
    }

    pub fn id_for(&self, key: &K) -> Option<ClientId> {
        self.clients_by_key.get(key).copied()
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<Connection<K, H>> {
        let conn = self.clients.remove(&client_id)?;
        self.clients_by_key.remove(&conn.key);
        Some(conn)
    }

    pub fn remove_by_key(&mut self, key: &K) -> Option<Connection<K, H>> {
        let client_id = self.clients_by_key.remove(key)?;
        self.clients.remove(&client_id)
    }

    /// Empties the set, returning the removed connections in id order.
    pub fn drain(&mut self) -> Vec<Connection<K, H>> {
        self.clients_by_key.clear();
        std::mem::take(&mut self.clients).into_values().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection<K, H>> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection<K, H>> {
        self.clients.values_mut()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn connected_ids(&self) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.client_id)
            .collect()
    }

    /// Removes and returns every connection idle for longer than `timeout`.
    pub fn cleanup_timed_out(&mut self, timeout: Duration) -> Vec<Connection<K, H>> {
        let timed_out: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.is_timed_out(timeout))
            .map(|c| c.client_id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.clients.values().filter(|c| c.is_connected()).count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn ids_start_at_one_and_stay_unique() {
        let mut manager: ConnectionManager<SocketAddr, ()> = ConnectionManager::new(8);

        assert_eq!(manager.accept(addr(1000), ()), Ok(1));
        assert_eq!(manager.accept(addr(1001), ()), Ok(2));
        assert_eq!(manager.accept(addr(1002), ()), Ok(3));
        assert_eq!(manager.id_for(&addr(1001)), Some(2));
        assert_eq!(manager.ids(), vec![1, 2, 3]);
    }

    #[test]
    fn freed_id_is_reused_only_after_removal() {
        let mut manager: ConnectionManager<SocketAddr, ()> = ConnectionManager::new(8);
        manager.accept(addr(1000), ()).unwrap();
        manager.accept(addr(1001), ()).unwrap();

        assert_eq!(manager.accept(addr(1002), ()), Ok(3));
        manager.remove_by_key(&addr(1001));
        assert!(manager.get(2).is_none());
        assert_eq!(manager.accept(addr(1003), ()), Ok(2));
        assert_eq!(manager.accept(addr(1004), ()), Ok(4));
    }

    #[test]
    fn full_server_rejects() {
        let mut manager: ConnectionManager<u32, ()> = ConnectionManager::new(2);
        manager.accept(1, ()).unwrap();
        manager.accept(2, ()).unwrap();

        assert_eq!(manager.accept(3, ()), Err(AcceptError::Full { max: 2 }));
    }

    #[test]
    fn ids_exhaust_at_u8_range() {
        let mut manager: ConnectionManager<u32, ()> = ConnectionManager::new(usize::MAX);
        for key in 0..u32::from(ClientId::MAX) {
            manager.accept(key, ()).unwrap();
        }

        assert_eq!(manager.accept(9999, ()), Err(AcceptError::IdsExhausted));
    }

    #[test]
    fn connected_count_tracks_state() {
        let mut manager: ConnectionManager<u32, ()> = ConnectionManager::new(4);
        let a = manager.accept(10, ()).unwrap();
        manager.accept(11, ()).unwrap();
        manager.get_mut(a).unwrap().state = ConnectionState::Connected;

        assert_eq!(manager.connected_count(), 1);
        assert_eq!(manager.connected_ids(), vec![a]);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn cleanup_removes_idle_connections() {
        let mut manager: ConnectionManager<u32, ()> = ConnectionManager::new(4);
        let idle = manager.accept(10, ()).unwrap();
        let fresh = manager.accept(11, ()).unwrap();
        if let Some(earlier) = Instant::now().checked_sub(Duration::from_secs(30)) {
            manager.get_mut(idle).unwrap().last_receive_time = earlier;
        }

        let removed = manager.cleanup_timed_out(Duration::from_secs(10));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].client_id, idle);
        assert_eq!(manager.ids(), vec![fresh]);
    }
}
