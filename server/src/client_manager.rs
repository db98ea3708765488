//! Connection tracking for the UDP server
//!
//! Maps remote addresses to player slots, filters duplicate and reordered
//! command datagrams, and reaps connections that go quiet.

use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected remote endpoint
#[derive(Debug)]
pub struct Client {
    /// Player slot in the game world
    pub id: u32,
    pub addr: SocketAddr,
    /// Last time any packet arrived from this client
    pub last_seen: Instant,
    /// Highest command sequence accepted so far
    pub last_sequence: u32,
    /// Command datagrams rejected as duplicate or out of order
    pub dropped_commands: u32,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            last_sequence: 0,
            dropped_commands: 0,
        }
    }

    /// Accepts a command sequence number if it is newer than anything seen.
    ///
    /// Any packet refreshes the activity timestamp, even a rejected one.
    pub fn accept_sequence(&mut self, sequence: u32) -> bool {
        self.last_seen = Instant::now();
        if sequence <= self.last_sequence {
            self.dropped_commands += 1;
            return false;
        }
        self.last_sequence = sequence;
        true
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// All connected clients, keyed by player slot
pub struct ClientManager {
    clients: HashMap<u32, Client>,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeout(max_clients, CLIENT_TIMEOUT)
    }

    pub fn with_timeout(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
            timeout,
        }
    }

    /// Registers `addr` under the slot the game handed out.
    ///
    /// Returns false when the manager is full or the slot is already taken.
    pub fn add_client(&mut self, id: u32, addr: SocketAddr) -> bool {
        if self.clients.len() >= self.max_clients || self.clients.contains_key(&id) {
            return false;
        }

        info!("Client {} connected from {}", id, addr);
        self.clients.insert(id, Client::new(id, addr));
        true
    }

    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!(
                "Client {} disconnected ({} stale commands dropped)",
                client.id, client.dropped_commands
            );
            true
        } else {
            false
        }
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Filters a command datagram by sequence. Unknown clients are rejected.
    pub fn accept_command(&mut self, client_id: u32, sequence: u32) -> bool {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        let accepted = client.accept_sequence(sequence);
        if !accepted {
            debug!(
                "Client {}: dropped command {} (last {})",
                client_id, sequence, client.last_sequence
            );
        }
        accepted
    }

    /// Removes every client that has been silent past the timeout.
    pub fn check_timeouts(&mut self) -> Vec<u32> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(self.timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            info!("Client {} timed out", client_id);
            self.remove_client(client_id);
        }

        timed_out
    }

    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = Client::new(3, test_addr());
        assert_eq!(client.id, 3);
        assert_eq!(client.addr, test_addr());
        assert_eq!(client.last_sequence, 0);
        assert_eq!(client.dropped_commands, 0);
    }

    #[test]
    fn test_sequence_filtering() {
        let mut client = Client::new(0, test_addr());
        assert!(client.accept_sequence(1));
        assert!(client.accept_sequence(3));
        assert!(!client.accept_sequence(2));
        assert!(!client.accept_sequence(3));
        assert!(client.accept_sequence(4));
        assert_eq!(client.last_sequence, 4);
        assert_eq!(client.dropped_commands, 2);
    }

    #[test]
    fn test_client_timeout() {
        let mut client = Client::new(1, test_addr());
        assert!(!client.is_timed_out(Duration::from_secs(1)));

        client.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_and_find_clients() {
        let mut manager = ClientManager::new(4);
        assert!(manager.is_empty());

        assert!(manager.add_client(0, test_addr()));
        assert!(manager.add_client(1, test_addr2()));
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(0));
        assert_eq!(manager.find_client_by_addr(test_addr2()), Some(1));
        let unknown: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_client_by_addr(unknown), None);
    }

    #[test]
    fn test_slot_cannot_be_taken_twice() {
        let mut manager = ClientManager::new(4);
        assert!(manager.add_client(2, test_addr()));
        assert!(!manager.add_client(2, test_addr2()));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_max_capacity() {
        let mut manager = ClientManager::new(1);
        assert!(manager.add_client(0, test_addr()));
        assert!(manager.is_full());
        assert!(!manager.add_client(1, test_addr2()));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = ClientManager::new(2);
        manager.add_client(0, test_addr());

        assert!(manager.remove_client(&0));
        assert!(!manager.remove_client(&0));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_accept_command_for_unknown_client() {
        let mut manager = ClientManager::new(2);
        assert!(!manager.accept_command(7, 1));

        manager.add_client(7, test_addr());
        assert!(manager.accept_command(7, 1));
        assert!(!manager.accept_command(7, 1));
    }

    #[test]
    fn test_check_timeouts_reaps_silent_clients() {
        let mut manager = ClientManager::with_timeout(4, Duration::from_millis(10));
        manager.add_client(0, test_addr());
        manager.add_client(1, test_addr2());

        if let Some(client) = manager.clients.get_mut(&0) {
            client.last_seen = Instant::now() - Duration::from_secs(1);
        }

        let removed = manager.check_timeouts();
        assert_eq!(removed, vec![0]);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.find_client_by_addr(test_addr2()), Some(1));
    }
}
