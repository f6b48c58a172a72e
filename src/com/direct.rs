//! In-process channel realization.
//!
//! When both endpoint groups live in the same OS process (one launcher, one
//! group communicator), connections rendezvous through a shared [`Hub`]: the
//! requester deposits its endpoint halves under the `(acceptor, requester)`
//! name pair, the acceptor collects them once all requester ranks have
//! arrived. Message queues are plain `std::sync::mpsc` pairs, so sends are
//! buffered and receives block, which gives the same suspension behavior as
//! the socket realization.

use super::{CommChannel, Message};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

struct PeerEnd {
    tx: Sender<Message>,
    rx: Mutex<Receiver<Message>>,
}

#[derive(Default)]
struct Rendezvous {
    /// Acceptor-side endpoint halves deposited by requesters, keyed by rank.
    deposited: BTreeMap<usize, PeerEnd>,
    /// Requester group size, set by the first requester to arrive.
    expected: Option<usize>,
}

/// Shared registry where direct channels find each other by name.
///
/// One hub per launcher; every participant holds an `Arc` to it.
#[derive(Default)]
pub struct Hub {
    pending: Mutex<HashMap<(String, String), Rendezvous>>,
    arrived: Condvar,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A channel endpoint backed by in-process queues.
pub struct DirectChannel {
    hub: Arc<Hub>,
    peers: BTreeMap<usize, PeerEnd>,
    connected: bool,
}

impl DirectChannel {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            peers: BTreeMap::new(),
            connected: false,
        }
    }

    fn peer(&self, rank: usize) -> Result<&PeerEnd> {
        if !self.connected {
            return Err(Error::Closed);
        }
        self.peers
            .get(&rank)
            .ok_or_else(|| Error::Connection(format!("no connected peer with rank {rank}")))
    }
}

impl CommChannel for DirectChannel {
    fn accept(&mut self, self_name: &str, peer_name: &str) -> Result<()> {
        if self.connected {
            return Err(Error::usage("channel is already connected"));
        }
        let key = (self_name.to_string(), peer_name.to_string());
        let mut pending = self.hub.pending.lock().unwrap();
        loop {
            let entry = pending.entry(key.clone()).or_default();
            if entry.expected.is_some_and(|n| entry.deposited.len() == n) {
                let entry = pending.remove(&key).unwrap();
                self.peers = entry.deposited;
                // Requesters block until their deposit disappears from the
                // registry, so wake them now.
                self.hub.arrived.notify_all();
                break;
            }
            pending = self.hub.arrived.wait(pending).unwrap();
        }
        drop(pending);
        self.connected = true;
        debug!(acceptor = self_name, requester = peer_name, peers = self.peers.len(), "direct channel accepted");
        Ok(())
    }

    fn request(
        &mut self,
        self_name: &str,
        peer_name: &str,
        self_rank: usize,
        self_size: usize,
    ) -> Result<()> {
        if self.connected {
            return Err(Error::usage("channel is already connected"));
        }
        let key = (peer_name.to_string(), self_name.to_string());
        let (to_acceptor, from_requester) = channel();
        let (to_requester, from_acceptor) = channel();
        {
            let mut pending = self.hub.pending.lock().unwrap();
            let entry = pending.entry(key.clone()).or_default();
            if let Some(expected) = entry.expected {
                if expected != self_size {
                    return Err(Error::Connection(format!(
                        "requester group size mismatch for \"{peer_name}\"/\"{self_name}\": \
                         {expected} vs {self_size}"
                    )));
                }
            }
            entry.expected = Some(self_size);
            if entry.deposited.contains_key(&self_rank) {
                return Err(Error::Connection(format!(
                    "rank {self_rank} already requested \"{peer_name}\"/\"{self_name}\""
                )));
            }
            entry.deposited.insert(
                self_rank,
                PeerEnd {
                    tx: to_requester,
                    rx: Mutex::new(from_requester),
                },
            );
            self.hub.arrived.notify_all();
            // Handshake: wait until the acceptor has taken the deposit.
            while pending.contains_key(&key) {
                pending = self.hub.arrived.wait(pending).unwrap();
            }
        }
        self.peers.insert(
            0,
            PeerEnd {
                tx: to_acceptor,
                rx: Mutex::new(from_acceptor),
            },
        );
        self.connected = true;
        debug!(requester = self_name, acceptor = peer_name, rank = self_rank, "direct channel requested");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn remote_size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, message: Message, peer_rank: usize) -> Result<()> {
        self.peer(peer_rank)?
            .tx
            .send(message)
            .map_err(|_| Error::Connection(format!("peer rank {peer_rank} hung up")))
    }

    fn receive(&self, peer_rank: usize) -> Result<Message> {
        self.peer(peer_rank)?
            .rx
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| Error::Connection(format!("peer rank {peer_rank} hung up")))
    }

    fn close(&mut self) {
        self.peers.clear();
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn accept_request_roundtrip() {
        let hub = Hub::new();
        let hub2 = Arc::clone(&hub);
        let acceptor = thread::spawn(move || {
            let mut ch = DirectChannel::new(hub2);
            ch.accept("A", "B").unwrap();
            let v = ch.receive_f64(0).unwrap();
            ch.send_f64(v * 2.0, 0).unwrap();
            ch.close();
        });
        let mut ch = DirectChannel::new(hub);
        ch.request("B", "A", 0, 1).unwrap();
        ch.send_f64(21.0, 0).unwrap();
        assert_eq!(ch.receive_f64(0).unwrap(), 42.0);
        ch.close();
        acceptor.join().unwrap();
    }

    #[test]
    fn acceptor_waits_for_whole_requester_group() {
        let hub = Hub::new();
        let mut handles = Vec::new();
        for rank in 0..3 {
            let hub = Arc::clone(&hub);
            handles.push(thread::spawn(move || {
                let mut ch = DirectChannel::new(hub);
                ch.request("master", "workers", rank, 3).unwrap();
                ch.send_i64(rank as i64, 0).unwrap();
                ch.close();
            }));
        }
        let mut ch = DirectChannel::new(Arc::clone(&hub));
        ch.accept("master", "workers").unwrap();
        assert_eq!(ch.remote_size(), 3);
        let sum: i64 = (0..3).map(|r| ch.receive_i64(r).unwrap()).sum();
        assert_eq!(sum, 3);
        ch.close();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn type_mismatch_is_a_protocol_error() {
        let hub = Hub::new();
        let hub2 = Arc::clone(&hub);
        let t = thread::spawn(move || {
            let mut ch = DirectChannel::new(hub2);
            ch.accept("A", "B").unwrap();
            ch.send_bool(true, 0).unwrap();
        });
        let mut ch = DirectChannel::new(hub);
        ch.request("B", "A", 0, 1).unwrap();
        assert!(matches!(ch.receive_f64(0), Err(Error::Protocol(_))));
        t.join().unwrap();
    }

    #[test]
    fn closed_channel_rejects_operations() {
        let hub = Hub::new();
        let ch = DirectChannel::new(hub);
        assert!(matches!(ch.send_f64(1.0, 0), Err(Error::Closed)));
    }
}
