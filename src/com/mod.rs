//! Point-to-point communication channels between named endpoints.
//!
//! A [`CommChannel`] is an ordered, reliable stream of typed messages between
//! two endpoints that find each other by name: one side calls
//! [`accept`](CommChannel::accept), the other [`request`](CommChannel::request).
//! A single accepting endpoint may be connected to a whole group of
//! requesters; sends and receives are then addressed by the requester's rank.
//!
//! Two realizations exist and are chosen at configuration time through a
//! [`ChannelFactory`]:
//!
//! - [`direct::DirectChannel`] rendezvouses through an in-process
//!   [`direct::Hub`], for participants that share one OS process (one group
//!   communicator). This is also what the test harness uses.
//! - [`sockets::SocketChannel`] connects over TCP; the acceptor publishes its
//!   address as a file in an exchange directory that the requester polls.
//!   Used when the two sides run as separate jobs, including the slave-rank
//!   rings.
//!
//! Error taxonomy: connect failures and broken transports surface as
//! [`Error::Connection`]; a type or length mismatch between matched send and
//! receive is [`Error::Protocol`]; operations on a closed channel yield
//! [`Error::Closed`].

pub mod direct;
pub mod group;
pub mod ring;
pub mod sockets;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// A typed message on a channel. This is the complete wire vocabulary;
/// everything the library exchanges is built from these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Int(i64),
    Double(f64),
    Bool(bool),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    Text(String),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Int(_) => "int",
            Message::Double(_) => "double",
            Message::Bool(_) => "bool",
            Message::IntArray(_) => "int array",
            Message::DoubleArray(_) => "double array",
            Message::Text(_) => "string",
        }
    }
}

/// Ordered, reliable, rank-addressed message transport between two named
/// endpoints.
///
/// All operations block until the matching call is made on the peer side.
/// `close` is idempotent; every other operation on a closed channel fails
/// with [`Error::Closed`].
pub trait CommChannel: Send {
    /// Wait for the peer group to connect. Blocks until every requester rank
    /// has arrived.
    fn accept(&mut self, self_name: &str, peer_name: &str) -> Result<()>;

    /// Connect to an accepting endpoint. `self_rank` and `self_size` describe
    /// the requester group so the acceptor knows how many connections to
    /// expect.
    fn request(
        &mut self,
        self_name: &str,
        peer_name: &str,
        self_rank: usize,
        self_size: usize,
    ) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Number of peer ranks on the other side.
    fn remote_size(&self) -> usize;

    /// Send one message to the given peer rank. Requesters address the
    /// acceptor as rank 0.
    fn send(&self, message: Message, peer_rank: usize) -> Result<()>;

    /// Receive the next message from the given peer rank.
    fn receive(&self, peer_rank: usize) -> Result<Message>;

    /// Release transport resources. Idempotent.
    fn close(&mut self);

    // Typed helpers. These are the forms the rest of the library uses; a
    // mismatch between matched send/receive pairs is a protocol error.

    fn send_i64(&self, value: i64, peer_rank: usize) -> Result<()> {
        self.send(Message::Int(value), peer_rank)
    }

    fn send_f64(&self, value: f64, peer_rank: usize) -> Result<()> {
        self.send(Message::Double(value), peer_rank)
    }

    fn send_bool(&self, value: bool, peer_rank: usize) -> Result<()> {
        self.send(Message::Bool(value), peer_rank)
    }

    fn send_text(&self, value: &str, peer_rank: usize) -> Result<()> {
        self.send(Message::Text(value.to_string()), peer_rank)
    }

    fn send_i64s(&self, values: &[i64], peer_rank: usize) -> Result<()> {
        self.send(Message::IntArray(values.to_vec()), peer_rank)
    }

    fn send_f64s(&self, values: &[f64], peer_rank: usize) -> Result<()> {
        self.send(Message::DoubleArray(values.to_vec()), peer_rank)
    }

    fn receive_i64(&self, peer_rank: usize) -> Result<i64> {
        match self.receive(peer_rank)? {
            Message::Int(v) => Ok(v),
            other => Err(mismatch("int", &other)),
        }
    }

    fn receive_f64(&self, peer_rank: usize) -> Result<f64> {
        match self.receive(peer_rank)? {
            Message::Double(v) => Ok(v),
            other => Err(mismatch("double", &other)),
        }
    }

    fn receive_bool(&self, peer_rank: usize) -> Result<bool> {
        match self.receive(peer_rank)? {
            Message::Bool(v) => Ok(v),
            other => Err(mismatch("bool", &other)),
        }
    }

    fn receive_text(&self, peer_rank: usize) -> Result<String> {
        match self.receive(peer_rank)? {
            Message::Text(v) => Ok(v),
            other => Err(mismatch("string", &other)),
        }
    }

    fn receive_i64s(&self, expected_len: usize, peer_rank: usize) -> Result<Vec<i64>> {
        match self.receive(peer_rank)? {
            Message::IntArray(v) if v.len() == expected_len => Ok(v),
            Message::IntArray(v) => Err(length_mismatch(expected_len, v.len())),
            other => Err(mismatch("int array", &other)),
        }
    }

    fn receive_f64s(&self, expected_len: usize, peer_rank: usize) -> Result<Vec<f64>> {
        match self.receive(peer_rank)? {
            Message::DoubleArray(v) if v.len() == expected_len => Ok(v),
            Message::DoubleArray(v) => Err(length_mismatch(expected_len, v.len())),
            other => Err(mismatch("double array", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &Message) -> Error {
    Error::Protocol(format!(
        "expected a {expected} message, received a {} message",
        got.kind()
    ))
}

fn length_mismatch(expected: usize, got: usize) -> Error {
    Error::Protocol(format!(
        "array length mismatch between matched send and receive: expected {expected}, got {got}"
    ))
}

/// Creates channels of the realization selected at configuration time.
///
/// Handing a factory around instead of a concrete channel type is what lets
/// every call site stay transport-agnostic; there is no build-time switch.
#[derive(Clone)]
pub enum ChannelFactory {
    /// In-process rendezvous through a shared [`direct::Hub`].
    Direct(Arc<direct::Hub>),
    /// TCP with file-based address publication in the given directory.
    Sockets(PathBuf),
}

impl ChannelFactory {
    pub fn create(&self) -> Box<dyn CommChannel> {
        match self {
            ChannelFactory::Direct(hub) => Box::new(direct::DirectChannel::new(Arc::clone(hub))),
            ChannelFactory::Sockets(dir) => Box::new(sockets::SocketChannel::new(dir.clone())),
        }
    }
}
