//! TCP channel realization with file-based address publication.
//!
//! The accepting side binds an ephemeral port and publishes `host:port` into
//! an exchange directory shared between the jobs (network filesystem, shared
//! volume). Publication is atomic: the address is written to a temporary
//! name first and renamed into place, so a requester never reads a partial
//! address. Requesters poll for the file, connect, and introduce themselves
//! with a `(rank, size)` handshake so the acceptor knows when the group is
//! complete.
//!
//! Frames are length-prefixed `postcard` encodings of [`Message`].

use super::{CommChannel, Message};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a requester polls for the published address before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct SocketPeer {
    writer: Mutex<TcpStream>,
    reader: Mutex<TcpStream>,
}

impl SocketPeer {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Ok(Self {
            writer: Mutex::new(stream),
            reader: Mutex::new(reader),
        })
    }
}

/// A channel endpoint backed by TCP streams.
pub struct SocketChannel {
    exchange_dir: PathBuf,
    peers: BTreeMap<usize, SocketPeer>,
    connected: bool,
}

impl SocketChannel {
    pub fn new(exchange_dir: PathBuf) -> Self {
        Self {
            exchange_dir,
            peers: BTreeMap::new(),
            connected: false,
        }
    }

    fn address_file(&self, acceptor: &str, requester: &str) -> PathBuf {
        // Endpoint names may contain separators; flatten them for the
        // file name.
        let sanitize = |s: &str| s.replace(['/', '\\'], "_");
        self.exchange_dir
            .join(format!("{}-{}.address", sanitize(acceptor), sanitize(requester)))
    }

    fn peer(&self, rank: usize) -> Result<&SocketPeer> {
        if !self.connected {
            return Err(Error::Closed);
        }
        self.peers
            .get(&rank)
            .ok_or_else(|| Error::Connection(format!("no connected peer with rank {rank}")))
    }
}

fn write_frame(stream: &mut TcpStream, message: &Message) -> Result<()> {
    let bytes = postcard::to_allocvec(message)
        .map_err(|e| Error::Protocol(format!("failed to encode message: {e}")))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Protocol("message exceeds frame size limit".into()))?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Message> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut bytes)?;
    postcard::from_bytes(&bytes).map_err(|e| Error::Protocol(format!("failed to decode message: {e}")))
}

impl CommChannel for SocketChannel {
    fn accept(&mut self, self_name: &str, peer_name: &str) -> Result<()> {
        if self.connected {
            return Err(Error::usage("channel is already connected"));
        }
        fs::create_dir_all(&self.exchange_dir)?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?.to_string();

        // Publish atomically: write then rename.
        let path = self.address_file(self_name, peer_name);
        let tmp = path.with_extension("address.partial");
        fs::write(&tmp, &address)?;
        fs::rename(&tmp, &path)?;
        debug!(acceptor = self_name, requester = peer_name, %address, "published connection address");

        // The first requester's handshake tells us the group size.
        let mut expected = usize::MAX;
        while self.peers.len() < expected {
            let (mut stream, _) = listener.accept()?;
            let (rank, size) = match read_frame(&mut stream)? {
                Message::IntArray(v) if v.len() == 2 => (v[0] as usize, v[1] as usize),
                _ => {
                    return Err(Error::Protocol(
                        "malformed connection handshake from requester".into(),
                    ));
                }
            };
            if expected == usize::MAX {
                expected = size;
            } else if expected != size {
                return Err(Error::Connection(format!(
                    "requester group size mismatch: {expected} vs {size}"
                )));
            }
            if self.peers.insert(rank, SocketPeer::new(stream)?).is_some() {
                return Err(Error::Connection(format!(
                    "requester rank {rank} connected twice"
                )));
            }
        }
        let _ = fs::remove_file(&path);
        self.connected = true;
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
        let path = self.address_file(peer_name, self_name);
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let address = loop {
            match fs::read_to_string(&path) {
                Ok(addr) => break addr,
                Err(_) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Err(_) => {
                    return Err(Error::Connection(format!(
                        "no address published by \"{peer_name}\" for \"{self_name}\" \
                         within {CONNECT_TIMEOUT:?}"
                    )));
                }
            }
        };
        let mut stream = TcpStream::connect(address.trim())?;
        stream.set_nodelay(true)?;
        write_frame(
            &mut stream,
            &Message::IntArray(vec![self_rank as i64, self_size as i64]),
        )?;
        self.peers.insert(0, SocketPeer::new(stream)?);
        self.connected = true;
        debug!(requester = self_name, acceptor = peer_name, rank = self_rank, "socket channel connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn remote_size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, message: Message, peer_rank: usize) -> Result<()> {
        let peer = self.peer(peer_rank)?;
        let mut writer = peer.writer.lock().unwrap();
        write_frame(&mut writer, &message)
    }

    fn receive(&self, peer_rank: usize) -> Result<Message> {
        let peer = self.peer(peer_rank)?;
        let mut reader = peer.reader.lock().unwrap();
        read_frame(&mut reader)
    }

    fn close(&mut self) {
        self.peers.clear();
        self.connected = false;
    }
}
