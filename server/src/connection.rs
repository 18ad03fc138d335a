//! Per-connection bookkeeping on the server.
//!
//! A [`ClientConnection`] carries the socket, the login identity, and the
//! observer state driving replication to that client: the `loaded` set (what
//! the client currently has instantiated), the provisional-to-global id remap
//! table for in-flight creations, and the id reserved by FORCE_CREATE.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpStream};

use shared::frame::{FrameBuffer, SendQueue};

pub struct ClientConnection {
    stream: TcpStream,
    pub addr: SocketAddr,
    recv: FrameBuffer,
    send: SendQueue,
    pub username: Option<String>,
    pub render_range: f32,
    /// Representations this client currently has instantiated. Drives every
    /// load/unload decision and broadcast filter.
    pub loaded: HashSet<i32>,
    /// Remaps provisional negative ids from this client to their assigned
    /// global ids. Needed because a child CREATE may name its parent by the
    /// parent's still-provisional id.
    pub local_to_global: HashMap<i32, i32>,
    /// Global id handed out by FORCE_CREATE, awaiting the confirming CREATE.
    pub reserved_id: Option<i32>,
    /// Set on any socket failure or explicit disconnect; the engine sweeps
    /// dead connections at the end of the tick.
    pub dead: bool,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr, render_range: f32) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            addr,
            recv: FrameBuffer::new(),
            send: SendQueue::new(),
            username: None,
            render_range,
            loaded: HashSet::new(),
            local_to_global: HashMap::new(),
            reserved_id: None,
            dead: false,
        })
    }

    /// Eagerly reads everything available. `Ok(false)` means the peer closed
    /// the stream.
    pub fn read_available(&mut self) -> io::Result<bool> {
        self.recv.read_from(&mut self.stream)
    }

    pub fn drain_frames(&mut self) -> Vec<(u8, Vec<u8>)> {
        self.recv.drain_frames()
    }

    pub fn queue(&mut self, msg_type: u8, payload: &[u8]) {
        self.send.push(msg_type, payload);
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.send.flush(&mut self.stream)
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.send.is_empty()
    }

    /// Resolves an id from this client: positive ids pass through, negative
    /// ones go through the remap table. `None` means the provisional id was
    /// never registered (or already swept away).
    pub fn resolve_id(&self, id: i32) -> Option<i32> {
        if id > 0 {
            Some(id)
        } else {
            self.local_to_global.get(&id).copied()
        }
    }

    /// Identity for log lines before and after login.
    pub fn label(&self) -> String {
        match &self.username {
            Some(username) => username.clone(),
            None => self.addr.to_string(),
        }
    }
}
