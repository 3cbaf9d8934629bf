//! MQTT broker event loop.
//!
//! One mio `Poll` drives the listener and every client transport. Packet
//! handling runs inline on this thread; the only suspension points are the
//! poll itself and non-blocking socket reads/writes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use tern_core::error::Result;

use crate::auth::{AllowAll, Authorizer};
use crate::config::Config;
use crate::registry::SessionRegistry;

/// Token for the listener socket.
const LISTENER: Token = Token(0);

/// First token handed to client connections.
const CLIENT_START: usize = 1;

/// Poll timeout; bounds how stale the keep-alive sweep can get.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// MQTT broker server.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    registry: SessionRegistry,
    next_token: usize,
    config: Arc<Config>,
}

impl Server {
    /// Bind the listener and set up the registry with the default
    /// allow-all authorization policy.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        Self::with_authorizer(config, Box::new(AllowAll))
    }

    pub fn with_authorizer(config: Arc<Config>, auth: Box<dyn Authorizer>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.server.bind)?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("tern listening on {}", listener.local_addr()?);

        let registry = SessionRegistry::new(auth, config.limits.max_packet_size);

        Ok(Self {
            poll,
            listener,
            registry,
            next_token: CLIENT_START,
            config,
        })
    }

    /// The bound listen address (useful when binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the event loop until an unrecoverable poll error.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// Run a single iteration of the event loop.
    pub fn run_once(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => self.accept_connections()?,
                token => {
                    if event.is_readable() || event.is_read_closed() {
                        self.registry.handle_readable(token);
                    }
                    if event.is_writable() {
                        self.registry.handle_writable(token);
                    }
                }
            }
        }

        if self.config.session.enforce_keep_alive {
            self.registry.sweep_keep_alive();
        }
        self.registry.cleanup();

        Ok(())
    }

    /// Accept until the listener would block (edge-triggered readiness).
    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;

                    debug!("connection from {}", addr);
                    self.registry.accept(token, stream);
                    // Data that raced ahead of the epoll registration won't
                    // fire an edge; catch it with an initial read.
                    self.registry.handle_readable(token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
