//! Orchestrator-facing transport loop.
//!
//! Owns the reactor and the connection pool keyed by (datacenter, kind,
//! slot). Everything runs on one dedicated network thread; other threads
//! interact exclusively through [`TransportHandle`], which enqueues a
//! closure on the mutex-guarded task queue and pokes the reactor's waker.
//! The loop drains the queue once before and once after every poll, so
//! externally submitted operations keep their submission order and callers
//! never block on network I/O.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::Waker;

use crate::connection::{
    Connection, ConnectionEvent, ConnectionKind, ConnectionOptions, ConnectionState,
};
use crate::errors::DisconnectReason;
use crate::reactor::{Reactor, ReadinessSource, Wakeup};
use crate::resolver::{Resolver, ThreadResolver};
use crate::socks5::Socks5Config;
use crate::timer::TimerId;

/// Upper bound on one poll wait; timers and the waker cut it short.
const MAX_WAIT: Duration = Duration::from_secs(1);

// ─── Keys and context ─────────────────────────────────────────────────────────

/// Identity of one pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Datacenter the connection belongs to.
    pub datacenter_id: u32,
    /// Traffic class.
    pub kind: ConnectionKind,
    /// Slot index for kinds that allow several parallel connections.
    pub slot: u16,
}

/// Identity of one transport instance. A process hosting several logical
/// accounts creates one context (and one loop) per account; nothing here is
/// a process-wide global.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportContext {
    /// Instance number, used only for logging.
    pub instance_id: u32,
}

/// Where a connection should connect to.
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// IP literal or hostname.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Prefer an IPv6 address when resolving.
    pub prefer_ipv6: bool,
}

/// Callbacks crossing the orchestrator boundary. Failures arrive as data —
/// a reason plus a numeric code — never as panics.
pub trait TransportDelegate: Send {
    /// A connection's channel came up.
    fn on_connected(&mut self, key: ConnectionKey);
    /// A connection went down and will not retry on its own.
    fn on_disconnected(&mut self, key: ConnectionKey, reason: DisconnectReason, code: i32);
    /// One complete inbound frame.
    fn on_received_data(&mut self, key: ConnectionKey, data: Vec<u8>);
    /// A quick-ack token for a frame sent with `report_ack`.
    fn on_quick_ack(&mut self, key: ConnectionKey, ack: u32);
}

type Task = Box<dyn FnOnce(&mut TransportLoop) + Send + 'static>;

// ─── TransportHandle ──────────────────────────────────────────────────────────

/// Cross-thread entry point to the transport loop.
#[derive(Clone)]
pub struct TransportHandle {
    tasks: Arc<Mutex<VecDeque<Task>>>,
    waker: Arc<Waker>,
}

impl TransportHandle {
    fn submit(&self, task: Task) {
        lock(&self.tasks).push_back(task);
        if let Err(e) = self.waker.wake() {
            log::warn!("[manager] waker failed: {e}");
        }
    }

    /// Open (or reconnect) the connection identified by `key`.
    pub fn open_connection(&self, key: ConnectionKey, endpoint: Endpoint) {
        self.submit(Box::new(move |lp| lp.open_connection(key, endpoint)));
    }

    /// Frame, encrypt and send bytes on an open connection.
    pub fn send_data(&self, key: ConnectionKey, data: Vec<u8>, report_ack: bool) {
        self.submit(Box::new(move |lp| lp.send_data(key, &data, report_ack)));
    }

    /// Suspend every connection, keeping session state for fast resume.
    pub fn suspend(&self) {
        self.submit(Box::new(|lp| lp.suspend_all()));
    }

    /// Resume every suspended connection.
    pub fn resume(&self) {
        self.submit(Box::new(|lp| lp.resume_all()));
    }

    /// Drop one connection for good.
    pub fn drop_connection(&self, key: ConnectionKey) {
        self.submit(Box::new(move |lp| lp.drop_connection(key)));
    }

    /// Route all traffic through `proxy` (or directly again with `None`),
    /// reconnecting every active connection.
    pub fn set_override_proxy(&self, proxy: Option<Socks5Config>) {
        self.submit(Box::new(move |lp| lp.set_override_proxy(proxy)));
    }

    /// Make [`TransportLoop::run`] return after the current iteration.
    pub fn shutdown(&self) {
        self.submit(Box::new(|lp| lp.running = false));
    }
}

// ─── TransportLoop ────────────────────────────────────────────────────────────

/// The network thread's main object.
pub struct TransportLoop {
    context: TransportContext,
    reactor: Reactor,
    tasks: Arc<Mutex<VecDeque<Task>>>,
    connections: HashMap<ConnectionKey, Connection>,
    endpoints: HashMap<ConnectionKey, Endpoint>,
    retry_timers: HashMap<TimerId, ConnectionKey>,
    delegate: Box<dyn TransportDelegate>,
    resolver: Box<dyn Resolver>,
    proxy: Option<Socks5Config>,
    options: ConnectionOptions,
    running: bool,
}

impl TransportLoop {
    pub fn new(context: TransportContext, delegate: Box<dyn TransportDelegate>) -> io::Result<Self> {
        Ok(Self {
            context,
            reactor: Reactor::new()?,
            tasks: Arc::new(Mutex::new(VecDeque::new())),
            connections: HashMap::new(),
            endpoints: HashMap::new(),
            retry_timers: HashMap::new(),
            delegate,
            resolver: Box::new(ThreadResolver),
            proxy: None,
            options: ConnectionOptions::default(),
            running: false,
        })
    }

    /// Replace the resolver collaborator (tests, custom DNS).
    pub fn set_resolver(&mut self, resolver: Box<dyn Resolver>) {
        self.resolver = resolver;
    }

    /// Options applied to connections created from now on.
    pub fn set_connection_options(&mut self, options: ConnectionOptions) {
        self.options = options;
    }

    /// A cloneable cross-thread handle to this loop.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            tasks: Arc::clone(&self.tasks),
            waker: self.reactor.waker(),
        }
    }

    /// Run until [`TransportHandle::shutdown`] is called.
    pub fn run(&mut self) {
        log::debug!("[manager] instance {} loop started", self.context.instance_id);
        self.running = true;
        while self.running {
            if let Err(e) = self.run_iteration(MAX_WAIT) {
                log::error!("[manager] reactor failure: {e}");
                break;
            }
        }
        log::debug!("[manager] instance {} loop stopped", self.context.instance_id);
    }

    /// One loop iteration; public so tests can drive the loop by hand.
    pub fn run_iteration(&mut self, max_wait: Duration) -> io::Result<()> {
        self.drain_tasks();
        let sweep = self.reactor.run_once(max_wait)?;
        self.drain_tasks();

        for wakeup in &sweep.wakeups {
            self.dispatch_wakeup(*wakeup);
        }
        for timer in &sweep.fired {
            if let Some(key) = self.retry_timers.remove(timer) {
                // Reconnects go back through initiate_connect so hostnames
                // are re-resolved on every attempt.
                let due = self
                    .connections
                    .get(&key)
                    .is_some_and(|c| c.state() == ConnectionState::Reconnecting);
                if due {
                    self.initiate_connect(key);
                }
            }
        }

        let now = Instant::now();
        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        for key in keys {
            let events = match self.connections.get_mut(&key) {
                Some(connection) => connection.check_timeout(&mut self.reactor, now),
                None => Vec::new(),
            };
            self.process_events(key, events);
        }
        Ok(())
    }

    fn drain_tasks(&mut self) {
        loop {
            let task = lock(&self.tasks).pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    fn dispatch_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup.source {
            ReadinessSource::Waker => {}
            ReadinessSource::Connection(key) => {
                let events = match self.connections.get_mut(&key) {
                    Some(connection) => {
                        connection.handle_readiness(&mut self.reactor, wakeup.readable, wakeup.writable)
                    }
                    None => Vec::new(),
                };
                self.process_events(key, events);
            }
        }
    }

    fn process_events(&mut self, key: ConnectionKey, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::Connected => self.delegate.on_connected(key),
                ConnectionEvent::Received(data) => self.delegate.on_received_data(key, data),
                ConnectionEvent::QuickAck(ack) => self.delegate.on_quick_ack(key, ack),
                ConnectionEvent::RetryAfter(delay) => {
                    let now = Instant::now();
                    if let Some(id) = self.reactor.timers().schedule_once(now, delay) {
                        self.retry_timers.insert(id, key);
                    }
                }
                ConnectionEvent::Down { reason, code } => {
                    self.delegate.on_disconnected(key, reason, code);
                }
            }
        }
    }

    // ── Operations (reached through the task queue) ──────────────────────────

    fn open_connection(&mut self, key: ConnectionKey, endpoint: Endpoint) {
        self.endpoints.insert(key, endpoint.clone());
        let options = self.options;
        let connection = self
            .connections
            .entry(key)
            .or_insert_with(|| Connection::new(key, options));
        if matches!(
            connection.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        self.initiate_connect(key);
    }

    fn initiate_connect(&mut self, key: ConnectionKey) {
        let Some(endpoint) = self.endpoints.get(&key).cloned() else { return };
        match endpoint.host.parse::<IpAddr>() {
            Ok(ip) => self.connect_with_target(key, SocketAddr::new(ip, endpoint.port)),
            Err(_) => {
                let handle = self.handle();
                self.resolver.resolve(
                    endpoint.host.clone(),
                    endpoint.port,
                    endpoint.prefer_ipv6,
                    Box::new(move |result| {
                        let result = result.map(|ip| SocketAddr::new(ip, endpoint.port));
                        handle.submit(Box::new(move |lp| lp.finish_resolve(key, result)));
                    }),
                );
            }
        }
    }

    fn finish_resolve(&mut self, key: ConnectionKey, result: io::Result<SocketAddr>) {
        match result {
            Ok(target) => self.connect_with_target(key, target),
            Err(e) => {
                log::warn!("[manager] resolve failed for dc{}: {e}", key.datacenter_id);
                let events = match self.connections.get_mut(&key) {
                    Some(connection) => connection.resolve_failed(),
                    None => Vec::new(),
                };
                self.process_events(key, events);
            }
        }
    }

    /// Connect `key` to an already-resolved target, routing through the
    /// override proxy when one is set. A hostname proxy goes through the
    /// resolver first like any endpoint.
    fn connect_with_target(&mut self, key: ConnectionKey, target: SocketAddr) {
        // A stale resolve completion must not stomp a live attempt.
        let busy = self.connections.get(&key).is_some_and(|c| {
            matches!(c.state(), ConnectionState::Connecting | ConnectionState::Connected)
        });
        if busy {
            return;
        }
        let proxy = match &self.proxy {
            None => None,
            Some(config) => match config.addr.parse::<IpAddr>() {
                Ok(ip) => Some((SocketAddr::new(ip, config.port), config.clone())),
                Err(_) => {
                    let handle = self.handle();
                    let config = config.clone();
                    self.resolver.resolve(
                        config.addr.clone(),
                        config.port,
                        target.is_ipv6(),
                        Box::new(move |result| {
                            handle.submit(Box::new(move |lp| match result {
                                Ok(ip) => lp.connect_through_proxy(
                                    key,
                                    target,
                                    SocketAddr::new(ip, config.port),
                                    config,
                                ),
                                Err(e) => {
                                    log::warn!("[manager] proxy resolve failed: {e}");
                                    lp.finish_resolve(
                                        key,
                                        Err(io::Error::new(io::ErrorKind::NotFound, e)),
                                    );
                                }
                            }));
                        }),
                    );
                    return;
                }
            },
        };
        let events = match self.connections.get_mut(&key) {
            Some(connection) => connection.connect(&mut self.reactor, target, proxy),
            None => Vec::new(),
        };
        self.process_events(key, events);
    }

    fn connect_through_proxy(
        &mut self,
        key: ConnectionKey,
        target: SocketAddr,
        proxy_addr: SocketAddr,
        config: Socks5Config,
    ) {
        let busy = self.connections.get(&key).is_some_and(|c| {
            matches!(c.state(), ConnectionState::Connecting | ConnectionState::Connected)
        });
        if busy {
            return;
        }
        let events = match self.connections.get_mut(&key) {
            Some(connection) => {
                connection.connect(&mut self.reactor, target, Some((proxy_addr, config)))
            }
            None => Vec::new(),
        };
        self.process_events(key, events);
    }

    fn send_data(&mut self, key: ConnectionKey, data: &[u8], report_ack: bool) {
        let events = match self.connections.get_mut(&key) {
            Some(connection) => connection.send_data(&mut self.reactor, data, report_ack),
            None => {
                log::warn!("[manager] send_data for unknown connection dc{}", key.datacenter_id);
                Vec::new()
            }
        };
        self.process_events(key, events);
    }

    fn suspend_all(&mut self) {
        log::debug!("[manager] instance {} suspending", self.context.instance_id);
        for connection in self.connections.values_mut() {
            connection.suspend(&mut self.reactor);
        }
        self.retry_timers.clear();
    }

    fn resume_all(&mut self) {
        log::debug!("[manager] instance {} resuming", self.context.instance_id);
        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        for key in keys {
            let (events, needs_resolve) = match self.connections.get_mut(&key) {
                Some(connection) if connection.state() == ConnectionState::Suspended => {
                    let events = connection.resume(&mut self.reactor);
                    // A connection suspended before its address resolved has
                    // no stored target; route it back through the resolver.
                    (events, connection.state() == ConnectionState::Idle)
                }
                _ => (Vec::new(), false),
            };
            self.process_events(key, events);
            if needs_resolve {
                self.initiate_connect(key);
            }
        }
    }

    fn drop_connection(&mut self, key: ConnectionKey) {
        self.endpoints.remove(&key);
        let events = match self.connections.remove(&key) {
            Some(mut connection) => connection.shutdown(&mut self.reactor),
            None => Vec::new(),
        };
        self.process_events(key, events);
    }

    fn set_override_proxy(&mut self, proxy: Option<Socks5Config>) {
        log::info!(
            "[manager] proxy override {}",
            if proxy.is_some() { "set" } else { "cleared" }
        );
        self.proxy = proxy;
        // Active connections must pick the new route up immediately.
        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        for key in keys {
            let reconnect = {
                let Some(connection) = self.connections.get_mut(&key) else { continue };
                match connection.state() {
                    ConnectionState::Suspended | ConnectionState::Idle => false,
                    _ => {
                        connection.disconnect_quiet(&mut self.reactor);
                        true
                    }
                }
            };
            if reconnect {
                self.initiate_connect(key);
            }
        }
    }

    /// Direct access to a connection's session state, for the orchestrator's
    /// message-id bookkeeping.
    pub fn connection_mut(&mut self, key: ConnectionKey) -> Option<&mut Connection> {
        self.connections.get_mut(&key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
