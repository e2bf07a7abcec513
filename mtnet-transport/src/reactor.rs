//! Single-threaded readiness reactor.
//!
//! One dedicated network thread owns the reactor and everything registered
//! with it. The only cross-thread surface is the [`mio::Waker`], which other
//! threads poke after enqueueing work for the loop (see
//! [`crate::manager::TransportHandle`]).
//!
//! Dispatch is data, not virtual calls: `run_once` returns [`Wakeup`] values
//! tagged with a [`ReadinessSource`], and the driver pattern-matches them to
//! the owning connection.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::manager::ConnectionKey;
use crate::timer::{TimerId, TimerQueue};

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENT_CAPACITY: usize = 128;

/// What a registered descriptor belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessSource {
    /// A pooled connection's socket.
    Connection(ConnectionKey),
    /// The cross-thread wake channel.
    Waker,
}

/// One readiness notification out of [`Reactor::run_once`].
#[derive(Clone, Copy, Debug)]
pub struct Wakeup {
    /// Who the event belongs to.
    pub source: ReadinessSource,
    /// Descriptor is readable (or the peer closed its half).
    pub readable: bool,
    /// Descriptor is writable.
    pub writable: bool,
}

/// Result of one reactor sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Readiness notifications to dispatch.
    pub wakeups: Vec<Wakeup>,
    /// Timers that came due during this sweep.
    pub fired: Vec<TimerId>,
}

/// The readiness multiplexer plus the timer queue bounding its waits.
pub struct Reactor {
    poll: Poll,
    events: Events,
    sources: HashMap<Token, ReadinessSource>,
    timers: TimerQueue,
    waker: Arc<Waker>,
    next_token: usize,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            sources: HashMap::new(),
            timers: TimerQueue::new(),
            waker,
            next_token: 0,
        })
    }

    /// The cross-thread wake handle. Poking it makes the current (or next)
    /// `run_once` return promptly.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// The timer queue whose next deadline bounds the poll wait.
    pub fn timers(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    /// Register a descriptor. A failure here is fatal for the descriptor:
    /// the caller must close it and report, never retry in a loop.
    ///
    /// Each underlying descriptor must have exactly one live registration.
    pub fn register<S: Source>(
        &mut self,
        source: &mut S,
        interest: Interest,
        tag: ReadinessSource,
    ) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(source, token, interest)?;
        self.sources.insert(token, tag);
        Ok(token)
    }

    /// Change the interest set of an already-registered descriptor.
    pub fn reregister<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Remove a descriptor's registration.
    pub fn deregister<S: Source>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.sources.remove(&token);
        self.poll.registry().deregister(source)
    }

    /// One loop iteration: wait (bounded by `max_wait` and the nearest
    /// timer), collect readiness wakeups, fire due timers.
    pub fn run_once(&mut self, max_wait: Duration) -> io::Result<Sweep> {
        let timeout = self.timers.wait_timeout(Instant::now(), max_wait);

        let mut sweep = Sweep::default();
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            // A signal landing mid-wait is not an error for the loop.
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            self.events.clear();
        }

        for event in self.events.iter() {
            let source = if event.token() == WAKER_TOKEN {
                ReadinessSource::Waker
            } else {
                match self.sources.get(&event.token()) {
                    Some(source) => *source,
                    // Stale event for a descriptor deregistered earlier in
                    // this same sweep.
                    None => continue,
                }
            };
            sweep.wakeups.push(Wakeup {
                source,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }

        sweep.fired = self.timers.fire_due(Instant::now());
        Ok(sweep)
    }
}
