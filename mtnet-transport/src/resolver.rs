//! Hostname resolution off the reactor thread.
//!
//! The reactor must never block on DNS, so lookups are delegated to an
//! external collaborator that calls back when the address is known. The
//! completion is expected to re-enter the loop through its task queue.

use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::thread;

/// Completion callback carrying the resolved address.
pub type ResolveCallback = Box<dyn FnOnce(io::Result<IpAddr>) + Send + 'static>;

/// External resolver collaborator.
pub trait Resolver: Send {
    /// Resolve `host`, preferring the requested address family, and invoke
    /// `done` from any thread when finished.
    fn resolve(&self, host: String, port: u16, prefer_ipv6: bool, done: ResolveCallback);
}

/// Default resolver: one short-lived thread per lookup backed by the
/// system resolver.
pub struct ThreadResolver;

impl Resolver for ThreadResolver {
    fn resolve(&self, host: String, port: u16, prefer_ipv6: bool, done: ResolveCallback) {
        thread::spawn(move || {
            let result = lookup(&host, port, prefer_ipv6);
            done(result);
        });
    }
}

fn lookup(host: &str, port: u16, prefer_ipv6: bool) -> io::Result<IpAddr> {
    let addrs: Vec<IpAddr> = (host, port).to_socket_addrs()?.map(|a| a.ip()).collect();
    addrs
        .iter()
        .copied()
        .find(|ip| ip.is_ipv6() == prefer_ipv6)
        .or_else(|| addrs.first().copied())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn resolves_ip_literals_without_dns() {
        let (tx, rx) = mpsc::channel();
        ThreadResolver.resolve(
            "127.0.0.1".into(),
            443,
            false,
            Box::new(move |result| {
                tx.send(result.map(|ip| ip.to_string())).unwrap();
            }),
        );
        let got = rx.recv().unwrap().unwrap();
        assert_eq!(got, "127.0.0.1");
    }
}
