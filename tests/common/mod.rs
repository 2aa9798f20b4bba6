//! Shared end-to-end test fixture: an in-memory "network" connecting two
//! or more [`Stack`]s without a real socket, so the crate-level scenario
//! tests (spec.md §8 S1-S7) exercise the real transaction/dialog machinery
//! on both sides of a call instead of mocking one side away.
//!
//! Grounded on the same `NullConn`/`NullTransport` shape the crate's own
//! unit tests use (see `src/stack.rs`, `src/dialog/tests.rs`), generalized
//! from "one stack talking to nothing" into "two stacks talking to each
//! other" by resolving a [`SipAddr`] to the `Stack` registered for it
//! instead of discarding every send.

use async_trait::async_trait;
use sipcore_stack::config::Config;
use sipcore_stack::stack::Stack;
use sipcore_stack::transport::{SipAddr, SipConnection, SipTransport, SipTransportConnection};
use sipcore_stack::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of every `Stack` reachable on this fake network, keyed by the
/// `host:port` it was registered under.
#[derive(Default)]
pub struct LoopbackNetwork {
    stacks: Mutex<HashMap<String, Stack>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: &str, stack: Stack) {
        self.stacks.lock().unwrap().insert(addr.to_string(), stack);
    }

    fn find(&self, addr: &str) -> Option<Stack> {
        self.stacks.lock().unwrap().get(addr).cloned()
    }
}

/// Keys the registry by host:port only, ignoring the transport-type tag a
/// `SipAddr` may or may not carry (a bare `sip:` URI and a Via-derived
/// address for the same peer don't always agree on it).
fn addr_key(addr: &SipAddr) -> String {
    let port = addr.addr.port.as_ref().map(|p| p.to_string()).unwrap_or_default();
    format!("{}:{}", addr.addr.host, port)
}

/// The transport a single `Stack` is configured with. Knows its own bound
/// address so outbound sends can hand the peer a connection that replies
/// to the right place.
pub struct LoopbackTransport {
    pub network: Arc<LoopbackNetwork>,
    pub local_addr: String,
}

#[async_trait]
impl SipTransport for LoopbackTransport {
    async fn lookup(
        &self,
        destination: &SipAddr,
        _via_key: Option<&sipcore_stack::transaction::key::TransactionKey>,
    ) -> Result<(SipConnection, SipAddr)> {
        let conn = LoopbackConnection {
            network: self.network.clone(),
            to_addr: addr_key(destination),
            from_addr: self.local_addr.clone(),
        };
        Ok((SipConnection::new(Arc::new(conn)), destination.clone()))
    }
}

/// A point-to-point pipe between two registered addresses. `send` ignores
/// its `dest` argument (it is already bound to `to_addr` at construction,
/// matching how the crate builds one connection per resolved destination)
/// and always hands the receiving stack a connection swapped to reply
/// back to `from_addr`, so an arbitrarily long exchange (INVITE, 180, 200,
/// ACK, BYE, 200) keeps routing correctly in both directions.
struct LoopbackConnection {
    network: Arc<LoopbackNetwork>,
    to_addr: String,
    from_addr: String,
}

#[async_trait]
impl SipTransportConnection for LoopbackConnection {
    fn is_reliable(&self) -> bool {
        // Treated as a reliable (TCP-like) pipe so RFC 3261 Timer
        // A/E/G retransmits never arm in these tests; timer discipline
        // itself is covered by `src/transaction/timer.rs`'s unit tests.
        true
    }

    async fn send(&self, msg: rsip::SipMessage, _dest: Option<&SipAddr>) -> Result<()> {
        let Some(target) = self.network.find(&self.to_addr) else {
            return Err(sipcore_stack::Error::TransportLayerError(format!(
                "no stack registered at {}",
                self.to_addr
            )));
        };
        let reply = SipConnection::new(Arc::new(LoopbackConnection {
            network: self.network.clone(),
            to_addr: self.from_addr.clone(),
            from_addr: self.to_addr.clone(),
        }));
        tokio::spawn(async move {
            target.handle_message(msg, Some(reply)).await;
        });
        Ok(())
    }
}

/// Builds a `Stack` bound to `addr` (e.g. `"127.0.0.1:25060"`) and
/// registers it on `network`, ready to send/receive through the loopback
/// transport.
pub fn spawn_stack(network: &Arc<LoopbackNetwork>, addr: &str, mut config: Config) -> Stack {
    let contact: rsip::Uri = format!("sip:endpoint@{}", addr).try_into().unwrap();
    config.local_contact = Some(contact);
    let transport = Arc::new(LoopbackTransport {
        network: network.clone(),
        local_addr: addr.to_string(),
    });
    let stack = Stack::new(config, transport);
    stack.start();
    network.register(addr, stack.clone());
    stack
}

pub fn sip_uri(user: &str, addr: &str) -> rsip::Uri {
    format!("sip:{}@{}", user, addr).try_into().unwrap()
}

/// Polls `state_of` until it returns `true` or `timeout` elapses, yielding
/// between attempts so the other side's spawned tasks get to run. Used
/// instead of a condvar because the observable here is "some predicate
/// over dialog state", not a single event.
pub async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
