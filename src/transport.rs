//! Transport boundary.
//!
//! Socket I/O (UDP/TCP/TLS/WS listeners) is out of scope for this crate
//! per spec.md §1 — it is consumed as an external collaborator through
//! this trait, grounded on the reference implementation's
//! `transport::SipAddr` / connection-handle shape (`transport/stream.rs`).
//! A concrete implementation plugs in a type implementing [`SipTransport`]
//! and hands the core a [`SipConnection`] handle per resolved destination.

use async_trait::async_trait;
use std::fmt;

/// A resolved network address plus the transport protocol to use for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipAddr {
    pub r#type: Option<rsip::Transport>,
    pub addr: rsip::HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.r#type {
            Some(t) => write!(f, "{}:{}/{}", self.addr.host, self.addr_port(), t),
            None => write!(f, "{}:{}", self.addr.host, self.addr_port()),
        }
    }
}

impl SipAddr {
    fn addr_port(&self) -> String {
        self.addr
            .port
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default()
    }

    pub fn get_socketaddr(&self) -> crate::Result<std::net::SocketAddr> {
        let ip = match &self.addr.host {
            rsip::Host::IpAddr(ip) => *ip,
            rsip::Host::Domain(d) => {
                return Err(crate::Error::DnsResolutionError(format!(
                    "{} is a domain name, not a resolved address",
                    d
                )))
            }
        };
        let port: u16 = self
            .addr
            .port
            .as_ref()
            .map(|p| (*p).into())
            .unwrap_or(5060);
        Ok(std::net::SocketAddr::new(ip, port))
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = crate::Error;

    fn try_from(uri: &rsip::Uri) -> crate::Result<Self> {
        Ok(SipAddr {
            r#type: uri.transport().ok(),
            addr: rsip::HostWithPort {
                host: uri.host().clone(),
                port: uri.port().cloned(),
            },
        })
    }
}

/// An opaque, cloneable handle to an established connection. The concrete
/// implementation (UDP socket set, TCP/TLS stream, WS stream) lives
/// outside this crate; the core only needs to serialize a message and
/// hand it to `send`.
#[derive(Clone)]
pub struct SipConnection(std::sync::Arc<dyn SipTransportConnection>);

impl SipConnection {
    pub fn new(inner: std::sync::Arc<dyn SipTransportConnection>) -> Self {
        Self(inner)
    }

    pub fn is_reliable(&self) -> bool {
        self.0.is_reliable()
    }

    pub async fn send(
        &self,
        msg: rsip::SipMessage,
        destination: Option<&SipAddr>,
    ) -> crate::Result<()> {
        self.0.send(msg, destination).await
    }
}

#[async_trait]
pub trait SipTransportConnection: Send + Sync {
    fn is_reliable(&self) -> bool;
    async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> crate::Result<()>;
}

/// Connection lookup/acceptance surface the transaction layer needs:
/// given a destination, either reuse an existing connection or establish
/// one, and report whether the underlying transport is reliable (TCP/TLS)
/// or not (UDP) — that distinction drives whether Timer A/G retransmits
/// are armed at all.
#[async_trait]
pub trait SipTransport: Send + Sync {
    async fn lookup(
        &self,
        destination: &SipAddr,
        via_key: Option<&crate::transaction::key::TransactionKey>,
    ) -> crate::Result<(SipConnection, SipAddr)>;
}
