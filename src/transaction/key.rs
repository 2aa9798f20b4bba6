//! Transaction identity: RFC 3261 §17.1.3/§17.2.3 matching rules.
//!
//! A transaction is identified by the branch parameter of the topmost Via
//! header plus the direction (client/server) it was created in. Per RFC
//! 3261, the *method* is deliberately excluded from server-transaction
//! matching (an ACK to a non-2xx matches the INVITE server transaction it
//! acknowledges even though its method differs); CANCEL gets its own
//! transaction but is routed to the original INVITE transaction by the
//! dialog layer, not by key equality.

use rsip::prelude::HeadersExt;
use rsip::{Param, Request};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "client"),
            TransactionRole::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub role: TransactionRole,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.branch)
    }
}

impl TransactionKey {
    pub fn from_request(req: &Request, role: TransactionRole) -> crate::Result<Self> {
        let via = req.via_header().map_err(|e| {
            crate::Error::MissingHeader(format!("Via: {}", e))
        })?;
        let typed = via.typed().map_err(|e| crate::Error::MissingHeader(format!("Via: {}", e)))?;
        let branch = typed
            .params
            .iter()
            .find_map(|p| match p {
                Param::Branch(b) => Some(b.value().to_string()),
                _ => None,
            })
            .ok_or_else(|| crate::Error::MissingHeader("Via branch".to_string()))?;
        Ok(Self { branch, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn req_with_branch(branch: &str) -> Request {
        Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                Via::new(format!("SIP/2.0/UDP host:5060;branch={}", branch)).into(),
                CallId::new("abc").into(),
                CSeq::new("1 INVITE").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn ack_and_invite_share_a_server_key_when_branch_matches() {
        let invite = req_with_branch("z9hG4bK-1");
        let mut ack = req_with_branch("z9hG4bK-1");
        ack.method = rsip::Method::Ack;

        let k1 = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
        let k2 = TransactionKey::from_request(&ack, TransactionRole::Server).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn client_and_server_keys_differ_for_same_branch() {
        let req = req_with_branch("z9hG4bK-1");
        let k1 = TransactionKey::from_request(&req, TransactionRole::Client).unwrap();
        let k2 = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn missing_branch_is_an_error() {
        let req = Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![Via::new("SIP/2.0/UDP host:5060").into()].into(),
            version: rsip::Version::V2,
            body: vec![],
        };
        assert!(TransactionKey::from_request(&req, TransactionRole::Client).is_err());
    }
}
