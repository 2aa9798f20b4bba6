//! The stack's dialog ownership piece: the sharded dialog table plus the
//! lookup-fallback chain spec.md §4.8 requires for routing an in-dialog
//! request that doesn't match the canonical `DialogId`.
//!
//! Grounded on the reference implementation's `DialogLayer` (`dialogs:
//! RwLock<HashMap<DialogId, Dialog>>`, `increment_last_seq`), generalized
//! onto [`crate::shard_map::ShardedMap`] per spec.md §4.2 and extended with
//! the `MaxDialogs` cap and fallback lookup chain `rvoip`'s `dialog-core`
//! crate uses in `manager/core.rs`.

use super::dialog::Dialog;
use super::DialogId;
use crate::shard_map::ShardedMap;
use crate::transaction::endpoint::{generate_random_cseq, EndpointInnerRef};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    dialogs: ShardedMap<DialogId, Dialog>,
    max_dialogs: usize,
    last_seq: AtomicU32,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef, max_dialogs: usize) -> Self {
        let seed = generate_random_cseq(&endpoint.id_pool);
        Self {
            endpoint,
            dialogs: ShardedMap::new(),
            max_dialogs,
            last_seq: AtomicU32::new(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Mints the next CSeq for a fresh dialog-creating request (the initial
    /// INVITE's starting sequence number).
    pub fn increment_last_seq(&self) -> u32 {
        self.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Looks a dialog up by its exact, canonical key only.
    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id)
    }

    /// The fallback lookup chain spec.md §4.8 requires for an in-dialog
    /// request that doesn't land on the canonical key: first the
    /// From/To-tag swap (a peer's request carries our tag in the opposite
    /// header from how we store it), then an empty-to-tag variant (the
    /// peer hasn't learned our to-tag yet, a narrow race against an early
    /// dialog), then a full scan restricted to matching Call-ID, picking
    /// whichever live dialog shares it.
    pub fn find_dialog(&self, id: &DialogId) -> Option<Dialog> {
        if let Some(d) = self.dialogs.get(id) {
            return Some(d);
        }
        if let Some(d) = self.dialogs.get(&id.swapped()) {
            return Some(d);
        }
        if let Some(d) = self.dialogs.get(&id.with_empty_to_tag()) {
            return Some(d);
        }
        let matches = self.dialogs.find_all(|k, _| k.call_id == id.call_id);
        matches.into_iter().map(|(_, d)| d).next()
    }

    /// Inserts a newly created dialog, enforcing the `MaxDialogs` cap
    /// (spec.md §4.8).
    pub fn insert_dialog(&self, id: DialogId, dialog: Dialog) -> Result<()> {
        if self.dialogs.len() >= self.max_dialogs {
            return Err(Error::ResourceExhausted(format!(
                "max_dialogs ({}) reached",
                self.max_dialogs
            )));
        }
        self.dialogs.insert(id, dialog);
        self.endpoint.metrics.dialog_created();
        Ok(())
    }

    pub fn remove_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let removed = self.dialogs.remove(id);
        if let Some(d) = &removed {
            d.on_remove();
            self.endpoint.metrics.dialog_terminated();
        }
        removed
    }

    /// Moves a dialog from its provisional key (from-tag only, to-tag
    /// unknown) to its confirmed key once the peer's to-tag is learned
    /// from a final response.
    pub fn rekey_dialog(&self, old: &DialogId, new: DialogId) -> bool {
        self.dialogs.rekey(old, new)
    }

    pub fn for_each(&self, f: impl FnMut(&DialogId, &Dialog)) {
        self.dialogs.for_each(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::client_dialog::ClientInviteDialog;
    use crate::dialog::dialog::DialogInner;
    use crate::transaction::endpoint::{EndpointBuilder, EndpointOption};
    use crate::transaction::key::TransactionRole;
    use crate::transport::{SipAddr, SipConnection, SipTransport, SipTransportConnection};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullConn;
    #[async_trait]
    impl SipTransportConnection for NullConn {
        fn is_reliable(&self) -> bool {
            true
        }
        async fn send(&self, _msg: rsip::SipMessage, _dest: Option<&SipAddr>) -> Result<()> {
            Ok(())
        }
    }

    struct NullTransport;
    #[async_trait]
    impl SipTransport for NullTransport {
        async fn lookup(
            &self,
            destination: &SipAddr,
            _via_key: Option<&crate::transaction::key::TransactionKey>,
        ) -> Result<(SipConnection, SipAddr)> {
            Ok((SipConnection::new(Arc::new(NullConn)), destination.clone()))
        }
    }

    fn endpoint() -> EndpointInnerRef {
        EndpointBuilder::new()
            .with_option(EndpointOption::default())
            .with_transport_layer(Arc::new(NullTransport))
            .build()
            .inner
    }

    fn invite_request(call_id: &str, from_tag: &str) -> rsip::Request {
        rsip::Request {
            method: rsip::Method::Invite,
            uri: "sip:bob@example.com".try_into().unwrap(),
            headers: vec![
                rsip::Header::From(
                    format!("<sip:alice@example.com>;tag={}", from_tag)
                        .try_into()
                        .unwrap(),
                ),
                rsip::Header::To("<sip:bob@example.com>".try_into().unwrap()),
                rsip::Header::CallId(call_id.to_string().into()),
                rsip::Header::CSeq(rsip::typed::CSeq { seq: 1, method: rsip::Method::Invite }.into()),
                rsip::Header::Contact("<sip:alice@192.168.1.1:5060>".try_into().unwrap()),
            ]
            .into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    fn dialog(endpoint: EndpointInnerRef, id: DialogId, req: rsip::Request) -> Dialog {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let inner = DialogInner::new(TransactionRole::Client, id, req, endpoint, tx, None).unwrap();
        ClientInviteDialog::new(inner).as_dialog()
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let layer = DialogLayer::new(endpoint(), 10);
        let id = DialogId::new("call-1", "ft", "");
        let req = invite_request("call-1", "ft");
        layer.insert_dialog(id.clone(), dialog(layer.endpoint.clone(), id.clone(), req)).unwrap();
        assert!(layer.get_dialog(&id).is_some());
        assert_eq!(layer.len(), 1);
    }

    #[test]
    fn max_dialogs_cap_is_enforced() {
        let layer = DialogLayer::new(endpoint(), 1);
        let id1 = DialogId::new("call-1", "ft", "");
        let req1 = invite_request("call-1", "ft");
        layer.insert_dialog(id1.clone(), dialog(layer.endpoint.clone(), id1, req1)).unwrap();
        let id2 = DialogId::new("call-2", "ft2", "");
        let req2 = invite_request("call-2", "ft2");
        let err = layer.insert_dialog(id2.clone(), dialog(layer.endpoint.clone(), id2, req2));
        assert!(matches!(err, Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn find_dialog_falls_back_through_swap_then_call_id_scan() {
        let layer = DialogLayer::new(endpoint(), 10);
        let id = DialogId::new("call-1", "ft", "tt");
        let req = invite_request("call-1", "ft");
        layer.insert_dialog(id.clone(), dialog(layer.endpoint.clone(), id.clone(), req)).unwrap();

        let swapped = id.swapped();
        assert!(layer.find_dialog(&swapped).is_some());

        let scan_only = DialogId::new("call-1", "nonexistent-from", "nonexistent-to");
        assert!(layer.find_dialog(&scan_only).is_some());

        let total_miss = DialogId::new("no-such-call", "x", "y");
        assert!(layer.find_dialog(&total_miss).is_none());
    }

    #[test]
    fn remove_dialog_cancels_its_token() {
        let layer = DialogLayer::new(endpoint(), 10);
        let id = DialogId::new("call-1", "ft", "");
        let req = invite_request("call-1", "ft");
        layer.insert_dialog(id.clone(), dialog(layer.endpoint.clone(), id.clone(), req)).unwrap();
        let removed = layer.remove_dialog(&id).unwrap();
        assert!(removed.inner().cancel_token.is_cancelled());
        assert!(layer.get_dialog(&id).is_none());
    }
}
