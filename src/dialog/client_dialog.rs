//! UAC (client) INVITE dialog: drives the outbound INVITE transaction
//! through provisional/final responses, sends the ACK, and owns
//! mid-dialog requests (BYE, re-INVITE, REFER) once established.
//!
//! Grounded on the reference implementation's `ClientInviteDialog` /
//! `process_invite`, simplified per spec.md's division of labor: the
//! dialog layer owns ACK construction for both 2xx and non-2xx final
//! responses (design note (b) in SPEC_FULL.md), and 401/407 challenges
//! are surfaced to the caller rather than retried here.

use super::dialog::{Dialog, DialogInner, DialogInnerRef, DialogState, TerminatedReason};
use super::DialogId;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{Transaction, TransactionKind, TuEvent};
use crate::Result;
use rsip::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ClientInviteDialog {
    pub inner: DialogInnerRef,
}

impl ClientInviteDialog {
    pub fn new(inner: DialogInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn set_public_address(&self, addr: crate::transport::SipAddr) {
        self.inner.set_public_address(addr);
    }

    /// Builds the client INVITE transaction for `request`, drives it to
    /// completion, and resolves to the confirmed dialog id (which may have
    /// gained a To-tag the initial id didn't have) plus the 2xx/non-2xx
    /// final response, or an error if the transaction never completed.
    pub async fn process_invite(&self, request: Request) -> Result<(DialogId, Option<Response>)> {
        let destination = crate::transport::SipAddr::try_from(&request.uri)?;
        let (connection, resolved) = self
            .inner
            .endpoint_inner
            .transport_layer
            .lookup(&destination, None)
            .await?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let (ev_tx, ev_rx) = tokio::sync::mpsc::unbounded_channel();
        let (tu_tx, mut tu_rx) = tokio::sync::mpsc::unbounded_channel();
        self.inner.endpoint_inner.attach_transaction(&key, ev_tx);
        let tx = Transaction::new(
            TransactionKind::ClientInvite,
            request.clone(),
            resolved,
            connection,
            self.inner.endpoint_inner.clone(),
            ev_rx,
            tu_tx,
        )?;
        tokio::spawn(tx.run());

        while let Some(event) = tu_rx.recv().await {
            match event {
                TuEvent::Provisional(resp) => {
                    self.on_provisional(&resp)?;
                }
                TuEvent::Final(resp) => {
                    return self.on_final(&request, &key, resp).await;
                }
                TuEvent::Terminated(reason) => {
                    let id = self.id();
                    let reason = match reason {
                        crate::transaction::transaction::TerminatedReason::Timeout => TerminatedReason::Timeout,
                        crate::transaction::transaction::TerminatedReason::TransportError => TerminatedReason::TransportFailure,
                        _ => TerminatedReason::UacOther(None),
                    };
                    self.inner.transition(DialogState::Terminated(id.clone(), reason))?;
                    return Err(crate::Error::TransactionTerminated(key));
                }
            }
        }
        Err(crate::Error::TransactionTerminated(key))
    }

    fn on_provisional(&self, resp: &Response) -> Result<()> {
        let id = self.id();
        if let Some(to_tag) = response_to_tag(resp) {
            let _ = self.inner.update_remote_tag(&to_tag);
        }
        if matches!(resp.status_code, StatusCode::Ringing | StatusCode::SessionProgress) {
            self.inner.transition(DialogState::Early(id, resp.clone()))?;
        } else if resp.status_code == StatusCode::Trying {
            self.inner.transition(DialogState::Trying(id))?;
        }
        Ok(())
    }

    async fn on_final(&self, request: &Request, key: &TransactionKey, resp: Response) -> Result<(DialogId, Option<Response>)> {
        if let Some(to_tag) = response_to_tag(&resp) {
            self.inner.update_remote_tag(&to_tag)?;
        }
        let id = self.id();

        if resp.status_code.kind() == rsip::StatusCodeKind::Successful {
            self.learn_route_set(&resp);
            self.inner.send_ack(request, &resp).await?;
            if !request.body.is_empty() {
                self.inner.set_local_answer(request.body.clone());
            }
            self.inner.notify_body(resp.body.clone());
            self.inner.transition(DialogState::Confirmed(id.clone()))?;
            info!(dialog = %id, "call established");
            Ok((id, Some(resp)))
        } else {
            self.inner.send_ack(request, &resp).await?;
            let reason = terminated_reason_for(&resp.status_code);
            self.inner.transition(DialogState::Terminated(id.clone(), reason))?;
            debug!(dialog = %id, status = %resp.status_code, "call failed, transaction key {}", key);
            Ok((id, Some(resp)))
        }
    }

    fn learn_route_set(&self, resp: &Response) {
        use rsip::prelude::HeadersExt;
        let mut routes = vec![];
        for h in resp.headers.iter() {
            if let rsip::Header::RecordRoute(rr) = h {
                routes.push(rsip::headers::Route::from(rr.value()));
            }
        }
        routes.reverse();
        if let Ok(contact) = resp.contact_header().and_then(|c| c.typed()) {
            self.inner.update_remote_target(contact.uri);
        }
        *self.inner.route_set.lock().unwrap() = routes;
    }

    pub async fn bye(&self) -> Result<()> {
        let request = self.inner.make_request(rsip::Method::Bye, None, None, None, None, None)?;
        let resp = self.inner.do_request(request).await?;
        let id = self.id();
        match resp {
            Some(r) if r.status_code.kind() == rsip::StatusCodeKind::Successful => {
                self.inner.transition(DialogState::Terminated(id, TerminatedReason::UacBye))
            }
            _ => self.inner.transition(DialogState::Terminated(id, TerminatedReason::Timeout)),
        }
    }

    pub async fn cancel(&self) -> Result<()> {
        let cancel_req = self.build_cancel()?;
        let key = TransactionKey::from_request(&cancel_req, TransactionRole::Client)?;
        let destination = crate::transport::SipAddr::try_from(&cancel_req.uri)?;
        let (conn, resolved) = self.inner.endpoint_inner.transport_layer.lookup(&destination, None).await?;
        conn.send(rsip::SipMessage::Request(cancel_req), Some(&resolved)).await?;
        let id = self.id();
        self.inner.transition(DialogState::Terminated(id, TerminatedReason::UacCancel))?;
        debug!(%key, "CANCEL sent for pending INVITE");
        Ok(())
    }

    fn build_cancel(&self) -> Result<Request> {
        use rsip::prelude::HeadersExt;
        let invite = &self.inner.initial_request;
        let mut headers = vec![
            invite.via_header()?.clone().into(),
            invite.from_header()?.clone().into(),
            invite.to_header()?.clone().into(),
            invite.call_id_header()?.clone().into(),
        ];
        let seq = invite.cseq_header()?.seq()?;
        headers.push(rsip::Header::CSeq(rsip::typed::CSeq { seq, method: rsip::Method::Cancel }.into()));
        headers.push(rsip::Header::MaxForwards(70.into()));
        Ok(Request {
            method: rsip::Method::Cancel,
            uri: invite.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        })
    }

    /// Handles an in-dialog request addressed to this dialog after the
    /// dialog has been established (NOTIFY for a REFER subscription,
    /// re-INVITE, INFO, OPTIONS, BYE from the peer).
    pub async fn handle(&mut self, mut tx: Transaction) -> Result<()> {
        match tx.kind {
            TransactionKind::ServerNonInvite if tx.request.method == rsip::Method::Bye => {
                let resp = self.inner.make_response(&tx.request, StatusCode::OK, None, None);
                tx.send_response(resp).await?;
                let id = self.id();
                self.inner.transition(DialogState::Terminated(id, TerminatedReason::UasBye))?;
            }
            TransactionKind::ServerNonInvite if tx.request.method == rsip::Method::Notify => {
                let id = self.id();
                super::refer::handle_incoming_notify(&self.inner, &tx.request)?;
                self.inner.transition(DialogState::Notify(id, tx.request.clone()))?;
                let resp = self.inner.make_response(&tx.request, StatusCode::OK, None, None);
                tx.send_response(resp).await?;
            }
            TransactionKind::ServerInvite => {
                let resp = match self.inner.handle_incoming_re_invite(&tx.request).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        debug!(error = %e, "rejecting re-INVITE");
                        self.inner.make_response(&tx.request, StatusCode::NotAcceptableHere, None, None)
                    }
                };
                tx.send_response(resp).await?;
            }
            _ => {
                warn!(method = %tx.request.method, "unhandled in-dialog request on client dialog");
                let resp = self.inner.make_response(&tx.request, StatusCode::NotImplemented, None, None);
                tx.send_response(resp).await?;
            }
        }
        Ok(())
    }

    /// Sends a mid-dialog re-INVITE originated by this side.
    pub async fn re_invite(&self, opt: super::builder::ReInviteOption) -> Result<Response> {
        self.inner.do_re_invite(&opt).await
    }

    /// Blind transfer (RFC 3515).
    pub async fn refer(&self, target: rsip::Uri, opt: super::builder::ReferOption) -> Result<Option<super::refer::ReferSubscription>> {
        self.inner.require_established()?;
        super::refer::send_refer(&self.inner, target, None, opt.refer_sub).await
    }

    /// Attended transfer (RFC 3891), embedding a `Replaces` header built
    /// from `other`'s call leg.
    pub async fn refer_replace(&self, other: &Dialog, opt: super::builder::ReferReplaceOption) -> Result<Option<super::refer::ReferSubscription>> {
        self.inner.require_established()?;
        let other_inner = other.inner();
        let (local, remote) = other_inner.local_remote_tags();
        let replaces = super::refer::ReplacesInfo {
            call_id: other.id().call_id,
            from_tag: remote,
            to_tag: local,
            early_only: opt.early_only,
        };
        let target = other_inner.remote_uri.lock().unwrap().clone();
        super::refer::send_refer(&self.inner, target, Some(replaces), opt.refer_sub).await
    }

    pub fn as_dialog(self) -> Dialog {
        Dialog::ClientInvite(self)
    }
}

fn response_to_tag(resp: &Response) -> Option<String> {
    use rsip::prelude::{HeadersExt, ToTypedHeader};
    resp.to_header().ok()?.typed().ok()?.tag().map(|t| t.to_string())
}

fn terminated_reason_for(status: &StatusCode) -> TerminatedReason {
    match status {
        StatusCode::BusyHere | StatusCode::BusyEverywhere => TerminatedReason::UacBusy,
        StatusCode::Decline => TerminatedReason::UasDecline,
        StatusCode::ProxyAuthenticationRequired | StatusCode::Unauthorized => TerminatedReason::ProxyAuthRequired,
        s if s.kind() == rsip::StatusCodeKind::ServerError || s.kind() == rsip::StatusCodeKind::GlobalFailure => {
            TerminatedReason::ProxyError(s.clone())
        }
        s => TerminatedReason::UacOther(Some(s.clone())),
    }
}
