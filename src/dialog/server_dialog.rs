//! UAS (server) INVITE dialog: answers or rejects an inbound INVITE,
//! waits for the peer's ACK, and owns mid-dialog requests afterwards.
//!
//! Grounded on the `server_dialog.rs` shape found in the other-examples
//! fork of this same project (`ServerInviteDialog` with
//! `accept`/`reject`/`bye`/`handle_bye`/`handle_info`/`handle_options`),
//! adapted to this crate's transaction/dialog split: responses are handed
//! to the already-running INVITE server transaction through its event
//! mailbox (`TransactionEvent::Respond`) instead of a direct method call,
//! so the transaction's own retransmit/ACK-wait timers keep driving it
//! after the dialog layer has moved on.

use super::dialog::{Dialog, DialogInner, DialogInnerRef, DialogState, TerminatedReason};
use super::DialogId;
use crate::transaction::transaction::{
    Transaction, TransactionEvent, TransactionEventSender, TransactionKind, TuEvent,
};
use crate::Result;
use rsip::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ServerInviteDialog {
    pub inner: DialogInnerRef,
    invite_events: TransactionEventSender,
}

impl ServerInviteDialog {
    /// `invite_events` is the mailbox of the already-spawned
    /// `ServerInvite` transaction for `inner.initial_request`; `tu_rx` is
    /// that same transaction's upward channel, drained here so an ACK
    /// timeout (Timer H) or an unexpectedly early termination still moves
    /// the dialog to `Terminated` even if the application never calls
    /// `accept`/`reject` again.
    pub fn new(inner: DialogInner, invite_events: TransactionEventSender, tu_rx: tokio::sync::mpsc::UnboundedReceiver<TuEvent>) -> Self {
        let inner = Arc::new(inner);
        let dialog = Self { inner: inner.clone(), invite_events };
        tokio::spawn(Self::watch_invite_transaction(dialog.clone(), tu_rx));
        dialog
    }

    /// Drains the INVITE server transaction's upward channel for the
    /// lifetime of the dialog: an ACK confirms it, an unsolicited CANCEL
    /// (RFC 3261 §9.2) gets answered with 487 through the normal `reject`
    /// path so the legality table and history stay consistent, and a
    /// Timer H/transport-failure termination forces the dialog down even
    /// if the application never calls `accept`/`reject` again.
    async fn watch_invite_transaction(dialog: Self, mut tu_rx: tokio::sync::mpsc::UnboundedReceiver<TuEvent>) {
        let inner = dialog.inner.clone();
        while let Some(event) = tu_rx.recv().await {
            match event {
                TuEvent::AckReceived => {
                    let id = inner.id.lock().unwrap().clone();
                    if let Err(e) = inner.transition(DialogState::Confirmed(id)) {
                        debug!(error = %e, "ACK observed but dialog could not confirm");
                    }
                }
                TuEvent::CancelReceived => {
                    if let Err(e) = dialog.reject(StatusCode::RequestTerminated, None).await {
                        debug!(error = %e, "failed to answer CANCEL with 487");
                    }
                    break;
                }
                TuEvent::Terminated(crate::transaction::transaction::TerminatedReason::Timeout) => {
                    let id = inner.id.lock().unwrap().clone();
                    let _ = inner.transition(DialogState::Terminated(id, TerminatedReason::Timeout));
                    break;
                }
                TuEvent::Terminated(_) => break,
                _ => {}
            }
        }
    }

    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    fn send_to_invite_transaction(&self, resp: Response) -> Result<()> {
        self.invite_events
            .send(TransactionEvent::Respond(resp))
            .map_err(|e| crate::Error::Error(format!("invite transaction mailbox closed: {}", e)))
    }

    /// Sends a provisional response (180 Ringing, 183 Session Progress).
    pub async fn provisional(&self, status: StatusCode, body: Option<Vec<u8>>) -> Result<()> {
        let resp = self
            .inner
            .make_response(&self.inner.initial_request, status.clone(), None, body);
        self.send_to_invite_transaction(resp.clone())?;
        if status != StatusCode::Trying {
            self.inner.transition(DialogState::Early(self.id(), resp))?;
        }
        Ok(())
    }

    /// Accepts the call with a 200 OK, attaching the given body (typically
    /// an SDP answer) and waiting for the peer's ACK.
    pub async fn accept(&self, headers: Option<Vec<rsip::Header>>, body: Option<Vec<u8>>) -> Result<()> {
        let resp = self
            .inner
            .make_response(&self.inner.initial_request, StatusCode::OK, headers, body.clone());
        self.send_to_invite_transaction(resp.clone())?;
        if let Some(b) = body {
            self.inner.set_local_answer(b);
        }
        let id = self.id();
        self.inner.transition(DialogState::WaitAck(id.clone(), resp))?;
        info!(dialog = %id, "200 OK sent, waiting for ACK");
        Ok(())
    }

    /// Confirms the dialog once the peer's ACK for a 2xx has been routed
    /// here directly by the stack (see `Stack::handle_ack`) — a
    /// self-transition when it confirms a later re-INVITE's 200 rather
    /// than the initial one.
    pub fn on_ack(&self, _req: &Request) -> Result<()> {
        let id = self.id();
        if let Err(e) = self.inner.transition(DialogState::Confirmed(id)) {
            debug!(error = %e, "ACK observed but dialog could not confirm");
        }
        Ok(())
    }

    /// Rejects the call with a final non-2xx response.
    pub async fn reject(&self, status: StatusCode, headers: Option<Vec<rsip::Header>>) -> Result<()> {
        let resp = self
            .inner
            .make_response(&self.inner.initial_request, status.clone(), headers, None);
        self.send_to_invite_transaction(resp)?;
        let id = self.id();
        let reason = match status {
            StatusCode::BusyHere | StatusCode::BusyEverywhere => TerminatedReason::UasBusy,
            StatusCode::Decline => TerminatedReason::UasDecline,
            s => TerminatedReason::UasOther(Some(s)),
        };
        self.inner.transition(DialogState::Terminated(id, reason))
    }

    pub async fn bye(&self) -> Result<()> {
        let request = self.inner.make_request(rsip::Method::Bye, None, None, None, None, None)?;
        let resp = self.inner.do_request(request).await?;
        let id = self.id();
        match resp {
            Some(r) if r.status_code.kind() == rsip::StatusCodeKind::Successful => {
                self.inner.transition(DialogState::Terminated(id, TerminatedReason::UasBye))
            }
            _ => self.inner.transition(DialogState::Terminated(id, TerminatedReason::Timeout)),
        }
    }

    async fn handle_bye(&self, mut tx: Transaction) -> Result<()> {
        let resp = self.inner.make_response(&tx.request, StatusCode::OK, None, None);
        tx.send_response(resp).await?;
        let id = self.id();
        self.inner.transition(DialogState::Terminated(id, TerminatedReason::UacBye))
    }

    async fn handle_info(&self, mut tx: Transaction) -> Result<()> {
        let id = self.id();
        self.inner.transition(DialogState::Info(id, tx.request.clone()))?;
        let resp = self.inner.make_response(&tx.request, StatusCode::OK, None, None);
        tx.send_response(resp).await
    }

    async fn handle_options(&self, mut tx: Transaction) -> Result<()> {
        let resp = self.inner.make_response(&tx.request, StatusCode::OK, None, None);
        tx.send_response(resp).await
    }

    async fn handle_refer(&self, mut tx: Transaction) -> Result<()> {
        let id = self.id();
        let outcome = super::refer::accept_incoming_refer(&self.inner, &tx.request)?;
        let resp = self.inner.make_response(&tx.request, StatusCode::Accepted, None, None);
        tx.send_response(resp).await?;
        self.inner.transition(DialogState::Updated(id, tx.request.clone()))?;
        let target = outcome.target.clone();
        let replaces = outcome.replaces.clone();
        super::refer::notify_initial_trying(&self.inner, outcome).await?;
        self.inner.endpoint_inner.notify_incoming_refer(super::refer::IncomingReferEvent {
            dialog: self.clone().as_dialog(),
            target,
            replaces,
        });
        Ok(())
    }

    /// Handles a request the dialog layer routed to an already-established
    /// dialog as a fresh, not-yet-started transaction: BYE, INFO, OPTIONS,
    /// REFER, re-INVITE. These are answered directly over the transaction's
    /// connection without spawning its `run` loop — a short-lived in-dialog
    /// non-INVITE exchange has nothing left to retransmit once its one
    /// response has gone out.
    pub async fn handle(&mut self, tx: Transaction) -> Result<()> {
        match tx.kind {
            TransactionKind::ServerNonInvite => match tx.request.method {
                rsip::Method::Bye => self.handle_bye(tx).await,
                rsip::Method::Info => self.handle_info(tx).await,
                rsip::Method::Options => self.handle_options(tx).await,
                rsip::Method::Refer => self.handle_refer(tx).await,
                other => {
                    warn!(method = %other, "unhandled in-dialog request on server dialog");
                    let mut tx = tx;
                    let resp = self.inner.make_response(&tx.request, StatusCode::NotImplemented, None, None);
                    tx.send_response(resp).await
                }
            },
            TransactionKind::ServerInvite => {
                let mut tx = tx;
                let resp = match self.inner.handle_incoming_re_invite(&tx.request).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        debug!(error = %e, "rejecting re-INVITE");
                        self.inner.make_response(&tx.request, StatusCode::NotAcceptableHere, None, None)
                    }
                };
                tx.send_response(resp).await
            }
            _ => Ok(()),
        }
    }

    /// Sends a mid-dialog re-INVITE originated by this side (spec.md §6.2
    /// `ReInvite`); a UAS can refresh a session just as well as a UAC.
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
        Dialog::ServerInvite(self)
    }
}
