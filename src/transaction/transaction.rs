//! Transaction state machines: INVITE client/server and non-INVITE
//! client/server (RFC 3261 §17). Grounded on the reference
//! implementation's `transaction::transaction::Transaction`, restructured
//! around an explicit [`TransactionState`]/[`TransactionKind`] pair and a
//! bounded mailbox so a stuck transaction-user can't make a transaction
//! leak memory (spec.md §4.4 "overload").

use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::timer::TransactionTimer;
use crate::transport::{SipAddr, SipConnection};
use rsip::{Request, Response, SipMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionKind {
    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::ClientInvite | TransactionKind::ServerInvite)
    }

    pub fn is_client(&self) -> bool {
        matches!(self, TransactionKind::ClientInvite | TransactionKind::ClientNonInvite)
    }

    pub fn role(&self) -> TransactionRole {
        if self.is_client() {
            TransactionRole::Client
        } else {
            TransactionRole::Server
        }
    }
}

/// A single state enum shared by all four machines; not every variant is
/// reachable from every [`TransactionKind`] (e.g. non-INVITE transactions
/// never see `Confirmed`), but sharing the type keeps the dialog layer's
/// matching code uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatedReason {
    Success,
    Timeout,
    TransportError,
    Cancelled,
}

/// Events fed into a live transaction's mailbox.
pub enum TransactionEvent {
    Incoming(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    /// The transport layer reported a send failure for the last message.
    TransportFailure(String),
    /// The transaction-user (a server dialog) wants to send a response.
    /// Server transactions only; routed through the mailbox rather than a
    /// direct method call so the transaction's retransmit/ACK-wait timers
    /// stay driven by the same `run` loop that sent the response.
    Respond(Response),
    /// The transaction-user (a client dialog) built the non-2xx ACK for
    /// this INVITE client transaction's final response. Client INVITE
    /// transactions only; handed back through the mailbox so the
    /// transaction can retain and retransmit it itself on a duplicated
    /// final response (RFC 3261 §17.1.1.2), rather than the TU sending it
    /// once over the transport and losing the retransmit obligation.
    Ack(Request),
}

pub type TransactionEventSender = mpsc::UnboundedSender<TransactionEvent>;
pub type TransactionEventReceiver = mpsc::UnboundedReceiver<TransactionEvent>;

/// What a transaction reports back to its transaction-user (the dialog
/// layer, or the stack itself for out-of-dialog requests).
pub enum TuEvent {
    Provisional(Response),
    Final(Response),
    /// Server INVITE transaction observed the peer's ACK.
    AckReceived,
    /// Server INVITE transaction observed a CANCEL while still
    /// Calling/Proceeding (RFC 3261 §9.2); the 200 OK to the CANCEL
    /// itself has already been sent, the TU is expected to answer the
    /// original INVITE with 487 Request Terminated.
    CancelReceived,
    Terminated(TerminatedReason),
}

pub type TuEventSender = mpsc::UnboundedSender<TuEvent>;

pub struct Transaction {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub request: Request,
    pub last_response: Option<Response>,
    pub destination: SipAddr,
    connection: SipConnection,
    endpoint: EndpointInnerRef,
    events: TransactionEventReceiver,
    tu: TuEventSender,
    retransmit_interval: Option<Duration>,
    timer_ids: Vec<u64>,
    /// The non-2xx ACK the TU built for this transaction's final response,
    /// retained so a retransmitted final response can be answered with a
    /// retransmitted ACK instead of silence (client INVITE transactions
    /// only).
    last_ack: Option<Request>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: TransactionKind,
        request: Request,
        destination: SipAddr,
        connection: SipConnection,
        endpoint: EndpointInnerRef,
        events: TransactionEventReceiver,
        tu: TuEventSender,
    ) -> crate::Result<Self> {
        let key = TransactionKey::from_request(&request, kind.role())?;
        let state = match kind {
            TransactionKind::ClientInvite => TransactionState::Calling,
            TransactionKind::ClientNonInvite => TransactionState::Trying,
            TransactionKind::ServerInvite => TransactionState::Proceeding,
            TransactionKind::ServerNonInvite => TransactionState::Trying,
        };
        endpoint.metrics.transaction_created();
        Ok(Self {
            key,
            kind,
            state,
            request,
            last_response: None,
            destination,
            connection,
            endpoint,
            events,
            tu,
            retransmit_interval: None,
            timer_ids: Vec::new(),
            last_ack: None,
        })
    }

    fn is_reliable(&self) -> bool {
        self.connection.is_reliable()
    }

    /// Drives the transaction until it terminates. Consumes `self` because
    /// a terminated transaction has nothing left to do.
    pub async fn run(mut self) {
        if let Err(e) = self.on_start().await {
            warn!(transaction = %self.key, error = %e, "failed to send initial message");
            self.terminate(TerminatedReason::TransportError);
            return;
        }
        while self.state != TransactionState::Terminated {
            let Some(event) = self.events.recv().await else {
                break;
            };
            match event {
                TransactionEvent::Incoming(msg, conn) => self.on_message(msg, conn).await,
                TransactionEvent::Timer(t) => self.on_timer(t).await,
                TransactionEvent::TransportFailure(reason) => {
                    debug!(transaction = %self.key, %reason, "transport failure");
                    self.terminate(TerminatedReason::TransportError);
                }
                TransactionEvent::Respond(resp) => {
                    if let Err(e) = self.send_response(resp).await {
                        warn!(transaction = %self.key, error = %e, "failed to send response");
                        self.terminate(TerminatedReason::TransportError);
                    }
                }
                TransactionEvent::Ack(ack) => self.on_ack_from_tu(ack).await,
            }
        }
        self.endpoint.detach_transaction(&self.key, self.request_or_response());
    }

    fn request_or_response(&self) -> Option<SipMessage> {
        self.last_response.clone().map(SipMessage::Response)
    }

    async fn on_start(&mut self) -> crate::Result<()> {
        match self.kind {
            TransactionKind::ClientInvite | TransactionKind::ClientNonInvite => {
                self.send(SipMessage::Request(self.request.clone())).await?;
                self.arm_client_timers();
            }
            TransactionKind::ServerInvite | TransactionKind::ServerNonInvite => {
                // server transactions are started by an already-received request;
                // nothing to send until the TU produces a response.
            }
        }
        Ok(())
    }

    fn arm_client_timers(&mut self) {
        let opt = &self.endpoint.option;
        match self.kind {
            TransactionKind::ClientInvite => {
                if !self.is_reliable() {
                    let id = self
                        .endpoint
                        .timers
                        .timeout(opt.t1, TransactionTimer::TimerA(self.key.clone(), opt.t1));
                    self.timer_ids.push(id);
                }
                let id = self.endpoint.timers.timeout(opt.t1x64, TransactionTimer::TimerB(self.key.clone()));
                self.timer_ids.push(id);
            }
            TransactionKind::ClientNonInvite => {
                if !self.is_reliable() {
                    let id = self
                        .endpoint
                        .timers
                        .timeout(opt.t1, TransactionTimer::TimerE(self.key.clone(), opt.t1));
                    self.timer_ids.push(id);
                }
                let id = self.endpoint.timers.timeout(opt.t1x64, TransactionTimer::TimerF(self.key.clone()));
                self.timer_ids.push(id);
            }
            _ => {}
        }
    }

    async fn send(&self, msg: SipMessage) -> crate::Result<()> {
        self.connection.send(msg, Some(&self.destination)).await
    }

    async fn on_message(&mut self, msg: SipMessage, _conn: Option<SipConnection>) {
        match (self.kind, msg) {
            (TransactionKind::ClientInvite, SipMessage::Response(resp)) => {
                self.on_client_invite_response(resp).await
            }
            (TransactionKind::ClientNonInvite, SipMessage::Response(resp)) => {
                self.on_client_non_invite_response(resp).await
            }
            (TransactionKind::ServerInvite, SipMessage::Request(req)) if req.method == rsip::Method::Ack => {
                self.on_server_invite_ack().await
            }
            (TransactionKind::ServerInvite, SipMessage::Request(req)) if req.method == rsip::Method::Cancel => {
                self.on_server_invite_cancel(req).await
            }
            _ => trace!(transaction = %self.key, "unexpected message for transaction kind, ignoring"),
        }
    }

    /// RFC 3261 §9.2: CANCEL matches the INVITE server transaction by
    /// sharing its branch, but is answered with its own 200 OK,
    /// independent of whatever final response the INVITE eventually gets.
    /// CANCEL only has an effect (487 to the INVITE) while that
    /// transaction is still Calling/Proceeding; a late CANCEL is
    /// acknowledged but otherwise ignored.
    async fn on_server_invite_cancel(&mut self, cancel: Request) {
        if let Ok(resp) = build_cancel_ok(&cancel) {
            if let Err(e) = self.send(SipMessage::Response(resp)).await {
                warn!(transaction = %self.key, error = %e, "failed to send 200 OK for CANCEL");
            }
        }
        if self.state == TransactionState::Proceeding || self.state == TransactionState::Calling {
            let _ = self.tu.send(TuEvent::CancelReceived);
        }
    }

    async fn on_client_invite_response(&mut self, resp: Response) {
        let status = resp.status_code.clone();
        if status.kind() == rsip::StatusCodeKind::Provisional {
            self.last_response = Some(resp.clone());
            self.state = TransactionState::Proceeding;
            let _ = self.tu.send(TuEvent::Provisional(resp));
            return;
        }
        if self.state == TransactionState::Completed {
            // A retransmitted non-2xx final response: RFC 3261 §17.1.1.2
            // requires absorbing it by retransmitting the ACK, not by
            // re-notifying the TU or resetting Timer D's retransmit
            // window.
            if let Some(ack) = self.last_ack.clone() {
                if let Err(e) = self.send(SipMessage::Request(ack)).await {
                    warn!(transaction = %self.key, error = %e, "failed to retransmit ACK");
                }
            }
            return;
        }
        self.last_response = Some(resp.clone());
        // final response: cancel A/B, the TU now owns ACK construction.
        for id in self.timer_ids.drain(..) {
            self.endpoint.timers.cancel(id);
        }
        let _ = self.tu.send(TuEvent::Final(resp));
        if status.kind() == rsip::StatusCodeKind::Successful {
            self.terminate(TerminatedReason::Success);
        } else {
            self.state = TransactionState::Completed;
            if !self.is_reliable() {
                let id = self
                    .endpoint
                    .timers
                    .timeout(self.endpoint.option.t1x64, TransactionTimer::TimerD(self.key.clone()));
                self.timer_ids.push(id);
            } else {
                self.terminate(TerminatedReason::Success);
            }
        }
    }

    /// The TU (a client dialog) built the non-2xx ACK for this
    /// transaction's final response; retain it for retransmission and send
    /// it now.
    async fn on_ack_from_tu(&mut self, ack: Request) {
        self.last_ack = Some(ack.clone());
        if let Err(e) = self.send(SipMessage::Request(ack)).await {
            warn!(transaction = %self.key, error = %e, "failed to send ACK");
        }
    }

    async fn on_client_non_invite_response(&mut self, resp: Response) {
        let status = resp.status_code.clone();
        self.last_response = Some(resp.clone());
        if status.kind() == rsip::StatusCodeKind::Provisional {
            self.state = TransactionState::Proceeding;
            let _ = self.tu.send(TuEvent::Provisional(resp));
            return;
        }
        for id in self.timer_ids.drain(..) {
            self.endpoint.timers.cancel(id);
        }
        let _ = self.tu.send(TuEvent::Final(resp));
        self.state = TransactionState::Completed;
        if self.is_reliable() {
            self.terminate(TerminatedReason::Success);
        } else {
            let id = self
                .endpoint
                .timers
                .timeout(self.endpoint.option.t4, TransactionTimer::TimerK(self.key.clone()));
            self.timer_ids.push(id);
        }
    }

    async fn on_server_invite_ack(&mut self) {
        if self.state != TransactionState::Completed {
            return;
        }
        for id in self.timer_ids.drain(..) {
            self.endpoint.timers.cancel(id);
        }
        self.state = TransactionState::Confirmed;
        let _ = self.tu.send(TuEvent::AckReceived);
        if self.is_reliable() {
            self.terminate(TerminatedReason::Success);
        } else {
            let id = self.endpoint.timers.timeout(self.endpoint.option.t4, TransactionTimer::TimerI(self.key.clone()));
            self.timer_ids.push(id);
        }
    }

    /// Invoked by the dialog layer when the TU produces a response for a
    /// server transaction.
    pub async fn send_response(&mut self, resp: Response) -> crate::Result<()> {
        let status = resp.status_code.clone();
        self.last_response = Some(resp.clone());
        self.send(SipMessage::Response(resp)).await?;
        match self.kind {
            TransactionKind::ServerInvite => {
                if status.kind() == rsip::StatusCodeKind::Provisional {
                    self.state = TransactionState::Proceeding;
                } else if status.kind() == rsip::StatusCodeKind::Successful {
                    self.terminate(TerminatedReason::Success);
                } else {
                    self.state = TransactionState::Completed;
                    if !self.is_reliable() {
                        let id = self.endpoint.timers.timeout(
                            self.endpoint.option.t1,
                            TransactionTimer::TimerG(self.key.clone(), self.endpoint.option.t1),
                        );
                        self.timer_ids.push(id);
                    }
                    let id = self.endpoint.timers.timeout(self.endpoint.option.t1x64, TransactionTimer::TimerH(self.key.clone()));
                    self.timer_ids.push(id);
                }
            }
            TransactionKind::ServerNonInvite => {
                if status.kind() == rsip::StatusCodeKind::Provisional {
                    self.state = TransactionState::Proceeding;
                } else {
                    self.state = TransactionState::Completed;
                    if self.is_reliable() {
                        self.terminate(TerminatedReason::Success);
                    } else {
                        let id = self.endpoint.timers.timeout(self.endpoint.option.t1x64, TransactionTimer::TimerJ(self.key.clone()));
                        self.timer_ids.push(id);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_timer(&mut self, timer: TransactionTimer) {
        match timer {
            TransactionTimer::TimerA(key, interval) if self.state == TransactionState::Calling => {
                if self.send(SipMessage::Request(self.request.clone())).await.is_ok() {
                    let next = (interval * 2).min(self.endpoint.option.t2);
                    let id = self.endpoint.timers.timeout(next, TransactionTimer::TimerA(key, next));
                    self.timer_ids.push(id);
                }
            }
            TransactionTimer::TimerB(_) if self.state == TransactionState::Calling => {
                self.endpoint.metrics.transaction_timed_out();
                let _ = self.tu.send(TuEvent::Terminated(TerminatedReason::Timeout));
                self.terminate(TerminatedReason::Timeout);
            }
            TransactionTimer::TimerE(key, interval) if self.state == TransactionState::Trying || self.state == TransactionState::Proceeding => {
                if self.send(SipMessage::Request(self.request.clone())).await.is_ok() {
                    let next = (interval * 2).min(self.endpoint.option.t2);
                    let id = self.endpoint.timers.timeout(next, TransactionTimer::TimerE(key, next));
                    self.timer_ids.push(id);
                }
            }
            TransactionTimer::TimerF(_) if self.state != TransactionState::Completed => {
                self.endpoint.metrics.transaction_timed_out();
                let _ = self.tu.send(TuEvent::Terminated(TerminatedReason::Timeout));
                self.terminate(TerminatedReason::Timeout);
            }
            TransactionTimer::TimerG(key, interval) if self.state == TransactionState::Completed => {
                if let Some(resp) = self.last_response.clone() {
                    if self.send(SipMessage::Response(resp)).await.is_ok() {
                        let next = (interval * 2).min(self.endpoint.option.t2);
                        let id = self.endpoint.timers.timeout(next, TransactionTimer::TimerG(key, next));
                        self.timer_ids.push(id);
                    }
                }
            }
            TransactionTimer::TimerH(_) => self.terminate(TerminatedReason::Timeout),
            TransactionTimer::TimerI(_) => self.terminate(TerminatedReason::Success),
            TransactionTimer::TimerJ(_) => self.terminate(TerminatedReason::Success),
            TransactionTimer::TimerK(_) => self.terminate(TerminatedReason::Success),
            TransactionTimer::TimerD(_) => self.terminate(TerminatedReason::Success),
            _ => trace!(transaction = %self.key, state = ?self.state, "stale timer ignored"),
        }
    }

    fn terminate(&mut self, reason: TerminatedReason) {
        if self.state == TransactionState::Terminated {
            return;
        }
        self.state = TransactionState::Terminated;
        for id in self.timer_ids.drain(..) {
            self.endpoint.timers.cancel(id);
        }
        let _ = self.tu.send(TuEvent::Terminated(reason));
    }
}

/// Builds the 200 OK response to a CANCEL request itself, copying its own
/// Via/From/To/Call-ID/CSeq rather than the INVITE's — the CANCEL is a
/// transaction in its own right even though it shares the INVITE's branch.
fn build_cancel_ok(cancel: &Request) -> crate::Result<Response> {
    use rsip::prelude::HeadersExt;
    let mut headers = rsip::Headers::default();
    headers.push(rsip::Header::Via(cancel.via_header()?.clone()));
    headers.push(rsip::Header::From(cancel.from_header()?.clone()));
    headers.push(rsip::Header::To(cancel.to_header()?.clone()));
    headers.push(rsip::Header::CallId(cancel.call_id_header()?.clone()));
    headers.push(rsip::Header::CSeq(cancel.cseq_header()?.clone()));
    headers.push(rsip::Header::ContentLength(0.into()));
    Ok(Response {
        status_code: rsip::StatusCode::OK,
        headers,
        body: vec![],
        version: cancel.version().clone(),
    })
}
