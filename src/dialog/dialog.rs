//! Dialog identity, state machine and the state/inner types shared by
//! [`crate::dialog::client_dialog::ClientInviteDialog`] and
//! [`crate::dialog::server_dialog::ServerInviteDialog`].

use super::{
    client_dialog::ClientInviteDialog,
    server_dialog::ServerInviteDialog,
    DialogId,
};
use crate::{
    transaction::{
        endpoint::EndpointInnerRef,
        key::TransactionRole,
        transaction::{Transaction, TransactionKind, TuEvent, TuEventSender},
    },
    Result,
};
use rsip::{
    headers::Route,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact},
    Header, Param, Request, Response, StatusCode,
};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The `DialogObserver` capability set from spec.md §9, replacing the
/// reference implementation's duck-typed callback soup with a single,
/// explicit set of optional hooks. Invoked outside any dialog lock
/// (see `DialogInner::transition`/`notify_body`): the caller already
/// snapshotted whatever data the callback needs.
#[derive(Default, Clone)]
pub(crate) struct DialogObserver {
    pub on_state: Option<Arc<dyn Fn(DialogState) + Send + Sync>>,
    pub on_body: Option<Arc<dyn Fn(Vec<u8>) + Send + Sync>>,
}

/// SIP dialog state (RFC 3261 §12), generalized to also mark which
/// in-dialog request most recently landed (`Updated`/`Notify`/`Info`/
/// `Options`) without losing the underlying phase — a dialog in
/// `Notify(id, _)` is still `Established` for every legality-table
/// purpose, it just carries the last-seen NOTIFY for observability.
#[derive(Clone)]
pub enum DialogState {
    Calling(DialogId),
    Trying(DialogId),
    Early(DialogId, Response),
    WaitAck(DialogId, Response),
    Confirmed(DialogId),
    Updated(DialogId, Request),
    Notify(DialogId, Request),
    Info(DialogId, Request),
    Options(DialogId, Request),
    Terminated(DialogId, TerminatedReason),
}

#[derive(Debug, Clone)]
pub enum TerminatedReason {
    Timeout,
    UacCancel,
    UacBye,
    UasBye,
    UacBusy,
    UasBusy,
    UasDecline,
    ProxyError(rsip::StatusCode),
    ProxyAuthRequired,
    UacOther(Option<rsip::StatusCode>),
    UasOther(Option<rsip::StatusCode>),
    Replaced,
    TransportFailure,
}

/// The coarse phase a [`DialogState`] maps to, used by the legality table.
/// Matches spec.md's 5-state table (`Init`/`Trying`/`Ringing`/
/// `Established`/`Terminated`) — `Init` is the moment before the first
/// `DialogState` exists (a dialog is only constructed once its first
/// state is known), so it doesn't appear as a `DialogState` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Trying,
    Ringing,
    Established,
    Terminated,
}

impl DialogState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }

    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Trying(id)
            | DialogState::Early(id, _)
            | DialogState::WaitAck(id, _)
            | DialogState::Confirmed(id)
            | DialogState::Updated(id, _)
            | DialogState::Notify(id, _)
            | DialogState::Info(id, _)
            | DialogState::Options(id, _)
            | DialogState::Terminated(id, _) => id,
        }
    }

    fn phase(&self) -> Phase {
        match self {
            DialogState::Calling(_) | DialogState::Trying(_) => Phase::Trying,
            DialogState::Early(_, _) | DialogState::WaitAck(_, _) => Phase::Ringing,
            DialogState::Confirmed(_)
            | DialogState::Updated(_, _)
            | DialogState::Notify(_, _)
            | DialogState::Info(_, _)
            | DialogState::Options(_, _) => Phase::Established,
            DialogState::Terminated(_, _) => Phase::Terminated,
        }
    }

    /// Enforces spec.md §4.5's legality table: a dialog's phase only ever
    /// moves forward (`Trying` -> `Ringing` -> `Established` ->
    /// `Terminated`), except that `Established` is re-entrant (in-dialog
    /// requests keep it in `Established`) and any phase can jump straight
    /// to `Terminated`. Anything else — including moving backwards, e.g.
    /// `Established` back to `Ringing` — is rejected.
    fn legal_transition(&self, next: &DialogState) -> bool {
        let (from, to) = (self.phase(), next.phase());
        if from == Phase::Terminated {
            return to == Phase::Terminated;
        }
        if to == Phase::Terminated {
            return true;
        }
        if from == Phase::Established && to == Phase::Established {
            return true;
        }
        to > from
    }
}

/// One entry in a dialog's bounded transition history, used for
/// diagnostics (spec.md §4.5's "state tracker records a bounded history").
#[derive(Clone)]
pub struct TransitionRecord {
    pub state: String,
}

const MAX_TRANSITION_HISTORY: usize = 20;

/// Internal dialog state and management shared between client and server
/// INVITE dialogs: transitions, sequence numbers, routing information,
/// and the transaction-layer handle.
pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,
    pub history: Mutex<VecDeque<TransitionRecord>>,

    pub local_seq: AtomicU32,
    pub local_contact: Option<rsip::Uri>,

    pub remote_seq: AtomicU32,
    pub remote_uri: Mutex<rsip::Uri>,

    pub from: String,
    pub to: Mutex<String>,

    pub route_set: Mutex<Vec<Route>>,
    pub(crate) endpoint_inner: EndpointInnerRef,
    pub(crate) state_sender: DialogStateSender,
    pub(crate) tu_sender: TuSenderRef,
    pub(crate) initial_request: Request,
    pub(crate) public_address: Mutex<Option<crate::transport::SipAddr>>,
    /// Outstanding REFER-created subscriptions keyed by the CSeq of the
    /// REFER that created them (spec.md §4.7).
    pub(crate) refer_subscriptions: Mutex<std::collections::HashMap<u32, crate::dialog::refer::ReferSubscription>>,
    pub(crate) observer: Mutex<DialogObserver>,
    /// Last body this side sent in an answer (initial 2xx or a re-INVITE's
    /// 200), replayed as the default answer body for a subsequent
    /// re-INVITE when the caller doesn't supply a new one.
    pub(crate) local_body: Mutex<Option<Vec<u8>>>,
    /// Single-fire close latch (spec.md §3.2, testable property #4):
    /// `close()` is idempotent, and every dialog-mutating operation past
    /// the first close returns `Error::InvalidState`.
    pub(crate) closed: AtomicBool,
}

pub type DialogStateReceiver = UnboundedReceiver<DialogState>;
pub type DialogStateSender = UnboundedSender<DialogState>;

pub(crate) type DialogInnerRef = Arc<DialogInner>;
pub(crate) type TuSenderRef = Mutex<Option<TuEventSender>>;

impl DialogInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        local_contact: Option<rsip::Uri>,
    ) -> Result<Self> {
        let initial_cseq = initial_request.cseq_header()?.seq()?;

        let (local_cseq, remote_cseq) = match role {
            TransactionRole::Client => (initial_cseq, initial_cseq),
            TransactionRole::Server => (
                crate::transaction::endpoint::generate_random_cseq(&endpoint_inner.id_pool),
                initial_cseq,
            ),
        };

        let remote_uri = match role {
            TransactionRole::Client => initial_request.uri.clone(),
            TransactionRole::Server => crate::rsip_ext::extract_uri_from_contact(
                initial_request.contact_header()?.value(),
            )?,
        };

        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            to.params.push(Param::Tag(id.to_tag.clone().into()));
        }

        let (from, to) = match role {
            TransactionRole::Client => (from.to_string(), to.to_string()),
            TransactionRole::Server => (to.to_string(), from.to_string()),
        };

        let mut route_set = vec![];
        if role == TransactionRole::Server {
            for h in initial_request.headers.iter() {
                if let Header::RecordRoute(rr) = h {
                    route_set.push(Route::from(rr.value()));
                }
            }
        }

        Ok(Self {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id.clone()),
            from,
            to: Mutex::new(to),
            local_seq: AtomicU32::new(local_cseq),
            remote_uri: Mutex::new(remote_uri),
            remote_seq: AtomicU32::new(remote_cseq),
            route_set: Mutex::new(route_set),
            endpoint_inner,
            state_sender,
            tu_sender: Mutex::new(None),
            state: Mutex::new(DialogState::Calling(id)),
            history: Mutex::new(VecDeque::with_capacity(MAX_TRANSITION_HISTORY)),
            initial_request,
            local_contact,
            public_address: Mutex::new(None),
            refer_subscriptions: Mutex::new(std::collections::HashMap::new()),
            observer: Mutex::new(DialogObserver::default()),
            local_body: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed);
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_remote_seq(&self) -> u32 {
        self.remote_seq.fetch_add(1, Ordering::Relaxed);
        self.remote_seq.load(Ordering::Relaxed)
    }

    pub fn update_remote_tag(&self, tag: &str) -> Result<()> {
        self.id.lock().unwrap().to_tag = tag.to_string();
        let to: rsip::headers::untyped::To = self.to.lock().unwrap().clone().into();
        *self.to.lock().unwrap() = to.typed()?.with_tag(tag.to_string().into()).to_string();
        Ok(())
    }

    /// Updates the dialog's remote target URI, as seen in a Contact header
    /// of a re-INVITE, UPDATE, or REFER/NOTIFY exchange (RFC 3261 §12.2.1.2
    /// target refresh). Swapped in wholesale under one short lock.
    pub fn update_remote_target(&self, uri: rsip::Uri) {
        *self.remote_uri.lock().unwrap() = uri;
    }

    pub fn set_public_address(&self, addr: crate::transport::SipAddr) {
        *self.public_address.lock().unwrap() = Some(addr);
    }

    pub(crate) fn make_request(
        &self,
        method: rsip::Method,
        cseq: Option<u32>,
        addr: Option<crate::transport::SipAddr>,
        branch: Option<Param>,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Request> {
        let mut headers = headers.unwrap_or_default();
        let cseq_header = CSeq {
            seq: cseq.unwrap_or_else(|| self.increment_local_seq()),
            method,
        };

        let via_addr = addr.or_else(|| self.public_address.lock().unwrap().clone());
        let via = self.endpoint_inner.get_via(via_addr, branch)?;
        headers.push(via.into());
        headers.push(Header::CallId(self.id.lock().unwrap().call_id.clone().into()));
        headers.push(Header::From(self.from.clone().into()));
        headers.push(Header::To(self.to.lock().unwrap().clone().into()));
        headers.push(Header::CSeq(cseq_header.into()));
        headers.push(Header::UserAgent(self.endpoint_inner.user_agent.clone().into()));

        if let Some(c) = self.local_contact.as_ref() {
            headers.push(Contact::from(c.clone()).into());
        }

        // A frozen route set (RFC 3261 §12.2.1.1): every in-dialog request
        // replays the same Route headers learned when the dialog was
        // established, never recomputed from later responses.
        for route in self.route_set.lock().unwrap().iter() {
            headers.push(Header::Route(route.clone()));
        }
        headers.push(Header::MaxForwards(70.into()));

        if let Some(b) = body.as_ref() {
            headers.push(Header::ContentLength((b.len() as u32).into()));
        }

        Ok(rsip::Request {
            method,
            uri: self.remote_uri.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    pub(crate) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = rsip::Headers::default();
        if let Some(c) = self.local_contact.as_ref() {
            resp_headers.push(Contact::from(c.clone()).into());
        }

        for header in request.headers.iter() {
            match header {
                Header::Via(via) => resp_headers.push(Header::Via(via.clone())),
                Header::From(from) => resp_headers.push(Header::From(from.clone())),
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            warn!("error parsing To header: {}", e);
                            continue;
                        }
                    };
                    if status != StatusCode::Trying && !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                        to.params.push(Param::Tag(self.id.lock().unwrap().to_tag.clone().into()));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                Header::CSeq(cseq) => resp_headers.push(Header::CSeq(cseq.clone())),
                Header::CallId(call_id) => resp_headers.push(Header::CallId(call_id.clone())),
                Header::RecordRoute(rr) => resp_headers.push(Header::RecordRoute(rr.clone())),
                _ => {}
            }
        }

        if let Some(headers) = headers {
            for header in headers {
                resp_headers.unique_push(header);
            }
        }

        if let Some(b) = body.as_ref() {
            resp_headers.push(Header::ContentLength((b.len() as u32).into()));
        }

        resp_headers.unique_push(Header::UserAgent(self.endpoint_inner.user_agent.clone().into()));

        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version().clone(),
        }
    }

    /// Sends an in-dialog request and waits for its final response.
    /// Digest authentication retry is intentionally not handled here:
    /// spec.md treats credential/header formatting as an external
    /// collaborator, so a 401/407 here is surfaced to the caller like any
    /// other final response rather than retried transparently.
    pub(crate) async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method;
        let route_header = request.route_header();
        let destination = match route_header {
            Some(route) => match route.typed() {
                Ok(typed_route) => match typed_route.uris().first() {
                    Some(first_uri) => {
                        let mut route_uri = first_uri.uri.clone();
                        route_uri.params.retain(|p| matches!(p, Param::Transport(_)));
                        Some(crate::transport::SipAddr::try_from(&route_uri)?)
                    }
                    None => None,
                },
                Err(e) => {
                    warn!("do_request {}: failed to parse Route header: {}", method, e);
                    None
                }
            },
            None => Some(crate::transport::SipAddr::try_from(&request.uri)?),
        };
        let destination = destination.ok_or_else(|| {
            crate::Error::ValidationFailed(format!("no usable destination for {} request", method))
        })?;

        let (connection, resolved) = self
            .endpoint_inner
            .transport_layer
            .lookup(&destination, None)
            .await?;

        let (tx_send, tx_recv) = tokio::sync::mpsc::unbounded_channel();
        let (tu_tx, mut tu_rx) = tokio::sync::mpsc::unbounded_channel();
        let key = crate::transaction::key::TransactionKey::from_request(
            &request,
            crate::transaction::key::TransactionRole::Client,
        )?;
        self.endpoint_inner.attach_transaction(&key, tx_send);
        let kind = if method == rsip::Method::Invite {
            crate::transaction::transaction::TransactionKind::ClientInvite
        } else {
            crate::transaction::transaction::TransactionKind::ClientNonInvite
        };
        let txn = Transaction::new(kind, request, resolved, connection, self.endpoint_inner.clone(), tx_recv, tu_tx)?;
        tokio::spawn(txn.run());

        while let Some(event) = tu_rx.recv().await {
            match event {
                crate::transaction::transaction::TuEvent::Provisional(resp) => {
                    let status = resp.status_code.clone();
                    if matches!(status, StatusCode::Ringing | StatusCode::SessionProgress) {
                        self.transition(DialogState::Early(self.id.lock().unwrap().clone(), resp))?;
                    }
                    continue;
                }
                crate::transaction::transaction::TuEvent::Final(resp) => {
                    debug!(dialog = %self.id.lock().unwrap(), status = %resp.status_code, "do_request completed");
                    return Ok(Some(resp));
                }
                crate::transaction::transaction::TuEvent::Terminated(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Validates and applies a state transition, logging and retaining the
    /// last [`MAX_TRANSITION_HISTORY`] entries. The old state is cloned
    /// and the lock released before the update is broadcast on
    /// `state_sender`, so a slow subscriber never blocks the dialog.
    pub(crate) fn transition(&self, state: DialogState) -> Result<()> {
        let id = state.id().clone();
        {
            let mut old_state = self.state.lock().unwrap();
            if !old_state.legal_transition(&state) {
                return Err(crate::Error::InvalidState(
                    format!("illegal dialog transition {} -> {}", old_state, state),
                    id,
                ));
            }
            info!("transitioning state: {} -> {}", old_state, state);
            *old_state = state.clone();
            if state.is_terminated() {
                self.mark_closed();
            }
        }
        {
            let mut history = self.history.lock().unwrap();
            if history.len() >= MAX_TRANSITION_HISTORY {
                history.pop_front();
            }
            history.push_back(TransitionRecord { state: state.to_string() });
        }
        if self.state_sender.send(state.clone()).is_err() {
            debug!("state sender channel closed, continuing with state transition");
        }
        self.notify_state(state);
        Ok(())
    }

    /// Registers the `OnStateChange` observer hook (spec.md §6.2). Replaces
    /// any previously registered hook, matching the reference
    /// implementation's "last writer wins" callback-field semantics.
    pub fn set_on_state_change(&self, f: impl Fn(DialogState) + Send + Sync + 'static) {
        self.observer.lock().unwrap().on_state = Some(Arc::new(f));
    }

    /// Registers the `OnBody` observer hook (spec.md §6.2), fired whenever
    /// this dialog learns a new body from the peer (the initial 2xx answer
    /// and every subsequent re-INVITE).
    pub fn set_on_body(&self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.observer.lock().unwrap().on_body = Some(Arc::new(f));
    }

    /// Snapshots the `OnState` hook under a brief lock and invokes it
    /// afterwards, never while holding `self.state`'s lock (spec.md §5's
    /// locking discipline: never call into application callbacks while
    /// holding a dialog lock).
    fn notify_state(&self, state: DialogState) {
        let hook = self.observer.lock().unwrap().on_state.clone();
        if let Some(hook) = hook {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(state))) {
                warn!(panic = ?e, "OnStateChange callback panicked");
            }
        }
    }

    /// Records and delivers a new body to the `OnBody` observer, and
    /// remembers it as this side's current local answer for symmetric
    /// re-INVITE responses.
    pub(crate) fn notify_body(&self, body: Vec<u8>) {
        *self.local_body.lock().unwrap() = Some(body.clone());
        let hook = self.observer.lock().unwrap().on_body.clone();
        if let Some(hook) = hook {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(body))) {
                warn!(panic = ?e, "OnBody callback panicked");
            }
        }
    }

    /// The last body this side sent (the initial answer, or the answer to
    /// the most recent re-INVITE), replayed verbatim when a later
    /// re-INVITE arrives without the application supplying a fresh one.
    pub(crate) fn last_local_body(&self) -> Option<Vec<u8>> {
        self.local_body.lock().unwrap().clone()
    }

    /// Idempotent close (spec.md §3.2, testable property #4): the first
    /// call tears the dialog down and returns `true`; every call after
    /// that is a no-op and returns `false`, letting callers distinguish
    /// "I closed it" from "someone already did".
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Guard used at the top of every dialog-mutating operation: once
    /// closed, every further operation fails with a stable error kind
    /// rather than silently acting on a torn-down dialog.
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(crate::Error::InvalidState(
                "dialog is closed".to_string(),
                self.id.lock().unwrap().clone(),
            ));
        }
        Ok(())
    }

    /// Bypasses the legality table, used only when the transport layer
    /// reports the peer is unreachable and the dialog must be torn down
    /// regardless of its current phase.
    pub(crate) fn force_terminate(&self, reason: TerminatedReason) {
        self.mark_closed();
        let id = self.id.lock().unwrap().clone();
        let state = DialogState::Terminated(id, reason);
        *self.state.lock().unwrap() = state.clone();
        let _ = self.state_sender.send(state.clone());
        self.notify_state(state);
        self.cancel_token.cancel();
    }

    pub fn history_snapshot(&self) -> Vec<String> {
        self.history.lock().unwrap().iter().map(|r| r.state.clone()).collect()
    }

    pub fn metrics(&self) -> &crate::metrics::Metrics {
        &self.endpoint_inner.metrics
    }

    /// Records the body this side just sent in an answer, without touching
    /// the `OnBody` observer — that hook fires only for bodies learned
    /// *from the peer* (see `notify_body`).
    pub(crate) fn set_local_answer(&self, body: Vec<u8>) {
        *self.local_body.lock().unwrap() = Some(body);
    }

    /// Guards every re-INVITE/REFER send against spec.md §4.7's "permitted
    /// only in an established dialog" rule, folding in the close check so
    /// callers only need one guard at the top of each operation.
    pub(crate) fn require_established(&self) -> Result<()> {
        self.check_open()?;
        let established = matches!(
            *self.state.lock().unwrap(),
            DialogState::Confirmed(_) | DialogState::Updated(_, _) | DialogState::Notify(_, _) | DialogState::Info(_, _) | DialogState::Options(_, _)
        );
        if !established {
            return Err(crate::Error::InvalidState(
                "operation requires an established dialog".to_string(),
                self.id.lock().unwrap().clone(),
            ));
        }
        Ok(())
    }

    /// The local/remote tag pair from this side's point of view, used to
    /// build a `Replaces` header against *another* dialog (RFC 3891): a
    /// server-role dialog's own tag lives in the id's `to_tag`, a
    /// client-role dialog's in `from_tag`.
    pub(crate) fn local_remote_tags(&self) -> (String, String) {
        let id = self.id.lock().unwrap();
        match self.role {
            TransactionRole::Client => (id.from_tag.clone(), id.to_tag.clone()),
            TransactionRole::Server => (id.to_tag.clone(), id.from_tag.clone()),
        }
    }

    /// Builds and sends the ACK for a final response to `invite`, either
    /// the initial INVITE or a later re-INVITE. Shared by both dialog
    /// roles since either side can send a re-INVITE and must ACK its own
    /// answer (RFC 3261 §17.1.1.3): the 2xx case is a fresh in-dialog
    /// request built through `make_request`, the non-2xx case reuses the
    /// INVITE's own branch and CSeq and bypasses the dialog's own request
    /// builder entirely.
    pub(crate) async fn send_ack(&self, invite: &Request, resp: &Response) -> Result<()> {
        let is_2xx = resp.status_code.kind() == rsip::StatusCodeKind::Successful;
        let cseq_num = invite.cseq_header()?.seq()?;
        let ack = if is_2xx {
            self.make_request(rsip::Method::Ack, Some(cseq_num), None, None, None, None)?
        } else {
            let mut headers = vec![
                Header::Via(invite.via_header()?.clone()),
                Header::From(invite.from_header()?.clone()),
                Header::To(resp.to_header()?.clone()),
                Header::CallId(invite.call_id_header()?.clone()),
            ];
            headers.push(Header::CSeq(CSeq { seq: cseq_num, method: rsip::Method::Ack }.into()));
            headers.push(Header::MaxForwards(70.into()));
            Request {
                method: rsip::Method::Ack,
                uri: invite.uri.clone(),
                headers: headers.into(),
                body: vec![],
                version: rsip::Version::V2,
            }
        };
        if !is_2xx {
            // Non-2xx ACK is a hop-by-hop continuation of the INVITE
            // client transaction (RFC 3261 §17.1.1.2), not an end-to-end
            // request: hand it to that transaction so it retains and
            // retransmits it on a duplicated final response, instead of
            // this sending it once and the transaction's Timer D window
            // going unanswered.
            let key = crate::transaction::key::TransactionKey::from_request(invite, TransactionRole::Client)?;
            if self.endpoint_inner.notify_ack(&key, ack.clone()) {
                return Ok(());
            }
        }
        let destination = crate::transport::SipAddr::try_from(&invite.uri)?;
        let (conn, resolved) = self.endpoint_inner.transport_layer.lookup(&destination, None).await?;
        conn.send(rsip::SipMessage::Request(ack), Some(&resolved)).await
    }

    /// Sends a mid-dialog re-INVITE (spec.md §6.2 `ReInvite`) and drives it
    /// to a final response, defaulting the offer to the last body this
    /// side sent when the caller doesn't supply a new one (a bare
    /// hold/unhold toggle shouldn't have to repeat the whole SDP).
    pub(crate) async fn do_re_invite(&self, opt: &super::builder::ReInviteOption) -> Result<Response> {
        self.require_established()?;
        let mut headers = opt.extra_headers.clone().unwrap_or_default();
        let body = opt.offer.clone().or_else(|| self.last_local_body());
        if let Some(ct) = opt.content_type.as_ref() {
            headers.push(Header::ContentType(ct.clone().into()));
        }
        let request = self.make_request(rsip::Method::Invite, None, None, None, Some(headers), body)?;
        let destination = crate::transport::SipAddr::try_from(&request.uri)?;
        let (connection, resolved) = self.endpoint_inner.transport_layer.lookup(&destination, None).await?;
        let key = crate::transaction::key::TransactionKey::from_request(&request, TransactionRole::Client)?;
        let (tx_send, tx_recv) = tokio::sync::mpsc::unbounded_channel();
        let (tu_tx, mut tu_rx) = tokio::sync::mpsc::unbounded_channel();
        self.endpoint_inner.attach_transaction(&key, tx_send);
        let txn = Transaction::new(TransactionKind::ClientInvite, request.clone(), resolved, connection, self.endpoint_inner.clone(), tx_recv, tu_tx)?;
        tokio::spawn(txn.run());

        while let Some(event) = tu_rx.recv().await {
            match event {
                TuEvent::Provisional(_) => continue,
                TuEvent::Final(resp) => {
                    self.send_ack(&request, &resp).await?;
                    if resp.status_code.kind() == rsip::StatusCodeKind::Successful {
                        self.notify_body(resp.body.clone());
                        if !request.body.is_empty() {
                            self.set_local_answer(request.body.clone());
                        }
                        let id = self.id.lock().unwrap().clone();
                        self.transition(DialogState::Updated(id, request.clone()))?;
                    }
                    return Ok(resp);
                }
                TuEvent::AckReceived | TuEvent::CancelReceived => continue,
                TuEvent::Terminated(_) => return Err(crate::Error::TransactionTerminated(key)),
            }
        }
        Err(crate::Error::TransactionTerminated(key))
    }

    /// Handles an inbound re-INVITE once the dialog is already established:
    /// delivers the peer's new offer through `OnBody`, transitions to
    /// `Updated`, and answers with the last body this side sent (RFC 3261
    /// requires a 2xx answer be compatible with the existing session;
    /// symmetric replay is the only sensible default without an
    /// application-supplied answer).
    pub(crate) async fn handle_incoming_re_invite(&self, request: &Request) -> Result<Response> {
        self.require_established()?;
        let id = self.id.lock().unwrap().clone();
        self.transition(DialogState::Updated(id, request.clone()))?;
        self.notify_body(request.body.clone());
        let answer = self.last_local_body();
        Ok(self.make_response(request, StatusCode::OK, None, answer))
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Calling(id) => write!(f, "{}(Calling)", id),
            DialogState::Trying(id) => write!(f, "{}(Trying)", id),
            DialogState::Early(id, _) => write!(f, "{}(Early)", id),
            DialogState::WaitAck(id, _) => write!(f, "{}(WaitAck)", id),
            DialogState::Confirmed(id) => write!(f, "{}(Confirmed)", id),
            DialogState::Updated(id, _) => write!(f, "{}(Updated)", id),
            DialogState::Notify(id, _) => write!(f, "{}(Notify)", id),
            DialogState::Info(id, _) => write!(f, "{}(Info)", id),
            DialogState::Options(id, _) => write!(f, "{}(Options)", id),
            DialogState::Terminated(id, reason) => write!(f, "{}(Terminated {:?})", id, reason),
        }
    }
}

/// A SIP dialog, either a server-side or client-side INVITE dialog.
#[derive(Clone)]
pub enum Dialog {
    ServerInvite(ServerInviteDialog),
    ClientInvite(ClientInviteDialog),
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        match self {
            Dialog::ServerInvite(d) => d.inner.id.lock().unwrap().clone(),
            Dialog::ClientInvite(d) => d.inner.id.lock().unwrap().clone(),
        }
    }

    pub fn inner(&self) -> &DialogInnerRef {
        match self {
            Dialog::ServerInvite(d) => &d.inner,
            Dialog::ClientInvite(d) => &d.inner,
        }
    }

    pub async fn handle(&mut self, tx: Transaction) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.handle(tx).await,
            Dialog::ClientInvite(d) => d.handle(tx).await,
        }
    }

    pub fn on_remove(&self) {
        self.inner().cancel_token.cancel();
    }

    pub async fn hangup(&self) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.bye().await,
            Dialog::ClientInvite(d) => {
                if d.inner.is_confirmed() {
                    d.bye().await
                } else {
                    d.cancel().await
                }
            }
        }
    }

    /// A snapshot of the current `DialogState` (spec.md §6.2 `State`).
    pub fn state(&self) -> DialogState {
        self.inner().state.lock().unwrap().clone()
    }

    /// Registers the `OnStateChange` observer hook.
    pub fn on_state_change(&self, f: impl Fn(DialogState) + Send + Sync + 'static) {
        self.inner().set_on_state_change(f);
    }

    /// Registers the `OnBody` observer hook.
    pub fn on_body(&self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.inner().set_on_body(f);
    }

    /// Idempotent teardown (spec.md §3.2, testable property #4): the first
    /// call marks the dialog closed and tears it down with a BYE/CANCEL as
    /// appropriate; every call after that returns `Error::InvalidState`
    /// without touching the network again.
    pub async fn close(&self) -> Result<()> {
        if !self.inner().mark_closed() {
            return Err(crate::Error::InvalidState("dialog already closed".to_string(), self.id()));
        }
        self.hangup().await
    }

    /// Sends a mid-dialog re-INVITE (spec.md §6.2 `ReInvite`); either
    /// dialog role may originate one once established.
    pub async fn re_invite(&self, opt: super::builder::ReInviteOption) -> Result<Response> {
        self.inner().do_re_invite(&opt).await
    }

    /// Blind transfer (RFC 3515): asks the peer to place a new call to
    /// `target` and report progress over an RFC 4488 NOTIFY subscription
    /// unless `opt.refer_sub` disables it.
    pub async fn refer(&self, target: rsip::Uri, opt: super::builder::ReferOption) -> Result<Option<super::refer::ReferSubscription>> {
        let inner = self.inner();
        inner.require_established()?;
        super::refer::send_refer(inner, target, None, opt.refer_sub).await
    }

    /// Attended transfer (RFC 3891): refers the peer of this dialog to the
    /// remote party of `other`, embedding a `Replaces` header built from
    /// `other`'s own call leg so the target can identify the call to join.
    pub async fn refer_replace(&self, other: &Dialog, opt: super::builder::ReferReplaceOption) -> Result<Option<super::refer::ReferSubscription>> {
        let inner = self.inner();
        inner.require_established()?;
        let other_inner = other.inner();
        let (local, remote) = other_inner.local_remote_tags();
        let replaces = super::refer::ReplacesInfo {
            call_id: other.id().call_id,
            from_tag: remote,
            to_tag: local,
            early_only: opt.early_only,
        };
        let target = other_inner.remote_uri.lock().unwrap().clone();
        super::refer::send_refer(inner, target, Some(replaces), opt.refer_sub).await
    }

    /// Accepts an inbound call with a 200 OK (spec.md §6.2 `Accept`).
    /// Only meaningful for the server side of an INVITE; calling this on a
    /// client-originated dialog is a programmer error and returns
    /// `Error::InvalidState`.
    pub async fn accept(&self, opt: super::builder::AcceptOption) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => {
                let mut headers = opt.extra_headers.unwrap_or_default();
                if let Some(ct) = opt.content_type {
                    headers.push(rsip::Header::ContentType(ct.into()));
                }
                let headers = if headers.is_empty() { None } else { Some(headers) };
                d.accept(headers, opt.answer).await
            }
            Dialog::ClientInvite(_) => Err(crate::Error::InvalidState(
                "accept is only valid for an inbound dialog".to_string(),
                self.id(),
            )),
        }
    }

    /// Rejects an inbound call with a final non-2xx response (spec.md §6.2
    /// `Reject`).
    pub async fn reject(&self, status: StatusCode, extra_headers: Option<Vec<rsip::Header>>) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.reject(status, extra_headers).await,
            Dialog::ClientInvite(_) => Err(crate::Error::InvalidState(
                "reject is only valid for an inbound dialog".to_string(),
                self.id(),
            )),
        }
    }

    /// Sends a provisional response (180 Ringing, 183 Session Progress) for
    /// an inbound call still in the `Calling`/`Trying` phase.
    pub async fn provisional(&self, status: StatusCode, body: Option<Vec<u8>>) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.provisional(status, body).await,
            Dialog::ClientInvite(_) => Err(crate::Error::InvalidState(
                "provisional is only valid for an inbound dialog".to_string(),
                self.id(),
            )),
        }
    }
}

#[cfg(test)]
mod legality_tests {
    use super::*;

    fn id() -> DialogId {
        DialogId::new("call-1", "from", "to")
    }

    #[test]
    fn trying_to_established_is_legal() {
        assert!(DialogState::Trying(id()).legal_transition(&DialogState::Confirmed(id())));
    }

    #[test]
    fn established_back_to_ringing_is_illegal() {
        let resp = Response {
            status_code: StatusCode::Ringing,
            headers: Default::default(),
            body: vec![],
            version: rsip::Version::V2,
        };
        assert!(!DialogState::Confirmed(id()).legal_transition(&DialogState::Early(id(), resp)));
    }

    #[test]
    fn any_phase_can_terminate() {
        assert!(DialogState::Calling(id()).legal_transition(&DialogState::Terminated(id(), TerminatedReason::Timeout)));
        assert!(DialogState::Confirmed(id()).legal_transition(&DialogState::Terminated(id(), TerminatedReason::UacBye)));
    }

    #[test]
    fn terminated_is_a_sink() {
        let term = DialogState::Terminated(id(), TerminatedReason::UacBye);
        assert!(!term.legal_transition(&DialogState::Confirmed(id())));
        assert!(term.legal_transition(&DialogState::Terminated(id(), TerminatedReason::Timeout)));
    }

    #[test]
    fn established_self_transitions_for_in_dialog_requests() {
        assert!(DialogState::Confirmed(id()).legal_transition(&DialogState::Notify(
            id(),
            Request {
                method: rsip::Method::Notify,
                uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
                headers: Default::default(),
                body: vec![],
                version: rsip::Version::V2,
            }
        )));
    }
}
