//! The top-level orchestrator (spec.md §4.8, §6.2): owns the transport
//! handle, dialog map, transaction registry, timer manager, id pool,
//! callbacks and metrics, and dispatches inbound messages to the right
//! dialog (or creates one, for an unmatched INVITE).
//!
//! Grounded on the reference implementation's `DialogLayer` for dialog
//! ownership (kept as [`crate::dialog::DialogLayer`]) plus `rvoip`'s
//! `dialog-core::DialogManager` for the surrounding `Stack` shape: a
//! single owner of every shared component, incoming dispatch with
//! fallback lookup, and a graceful, bounded shutdown.

use crate::config::Config;
use crate::dialog::builder::InviteOption;
use crate::dialog::client_dialog::ClientInviteDialog;
use crate::dialog::dialog::{DialogInner, DialogStateSender, TerminatedReason};
use crate::dialog::refer::ReplacesInfo;
use crate::dialog::server_dialog::ServerInviteDialog;
use crate::dialog::{Dialog, DialogId, DialogLayer};
use crate::transaction::endpoint::{spawn_background_tasks, Endpoint, EndpointBuilder, EndpointOption};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::timer::TransactionTimer;
use crate::transaction::transaction::{Transaction, TransactionKind};
use crate::transport::{SipAddr, SipConnection, SipTransport};
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Request, Response, SipMessage, StatusCode};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type IncomingDialogCallback = Box<dyn Fn(Dialog) + Send + Sync>;
type IncomingReferCallback = Box<dyn Fn(Dialog, rsip::Uri, Option<ReplacesInfo>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_incoming_dialog: Option<IncomingDialogCallback>,
    on_incoming_refer: Option<IncomingReferCallback>,
}

/// Owns every shared component named in spec.md §4.8 and dispatches
/// inbound transport traffic. Cheaply cloneable: the heavy state lives
/// behind `Arc`s internally.
#[derive(Clone)]
pub struct Stack {
    config: Config,
    endpoint: Arc<Endpoint>,
    dialog_layer: Arc<DialogLayer>,
    callbacks: Arc<Mutex<Callbacks>>,
    cancel_token: CancellationToken,
}

impl Stack {
    pub fn new(config: Config, transport_layer: Arc<dyn SipTransport>) -> Self {
        let endpoint_option = EndpointOption {
            t1: config.timer.t1,
            t2: config.timer.t2,
            t4: config.timer.t4,
            t1x64: config.timer.t1x64,
            callid_suffix: None,
            max_concurrent_transactions: config.max_transactions,
        };
        let endpoint = EndpointBuilder::new()
            .with_user_agent(&config.user_agent)
            .with_option(endpoint_option)
            .with_transport_layer(transport_layer)
            .build();
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone(), config.max_dialogs));
        Self {
            config,
            endpoint: Arc::new(endpoint),
            dialog_layer,
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Starts the background timer dispatch/sweep loops and the dialog-layer
    /// timer consumer (`DialogExpiry`/`SessionRefresh`). Idempotent only in
    /// the sense that calling it twice spawns two sets of loops; callers
    /// are expected to call it once per `Stack`.
    pub fn start(&self) {
        spawn_background_tasks(self.endpoint.inner.clone());

        let (dialog_timer_tx, mut dialog_timer_rx) = tokio::sync::mpsc::unbounded_channel();
        self.endpoint.inner.set_dialog_timer_sender(dialog_timer_tx);

        let dialog_layer = self.dialog_layer.clone();
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    timer = dialog_timer_rx.recv() => {
                        match timer {
                            Some(TransactionTimer::DialogExpiry(id)) => {
                                if let Some(dialog) = dialog_layer.find_dialog(&id) {
                                    dialog.inner().force_terminate(TerminatedReason::Timeout);
                                    dialog_layer.remove_dialog(&dialog.id());
                                }
                            }
                            Some(TransactionTimer::SessionRefresh(id)) => {
                                trace!(dialog = %id, "session-refresh timer fired (refresher disabled by default)");
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });

        let (refer_tx, mut refer_rx) = tokio::sync::mpsc::unbounded_channel();
        self.endpoint.inner.set_incoming_refer_sender(refer_tx);
        let refer_stack = self.clone();
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = refer_rx.recv() => {
                        match event {
                            Some(ev) => refer_stack.fire_incoming_refer(ev.dialog, ev.target, ev.replaces),
                            None => break,
                        }
                    }
                }
            }
        });
        info!("stack background tasks started");
    }

    /// Cancels the root token, asks every live dialog to close (BYE if
    /// established, CANCEL otherwise), and waits up to `grace` for the
    /// resulting transactions to settle before returning regardless.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_token.cancel();
        let mut ids = Vec::new();
        self.dialog_layer.for_each(|id, _| ids.push(id.clone()));
        let closes = ids.into_iter().map(|id| {
            let dialog_layer = self.dialog_layer.clone();
            async move {
                if let Some(dialog) = dialog_layer.get_dialog(&id) {
                    let _ = dialog.hangup().await;
                    dialog_layer.remove_dialog(&id);
                }
            }
        });
        if tokio::time::timeout(grace, futures::future::join_all(closes)).await.is_err() {
            warn!("shutdown grace period elapsed with dialogs still closing, proceeding");
        }
    }

    pub fn on_incoming_dialog(&self, f: impl Fn(Dialog) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_incoming_dialog = Some(Box::new(f));
    }

    pub fn on_incoming_refer(&self, f: impl Fn(Dialog, rsip::Uri, Option<ReplacesInfo>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().on_incoming_refer = Some(Box::new(f));
    }

    pub fn dialog_by_key(&self, id: &DialogId) -> Option<Dialog> {
        self.dialog_layer.get_dialog(id)
    }

    pub fn dialog_layer(&self) -> &Arc<DialogLayer> {
        &self.dialog_layer
    }

    /// Starts an outbound call (spec.md §6.2 `NewInvite`).
    pub async fn new_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        self.dialog_layer.new_invite(opt, state_sender).await
    }

    /// Entry point for the transport collaborator: hand every inbound,
    /// already-parsed SIP message to this method. Never panics on
    /// malformed input — a message this core can't match or make sense of
    /// is logged and dropped (or answered 481/400 when that's the
    /// protocol-correct response).
    pub async fn handle_message(&self, msg: SipMessage, connection: Option<SipConnection>) {
        let result = match &msg {
            SipMessage::Response(_) => self.route_response(msg, connection).await,
            SipMessage::Request(req) => self.route_request(req.clone(), msg.clone(), connection).await,
        };
        if let Err(e) = result {
            debug!(error = %e, "error handling inbound message");
        }
    }

    async fn route_response(&self, msg: SipMessage, connection: Option<SipConnection>) -> Result<()> {
        let key = TransactionKey {
            branch: branch_of(&msg)?,
            role: TransactionRole::Client,
        };
        if !self.endpoint.inner.route_to_transaction(&key, msg, connection) {
            trace!(transaction = %key, "response matches no live client transaction, dropping");
        }
        Ok(())
    }

    async fn route_request(&self, req: Request, msg: SipMessage, connection: Option<SipConnection>) -> Result<()> {
        let key = TransactionKey {
            branch: branch_of(&msg)?,
            role: TransactionRole::Server,
        };
        if self.endpoint.inner.route_to_transaction(&key, msg, connection.clone()) {
            return Ok(());
        }

        match req.method {
            rsip::Method::Invite => self.handle_new_invite(req, connection).await,
            rsip::Method::Ack => self.handle_ack(req).await,
            rsip::Method::Cancel => {
                debug!("CANCEL with no matching INVITE server transaction, responding 481");
                self.reply_stateless(&req, connection, StatusCode::CallTransactionDoesNotExist).await
            }
            _ => self.handle_in_dialog_request(req, connection).await,
        }
    }

    async fn handle_new_invite(&self, req: Request, connection: Option<SipConnection>) -> Result<()> {
        let connection = connection
            .ok_or_else(|| Error::TransportLayerError("no connection supplied for inbound INVITE".to_string()))?;
        let mut id = DialogId::try_from(&req)?;
        id.to_tag = self.endpoint.inner.id_pool.get_tag();

        let destination = via_destination(&req)?;
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
        let (ev_tx, ev_rx) = tokio::sync::mpsc::unbounded_channel();
        let (tu_tx, tu_rx) = tokio::sync::mpsc::unbounded_channel();
        self.endpoint.inner.attach_transaction(&key, ev_tx.clone());
        let txn = Transaction::new(
            TransactionKind::ServerInvite,
            req.clone(),
            destination,
            connection,
            self.endpoint.inner.clone(),
            ev_rx,
            tu_tx,
        )?;
        tokio::spawn(txn.run());

        let (state_tx, _state_rx) = tokio::sync::mpsc::unbounded_channel();
        let inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            req,
            self.endpoint.inner.clone(),
            state_tx,
            self.config.local_contact.clone(),
        )?;
        let dialog = ServerInviteDialog::new(inner, ev_tx, tu_rx);
        self.dialog_layer.insert_dialog(id, Dialog::ServerInvite(dialog.clone()))?;

        self.fire_incoming_dialog(Dialog::ServerInvite(dialog));
        Ok(())
    }

    /// Routes a 2xx ACK straight to the dialog it confirms. RFC 3261
    /// §13.3.1.4: the INVITE server transaction terminates the instant it
    /// sends a 2xx, so by the time the real ACK arrives over the wire
    /// there is no live transaction left to match it against — the ACK for
    /// a 2xx is end-to-end, delivered directly to the dialog (design note
    /// (b) in the expanded spec) rather than routed through the
    /// transaction registry like a non-2xx ACK is.
    async fn handle_ack(&self, req: Request) -> Result<()> {
        let id = DialogId::try_from(&req)?;
        match self.dialog_layer.find_dialog(&id) {
            Some(Dialog::ServerInvite(d)) => d.on_ack(&req),
            Some(Dialog::ClientInvite(_)) => Ok(()),
            None => {
                trace!(dialog = %id, "ACK matches no dialog, ignoring");
                Ok(())
            }
        }
    }

    async fn handle_in_dialog_request(&self, req: Request, connection: Option<SipConnection>) -> Result<()> {
        let id = DialogId::try_from(&req)?;
        let Some(mut dialog) = self.dialog_layer.find_dialog(&id) else {
            debug!(dialog = %id, method = %req.method, "in-dialog request matches no dialog, responding 481");
            return self.reply_stateless(&req, connection, StatusCode::CallTransactionDoesNotExist).await;
        };

        let connection = connection
            .ok_or_else(|| Error::TransportLayerError("no connection supplied for inbound request".to_string()))?;
        let destination = via_destination(&req)?;
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
        let kind = if req.method == rsip::Method::Invite {
            TransactionKind::ServerInvite
        } else {
            TransactionKind::ServerNonInvite
        };
        let (ev_tx, ev_rx) = tokio::sync::mpsc::unbounded_channel();
        let (tu_tx, _tu_rx) = tokio::sync::mpsc::unbounded_channel();
        self.endpoint.inner.attach_transaction(&key, ev_tx);
        let txn = Transaction::new(kind, req, destination, connection, self.endpoint.inner.clone(), ev_rx, tu_tx)?;

        let result = dialog.handle(txn).await;
        self.endpoint.inner.detach_transaction(&key, None);
        result
    }

    async fn reply_stateless(&self, req: &Request, connection: Option<SipConnection>, status: StatusCode) -> Result<()> {
        let Some(connection) = connection else { return Ok(()) };
        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Via(req.via_header()?.clone()));
        headers.push(rsip::Header::From(req.from_header()?.clone()));
        headers.push(rsip::Header::To(req.to_header()?.clone()));
        headers.push(rsip::Header::CallId(req.call_id_header()?.clone()));
        headers.push(rsip::Header::CSeq(req.cseq_header()?.clone()));
        headers.push(rsip::Header::ContentLength(0.into()));
        let resp = Response {
            status_code: status,
            headers,
            body: vec![],
            version: req.version().clone(),
        };
        let destination = via_destination(req)?;
        connection.send(SipMessage::Response(resp), Some(&destination)).await
    }

    fn fire_incoming_dialog(&self, dialog: Dialog) {
        let callback = {
            let guard = self.callbacks.lock().unwrap();
            guard.on_incoming_dialog.as_ref().map(|_| ())
        };
        if callback.is_none() {
            debug!(dialog = %dialog.id(), "no OnIncomingDialog callback registered, UAS dialog left unanswered");
            return;
        }
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            let guard = callbacks.lock().unwrap();
            if let Some(cb) = guard.on_incoming_dialog.as_ref() {
                if let Err(e) = std::panic::catch_unwind(AssertUnwindSafe(|| cb(dialog))) {
                    warn!(panic = ?e, "OnIncomingDialog callback panicked");
                }
            }
        });
    }

    /// Invoked from the background REFER-event consumer spawned by
    /// [`Stack::start`] once an incoming REFER has been accepted and its
    /// initial NOTIFY sent (spec.md §4.7).
    fn fire_incoming_refer(&self, dialog: Dialog, target: rsip::Uri, replaces: Option<ReplacesInfo>) {
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            let guard = callbacks.lock().unwrap();
            if let Some(cb) = guard.on_incoming_refer.as_ref() {
                if let Err(e) = std::panic::catch_unwind(AssertUnwindSafe(|| cb(dialog, target, replaces))) {
                    warn!(panic = ?e, "OnIncomingRefer callback panicked");
                }
            }
        });
    }
}

fn branch_of(msg: &SipMessage) -> Result<String> {
    use rsip::Param;
    let via = match msg {
        SipMessage::Request(r) => r.via_header()?,
        SipMessage::Response(r) => r.via_header()?,
    };
    let typed = via.typed()?;
    typed
        .params
        .iter()
        .find_map(|p| match p {
            Param::Branch(b) => Some(b.value().to_string()),
            _ => None,
        })
        .ok_or_else(|| Error::MissingHeader("Via branch".to_string()))
}

/// Derives the destination a response/ACK to `req` should be sent to from
/// its topmost Via's sent-by. The `received`/`rport` correction RFC 3261
/// §18.2.1 describes is the transport collaborator's job (spec.md §1 puts
/// socket-level NAT handling out of scope); this core only reads what the
/// request itself claims.
fn via_destination(req: &Request) -> Result<SipAddr> {
    let via = req.via_header()?.typed()?;
    Ok(SipAddr {
        r#type: Some(via.transport),
        addr: via.uri.host_with_port,
    })
}
