//! The transaction layer's shared state: SIP message construction helpers,
//! Via generation, and the transaction registry used to route inbound
//! messages to the right [`Transaction`](super::transaction::Transaction).
//!
//! Grounded on the reference implementation's `transaction::endpoint`
//! module (`EndpointInner`/`Endpoint`/`EndpointBuilder`), generalized with
//! an explicit [`crate::transaction::registry::TransactionRegistry`] so
//! overload behavior (spec.md §4.4) is enforced rather than implicit.

use crate::dialog::refer::IncomingReferEvent;
use crate::identifiers::IdentifierPool;
use crate::metrics::Metrics;
use crate::transaction::key::TransactionKey;
use crate::transaction::registry::TransactionRegistry;
use crate::transaction::timer::{Timer, TimerOptions, TransactionTimer};
use crate::transaction::transaction::TransactionEventSender;
use crate::transport::{SipAddr, SipTransport};
use rsip::{Header, Param, Request, Response, SipMessage, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t1x64: Duration,
    pub callid_suffix: Option<String>,
    pub max_concurrent_transactions: usize,
}

impl Default for EndpointOption {
    fn default() -> Self {
        let t = TimerOptions::default();
        Self {
            t1: t.t1,
            t2: t.t2,
            t4: t.t4,
            t1x64: t.t1x64,
            callid_suffix: None,
            max_concurrent_transactions: 100_000,
        }
    }
}

pub struct EndpointInner {
    pub option: EndpointOption,
    pub user_agent: String,
    pub timers: Timer<TransactionTimer>,
    pub id_pool: IdentifierPool,
    pub transport_layer: Arc<dyn SipTransport>,
    pub metrics: Arc<Metrics>,
    registry: TransactionRegistry,
    /// Sink for the dialog-layer timer kinds (`DialogExpiry`/
    /// `SessionRefresh`) the background dispatcher can't route through the
    /// transaction registry; set once by [`crate::stack::Stack`] at
    /// construction.
    dialog_timer_tx: Mutex<Option<UnboundedSender<TransactionTimer>>>,
    /// Sink for accepted inbound REFERs, drained by [`crate::stack::Stack`]
    /// to invoke its `OnIncomingRefer` callback outside the dialog lock.
    incoming_refer_tx: Mutex<Option<UnboundedSender<IncomingReferEvent>>>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

impl EndpointInner {
    /// Builds a Via header for an outbound request. When `addr` is
    /// supplied (e.g. a NAT-discovered public address) it is used for the
    /// sent-by part; otherwise callers are expected to have a transport
    /// layer that rewrites `received`/`rport` on the wire.
    pub fn get_via(&self, addr: Option<SipAddr>, branch: Option<Param>) -> crate::Result<rsip::typed::Via> {
        let branch = branch.unwrap_or_else(|| Param::Branch(self.id_pool.get_branch().into()));
        let (host, transport) = match addr {
            Some(a) => (a.addr.host, a.r#type.unwrap_or(rsip::Transport::Udp)),
            None => (
                rsip::Host::Domain("0.0.0.0".into()),
                rsip::Transport::Udp,
            ),
        };
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport,
            uri: rsip::Uri {
                host_with_port: host.with_default_port(transport.default_port()),
                ..Default::default()
            },
            params: vec![branch],
        })
    }

    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(&self.id_pool, self.option.callid_suffix.as_deref())),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        rsip::Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    pub fn make_response(&self, req: &Request, status_code: StatusCode, body: Option<Vec<u8>>) -> Response {
        use rsip::message::HeadersExt as _;
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::MaxForwards(_)
                    | Header::CSeq(_)
            )
        });
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Response {
            status_code,
            version: req.version().clone(),
            headers,
            body: body.unwrap_or_default(),
        }
    }

    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.registry.attach(key.clone(), sender);
    }

    pub fn detach_transaction(&self, key: &TransactionKey, last_message: Option<SipMessage>) {
        self.registry.detach(key, last_message);
    }

    /// Routes an inbound message to its matching transaction, if any.
    /// Returns `None` (no matching transaction) so the caller (the dialog
    /// stack) can decide how to handle a message that starts a brand new
    /// transaction (e.g. an out-of-dialog INVITE).
    pub fn route_to_transaction(
        &self,
        key: &TransactionKey,
        msg: SipMessage,
        connection: Option<crate::transport::SipConnection>,
    ) -> bool {
        self.registry.route(key, msg, connection)
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Hands a TU-built non-2xx ACK to the client INVITE transaction
    /// matching `key` for retention/retransmission. Returns `false` if no
    /// such transaction is currently attached.
    pub fn notify_ack(&self, key: &TransactionKey, ack: Request) -> bool {
        self.registry.route_ack(key, ack)
    }

    pub fn set_dialog_timer_sender(&self, tx: UnboundedSender<TransactionTimer>) {
        *self.dialog_timer_tx.lock().unwrap() = Some(tx);
    }

    pub fn arm_dialog_timer(&self, after: Duration, timer: TransactionTimer) -> u64 {
        self.timers.timeout(after, timer)
    }

    pub fn cancel_timer(&self, id: u64) {
        self.timers.cancel(id);
    }

    pub fn set_incoming_refer_sender(&self, tx: UnboundedSender<IncomingReferEvent>) {
        *self.incoming_refer_tx.lock().unwrap() = Some(tx);
    }

    pub fn notify_incoming_refer(&self, event: IncomingReferEvent) {
        let sender = self.incoming_refer_tx.lock().unwrap().clone();
        match sender {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => trace!("incoming REFER observed with no OnIncomingRefer consumer attached, dropping"),
        }
    }
}

/// Starts the two background loops the timer manager needs (spec.md
/// §4.3): a fast dispatcher that fires due timers into their owning
/// transaction (or the dialog layer, for `DialogExpiry`/`SessionRefresh`),
/// and a slow sweeper that force-cancels timers old enough to indicate a
/// caller leaked their id. Both are spawned once, from an async context,
/// by [`crate::stack::Stack::start`] — never from [`EndpointBuilder::build`]
/// itself, which may run before a runtime exists.
pub fn spawn_background_tasks(endpoint: EndpointInnerRef) {
    let dispatch_endpoint = endpoint.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(20));
        loop {
            interval.tick().await;
            let fired = dispatch_endpoint.timers.poll_bounded(Instant::now(), 1000);
            for timer in fired {
                dispatch_timer(&dispatch_endpoint, timer);
            }
        }
    });

    let sweep_endpoint = endpoint;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_endpoint.option_cleanup_interval());
        loop {
            interval.tick().await;
            let evicted = sweep_endpoint
                .timers
                .evict_older_than(Instant::now(), sweep_endpoint.option_max_age());
            if evicted > 0 {
                debug!(count = evicted, "timer sweeper force-cancelled stale entries");
            }
        }
    });
}

fn dispatch_timer(endpoint: &EndpointInnerRef, timer: TransactionTimer) {
    if let Some(key) = timer.transaction_key().cloned() {
        if !endpoint.registry().route_timer(&key, timer) {
            trace!(transaction = %key, "timer fired for a transaction that already detached");
        }
        return;
    }
    let sender = endpoint.dialog_timer_tx.lock().unwrap().clone();
    match sender {
        Some(tx) => {
            let _ = tx.send(timer);
        }
        None => trace!("dialog timer fired with no dialog layer attached yet, dropping"),
    }
}

impl EndpointInner {
    fn option_cleanup_interval(&self) -> Duration {
        TimerOptions::default().cleanup_interval
    }

    fn option_max_age(&self) -> Duration {
        TimerOptions::default().max_age
    }
}

fn make_call_id(pool: &IdentifierPool, suffix: Option<&str>) -> rsip::headers::CallId {
    pool.get_call_id(suffix).into()
}

pub fn make_tag(pool: &IdentifierPool) -> String {
    pool.get_tag()
}

/// A transaction-less CSeq seed used for dialog-creating requests. Spread
/// across a wide range so two freshly started endpoints don't produce
/// colliding sequences when racing against the same peer.
pub fn generate_random_cseq(pool: &IdentifierPool) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    pool.get_branch().hash(&mut hasher);
    ((hasher.finish() as u32) & 0x7fff_ffff).max(1)
}

pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

pub struct EndpointBuilder {
    user_agent: String,
    option: EndpointOption,
    transport_layer: Option<Arc<dyn SipTransport>>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self {
            user_agent: "sipcore-stack".to_string(),
            option: EndpointOption::default(),
            transport_layer: None,
        }
    }

    pub fn with_user_agent(mut self, ua: &str) -> Self {
        self.user_agent = ua.to_string();
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: Arc<dyn SipTransport>) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn build(self) -> Endpoint {
        let transport_layer = self
            .transport_layer
            .expect("EndpointBuilder requires a transport layer");
        let max_concurrent = self.option.max_concurrent_transactions;
        let metrics = Arc::new(Metrics::new());
        Endpoint {
            inner: Arc::new(EndpointInner {
                option: self.option,
                user_agent: self.user_agent,
                timers: Timer::new(),
                id_pool: IdentifierPool::new(),
                transport_layer,
                registry: TransactionRegistry::new(max_concurrent, metrics.clone()),
                metrics,
                dialog_timer_tx: Mutex::new(None),
                incoming_refer_tx: Mutex::new(None),
            }),
        }
    }
}
