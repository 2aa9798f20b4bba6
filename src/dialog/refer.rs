//! REFER/Replaces call-transfer subsystem (RFC 3515, RFC 3891, RFC 4488).
//!
//! New relative to the reference implementation, which has no REFER
//! support at all. Grounded on:
//! - the reference implementation's `make_request`/`do_request` for
//!   building and sending the REFER and NOTIFY in-dialog requests;
//! - `eisenzopf-rvoip`'s `transfer/notify.rs` for the `message/sipfrag`
//!   NOTIFY body shape and progress-to-status-line mapping;
//! - `Header::Other` (the generic escape hatch other SIP crates in the
//!   pack use for headers outside their typed set) for `Refer-To`,
//!   `Referred-By`, `Event`, `Subscription-State` and `Refer-Sub`, none of
//!   which are part of `rsip`'s typed header set.

use super::dialog::DialogInnerRef;
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Header, Request, StatusCode};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_REFER_TO_LEN: usize = 2048;
const DEFAULT_SUBSCRIPTION_TTL: Duration = Duration::from_secs(3600);

/// RFC 3891 Replaces payload, serialized as
/// `CallID;from-tag=X;to-tag=Y[;early-only]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacesInfo {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub early_only: bool,
}

impl ReplacesInfo {
    pub fn encode(&self) -> String {
        let mut s = format!("{};from-tag={};to-tag={}", self.call_id, self.from_tag, self.to_tag);
        if self.early_only {
            s.push_str(";early-only");
        }
        s
    }

    /// Percent-encodes the value for embedding as a URI header parameter
    /// inside `Refer-To`, where `;` and `=` would otherwise be parsed as
    /// URI parameter delimiters rather than part of the Replaces payload.
    pub fn encode_for_uri(&self) -> String {
        percent_encode(&self.encode())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw = percent_decode(raw);
        let mut parts = raw.split(';');
        let call_id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Error("Replaces header missing Call-ID".to_string()))?
            .to_string();
        let mut from_tag = None;
        let mut to_tag = None;
        let mut early_only = false;
        for part in parts {
            if let Some(v) = part.strip_prefix("from-tag=") {
                from_tag = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("to-tag=") {
                to_tag = Some(v.to_string());
            } else if part == "early-only" {
                early_only = true;
            }
        }
        Ok(Self {
            call_id,
            from_tag: from_tag.ok_or_else(|| Error::Error("Replaces header missing from-tag".to_string()))?,
            to_tag: to_tag.ok_or_else(|| Error::Error("Replaces header missing to-tag".to_string()))?,
            early_only,
        })
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b';' => out.push_str("%3B"),
            b'=' => out.push_str("%3D"),
            b'?' => out.push_str("%3F"),
            b',' => out.push_str("%2C"),
            _ => out.push(b as char),
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.bytes().peekable();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let hex = [hi, lo];
                if let Ok(hex_str) = std::str::from_utf8(&hex) {
                    if let Ok(byte) = u8::from_str_radix(hex_str, 16) {
                        out.push(byte as char);
                        continue;
                    }
                }
            }
        } else {
            out.push(b as char);
        }
    }
    out
}

/// A REFER-spawned subscription (spec.md §3.4). `dialog_call_id` is kept
/// instead of a pointer back to the owning dialog so a finalized dialog is
/// never rooted by a stray subscription.
#[derive(Debug, Clone)]
pub struct ReferSubscription {
    pub id: String,
    pub dialog_call_id: String,
    pub target: rsip::Uri,
    pub replaces: Option<ReplacesInfo>,
    pub active: bool,
    pub created_at: Instant,
}

/// Outcome of accepting an incoming REFER, handed to
/// [`notify_initial_trying`] once the 202 has been sent.
pub struct IncomingReferOutcome {
    pub cseq: u32,
    pub target: rsip::Uri,
    pub replaces: Option<ReplacesInfo>,
}

/// Delivered to [`crate::stack::Stack`]'s `OnIncomingRefer` callback once an
/// inbound REFER has been accepted and its initial NOTIFY sent.
pub struct IncomingReferEvent {
    pub dialog: super::dialog::Dialog,
    pub target: rsip::Uri,
    pub replaces: Option<ReplacesInfo>,
}

fn build_refer_to(target: &rsip::Uri, replaces: Option<&ReplacesInfo>) -> String {
    match replaces {
        Some(r) => format!("<{}?Replaces={}>", target, r.encode_for_uri()),
        None => format!("<{}>", target),
    }
}

fn parse_refer_to(value: &str) -> Result<(rsip::Uri, Option<ReplacesInfo>)> {
    if value.len() > MAX_REFER_TO_LEN {
        return Err(Error::Error("Refer-To exceeds maximum length".to_string()));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(Error::Error("Refer-To contains control characters".to_string()));
    }
    let trimmed = value.trim().trim_start_matches('<');
    let (uri_part, replaces) = match trimmed.split_once("?Replaces=") {
        Some((uri, rest)) => {
            let rest = rest.trim_end_matches('>');
            let (replaces_raw, _tail) = rest.split_once('&').unwrap_or((rest, ""));
            (uri.trim_end_matches('>'), Some(ReplacesInfo::parse(replaces_raw)?))
        }
        None => (trimmed.trim_end_matches('>'), None),
    };
    let uri: rsip::Uri = uri_part
        .try_into()
        .map_err(|_| Error::Error(format!("malformed Refer-To URI: {}", uri_part)))?;
    Ok((uri, replaces))
}

/// Sends an outgoing REFER (spec.md §4.7), permitted only once the dialog
/// is `Established`. Blocks for the REFER transaction's final response:
/// 2xx yields the subscription (unless `refer_sub` is false, disabling the
/// NOTIFY subscription per RFC 4488), 3xx-6xx yields a rejection error.
pub async fn send_refer(
    inner: &DialogInnerRef,
    target: rsip::Uri,
    replaces: Option<ReplacesInfo>,
    refer_sub: bool,
) -> Result<Option<ReferSubscription>> {
    let refer_to = build_refer_to(&target, replaces.as_ref());
    let mut headers = vec![
        Header::Other("Refer-To".to_string(), refer_to),
        Header::Other("Event".to_string(), "refer".to_string()),
    ];
    if !refer_sub {
        headers.push(Header::Other("Refer-Sub".to_string(), "false".to_string()));
    }
    let request = inner.make_request(rsip::Method::Refer, None, None, None, Some(headers), None)?;
    let cseq = request.cseq_header()?.seq()?;
    let resp = inner.do_request(request).await?;

    match resp {
        Some(r) if r.status_code.kind() == rsip::StatusCodeKind::Successful => {
            inner.metrics().refer_sent();
            if !refer_sub {
                return Ok(None);
            }
            let call_id = inner.id.lock().unwrap().call_id.clone();
            let sub = ReferSubscription {
                id: cseq.to_string(),
                dialog_call_id: call_id,
                target,
                replaces,
                active: true,
                created_at: Instant::now(),
            };
            let mut subs = inner.refer_subscriptions.lock().unwrap();
            prune_expired(&mut subs, DEFAULT_SUBSCRIPTION_TTL);
            subs.insert(cseq, sub.clone());
            Ok(Some(sub))
        }
        Some(r) => Err(Error::Error(format!("refer rejected: {}", r.status_code))),
        None => Err(Error::Error("transaction terminated without final response".to_string())),
    }
}

/// Validates and records an incoming REFER (spec.md §4.7). The caller is
/// expected to have already invoked `OnIncomingRefer` outside any dialog
/// lock before calling this; this function only does the bookkeeping and
/// validation, never the application callback itself.
pub fn accept_incoming_refer(inner: &DialogInnerRef, request: &Request) -> Result<IncomingReferOutcome> {
    let refer_to_value = request
        .headers
        .iter()
        .find_map(|h| match h {
            Header::Other(name, value) if name.eq_ignore_ascii_case("refer-to") => Some(value.clone()),
            _ => None,
        })
        .ok_or_else(|| Error::Error("REFER missing Refer-To".to_string()))?;
    let (target, replaces) = parse_refer_to(&refer_to_value)?;
    let cseq = request.cseq_header()?.seq()?;

    let mut subs = inner.refer_subscriptions.lock().unwrap();
    prune_expired(&mut subs, DEFAULT_SUBSCRIPTION_TTL);
    if subs.contains_key(&cseq) {
        return Err(Error::Error(format!("subscription already exists for cseq {}", cseq)));
    }
    let call_id = inner.id.lock().unwrap().call_id.clone();
    subs.insert(
        cseq,
        ReferSubscription {
            id: cseq.to_string(),
            dialog_call_id: call_id,
            target: target.clone(),
            replaces: replaces.clone(),
            active: true,
            created_at: Instant::now(),
        },
    );
    inner.metrics().refer_received();
    Ok(IncomingReferOutcome { cseq, target, replaces })
}

fn prune_expired(subs: &mut HashMap<u32, ReferSubscription>, ttl: Duration) {
    subs.retain(|_, s| s.created_at.elapsed() < ttl);
}

fn sipfrag_notify(inner: &DialogInnerRef, cseq: u32, sipfrag: &str, terminated: bool) -> Result<Request> {
    let state = if terminated {
        "terminated;reason=noresource".to_string()
    } else {
        "active".to_string()
    };
    let headers = vec![
        Header::Other("Event".to_string(), format!("refer;id={}", cseq)),
        Header::Other("Subscription-State".to_string(), state),
        Header::ContentType("message/sipfrag".into()),
    ];
    inner.make_request(
        rsip::Method::Notify,
        None,
        None,
        None,
        Some(headers),
        Some(sipfrag.as_bytes().to_vec()),
    )
}

/// Sends the mandatory initial `100 Trying` NOTIFY after a REFER has been
/// accepted with a 202. Failure tears the subscription down.
pub async fn notify_initial_trying(inner: &DialogInnerRef, outcome: IncomingReferOutcome) -> Result<()> {
    let request = sipfrag_notify(inner, outcome.cseq, "SIP/2.0 100 Trying", false)?;
    match inner.do_request(request).await {
        Ok(_) => Ok(()),
        Err(e) => {
            inner.refer_subscriptions.lock().unwrap().remove(&outcome.cseq);
            Err(e)
        }
    }
}

/// Sends a progress or final NOTIFY for an active subscription this dialog
/// owns (the transferee side, reporting how the transfer-target call is
/// going). `status` drives both the sipfrag first line and, when it is a
/// final response, the `Subscription-State: terminated` transition and
/// subscription cleanup.
pub async fn notify_progress(inner: &DialogInnerRef, cseq: u32, status: StatusCode) -> Result<()> {
    let sipfrag = format!("SIP/2.0 {}", status);
    let terminal = status.kind() != rsip::StatusCodeKind::Provisional;
    let request = sipfrag_notify(inner, cseq, &sipfrag, terminal)?;
    let result = inner.do_request(request).await;
    if terminal {
        let mut subs = inner.refer_subscriptions.lock().unwrap();
        if let Some(sub) = subs.get_mut(&cseq) {
            sub.active = false;
        }
        subs.remove(&cseq);
        if status.kind() == rsip::StatusCodeKind::Successful {
            inner.metrics().transfer_completed();
        } else {
            inner.metrics().transfer_failed();
        }
    }
    result.map(|_| ())
}

/// Handles an inbound NOTIFY for a subscription this dialog created by
/// sending a REFER (the transferor side). Parses the sipfrag status line
/// and, on a terminal `Subscription-State`, removes the subscription and
/// bumps the completed/failed transfer counters.
pub fn handle_incoming_notify(inner: &DialogInnerRef, request: &Request) -> Result<()> {
    let event = request
        .headers
        .iter()
        .find_map(|h| match h {
            Header::Other(name, value) if name.eq_ignore_ascii_case("event") => Some(value.clone()),
            _ => None,
        })
        .ok_or_else(|| Error::Error("NOTIFY missing Event header".to_string()))?;
    let cseq: u32 = event
        .split("id=")
        .nth(1)
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::Error("NOTIFY Event header missing refer id".to_string()))?;

    let subscription_state = request
        .headers
        .iter()
        .find_map(|h| match h {
            Header::Other(name, value) if name.eq_ignore_ascii_case("subscription-state") => Some(value.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let body = String::from_utf8_lossy(&request.body);
    let terminated = subscription_state.starts_with("terminated");

    if terminated {
        let mut subs = inner.refer_subscriptions.lock().unwrap();
        subs.remove(&cseq);
        drop(subs);
        if body.contains("200") {
            inner.metrics().transfer_completed();
        } else {
            inner.metrics().transfer_failed();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_round_trips_through_encode_and_parse() {
        let info = ReplacesInfo {
            call_id: "abc123@host".to_string(),
            from_tag: "ft".to_string(),
            to_tag: "tt".to_string(),
            early_only: true,
        };
        let encoded = info.encode_for_uri();
        let decoded = ReplacesInfo::parse(&percent_decode(&encoded)).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn replaces_without_early_only_round_trips() {
        let info = ReplacesInfo {
            call_id: "xyz".to_string(),
            from_tag: "a".to_string(),
            to_tag: "b".to_string(),
            early_only: false,
        };
        let decoded = ReplacesInfo::parse(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn parse_refer_to_extracts_uri_and_replaces() {
        let target: rsip::Uri = "sip:charlie@192.168.1.100:5060".try_into().unwrap();
        let replaces = ReplacesInfo {
            call_id: "call1".to_string(),
            from_tag: "f1".to_string(),
            to_tag: "t1".to_string(),
            early_only: false,
        };
        let raw = build_refer_to(&target, Some(&replaces));
        let (parsed_uri, parsed_replaces) = parse_refer_to(&raw).unwrap();
        assert_eq!(parsed_uri.host().to_string(), "192.168.1.100");
        assert_eq!(parsed_replaces.unwrap().call_id, "call1");
    }

    #[test]
    fn refer_to_over_length_limit_is_rejected() {
        let huge = format!("<sip:{}@example.com>", "a".repeat(MAX_REFER_TO_LEN));
        assert!(parse_refer_to(&huge).is_err());
    }

    #[test]
    fn refer_to_with_control_characters_is_rejected() {
        let bad = "<sip:a@b.com>\u{0007}";
        assert!(parse_refer_to(bad).is_err());
    }

    #[test]
    fn prune_expired_removes_only_old_subscriptions() {
        let mut subs = HashMap::new();
        subs.insert(
            1,
            ReferSubscription {
                id: "1".to_string(),
                dialog_call_id: "c".to_string(),
                target: "sip:a@b.com".try_into().unwrap(),
                replaces: None,
                active: true,
                created_at: Instant::now() - Duration::from_secs(10),
            },
        );
        subs.insert(
            2,
            ReferSubscription {
                id: "2".to_string(),
                dialog_call_id: "c".to_string(),
                target: "sip:a@b.com".try_into().unwrap(),
                replaces: None,
                active: true,
                created_at: Instant::now(),
            },
        );
        prune_expired(&mut subs, Duration::from_secs(5));
        assert_eq!(subs.len(), 1);
        assert!(subs.contains_key(&2));
    }
}
