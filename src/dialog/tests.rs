//! End-to-end dialog-layer tests exercising real state transitions through
//! [`ServerInviteDialog`]/[`ClientInviteDialog`] against a recording mock
//! transport, grounded on the same `NullConn`/`NullTransport` shape used in
//! `dialog_layer`'s own test module.

use super::builder::InviteOption;
use super::client_dialog::ClientInviteDialog;
use super::dialog::{DialogInner, DialogState};
use super::dialog_layer::DialogLayer;
use super::server_dialog::ServerInviteDialog;
use super::DialogId;
use crate::transaction::endpoint::{EndpointBuilder, EndpointInnerRef, EndpointOption};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{TransactionEvent, TuEvent};
use crate::transport::{SipAddr, SipConnection, SipTransport, SipTransportConnection};
use async_trait::async_trait;
use rsip::prelude::HeadersExt;
use std::sync::Arc;

struct NullConn;
#[async_trait]
impl SipTransportConnection for NullConn {
    fn is_reliable(&self) -> bool {
        true
    }
    async fn send(&self, _msg: rsip::SipMessage, _dest: Option<&SipAddr>) -> crate::Result<()> {
        Ok(())
    }
}

struct NullTransport;
#[async_trait]
impl SipTransport for NullTransport {
    async fn lookup(&self, destination: &SipAddr, _via_key: Option<&TransactionKey>) -> crate::Result<(SipConnection, SipAddr)> {
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

fn incoming_invite() -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Invite,
        uri: "sip:bob@example.com".try_into().unwrap(),
        headers: vec![
            rsip::Header::Via("SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bK-dialog-test".try_into().unwrap()),
            rsip::Header::From("<sip:alice@example.com>;tag=alice-tag".try_into().unwrap()),
            rsip::Header::To("<sip:bob@example.com>".try_into().unwrap()),
            rsip::Header::CallId("dialog-test-call".to_string().into()),
            rsip::Header::CSeq(rsip::typed::CSeq { seq: 1, method: rsip::Method::Invite }.into()),
            rsip::Header::Contact("<sip:alice@192.168.1.10:5060>".try_into().unwrap()),
        ]
        .into(),
        body: vec![],
        version: rsip::Version::V2,
    }
}

#[tokio::test]
async fn server_invite_accept_then_ack_reaches_confirmed() {
    let ep = endpoint();
    let req = incoming_invite();
    let mut id = DialogId::try_from(&req).unwrap();
    id.to_tag = "bob-tag".to_string();

    let (state_tx, _state_rx) = tokio::sync::mpsc::unbounded_channel();
    let contact: rsip::Uri = "sip:bob@192.168.1.20:5060".try_into().unwrap();
    let inner = DialogInner::new(TransactionRole::Server, id.clone(), req, ep.clone(), state_tx, Some(contact)).unwrap();

    let (ev_tx, mut ev_rx) = tokio::sync::mpsc::unbounded_channel();
    let (tu_tx, tu_rx) = tokio::sync::mpsc::unbounded_channel();
    let dialog = ServerInviteDialog::new(inner, ev_tx, tu_rx);

    dialog.provisional(rsip::StatusCode::Ringing, None).await.unwrap();
    match ev_rx.recv().await.unwrap() {
        TransactionEvent::Respond(resp) => assert_eq!(resp.status_code, rsip::StatusCode::Ringing),
        _ => panic!("expected a Respond event for the provisional response"),
    }

    dialog.accept(None, Some(b"v=0".to_vec())).await.unwrap();
    match ev_rx.recv().await.unwrap() {
        TransactionEvent::Respond(resp) => assert_eq!(resp.status_code, rsip::StatusCode::OK),
        _ => panic!("expected a Respond event for the 200 OK"),
    }
    assert!(!dialog.inner.is_confirmed());

    tu_tx.send(TuEvent::AckReceived).unwrap();
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert!(dialog.inner.is_confirmed());
}

#[tokio::test]
async fn server_invite_reject_terminates_without_waiting_for_ack() {
    let ep = endpoint();
    let req = incoming_invite();
    let mut id = DialogId::try_from(&req).unwrap();
    id.to_tag = "bob-tag".to_string();

    let (state_tx, _state_rx) = tokio::sync::mpsc::unbounded_channel();
    let inner = DialogInner::new(TransactionRole::Server, id, req, ep, state_tx, None).unwrap();
    let (ev_tx, mut ev_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_tu_tx, tu_rx) = tokio::sync::mpsc::unbounded_channel();
    let dialog = ServerInviteDialog::new(inner, ev_tx.clone(), tu_rx);

    dialog.reject(rsip::StatusCode::BusyHere, None).await.unwrap();
    match ev_rx.recv().await.unwrap() {
        TransactionEvent::Respond(resp) => assert_eq!(resp.status_code, rsip::StatusCode::BusyHere),
        _ => panic!("expected a Respond event for the rejection"),
    }
    assert!(matches!(
        dialog.inner.state.lock().unwrap().clone(),
        DialogState::Terminated(_, _)
    ));
}

#[tokio::test]
async fn client_invite_final_200_confirms_dialog_and_sends_ack() {
    let ep = endpoint();
    let layer = DialogLayer::new(ep.clone(), 10);
    let contact: rsip::Uri = "sip:alice@192.168.1.30:5060".try_into().unwrap();
    let opt = InviteOption::new(
        "sip:alice@example.com".try_into().unwrap(),
        "sip:bob@example.com".try_into().unwrap(),
        contact.clone(),
    );
    let request = layer.make_invite_request(&opt).unwrap();
    let key = TransactionKey::from_request(&request, TransactionRole::Client).unwrap();

    let response = {
        let mut to = request.to_header().unwrap().typed().unwrap();
        to.params.push(rsip::Param::Tag("callee-tag".to_string().into()));
        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Via(request.via_header().unwrap().clone()));
        headers.push(rsip::Header::From(request.from_header().unwrap().clone()));
        headers.push(rsip::Header::To(to.into()));
        headers.push(rsip::Header::CallId(request.call_id_header().unwrap().clone()));
        headers.push(rsip::Header::CSeq(request.cseq_header().unwrap().clone()));
        headers.push(rsip::Header::ContentLength(0.into()));
        rsip::Response {
            status_code: rsip::StatusCode::OK,
            headers,
            body: vec![],
            version: request.version().clone(),
        }
    };

    let id = DialogId::try_from(&request).unwrap();
    let (state_tx, _state_rx) = tokio::sync::mpsc::unbounded_channel();
    let inner = DialogInner::new(TransactionRole::Client, id, request.clone(), ep.clone(), state_tx, Some(contact)).unwrap();
    let dialog = ClientInviteDialog::new(inner);

    let drive = {
        let dialog = dialog.clone();
        tokio::spawn(async move { dialog.process_invite(request).await })
    };
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert!(ep.route_to_transaction(&key, rsip::SipMessage::Response(response), None));

    let (confirmed_id, final_resp) = drive.await.unwrap().unwrap();
    assert!(final_resp.is_some());
    assert_eq!(confirmed_id.to_tag, "callee-tag");
    assert!(dialog.inner.is_confirmed());
}
