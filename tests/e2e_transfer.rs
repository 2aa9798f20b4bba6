//! S5 and S6 from spec.md §8: blind transfer (RFC 3515) and attended
//! transfer (RFC 3891 Replaces), both driven over two/three real `Stack`s
//! on the loopback network.

mod common;

use common::{sip_uri, spawn_stack, wait_until, LoopbackNetwork};
use sipcore_stack::config::Config;
use sipcore_stack::dialog::builder::{AcceptOption, InviteOption, ReferOption, ReferReplaceOption};
use sipcore_stack::dialog::Dialog;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn channel() -> sipcore_stack::dialog::dialog::DialogStateSender {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    tx
}

async fn establish(
    caller: &sipcore_stack::stack::Stack,
    caller_addr: &str,
    callee: &sipcore_stack::stack::Stack,
    callee_addr: &str,
) -> (Dialog, Dialog) {
    let uas_dialog: Arc<Mutex<Option<Dialog>>> = Arc::new(Mutex::new(None));
    let uas_dialog_cb = uas_dialog.clone();
    callee.on_incoming_dialog(move |dialog| {
        let slot = uas_dialog_cb.clone();
        tokio::spawn(async move {
            dialog.accept(AcceptOption::default()).await.unwrap();
            *slot.lock().unwrap() = Some(dialog);
        });
    });

    let user_b = callee_addr.split(':').next().unwrap_or("user");
    let opt = InviteOption::new(sip_uri("alice", caller_addr), sip_uri(user_b, callee_addr), sip_uri("alice", caller_addr));
    let (client_dialog, resp) = caller.new_invite(opt, channel()).await.expect("invite succeeds");
    assert_eq!(resp.unwrap().status_code, rsip::StatusCode::OK);
    let dialog_a = client_dialog.as_dialog();

    assert!(wait_until(|| uas_dialog.lock().unwrap().is_some(), Duration::from_secs(1)).await);
    let dialog_b = uas_dialog.lock().unwrap().clone().unwrap();
    assert!(wait_until(|| dialog_b.state().is_confirmed() && dialog_a.state().is_confirmed(), Duration::from_secs(1)).await);
    (dialog_a, dialog_b)
}

/// S5 — UA1/UA2 are established; UA1 blind-transfers UA2 to
/// `sip:carol@...` (a third party that need not even exist for this
/// assertion, since REFER only asks UA2 to *try*). UA2 observes the
/// Refer-To target through `OnIncomingRefer` and the REFER-sending dialog
/// gets back an active subscription.
#[tokio::test]
async fn s5_blind_transfer_delivers_refer_to_target() {
    let network = LoopbackNetwork::new();
    let ua1 = spawn_stack(&network, "127.0.0.1:25080", Config::default());
    let ua2 = spawn_stack(&network, "127.0.0.1:26080", Config::default());

    let seen_target: Arc<Mutex<Option<rsip::Uri>>> = Arc::new(Mutex::new(None));
    let seen_target_cb = seen_target.clone();
    ua2.on_incoming_refer(move |_dialog, target, _replaces| {
        *seen_target_cb.lock().unwrap() = Some(target);
    });

    let (dialog_a, _dialog_b) = establish(&ua1, "127.0.0.1:25080", &ua2, "127.0.0.1:26080").await;

    let carol = sip_uri("carol", "127.0.0.1:27080");
    let sub = dialog_a
        .refer(carol.clone(), ReferOption::new())
        .await
        .expect("refer succeeds")
        .expect("subscription created (refer_sub defaults true)");
    assert!(sub.active);
    assert_eq!(sub.replaces, None);

    let carol_str = carol.to_string();
    assert!(
        wait_until(
            || seen_target.lock().unwrap().as_ref().map(|u| u.to_string()) == Some(carol_str.clone()),
            Duration::from_secs(1)
        )
        .await,
        "UA2 never observed the blind-transfer Refer-To target"
    );
}

/// S6 — UA1 has two established calls: one to UA2, one to UA3. UA1 refers
/// UA2 to UA3 with a `Replaces` built from the UA1-UA3 leg (attended
/// transfer). UA2 observes both the target URI and a `Replaces` payload
/// whose Call-ID matches the UA1-UA3 dialog.
#[tokio::test]
async fn s6_attended_transfer_embeds_replaces_for_the_other_leg() {
    let network = LoopbackNetwork::new();
    let ua1 = spawn_stack(&network, "127.0.0.1:25090", Config::default());
    let ua2 = spawn_stack(&network, "127.0.0.1:26090", Config::default());
    let ua3 = spawn_stack(&network, "127.0.0.1:27090", Config::default());

    let seen: Arc<Mutex<Option<(rsip::Uri, Option<sipcore_stack::dialog::refer::ReplacesInfo>)>>> = Arc::new(Mutex::new(None));
    let seen_cb = seen.clone();
    ua2.on_incoming_refer(move |_dialog, target, replaces| {
        *seen_cb.lock().unwrap() = Some((target, replaces));
    });

    let (dialog_a_to_b, _dialog_b) = establish(&ua1, "127.0.0.1:25090", &ua2, "127.0.0.1:26090").await;
    let (dialog_a_to_c, _dialog_c) = establish(&ua1, "127.0.0.1:25090", &ua3, "127.0.0.1:27090").await;

    let sub = dialog_a_to_b
        .refer_replace(&dialog_a_to_c, ReferReplaceOption::default())
        .await
        .expect("refer-replace succeeds")
        .expect("subscription created");
    assert!(sub.replaces.is_some());
    assert_eq!(sub.replaces.as_ref().unwrap().call_id, dialog_a_to_c.id().call_id);

    assert!(
        wait_until(|| seen.lock().unwrap().is_some(), Duration::from_secs(1)).await,
        "UA2 never received the attended-transfer REFER"
    );
    let (_, replaces) = seen.lock().unwrap().clone().unwrap();
    let replaces = replaces.expect("Replaces header parsed back out of Refer-To");
    assert_eq!(replaces.call_id, dialog_a_to_c.id().call_id);
}
