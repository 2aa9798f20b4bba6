//! Builds and sends the outbound INVITE that starts a UAC dialog
//! (spec.md §6.2's `Stack::new_invite`).
//!
//! Grounded on the reference implementation's `DialogLayer::make_invite_request`
//! / `do_invite`, adapted to this crate's split between `DialogInner::new`
//! (dialog construction) and [`ClientInviteDialog::process_invite`] (which
//! already owns spawning and driving the client transaction).

use super::builder::InviteOption;
use super::client_dialog::ClientInviteDialog;
use super::dialog::{Dialog, DialogInner, DialogStateSender};
use super::dialog_layer::DialogLayer;
use super::DialogId;
use crate::transaction::endpoint::make_tag;
use crate::transaction::key::TransactionRole;
use crate::Result;
use rsip::Response;
use tracing::{debug, info};

impl DialogLayer {
    /// Constructs the INVITE request from `opt` without sending it.
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<rsip::Request> {
        let seq = self.increment_last_seq();
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.callee.clone(),
            params: vec![],
        };
        let recipient = to.uri.clone();

        let from = rsip::typed::From {
            display_name: opt.from_display_name.clone(),
            uri: opt.caller.clone(),
            params: vec![],
        }
        .with_tag(make_tag(&self.endpoint.id_pool).into());

        let via = self.endpoint.get_via(None, None)?;
        let mut request = self.endpoint.make_request(rsip::Method::Invite, recipient, via, from, to, seq);

        let contact = rsip::typed::Contact {
            display_name: None,
            uri: opt.contact.clone(),
            params: vec![],
        };
        request.headers.unique_push(rsip::Header::Contact(contact.into()));
        request.headers.unique_push(rsip::Header::ContentType(
            opt.content_type.clone().unwrap_or_else(|| "application/sdp".to_string()).into(),
        ));
        if let Some(subject) = opt.subject.as_ref() {
            request.headers.unique_push(rsip::Header::Subject(subject.clone().into()));
        }
        if let Some(ua) = opt.user_agent.as_ref() {
            request.headers.unique_push(rsip::Header::UserAgent(ua.clone().into()));
        }
        if let Some(extra) = opt.extra_headers.as_ref() {
            for header in extra {
                request.headers.unique_push(header.clone());
            }
        }
        request.body = opt.offer.clone().unwrap_or_default();
        request.headers.unique_push(rsip::Header::ContentLength((request.body.len() as u32).into()));
        Ok(request)
    }

    /// Sends the INVITE and drives it to its final response, registering
    /// the resulting [`ClientInviteDialog`] in the dialog table under its
    /// provisional key first, then its confirmed key (which may carry a
    /// to-tag the provisional id didn't have) once a response arrives.
    pub async fn new_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let request = self.make_invite_request(&opt)?;
        let id = DialogId::try_from(&request)?;
        let inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request.clone(),
            self.endpoint.clone(),
            state_sender,
            Some(opt.contact.clone()),
        )?;
        let dialog = ClientInviteDialog::new(inner);

        self.insert_dialog(id.clone(), Dialog::ClientInvite(dialog.clone()))?;
        info!(dialog = %id, "client invite dialog created");

        match dialog.process_invite(request).await {
            Ok((confirmed_id, resp)) => {
                debug!(provisional = %id, confirmed = %confirmed_id, "client invite dialog resolved");
                if confirmed_id != id {
                    self.rekey_dialog(&id, confirmed_id);
                }
                Ok((dialog, resp))
            }
            Err(e) => {
                self.remove_dialog(&id);
                Err(e)
            }
        }
    }
}
