//! Per-call option structs for the stack-facing API (spec.md §6.2).
//!
//! Grounded on the reference implementation's `InviteOption` (moved here
//! from `invitation.rs` and generalized), extended with the sibling option
//! types spec.md §6.2 enumerates for re-INVITE, accept, and the two REFER
//! flavors. None of these carry authentication credentials: spec.md frames
//! header/credential formatting as an external collaborator, so a 401/407
//! is surfaced to the caller like any other final response (design note
//! (b) in SPEC_FULL.md) rather than retried transparently here.

/// Options for an outbound INVITE (`Stack::new_invite`).
pub struct InviteOption {
    pub caller: rsip::Uri,
    pub callee: rsip::Uri,
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub contact: rsip::Uri,
    /// Display name to use on the From header; defaults to none.
    pub from_display_name: Option<String>,
    pub subject: Option<String>,
    /// Overrides the endpoint's default User-Agent for this request only.
    pub user_agent: Option<String>,
    pub extra_headers: Option<Vec<rsip::Header>>,
}

impl InviteOption {
    pub fn new(caller: rsip::Uri, callee: rsip::Uri, contact: rsip::Uri) -> Self {
        Self {
            caller,
            callee,
            content_type: None,
            offer: None,
            contact,
            from_display_name: None,
            subject: None,
            user_agent: None,
            extra_headers: None,
        }
    }
}

/// Options for a mid-dialog re-INVITE.
#[derive(Default)]
pub struct ReInviteOption {
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub extra_headers: Option<Vec<rsip::Header>>,
}

/// Options for accepting an inbound INVITE with a 200 OK.
#[derive(Default)]
pub struct AcceptOption {
    pub content_type: Option<String>,
    pub answer: Option<Vec<u8>>,
    pub extra_headers: Option<Vec<rsip::Header>>,
}

/// Options for `Dialog::refer` (blind transfer, RFC 3515).
pub struct ReferOption {
    /// Disables the RFC 4488 NOTIFY subscription when `false`.
    pub refer_sub: bool,
}

impl Default for ReferOption {
    fn default() -> Self {
        Self { refer_sub: true }
    }
}

impl ReferOption {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Options for `Dialog::refer_replace` (attended transfer, RFC 3891).
pub struct ReferReplaceOption {
    pub refer_sub: bool,
    pub early_only: bool,
}

impl Default for ReferReplaceOption {
    fn default() -> Self {
        Self {
            refer_sub: true,
            early_only: false,
        }
    }
}
