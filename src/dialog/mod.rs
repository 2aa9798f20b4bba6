//! RFC 3261 §12 dialog layer: identity, state machine, client/server
//! INVITE dialogs, the request/response builder, the REFER/Replaces
//! transfer subsystem, and the stack-facing `DialogLayer` orchestrator.

pub mod builder;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod refer;
pub mod server_dialog;

#[cfg(test)]
mod tests;

pub use dialog::{Dialog, DialogInner, DialogState, TerminatedReason};
pub use dialog_layer::DialogLayer;

use rsip::prelude::HeadersExt;

/// Identifies a dialog by the RFC 3261 §12 dialog ID: Call-ID plus the two
/// tags. `from_tag`/`to_tag` are fixed to whichever header they came from
/// on the *first* request seen for this dialog and never swap meaning
/// afterwards, even though "local"/"remote" swap depending on which side
/// reads them — a UAC's `from_tag` is its own local tag, a UAS's `to_tag`
/// is its own local tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.from_tag, self.to_tag)
    }
}

impl DialogId {
    pub fn new(call_id: impl Into<String>, from_tag: impl Into<String>, to_tag: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            from_tag: from_tag.into(),
            to_tag: to_tag.into(),
        }
    }

    /// The key with `from_tag`/`to_tag` swapped — a peer's request has our
    /// local tag in the *To* header and our remote tag in *From*, so a
    /// direct field-for-field match on an inbound request fails for one
    /// side of every dialog. Used as the first fallback when the
    /// canonical key misses in the dialog map.
    pub fn swapped(&self) -> Self {
        Self {
            call_id: self.call_id.clone(),
            from_tag: self.to_tag.clone(),
            to_tag: self.from_tag.clone(),
        }
    }

    /// A key with the remote tag blanked out, for matching the very first
    /// in-dialog request from a UAS that has not yet learned its own
    /// `to_tag` at construction time (rare, but legal when a 2xx races an
    /// in-dialog request sent off the provisional dialog).
    pub fn with_empty_to_tag(&self) -> Self {
        Self {
            call_id: self.call_id.clone(),
            from_tag: self.from_tag.clone(),
            to_tag: String::new(),
        }
    }
}

impl TryFrom<&rsip::Request> for DialogId {
    type Error = crate::Error;

    /// Builds a `DialogId` from an in-dialog request as received: `from_tag`
    /// is the request's own From-tag, `to_tag` its own To-tag, regardless
    /// of which side is "local". Callers that need the dialog's canonical
    /// orientation normalize via [`DialogId::swapped`] as needed.
    fn try_from(req: &rsip::Request) -> Result<Self, Self::Error> {
        let from = req
            .from_header()
            .map_err(|e| crate::Error::MissingHeader(format!("From: {}", e)))?
            .typed()
            .map_err(|e| crate::Error::MissingHeader(format!("From: {}", e)))?;
        let to = req
            .to_header()
            .map_err(|e| crate::Error::MissingHeader(format!("To: {}", e)))?
            .typed()
            .map_err(|e| crate::Error::MissingHeader(format!("To: {}", e)))?;
        let call_id = req
            .call_id_header()
            .map_err(|e| crate::Error::MissingHeader(format!("Call-ID: {}", e)))?
            .value()
            .to_string();
        let from_tag = from.tag().map(|t| t.to_string()).unwrap_or_default();
        let to_tag = to.tag().map(|t| t.to_string()).unwrap_or_default();
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn swapped_exchanges_tags_not_call_id() {
        let id = DialogId::new("call-1", "a", "b");
        let s = id.swapped();
        assert_eq!(s.call_id, "call-1");
        assert_eq!(s.from_tag, "b");
        assert_eq!(s.to_tag, "a");
    }

    #[test]
    fn display_is_stable_and_readable() {
        let id = DialogId::new("call-1", "a", "b");
        assert_eq!(id.to_string(), "call-1:a:b");
    }
}
