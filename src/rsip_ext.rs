//! Small `rsip` convenience helpers that don't belong on any single typed
//! header. Kept as a standalone module the way the reference
//! implementation does, rather than inlined at each call site.

/// Parses a raw Contact header value and returns the URI it carries,
/// discarding the display name and header parameters (`q`, `expires`,
/// etc.) that callers here never need.
pub fn extract_uri_from_contact(value: &str) -> crate::Result<rsip::Uri> {
    let contact: rsip::headers::Contact = value.to_string().into();
    let typed = contact
        .typed()
        .map_err(|e| crate::Error::MissingHeader(format!("Contact: {}", e)))?;
    Ok(typed.uri)
}
