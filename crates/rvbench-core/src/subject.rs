//! Subject names, wildcard matching and private inboxes

use crate::errors::{BusError, BusResult};

// ----------------------------------------------------------------------------
// Well-known Subjects
// ----------------------------------------------------------------------------

/// Clients publish here to locate a direct-mode server
pub const LOCATE_SUBJECT: &str = "TIBRV.LOCATE";

/// Clients publish here to locate a server accepting virtual circuits
pub const VC_LOCATE_SUBJECT: &str = "TIBRV.VC.LOCATE";

/// Requests sent over a virtual circuit
pub const VC_REQUEST_SUBJECT: &str = "TIBRV.VC.WORK";

/// Non-inbox reply subject for responses on a virtual circuit
pub const VC_RESPONSE_SUBJECT: &str = "TIBRV.VC.REPLY";

/// Advisory delivered on a circuit once the connect handshake completes
pub const VC_CONNECTED_ADVISORY: &str = "_RV.INFO.SYSTEM.VC.CONNECTED";

/// Pattern matching every circuit disconnect advisory
pub const VC_DISCONNECTED_ADVISORY: &str = "_RV.*.SYSTEM.VC.DISCONNECTED";

/// Concrete subject a circuit uses when it emits a disconnect advisory
pub const VC_DISCONNECTED_INFO: &str = "_RV.INFO.SYSTEM.VC.DISCONNECTED";

/// Self-addressed signal that unblocks a waiting main loop
pub const COMPLETION_SUBJECT: &str = "TEST.COMPLETED";

const INBOX_PREFIX: &str = "_INBOX";
const MAX_SUBJECT_LEN: usize = 255;

// ----------------------------------------------------------------------------
// Validation
// ----------------------------------------------------------------------------

/// Validate a subject or subscription pattern
///
/// Elements are separated by `.` and may not be empty. `*` must occupy a
/// whole element; `>` must occupy the last element.
pub fn validate(subject: &str) -> BusResult<()> {
    if subject.is_empty() {
        return Err(BusError::invalid_subject(subject, "empty subject"));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(BusError::invalid_subject(subject, "subject too long"));
    }

    let elements: Vec<&str> = subject.split('.').collect();
    let last = elements.len() - 1;
    for (index, element) in elements.iter().enumerate() {
        if element.is_empty() {
            return Err(BusError::invalid_subject(subject, "empty element"));
        }
        if element.contains('*') && *element != "*" {
            return Err(BusError::invalid_subject(subject, "'*' must be a whole element"));
        }
        if element.contains('>') && (*element != ">" || index != last) {
            return Err(BusError::invalid_subject(subject, "'>' must be the last element"));
        }
    }
    Ok(())
}

/// Whether a subject contains wildcard elements
pub fn is_wildcard(subject: &str) -> bool {
    subject.split('.').any(|element| element == "*" || element == ">")
}

/// Validate a subject a message can be published to
pub fn validate_send(subject: &str) -> BusResult<()> {
    validate(subject)?;
    if is_wildcard(subject) {
        return Err(BusError::invalid_subject(subject, "cannot publish to a wildcard"));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Matching
// ----------------------------------------------------------------------------

/// Match a concrete subject against a subscription pattern
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_elements = pattern.split('.');
    let mut subject_elements = subject.split('.');

    loop {
        match (pattern_elements.next(), subject_elements.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ----------------------------------------------------------------------------
// Inboxes
// ----------------------------------------------------------------------------

/// Mint a fresh private reply address
pub fn new_inbox() -> String {
    format!("{}.{}", INBOX_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Whether a subject is a private inbox
pub fn is_inbox(subject: &str) -> bool {
    subject
        .strip_prefix(INBOX_PREFIX)
        .map(|rest| rest.starts_with('.'))
        .unwrap_or(false)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
