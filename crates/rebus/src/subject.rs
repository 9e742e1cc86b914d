//! Subject codec and name validation.
//!
//! Bus subjects and resource IDs are dot-separated sequences of tokens from
//! the set `[A-Za-z0-9_-]`. A resource ID may additionally carry a `?query`
//! suffix which is preserved verbatim but never participates in routing.

/// Kind of an inbound request, derived from the subject's first token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Access,
    Get,
    Call,
    Auth,
}

impl RequestKind {
    /// The subject prefix token for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Access => "access",
            RequestKind::Get => "get",
            RequestKind::Call => "call",
            RequestKind::Auth => "auth",
        }
    }
}

/// A decoded inbound request subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub kind: RequestKind,
    /// Resource ID, without query.
    pub rid: String,
    /// Method name for call and auth requests.
    pub method: Option<String>,
}

/// Decode an inbound subject into its kind, resource ID and method.
///
/// Returns `None` for subjects that do not follow one of the request shapes
/// `access.<rid>`, `get.<rid>`, `call.<rid>.<method>` or `auth.<rid>.<method>`.
pub fn parse_inbound(subject: &str) -> Option<Inbound> {
    let (prefix, rest) = subject.split_once('.')?;
    let kind = match prefix {
        "access" => RequestKind::Access,
        "get" => RequestKind::Get,
        "call" => RequestKind::Call,
        "auth" => RequestKind::Auth,
        _ => return None,
    };

    match kind {
        RequestKind::Access | RequestKind::Get => {
            if !is_valid_rid(rest, false) {
                return None;
            }
            Some(Inbound {
                kind,
                rid: rest.to_string(),
                method: None,
            })
        }
        RequestKind::Call | RequestKind::Auth => {
            let (rid, method) = rest.rsplit_once('.')?;
            if !is_valid_rid(rid, false) || !is_valid_token(method) {
                return None;
            }
            Some(Inbound {
                kind,
                rid: rid.to_string(),
                method: Some(method.to_string()),
            })
        }
    }
}

/// Build the event subject for a resource and event name.
pub fn event_subject(rid: &str, event: &str) -> String {
    format!("event.{}.{}", rid, event)
}

/// Split a resource ID into its name and optional query part.
pub fn split_query(rid: &str) -> (&str, Option<&str>) {
    match rid.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (rid, None),
    }
}

/// Whether `s` is a single valid name token: non-empty and restricted to
/// `[A-Za-z0-9_-]`.
pub fn is_valid_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Whether `s` is a valid resource ID. With `allow_query`, a `?query` suffix
/// is accepted and ignored; the query itself may contain any characters.
pub fn is_valid_rid(s: &str, allow_query: bool) -> bool {
    let name = if allow_query { split_query(s).0 } else { s };
    !name.is_empty() && name.split('.').all(is_valid_token)
}

/// Whether `s` is a valid custom event name.
pub fn is_valid_event_name(s: &str) -> bool {
    is_valid_token(s)
}

/// Whether `s` is a valid connection ID.
pub fn is_valid_cid(s: &str) -> bool {
    is_valid_token(s)
}

/// Whether `s` is a valid service name: a dot-separated token sequence.
pub fn is_valid_service_name(s: &str) -> bool {
    is_valid_rid(s, false)
}

/// Whether a subscription `pattern` (with `*` and `>` wildcards) matches a
/// concrete subject.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pt = pattern.split('.');
    let mut st = subject.split('.');
    loop {
        match (pt.next(), st.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
