//! Chat identity normalization.
//!
//! Brazilian mobile numbers used to have 8-digit subscriber numbers and were later promoted
//! to 9 digits by prefixing a `9`. Chats may be stored under either form, so lookups have to
//! try both before deciding a chat is new.

use std::fmt;

pub const COUNTRY_PREFIX: &str = "55";

/// Identity used when an event carries no recognizable participant.
pub const UNKNOWN_CHAT: &str = "unknown_chat";

/// Country code plus area code.
const AREA_PREFIX_LEN: usize = 4;
const LEGACY_SUBSCRIBER_LEN: usize = 8;

/// Canonical `<number>@<domain>` identity of a chat, as used in cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatKey(String);

impl ChatKey {
    /// Wraps an identity verbatim, without normalizing it.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `@`, or the whole identity when there is no domain.
    pub fn number(&self) -> &str {
        self.0.split('@').next().unwrap_or_default()
    }
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChatKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns the localpart split as (area prefix, subscriber) when it is a Brazilian number.
fn brazilian_parts(localpart: &str) -> Option<(&str, &str)> {
    let qualifies = localpart.starts_with(COUNTRY_PREFIX)
        && localpart.len() > AREA_PREFIX_LEN
        && localpart.bytes().all(|b| b.is_ascii_digit());
    qualifies.then(|| localpart.split_at(AREA_PREFIX_LEN))
}

/// Maps a raw participant identity to its canonical key.
///
/// Only `55`-prefixed localparts with an 8-digit subscriber number are rewritten (a `9` is
/// inserted after the area code). Anything else passes through unchanged.
///
/// Stricter than a plain prefix check: localparts containing non-digit characters never qualify.
pub fn normalize(raw: &str) -> ChatKey {
    let Some((localpart, domain)) = raw.split_once('@') else {
        return ChatKey::new(raw);
    };
    match brazilian_parts(localpart) {
        Some((area, subscriber)) if subscriber.len() == LEGACY_SUBSCRIBER_LEN => {
            ChatKey(format!("{area}9{subscriber}@{domain}"))
        }
        _ => ChatKey::new(raw),
    }
}

/// Every key a chat for `raw` may be stored under: the identity as given, followed by its
/// normalized form when that differs.
pub fn alternate_forms(raw: &str) -> Vec<ChatKey> {
    let original = ChatKey::new(raw);
    let normalized = normalize(raw);
    if normalized == original {
        vec![original]
    } else {
        vec![original, normalized]
    }
}

/// The pre-promotion 8-digit key of a modern `55` mobile number, i.e. `raw` with the leading
/// `9` of its 9-digit subscriber number dropped. `None` for any other identity.
pub fn legacy_form(raw: &str) -> Option<ChatKey> {
    let (localpart, domain) = raw.split_once('@')?;
    let (area, subscriber) = brazilian_parts(localpart)?;
    let legacy = subscriber
        .strip_prefix('9')
        .filter(|rest| rest.len() == LEGACY_SUBSCRIBER_LEN)?;
    Some(ChatKey(format!("{area}{legacy}@{domain}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_number_gets_ninth_digit() {
        assert_eq!(
            normalize("551187654321@c.us").as_str(),
            "5511987654321@c.us"
        );
    }

    #[test]
    fn test_modern_number_is_unchanged() {
        assert_eq!(
            normalize("5511987654321@c.us").as_str(),
            "5511987654321@c.us"
        );
        // nine digits not starting with 9 are left alone too
        assert_eq!(
            normalize("5511387654321@s.whatsapp.net").as_str(),
            "5511387654321@s.whatsapp.net"
        );
    }

    #[test]
    fn test_normalizing_twice_is_stable() {
        let once = normalize("551187654321@c.us");
        assert_eq!(normalize(once.as_str()), once);
    }

    #[test]
    fn test_other_identities_pass_through() {
        for raw in [
            "14155550123@c.us",
            "5511@c.us",
            "551187654321",
            "55118765432@c.us",
            "120363025@g.us",
            "55ab87654321@c.us",
            UNKNOWN_CHAT,
            "",
        ] {
            assert_eq!(normalize(raw).as_str(), raw, "{raw}");
        }
    }

    #[test]
    fn test_alternate_forms_lists_original_first() {
        let forms = alternate_forms("551187654321@c.us");
        assert_eq!(
            forms,
            vec![
                ChatKey::new("551187654321@c.us"),
                ChatKey::new("5511987654321@c.us")
            ]
        );
    }

    #[test]
    fn test_alternate_forms_of_canonical_key_is_itself() {
        assert_eq!(
            alternate_forms("5511987654321@c.us"),
            vec![ChatKey::new("5511987654321@c.us")]
        );
        assert_eq!(alternate_forms(UNKNOWN_CHAT), vec![ChatKey::new(UNKNOWN_CHAT)]);
    }

    #[test]
    fn test_legacy_form_drops_ninth_digit() {
        assert_eq!(
            legacy_form("5511987654321@c.us"),
            Some(ChatKey::new("551187654321@c.us"))
        );
        let legacy = legacy_form("5511987654321@c.us").unwrap();
        assert_eq!(normalize(legacy.as_str()).as_str(), "5511987654321@c.us");
    }

    #[test]
    fn test_legacy_form_only_for_modern_mobile_numbers() {
        for raw in [
            "551187654321@c.us",
            "5511387654321@c.us",
            "14155550123@c.us",
            "5511987654321",
            UNKNOWN_CHAT,
        ] {
            assert_eq!(legacy_form(raw), None, "{raw}");
        }
    }

    #[test]
    fn test_number_strips_domain() {
        assert_eq!(ChatKey::new("5511987654321@c.us").number(), "5511987654321");
        assert_eq!(ChatKey::new(UNKNOWN_CHAT).number(), UNKNOWN_CHAT);
    }
}
