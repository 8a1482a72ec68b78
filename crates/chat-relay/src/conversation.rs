//! Conversation identity.
//!
//! Clients that already hold a conversation id send it back as `csid`; when
//! they don't, the gateway mints one from the current epoch millis in base 36
//! and hands it back in the `Conversation-ID` response header.

use chrono::Utc;
use std::fmt;

pub const CONVERSATION_ID_HEADER: &str = "Conversation-ID";

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque conversation identifier. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConversation {
    pub id: ConversationId,
    pub is_new: bool,
}

impl ResolvedConversation {
    /// Header announcing a freshly minted id; `None` for client-supplied ids.
    pub fn header(&self) -> Option<(&'static str, String)> {
        self.is_new
            .then(|| (CONVERSATION_ID_HEADER, self.id.as_str().to_string()))
    }
}

/// Accept the client's id when it is non-empty, otherwise mint a new one.
pub fn resolve(existing: Option<&str>) -> ResolvedConversation {
    resolve_at(existing, Utc::now().timestamp_millis())
}

fn resolve_at(existing: Option<&str>, now_millis: i64) -> ResolvedConversation {
    match existing.filter(|id| !id.is_empty()) {
        Some(id) => ResolvedConversation {
            id: ConversationId(id.to_string()),
            is_new: false,
        },
        None => ResolvedConversation {
            id: ConversationId(encode_base36(now_millis.max(0) as u64)),
            is_new: true,
        },
    }
}

/// Lowercase base-36 rendering of `value`.
pub fn encode_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    // Every byte comes from BASE36_DIGITS, which is ASCII.
    digits.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_base36(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
    }

    #[test]
    fn existing_id_is_kept() {
        let resolved = resolve(Some("lq0z3k1a"));
        assert_eq!(resolved.id.as_str(), "lq0z3k1a");
        assert!(!resolved.is_new);
        assert_eq!(resolved.header(), None);
    }

    #[test]
    fn missing_or_empty_id_is_minted() {
        for input in [None, Some("")] {
            let resolved = resolve(input);
            assert!(resolved.is_new);
            assert!(is_base36(resolved.id.as_str()), "{}", resolved.id);
            let (name, value) = resolved.header().unwrap();
            assert_eq!(name, CONVERSATION_ID_HEADER);
            assert_eq!(value, resolved.id.as_str());
        }
    }

    #[test]
    fn minted_id_encodes_timestamp() {
        let resolved = resolve_at(None, 1_700_000_000_000);
        assert_eq!(resolved.id.as_str(), "loyw3v28");
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(encode_base36(0), "0");
        assert_eq!(encode_base36(35), "z");
        assert_eq!(encode_base36(36), "10");
        assert_eq!(encode_base36(46_655), "zzz");
        assert_eq!(
            u64::from_str_radix(&encode_base36(1_697_500_000_123), 36).unwrap(),
            1_697_500_000_123
        );
    }
}
