//! Rooms and shareable room links.
//!
//! A link has the form `<base>#room=<roomId>,<roomKey>`. The key lives in
//! the URL fragment so it is never sent to any server.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;

use crate::crypto::RoomKey;

pub type RoomId = String;

const ROOM_ID_BYTES: usize = 10;
const LINK_MARKER: &str = "#room=";

/// Identity and key of a collaboration room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLinkData {
    pub room_id: RoomId,
    pub room_key: RoomKey,
}

impl RoomLinkData {
    pub fn new(room_id: impl Into<RoomId>, room_key: RoomKey) -> Self {
        Self {
            room_id: room_id.into(),
            room_key,
        }
    }

    /// Random room id and a fresh key.
    pub fn generate() -> Self {
        Self::new(generate_room_id(), RoomKey::generate())
    }

    pub fn to_link(&self, base_url: &str) -> String {
        let base = base_url.split('#').next().unwrap_or(base_url);
        format!("{base}{LINK_MARKER}{},{}", self.room_id, self.room_key.to_base64())
    }

    /// Extract room data from a link. `None` if the link is not a room link.
    pub fn parse_link(link: &str) -> Option<Self> {
        let start = link.find(LINK_MARKER)? + LINK_MARKER.len();
        let fragment = &link[start..];
        let (room_id, rest) = fragment.split_once(',')?;
        let key_text: &str = rest
            .split(|c: char| !is_link_char(c))
            .next()
            .unwrap_or_default();
        if room_id.is_empty() || !room_id.chars().all(is_link_char) {
            return None;
        }
        let room_key = RoomKey::from_base64(key_text).ok()?;
        Some(Self::new(room_id, room_key))
    }
}

fn is_link_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// 20 lowercase hex characters.
pub fn generate_room_id() -> RoomId {
    let mut bytes = [0u8; ROOM_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

const FOLLOW_PREFIX: &str = "follow@";

/// Room that followers of `socket_id` join to receive its viewport.
pub fn follow_room_id(socket_id: &str) -> RoomId {
    format!("{FOLLOW_PREFIX}{socket_id}")
}

pub fn is_follow_room(room_id: &str) -> bool {
    room_id.starts_with(FOLLOW_PREFIX)
}

/// The socket a follow room belongs to.
pub fn followed_socket(room_id: &str) -> Option<&str> {
    room_id.strip_prefix(FOLLOW_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_room_id() {
        let id = generate_room_id();
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_room_id());
    }

    #[test]
    fn test_link_roundtrip() {
        let data = RoomLinkData::generate();
        let link = data.to_link("https://draw.example.com/");
        assert!(link.starts_with("https://draw.example.com/#room="));
        assert_eq!(RoomLinkData::parse_link(&link), Some(data));
    }

    #[test]
    fn test_link_replaces_existing_fragment() {
        let data = RoomLinkData::generate();
        let link = data.to_link("https://draw.example.com/#json=abc");
        assert_eq!(link.matches('#').count(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RoomLinkData::parse_link("https://draw.example.com/").is_none());
        assert!(RoomLinkData::parse_link("https://x/#room=abc").is_none());
        assert!(RoomLinkData::parse_link("https://x/#room=abc,notakey").is_none());
        assert!(RoomLinkData::parse_link("https://x/#room=,AAAAAAAAAAAAAAAAAAAAAA").is_none());
    }

    #[test]
    fn test_follow_rooms() {
        assert_eq!(follow_room_id("s1"), "follow@s1");
        assert!(is_follow_room("follow@s1"));
        assert!(!is_follow_room("abc"));
        assert_eq!(followed_socket("follow@s1"), Some("s1"));
        assert_eq!(followed_socket("abc"), None);
    }
}
