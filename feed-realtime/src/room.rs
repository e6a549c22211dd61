//! Canonical room identifiers.
//!
//! A canonical id is the single key used for transport-level room
//! membership and for message-store queries:
//!
//! ```text
//! { type: group,  id: "lobby" }  ──►  "lobby"
//! { type: single, id: "u2" } by u1  ──►  "u1:u2"
//! { type: single, id: "u1" } by u2  ──►  "u1:u2"
//! ```

use crate::protocol::{RoomDescriptor, RoomKind};

/// Separator between the two participants of a direct room. Descriptor
/// ids never contain it, so group and direct keys stay disjoint.
pub const ROOM_SEPARATOR: char = ':';

/// Resolve a descriptor into its canonical room id.
///
/// Direct rooms sort the two user ids by byte order, so both participants
/// compute the same id without coordinating. Callers validate the
/// descriptor before resolving.
pub fn resolve(descriptor: &RoomDescriptor, requesting_user_id: &str) -> String {
    match descriptor.kind {
        RoomKind::Group => descriptor.id.clone(),
        RoomKind::Single => {
            let (low, high) = if requesting_user_id <= descriptor.id.as_str() {
                (requesting_user_id, descriptor.id.as_str())
            } else {
                (descriptor.id.as_str(), requesting_user_id)
            };
            let mut key = String::with_capacity(low.len() + high.len() + 1);
            key.push_str(low);
            key.push(ROOM_SEPARATOR);
            key.push_str(high);
            key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_is_verbatim() {
        let room = RoomDescriptor::group("Lobby General");
        assert_eq!(resolve(&room, "u1"), "Lobby General");
        assert_eq!(resolve(&room, "zz"), "Lobby General");
    }

    #[test]
    fn test_single_is_symmetric() {
        let pairs = [
            ("u1", "u2"),
            ("b", "a"),
            ("alice", "Alice"),
            ("10", "9"),
            ("ä", "z"),
            ("same", "same"),
        ];
        for (a, b) in pairs {
            assert_eq!(
                resolve(&RoomDescriptor::single(b), a),
                resolve(&RoomDescriptor::single(a), b),
                "pair ({a}, {b})"
            );
        }
    }

    #[test]
    fn test_single_sorts_bytewise() {
        // Byte order, not locale order: uppercase sorts before lowercase
        // and "10" before "9".
        assert_eq!(resolve(&RoomDescriptor::single("alice"), "Bob"), "Bob:alice");
        assert_eq!(resolve(&RoomDescriptor::single("9"), "10"), "10:9");
        assert_eq!(resolve(&RoomDescriptor::single("z"), "ä"), "z:ä");
    }

    #[test]
    fn test_single_is_deterministic() {
        let room = RoomDescriptor::single("0190-peer");
        let first = resolve(&room, "0190-self");
        for _ in 0..100 {
            assert_eq!(resolve(&room, "0190-self"), first);
        }
    }
}
