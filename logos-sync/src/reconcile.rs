//! Conflict-free merge of a remote scene into the local one.
//!
//! ```text
//!   local  ──┐
//!            ├─► union by id ─► per-id winner ─► sort by (index, id) ─► merged
//!   remote ──┘
//! ```
//!
//! Per id the winner is the copy with the higher `version`; on a tie the
//! higher `versionNonce`; then a tombstone beats a live copy. Identical
//! edits keep the local copy. Because the winner only depends on the pair and
//! the output order only depends on the winners, merging is idempotent and
//! every peer that has seen the same set of edits ends up with the same
//! scene regardless of arrival order.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::element::{Element, Scene};

/// Merge `remote` into `local`. Pure and total.
pub fn reconcile(local: &Scene, remote: &Scene) -> Scene {
    let mut winners: HashMap<&str, &Element> = HashMap::with_capacity(local.len() + remote.len());
    for element in local {
        winners.insert(element.id.as_str(), element);
    }
    for element in remote {
        match winners.get(element.id.as_str()) {
            Some(current) if !supersedes(element, current) => {}
            _ => {
                winners.insert(element.id.as_str(), element);
            }
        }
    }

    let mut merged: Vec<Element> = winners.into_values().cloned().collect();
    merged.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    Scene::from_sorted(merged)
}

/// Whether `candidate` beats `current` for the same element id.
pub fn supersedes(candidate: &Element, current: &Element) -> bool {
    compare_edits(candidate, current) == Ordering::Greater
}

/// Total order over two copies of one element.
///
/// Copies that agree on version, nonce and deletion are the same edit in
/// practice; the trailing comparisons only make the order total so that two
/// peers never pick different winners.
pub fn compare_edits(a: &Element, b: &Element) -> Ordering {
    a.version
        .cmp(&b.version)
        .then(a.version_nonce.cmp(&b.version_nonce))
        .then(a.is_deleted.cmp(&b.is_deleted))
        .then(a.updated.cmp(&b.updated))
        .then_with(|| a.index.cmp(&b.index))
        .then_with(|| fingerprint(a).cmp(&fingerprint(b)))
}

fn fingerprint(element: &Element) -> String {
    serde_json::to_string(element).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(id: &str, index: &str, version: u64, nonce: u32, deleted: bool) -> Element {
        let mut e = Element::new(id);
        e.index = Some(index.to_string());
        e.version = version;
        e.version_nonce = nonce;
        e.is_deleted = deleted;
        e.updated = 1_000;
        e
    }

    fn scene(elements: Vec<Element>) -> Scene {
        Scene::from_ordered(elements).unwrap()
    }

    fn ids(scene: &Scene) -> Vec<&str> {
        scene.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_nonce_tie_break_to_tombstone() {
        let local = scene(vec![el("x", "a", 5, 100, false)]);
        let remote = scene(vec![el("x", "a", 5, 200, true)]);
        let merged = reconcile(&local, &remote);
        let x = merged.get("x").unwrap();
        assert!(x.is_deleted);
        assert_eq!(x.version_nonce, 200);
    }

    #[test]
    fn test_higher_version_wins_either_order() {
        let v6 = scene(vec![el("y", "a", 6, 1, false)]);
        let v7 = scene(vec![el("y", "a", 7, 1, false)]);
        assert_eq!(reconcile(&v6, &v7).get("y").unwrap().version, 7);
        assert_eq!(reconcile(&v7, &v6).get("y").unwrap().version, 7);
    }

    #[test]
    fn test_tombstone_beats_live_on_full_tie() {
        let live = scene(vec![el("z", "a", 3, 9, false)]);
        let dead = scene(vec![el("z", "a", 3, 9, true)]);
        assert!(reconcile(&live, &dead).get("z").unwrap().is_deleted);
        assert!(reconcile(&dead, &live).get("z").unwrap().is_deleted);
    }

    #[test]
    fn test_stale_live_copy_cannot_resurrect() {
        let local = scene(vec![el("d", "a", 4, 1, true)]);
        let remote = scene(vec![el("d", "a", 3, 999, false)]);
        assert!(reconcile(&local, &remote).get("d").unwrap().is_deleted);
    }

    #[test]
    fn test_union_and_order() {
        let local = scene(vec![el("a", "a", 1, 1, false), el("c", "c", 1, 1, false)]);
        let remote = scene(vec![el("b", "b", 1, 1, false), el("d", "d", 1, 1, false)]);
        let merged = reconcile(&local, &remote);
        assert_eq!(ids(&merged), ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_winner_brings_its_position() {
        let local = scene(vec![el("a", "a", 1, 1, false), el("b", "b", 1, 1, false)]);
        let remote = scene(vec![el("b", "Z", 2, 1, false), el("a", "a", 1, 1, false)]);
        let merged = reconcile(&local, &remote);
        assert_eq!(ids(&merged), ["b", "a"]);
    }

    #[test]
    fn test_equal_keys_ordered_by_id() {
        let local = scene(vec![el("q", "V", 1, 1, false)]);
        let remote = scene(vec![el("p", "V", 1, 1, false)]);
        assert_eq!(ids(&reconcile(&local, &remote)), ["p", "q"]);
        assert_eq!(ids(&reconcile(&remote, &local)), ["p", "q"]);
    }

    #[test]
    fn test_idempotent() {
        let local = scene(vec![el("a", "a", 2, 5, false), el("b", "b", 1, 1, false)]);
        let remote = scene(vec![el("a", "a", 2, 7, false), el("c", "c", 1, 1, true)]);
        let once = reconcile(&local, &remote);
        let twice = reconcile(&once, &remote);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_sides() {
        let s = scene(vec![el("a", "a", 1, 1, false)]);
        assert_eq!(reconcile(&Scene::new(), &s), s);
        assert_eq!(reconcile(&s, &Scene::new()), s);
    }
}
