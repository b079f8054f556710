//! Scene elements and the ordered scene they live in.
//!
//! Only the identity and versioning fields are typed; everything else an
//! element carries (geometry, style, text) rides along untouched in
//! [`Element::extra`].
//!
//! Both types validate themselves while deserializing, so any scene that
//! reaches the reconciler has non-empty unique ids and well-formed order
//! keys.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fractional;

/// Opaque element identifier, unique within a scene.
pub type ElementId = String;

/// Identifier of a binary file attached to an image element.
pub type FileId = String;

/// Upload state of an image element's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Saved,
    Error,
}

// ─── Element ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawElement", rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    /// Incremented on every local mutation.
    pub version: u64,
    /// Random per mutation. Only used to break version ties.
    pub version_nonce: u32,
    pub is_deleted: bool,
    /// Milliseconds since the epoch of the last mutation. Advisory only.
    pub updated: u64,
    /// Fractional order key, see [`crate::fractional`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Wire shape of an element before validation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawElement {
    id: String,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    version_nonce: u32,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    updated: u64,
    #[serde(default)]
    index: Option<String>,
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    status: Option<FileStatus>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Validation failures for elements and scenes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    EmptyId,
    InvalidIndex { id: ElementId, index: String },
    DuplicateId(ElementId),
}

impl fmt::Display for SceneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneError::EmptyId => write!(f, "element with empty id"),
            SceneError::InvalidIndex { id, index } => {
                write!(f, "element {id} has invalid order key {index:?}")
            }
            SceneError::DuplicateId(id) => write!(f, "duplicate element id {id}"),
        }
    }
}

impl std::error::Error for SceneError {}

impl TryFrom<RawElement> for Element {
    type Error = SceneError;

    fn try_from(raw: RawElement) -> Result<Self, Self::Error> {
        if raw.id.is_empty() {
            return Err(SceneError::EmptyId);
        }
        if let Some(index) = &raw.index {
            if !fractional::is_valid_key(index) {
                return Err(SceneError::InvalidIndex {
                    id: raw.id,
                    index: index.clone(),
                });
            }
        }
        Ok(Element {
            id: raw.id,
            version: raw.version,
            version_nonce: raw.version_nonce,
            is_deleted: raw.is_deleted,
            updated: raw.updated,
            index: raw.index,
            file_id: raw.file_id,
            status: raw.status,
            extra: raw.extra,
        })
    }
}

impl Element {
    /// A fresh element at version 1 with no order key yet.
    pub fn new(id: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            version_nonce: random_nonce(),
            is_deleted: false,
            updated: now_millis(),
            index: None,
            file_id: None,
            status: None,
            extra: Map::new(),
        }
    }

    /// An image element referencing `file_id`, waiting for upload.
    pub fn image(id: impl Into<ElementId>, file_id: impl Into<FileId>) -> Self {
        let mut element = Self::new(id);
        element.file_id = Some(file_id.into());
        element.status = Some(FileStatus::Pending);
        element
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Record a local mutation: new version, new nonce, new timestamp.
    pub fn bump(&mut self) {
        self.version += 1;
        self.version_nonce = random_nonce();
        self.updated = now_millis();
    }

    pub fn is_image(&self) -> bool {
        self.file_id.is_some()
    }

    /// Deleted elements are synced only for `tombstone_ttl` after deletion.
    pub fn is_syncable(&self, now_ms: u64, tombstone_ttl: Duration) -> bool {
        if self.is_deleted {
            self.updated > now_ms.saturating_sub(tombstone_ttl.as_millis() as u64)
        } else {
            true
        }
    }

    pub(crate) fn order_key(&self) -> (&str, &str) {
        (self.index.as_deref().unwrap_or(""), self.id.as_str())
    }
}

// ─── Scene ──────────────────────────────────────────────────────────────────

/// Elements in rendering order. Ids are unique and every element has an
/// order key; the vector is sorted by `(index, id)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Element>", into = "Vec<Element>")]
pub struct Scene {
    elements: Vec<Element>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scene from elements in the intended rendering order.
    ///
    /// Elements whose key is missing or out of order get a new key between
    /// their neighbours, so the resulting order is exactly the given one.
    pub fn from_ordered(mut elements: Vec<Element>) -> Result<Self, SceneError> {
        let mut seen = HashSet::with_capacity(elements.len());
        for element in &elements {
            if element.id.is_empty() {
                return Err(SceneError::EmptyId);
            }
            if !seen.insert(element.id.as_str()) {
                return Err(SceneError::DuplicateId(element.id.clone()));
            }
        }

        // Equal keys are fine as long as ids ascend: merged concurrent
        // appends look like that.
        let mut prev: Option<(String, String)> = None;
        for i in 0..elements.len() {
            let in_order = match (elements[i].index.as_deref(), &prev) {
                (Some(key), Some((pk, pid))) => (key, elements[i].id.as_str()) > (pk.as_str(), pid.as_str()),
                (Some(_), None) => true,
                (None, _) => false,
            };
            let prev_key = prev.as_ref().map(|(k, _)| k.as_str());
            if !in_order {
                let upper = elements[i + 1..]
                    .iter()
                    .filter_map(|e| e.index.as_deref())
                    .find(|k| prev_key.map_or(true, |p| *k > p))
                    .map(str::to_owned);
                elements[i].index = Some(fractional::key_between(prev_key, upper.as_deref()));
            }
            let key = elements[i].index.clone().unwrap_or_default();
            prev = Some((key, elements[i].id.clone()));
        }
        Ok(Self { elements })
    }

    /// Wrap elements that already satisfy the scene invariants.
    pub(crate) fn from_sorted(elements: Vec<Element>) -> Self {
        debug_assert!(elements.windows(2).all(|w| w[0].order_key() < w[1].order_key()));
        Self { elements }
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Element> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Non-deleted elements.
    pub fn visible(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| !e.is_deleted)
    }

    pub fn into_elements(self) -> Vec<Element> {
        self.elements
    }

    /// Append on top of the stack.
    pub fn push(&mut self, element: Element) -> Result<(), SceneError> {
        self.insert_at(self.elements.len(), element)
    }

    /// Insert at `position` in rendering order, keying between neighbours.
    ///
    /// Neighbours may share a key after concurrent appends were merged. A
    /// position inside such a run cannot be keyed, so the element goes
    /// right after the run instead.
    pub fn insert_at(&mut self, position: usize, mut element: Element) -> Result<(), SceneError> {
        if element.id.is_empty() {
            return Err(SceneError::EmptyId);
        }
        if self.contains(&element.id) {
            return Err(SceneError::DuplicateId(element.id));
        }
        let position = position.min(self.elements.len());
        let before = position
            .checked_sub(1)
            .and_then(|i| self.elements[i].index.as_deref());
        let after = self.elements[position..]
            .iter()
            .filter_map(|e| e.index.as_deref())
            .find(|k| before.map_or(true, |b| *k > b));
        element.index = Some(fractional::key_between(before, after));
        let at = self
            .elements
            .partition_point(|e| e.order_key() < element.order_key());
        self.elements.insert(at, element);
        Ok(())
    }

    /// Apply a local edit to one element and bump its version.
    ///
    /// Returns `false` if no element has that id.
    pub fn mutate(&mut self, id: &str, edit: impl FnOnce(&mut Element)) -> bool {
        let Some(element) = self.elements.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        let id = element.id.clone();
        let index = element.index.clone();
        edit(element);
        element.id = id;
        if element
            .index
            .as_deref()
            .map_or(true, |k| !fractional::is_valid_key(k))
        {
            element.index = index;
        }
        element.bump();
        self.elements.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        true
    }

    /// Soft delete. The tombstone stays in the scene.
    pub fn delete(&mut self, id: &str) -> bool {
        self.mutate(id, |e| e.is_deleted = true)
    }

    /// Elements that should be sent to peers and storage.
    pub fn syncable(&self, now_ms: u64, tombstone_ttl: Duration) -> Scene {
        Scene {
            elements: self
                .elements
                .iter()
                .filter(|e| e.is_syncable(now_ms, tombstone_ttl))
                .cloned()
                .collect(),
        }
    }
}

impl TryFrom<Vec<Element>> for Scene {
    type Error = SceneError;

    fn try_from(elements: Vec<Element>) -> Result<Self, Self::Error> {
        Scene::from_ordered(elements)
    }
}

impl From<Scene> for Vec<Element> {
    fn from(scene: Scene) -> Self {
        scene.elements
    }
}

impl<'a> IntoIterator for &'a Scene {
    type Item = &'a Element;
    type IntoIter = std::slice::Iter<'a, Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn random_nonce() -> u32 {
    OsRng.next_u32()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(scene: &Scene) -> Vec<&str> {
        scene.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_deserialize_keeps_opaque_fields() {
        let raw = json!({
            "id": "rect-1",
            "version": 3,
            "versionNonce": 42,
            "isDeleted": false,
            "updated": 1700000000000u64,
            "index": "a1",
            "type": "rectangle",
            "x": 10.5,
            "strokeColor": "#000"
        });
        let element: Element = serde_json::from_value(raw).unwrap();
        assert_eq!(element.version, 3);
        assert_eq!(element.version_nonce, 42);
        assert_eq!(element.extra["type"], "rectangle");
        assert_eq!(element.extra["x"], 10.5);

        let back = serde_json::to_value(&element).unwrap();
        assert_eq!(back["strokeColor"], "#000");
        assert_eq!(back["versionNonce"], 42);
    }

    #[test]
    fn test_reject_empty_id() {
        let err = serde_json::from_value::<Element>(json!({"id": "", "version": 1}));
        assert!(err.is_err());
    }

    #[test]
    fn test_reject_bad_index() {
        let err = serde_json::from_value::<Element>(json!({"id": "a", "index": "a0"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_scene_rejects_duplicates() {
        let err = serde_json::from_value::<Scene>(json!([{"id": "a"}, {"id": "a"}]));
        assert!(err.is_err());
    }

    #[test]
    fn test_from_ordered_assigns_missing_keys() {
        let scene = Scene::from_ordered(vec![
            Element::new("a"),
            Element::new("b"),
            Element::new("c"),
        ])
        .unwrap();
        assert_eq!(ids(&scene), ["a", "b", "c"]);
        let keys: Vec<_> = scene.iter().map(|e| e.index.clone().unwrap()).collect();
        assert!(keys[0] < keys[1] && keys[1] < keys[2]);
    }

    #[test]
    fn test_from_ordered_repairs_out_of_order_keys() {
        let mut a = Element::new("a");
        a.index = Some("b".into());
        let mut b = Element::new("b");
        b.index = Some("a".into());
        let mut c = Element::new("c");
        c.index = Some("c".into());

        let scene = Scene::from_ordered(vec![a, b, c]).unwrap();
        assert_eq!(ids(&scene), ["a", "b", "c"]);
        assert_eq!(scene.get("a").unwrap().index.as_deref(), Some("b"));
        assert_eq!(scene.get("c").unwrap().index.as_deref(), Some("c"));
        let b_key = scene.get("b").unwrap().index.clone().unwrap();
        assert!("b" < b_key.as_str() && b_key.as_str() < "c");
    }

    #[test]
    fn test_insert_at_between_neighbours() {
        let mut scene = Scene::new();
        scene.push(Element::new("a")).unwrap();
        scene.push(Element::new("c")).unwrap();
        scene.insert_at(1, Element::new("b")).unwrap();
        assert_eq!(ids(&scene), ["a", "b", "c"]);
        assert!(scene.push(Element::new("a")).is_err());
    }

    #[test]
    fn test_insert_into_equal_key_run() {
        let mut left = Scene::new();
        left.push(Element::new("a")).unwrap();
        let mut right = Scene::new();
        right.push(Element::new("b")).unwrap();
        let mut merged = crate::reconcile::reconcile(&left, &right);
        assert_eq!(ids(&merged), ["a", "b"]);
        assert_eq!(merged.get("a").unwrap().index, merged.get("b").unwrap().index);

        merged.insert_at(1, Element::new("c")).unwrap();
        merged.insert_at(0, Element::new("z")).unwrap();
        assert_eq!(ids(&merged), ["z", "a", "b", "c"]);
        for pair in merged.elements().windows(2) {
            assert!(pair[0].order_key() < pair[1].order_key());
        }
    }

    #[test]
    fn test_from_ordered_keeps_equal_keys_with_ascending_ids() {
        let mut a = Element::new("a");
        a.index = Some("V".into());
        let mut b = Element::new("b");
        b.index = Some("V".into());
        let scene = Scene::from_ordered(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(scene.get("b").unwrap().index.as_deref(), Some("V"));

        // Same keys, descending ids: the second one is rekeyed
        let scene = Scene::from_ordered(vec![b, a]).unwrap();
        assert_eq!(ids(&scene), ["b", "a"]);
        assert!(scene.get("a").unwrap().index.as_deref() > Some("V"));
    }

    #[test]
    fn test_mutate_bumps_version() {
        let mut scene = Scene::new();
        scene.push(Element::new("a")).unwrap();
        assert!(scene.mutate("a", |e| {
            e.extra.insert("x".into(), json!(5));
        }));
        let a = scene.get("a").unwrap();
        assert_eq!(a.version, 2);
        assert_eq!(a.extra["x"], 5);
        assert!(!scene.mutate("missing", |_| {}));
    }

    #[test]
    fn test_delete_keeps_tombstone() {
        let mut scene = Scene::new();
        scene.push(Element::new("a")).unwrap();
        scene.delete("a");
        assert_eq!(scene.len(), 1);
        assert!(scene.get("a").unwrap().is_deleted);
        assert_eq!(scene.visible().count(), 0);
    }

    #[test]
    fn test_syncable_drops_old_tombstones() {
        let ttl = Duration::from_secs(24 * 60 * 60);
        let now = now_millis();
        let mut old = Element::new("old");
        old.is_deleted = true;
        old.updated = now - ttl.as_millis() as u64 - 1;
        let mut recent = Element::new("recent");
        recent.is_deleted = true;
        let live = Element::new("live");

        let scene = Scene::from_ordered(vec![old, recent, live]).unwrap();
        let syncable = scene.syncable(now, ttl);
        assert_eq!(ids(&syncable), ["recent", "live"]);
    }
}
