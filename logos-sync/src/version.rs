//! Scene version and the broadcast watermark.
//!
//! The watermark remembers the highest scene version this peer has either
//! broadcast or received. A local change is only broadcast when it pushes
//! the version past the watermark, which is what stops a received update
//! from being echoed straight back to the room.

use crate::element::Scene;

/// Sum of element versions, tombstones included.
pub fn scene_version(scene: &Scene) -> u64 {
    scene
        .iter()
        .fold(0u64, |acc, e| acc.saturating_add(e.version))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    last: Option<u64>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<u64> {
        self.last
    }

    /// True when `version` is newer than anything sent or received.
    pub fn should_broadcast(&self, version: u64) -> bool {
        self.last.map_or(true, |last| version > last)
    }

    pub fn set(&mut self, version: u64) {
        self.last = Some(version);
    }

    /// Never lowers the watermark.
    pub fn raise(&mut self, version: u64) {
        self.last = Some(self.last.map_or(version, |last| last.max(version)));
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;

    #[test]
    fn test_scene_version_counts_tombstones() {
        let mut scene = Scene::new();
        scene.push(Element::new("a")).unwrap();
        scene.push(Element::new("b")).unwrap();
        assert_eq!(scene_version(&scene), 2);
        scene.delete("a");
        assert_eq!(scene_version(&scene), 3);
    }

    #[test]
    fn test_local_edit_increases_version() {
        let mut scene = Scene::new();
        scene.push(Element::new("a")).unwrap();
        let before = scene_version(&scene);
        scene.mutate("a", |_| {});
        assert!(scene_version(&scene) > before);
    }

    #[test]
    fn test_watermark_gate() {
        let mut mark = Watermark::new();
        assert!(mark.should_broadcast(0));
        mark.set(10);
        assert!(!mark.should_broadcast(10));
        assert!(!mark.should_broadcast(9));
        assert!(mark.should_broadcast(11));
    }

    #[test]
    fn test_raise_is_monotonic() {
        let mut mark = Watermark::new();
        mark.raise(5);
        mark.raise(3);
        assert_eq!(mark.get(), Some(5));
        mark.raise(8);
        assert_eq!(mark.get(), Some(8));
    }

    #[test]
    fn test_reset() {
        let mut mark = Watermark::new();
        mark.set(4);
        mark.reset();
        assert_eq!(mark.get(), None);
        assert!(mark.should_broadcast(0));
    }
}
