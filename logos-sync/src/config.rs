//! Coordinator timing and limits.

use std::time::Duration;

/// Session configuration for [`crate::collab::Collab`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL room links are built on
    pub base_url: String,
    /// How long to wait for a peer's SCENE_INIT before loading from storage
    pub initial_scene_timeout: Duration,
    /// Period of the full-scene anti-entropy broadcast
    pub full_sync_interval: Duration,
    /// Minimum spacing of incremental broadcasts (zero = every change)
    pub min_broadcast_interval: Duration,
    /// Trailing throttle for persisting the scene
    pub save_interval: Duration,
    /// Pointer broadcast throttle (~30 fps)
    pub cursor_sync_interval: Duration,
    /// No pointer activity for this long marks the user idle
    pub idle_threshold: Duration,
    /// Heartbeat re-broadcasting the active state
    pub active_threshold: Duration,
    /// Throttle for fetching image files after remote updates
    pub load_images_interval: Duration,
    /// Throttle for uploading files after a broadcast
    pub file_upload_interval: Duration,
    /// How long the available-rooms answer is cached
    pub rooms_query_interval: Duration,
    /// Deleted elements stop syncing this long after deletion
    pub deleted_element_ttl: Duration,
    /// Largest encrypted file attachment accepted
    pub file_upload_max_bytes: usize,
    /// Largest encoded scene snapshot accepted by storage
    pub max_scene_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/".into(),
            initial_scene_timeout: Duration::from_millis(5000),
            full_sync_interval: Duration::from_millis(20_000),
            min_broadcast_interval: Duration::ZERO,
            save_interval: Duration::from_millis(20_000),
            cursor_sync_interval: Duration::from_millis(33),
            idle_threshold: Duration::from_secs(60),
            active_threshold: Duration::from_secs(3),
            load_images_interval: Duration::from_millis(500),
            file_upload_interval: Duration::from_millis(300),
            rooms_query_interval: Duration::from_secs(10),
            deleted_element_ttl: Duration::from_secs(24 * 60 * 60),
            file_upload_max_bytes: 4 * 1024 * 1024,
            max_scene_bytes: 10 * 1024 * 1024,
        }
    }
}

impl SyncConfig {
    /// Short intervals for tests. Durations are kept distinct so timer
    /// tests can tell them apart.
    pub fn for_testing() -> Self {
        Self {
            base_url: "http://localhost/".into(),
            initial_scene_timeout: Duration::from_millis(500),
            full_sync_interval: Duration::from_millis(2_000),
            min_broadcast_interval: Duration::ZERO,
            save_interval: Duration::from_millis(1_000),
            cursor_sync_interval: Duration::from_millis(33),
            idle_threshold: Duration::from_secs(6),
            active_threshold: Duration::from_millis(300),
            load_images_interval: Duration::from_millis(50),
            file_upload_interval: Duration::from_millis(30),
            rooms_query_interval: Duration::from_secs(10),
            deleted_element_ttl: Duration::from_secs(24 * 60 * 60),
            file_upload_max_bytes: 64 * 1024,
            max_scene_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.initial_scene_timeout, Duration::from_millis(5000));
        assert_eq!(config.full_sync_interval, Duration::from_secs(20));
        assert_eq!(config.cursor_sync_interval, Duration::from_millis(33));
        assert!(config.idle_threshold > config.active_threshold);
    }

    #[test]
    fn test_testing_config_is_fast() {
        let config = SyncConfig::for_testing();
        assert!(config.initial_scene_timeout < SyncConfig::default().initial_scene_timeout);
        assert!(config.initial_scene_timeout < config.full_sync_interval);
    }
}
