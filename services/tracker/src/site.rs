//! Site snapshot: catalog, zones and camera statuses loaded once at startup.
//!
//! Missing or unreadable files degrade to empty values so a partially
//! configured site still runs: an empty catalog never matches and absent zones
//! leave presence filtering vacuously satisfied.

use crate::catalog::IdentityCatalog;
use crate::config::SiteConfig;
use crate::feed::FeedStatus;
use crate::region::{zone_sets_from_raw, BlockRegionsFile, SeatRegionsFile, ZoneSet};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Immutable configuration shared by all feed producers.
#[derive(Debug, Clone, Default)]
pub struct SiteSnapshot {
    pub catalog: Arc<IdentityCatalog>,
    pub zones: Arc<HashMap<String, ZoneSet>>,
    pub camera_status: Arc<HashMap<String, FeedStatus>>,
}

impl SiteSnapshot {
    /// Load every site file, falling back to empty values on failure.
    pub fn load(config: &SiteConfig) -> Self {
        let features: serde_json::Map<String, serde_json::Value> =
            load_json_or_default(&config.features_file, "features");
        let names: HashMap<String, String> = load_json_or_default(&config.names_file, "names");
        let catalog = IdentityCatalog::from_features_json(&features).with_names(names);

        let blocks: BlockRegionsFile =
            load_json_or_default(&config.block_regions_file, "block regions");
        let seats: SeatRegionsFile =
            load_json_or_default(&config.seat_regions_file, "seat regions");
        let zones = zone_sets_from_raw(blocks.0, seats.0).unwrap_or_else(|e| {
            warn!(error = %e, "Region definitions rejected, running without zones");
            HashMap::new()
        });

        let statuses: HashMap<String, String> =
            load_json_or_default(&config.camera_status_file, "camera status");
        let camera_status = statuses
            .into_iter()
            .map(|(source_id, status)| (source_id, FeedStatus::parse(&status)))
            .collect::<HashMap<_, _>>();

        if catalog.is_empty() {
            warn!("Identity catalog is empty; no detection will match");
        }

        info!(
            identities = catalog.len(),
            zoned_sources = zones.len(),
            known_cameras = camera_status.len(),
            "Site snapshot loaded"
        );

        Self {
            catalog: Arc::new(catalog),
            zones: Arc::new(zones),
            camera_status: Arc::new(camera_status),
        }
    }

    /// Zone set for a source; empty when none is defined.
    pub fn zones_for(&self, source_id: &str) -> ZoneSet {
        self.zones.get(source_id).cloned().unwrap_or_default()
    }

    /// Operational status for a source; idle when unknown.
    pub fn status_for(&self, source_id: &str) -> FeedStatus {
        self.camera_status
            .get(source_id)
            .copied()
            .unwrap_or(FeedStatus::Idle)
    }
}

fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path, what: &str) -> T {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => contents,
        Ok(_) => {
            warn!(path = %path.display(), file = what, "Site file is empty");
            return T::default();
        }
        Err(e) => {
            warn!(path = %path.display(), file = what, error = %e, "Site file unavailable");
            return T::default();
        }
    };

    serde_json::from_str(&contents).unwrap_or_else(|e| {
        warn!(path = %path.display(), file = what, error = %e, "Site file is malformed");
        T::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn site_config(dir: &Path) -> SiteConfig {
        SiteConfig {
            features_file: dir.join("features.json"),
            names_file: dir.join("names.json"),
            block_regions_file: dir.join("blocks.json"),
            seat_regions_file: dir.join("seats.json"),
            camera_status_file: dir.join("status.json"),
        }
    }

    #[test]
    fn test_missing_files_degrade_to_empty() {
        let config = site_config(&PathBuf::from("/nonexistent/site"));
        let site = SiteSnapshot::load(&config);
        assert!(site.catalog.is_empty());
        assert!(site.zones.is_empty());
        assert_eq!(site.status_for("172.14.0.112"), FeedStatus::Idle);
        assert!(!site.zones_for("172.14.0.112").is_configured());
    }

    #[test]
    fn test_loads_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = site_config(dir.path());
        std::fs::write(&config.features_file, r#"{"U1": [1.0, 0.0], "U2": [0.0, 1.0]}"#).unwrap();
        std::fs::write(&config.names_file, r#"{"U1": "Ada"}"#).unwrap();
        std::fs::write(&config.block_regions_file, "").unwrap();
        std::fs::write(&config.seat_regions_file, r#"{"cam-a": [{"S3": [0.25, 0.25, 0.5, 0.5]}]}"#)
            .unwrap();
        std::fs::write(&config.camera_status_file, r#"{"cam-a": "Working", "cam-b": "Off"}"#)
            .unwrap();

        let site = SiteSnapshot::load(&config);
        assert_eq!(site.catalog.len(), 2);
        assert_eq!(site.catalog.display_name("U1"), Some("Ada"));
        assert_eq!(site.zones_for("cam-a").seats[0].name, "S3");
        assert_eq!(site.status_for("cam-a"), FeedStatus::Working);
        assert_eq!(site.status_for("cam-b"), FeedStatus::Idle);
    }

    #[test]
    fn test_malformed_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let config = site_config(dir.path());
        std::fs::write(&config.features_file, "{not json").unwrap();
        let site = SiteSnapshot::load(&config);
        assert!(site.catalog.is_empty());
    }
}
