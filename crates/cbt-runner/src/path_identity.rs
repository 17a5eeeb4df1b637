//! Canonical, parameter-derived directory identity for a run.
//!
//! The same five fields place both the remote working directory and the local
//! archive directory, so an archived run can be recognized on a later sweep.

use crate::config::{EffectiveConfig, Mode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RunIdentity {
    pub osd_ra: u64,
    pub op_size: u64,
    pub concurrent_procs: usize,
    pub iodepth: u32,
    pub mode: Mode,
}

impl RunIdentity {
    pub fn from_config(config: &EffectiveConfig, client_count: usize) -> Self {
        Self {
            osd_ra: config.osd_ra,
            op_size: config.op_size,
            concurrent_procs: config.total_procs(client_count),
            iodepth: config.iodepth,
            mode: config.mode,
        }
    }

    pub fn components(&self) -> [String; 5] {
        [
            format!("osd_ra-{:08}", self.osd_ra),
            format!("op_size-{:08}", self.op_size),
            format!("concurrent_procs-{:03}", self.concurrent_procs),
            format!("iodepth-{:03}", self.iodepth),
            self.mode.as_str().to_string(),
        ]
    }

    pub fn path_under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in self.components() {
            path.push(part);
        }
        path
    }
}

pub fn build_path(root: &Path, config: &EffectiveConfig, client_count: usize) -> PathBuf {
    RunIdentity::from_config(config, client_count).path_under(root)
}

/// True when a completed run already owns `archive_dir`.
pub fn exists(archive_dir: &Path) -> bool {
    if archive_dir.exists() {
        info!(archive_dir = %archive_dir.display(), "skipping existing test");
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map, Value};
    use std::collections::HashSet;

    fn config(overrides: Value) -> EffectiveConfig {
        let map: Map<String, Value> = match overrides {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        EffectiveConfig::resolve(&map).expect("config")
    }

    #[test]
    fn layout_matches_archive_convention() {
        let cfg = config(json!({
            "mode": "write",
            "op_size": 4194304,
            "iodepth": 16,
            "volumes_per_client": 2,
            "osd_ra": 128
        }));
        let path = build_path(Path::new("/archive"), &cfg, 2);
        assert_eq!(
            path,
            PathBuf::from(
                "/archive/osd_ra-00000128/op_size-04194304/concurrent_procs-004/iodepth-016/write"
            )
        );
    }

    #[test]
    fn identical_identity_fields_give_identical_paths() {
        let a = config(json!({"op_size": 4096, "runtime": 60, "idle_sleep": 1}));
        let b = config(json!({"op_size": 4096, "runtime": 600, "idle_sleep": 90}));
        assert_eq!(
            build_path(Path::new("/r"), &a, 3),
            build_path(Path::new("/r"), &b, 3)
        );
    }

    #[test]
    fn each_identity_field_changes_the_path() {
        let variants = vec![
            json!({}),
            json!({"osd_ra": 4096}),
            json!({"op_size": 4096}),
            json!({"procs_per_volume": 2}),
            json!({"iodepth": 32}),
            json!({"mode": "randread"}),
        ];
        let paths: HashSet<PathBuf> = variants
            .into_iter()
            .map(|v| build_path(Path::new("/r"), &config(v), 1))
            .collect();
        assert_eq!(paths.len(), 6);
    }

    #[test]
    fn zero_padding_keeps_lexical_order_numeric() {
        let small = build_path(Path::new("/r"), &config(json!({"op_size": 4096})), 1);
        let large = build_path(Path::new("/r"), &config(json!({"op_size": 65536})), 1);
        assert!(small.to_string_lossy() < large.to_string_lossy());
    }

    #[test]
    fn exists_tracks_directory_presence() {
        let root = std::env::temp_dir().join(format!(
            "cbt_exists_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let archive = build_path(&root, &config(json!({})), 1);
        assert!(!exists(&archive));
        std::fs::create_dir_all(&archive).expect("create archive");
        assert!(exists(&archive));
        let _ = std::fs::remove_dir_all(root);
    }
}
