//! Persistence of the resolved configuration.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::config::{is_toml, read_config_file, ZonewatchConfig};

/// Synchronous load/save of the full configuration.
pub trait ConfigStore: Send + Sync {
    /// Load the stored configuration. A missing store yields defaults.
    fn load(&self) -> Result<ZonewatchConfig>;

    fn save(&self, config: &ZonewatchConfig) -> Result<()>;
}

/// File-backed store using the config file layout (JSON, or TOML by
/// extension). Writes go to a sibling temp file and are renamed into place.
#[derive(Clone, Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<ZonewatchConfig> {
        if !self.path.exists() {
            log::info!(
                "config store {} not found, using defaults",
                self.path.display()
            );
            return Ok(ZonewatchConfig::default());
        }
        let file = read_config_file(&self.path)?;
        let mut cfg = ZonewatchConfig::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn save(&self, config: &ZonewatchConfig) -> Result<()> {
        let file = config.to_file();
        let raw = if is_toml(&self.path) {
            toml::to_string_pretty(&file).context("encode config as toml")?
        } else {
            serde_json::to_string_pretty(&file).context("encode config as json")?
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config directory {}", parent.display()))?;
        }
        let temp = self.temp_path();
        std::fs::write(&temp, raw)
            .map_err(|e| anyhow!("failed to write {}: {}", temp.display(), e))?;
        std::fs::rename(&temp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            anyhow!("failed to replace {}: {}", self.path.display(), e)
        })?;
        log::debug!("config saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::{Point, Zone};
    use std::time::Duration;

    #[test]
    fn missing_file_loads_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonConfigStore::new(dir.path().join("absent.json"));
        let cfg = store.load()?;
        assert_eq!(cfg.alarm.debounce, Duration::from_secs(5));
        assert!(cfg.zones.is_empty());
        Ok(())
    }

    #[test]
    fn save_then_load_keeps_zones_and_policy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonConfigStore::new(dir.path().join("state/zonewatch.json"));

        let mut cfg = ZonewatchConfig::default();
        cfg.alarm.once_per_id = true;
        cfg.zones.push(Zone::new(
            "driveway",
            vec![
                Point::new(0.0, 0.0),
                Point::new(50.0, 0.0),
                Point::new(50.0, 50.0),
            ],
        ));
        store.save(&cfg)?;
        assert!(!store.temp_path().exists());

        let loaded = store.load()?;
        assert!(loaded.alarm.once_per_id);
        assert_eq!(loaded.zones, cfg.zones);
        Ok(())
    }

    #[test]
    fn toml_store_roundtrips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonConfigStore::new(dir.path().join("zonewatch.toml"));
        let mut cfg = ZonewatchConfig::default();
        cfg.source_url = "rtsp://10.1.1.1/live".to_string();
        cfg.classes.thresholds.insert(0, 0.4);
        store.save(&cfg)?;
        let loaded = store.load()?;
        assert_eq!(loaded.source_url, cfg.source_url);
        assert_eq!(loaded.classes.thresholds.get(&0), Some(&0.4));
        Ok(())
    }
}
