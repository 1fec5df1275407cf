use std::fs;
use std::path::Path;

use kb_core::PipelineConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const CONFIG_FILE: &str = "kitbash.toml";

/// Library-wide settings from `<base>/kitbash.toml`.
///
/// ```toml
/// auto_activate = true
///
/// [pipeline]
/// promotion_min_hits = 5
/// cycle_every = 1
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KitbashConfig {
    pub pipeline: PipelineConfig,
    /// Activate every cartridge's grains when the library opens.
    pub auto_activate: bool,
}

impl KitbashConfig {
    /// Read `<base>/kitbash.toml`. A missing file yields the defaults;
    /// pipeline values that cannot run are rejected here.
    pub fn load(base: &Path) -> Result<Self> {
        let path = base.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&text)?;
        config.pipeline.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        assert_eq!(KitbashConfig::load(dir.path()).unwrap(), KitbashConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "auto_activate = true\n\n[pipeline]\ncycle_every = 3\nresistance_min_ratio = 0.5\n",
        )
        .unwrap();
        let cfg = KitbashConfig::load(dir.path()).unwrap();
        assert!(cfg.auto_activate);
        assert_eq!(cfg.pipeline.cycle_every, 3);
        assert_eq!(cfg.pipeline.resistance_min_ratio, 0.5);
        assert_eq!(
            cfg.pipeline.promotion_min_hits,
            PipelineConfig::default().promotion_min_hits
        );
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[pipeline\n").unwrap();
        assert!(matches!(
            KitbashConfig::load(dir.path()),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_unusable_pipeline_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[pipeline]\nlock_trend_window = 0\n",
        )
        .unwrap();
        assert!(matches!(
            KitbashConfig::load(dir.path()),
            Err(StoreError::Core(kb_core::KbError::InvalidConfig(_)))
        ));

        fs::write(
            dir.path().join(CONFIG_FILE),
            "[pipeline]\nhit_score_saturation = 0.0\n",
        )
        .unwrap();
        assert!(KitbashConfig::load(dir.path()).is_err());
    }
}
