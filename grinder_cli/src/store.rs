use std::path::PathBuf;

use grinder_config::Config;
use grinder_core::conversions::apply_to_config;
use grinder_core::{Settings, SettingsStore};

/// Persists runtime settings by rewriting the TOML config file.
///
/// Only the sections that mirror `Settings` change; pins, logging and the
/// simulator section are written back as loaded.
pub struct TomlSettingsStore {
    path: PathBuf,
    base: Config,
}

impl TomlSettingsStore {
    pub fn new(path: PathBuf, base: Config) -> Self {
        Self { path, base }
    }
}

impl SettingsStore for TomlSettingsStore {
    fn save(&mut self, settings: &Settings) -> eyre::Result<()> {
        apply_to_config(settings, &mut self.base);
        grinder_config::save_toml(&self.base, &self.path)?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_keeps_host_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grinder.toml");
        let mut base = Config::default();
        base.pins.relay = 27;
        let mut store = TomlSettingsStore::new(path.clone(), base);

        let settings = Settings {
            target_dose_single: 19.5,
            ..Settings::default()
        };
        store.save(&settings).unwrap();

        let back = grinder_config::load_path(&path).unwrap();
        assert_eq!(back.pins.relay, 27);
        assert!((back.dose.target_single_g - 19.5).abs() < f32::EPSILON);
    }
}
