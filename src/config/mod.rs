use crate::models::{PresetConfig, Settings};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Configuration manager for loading and saving YAML configuration files.
///
/// Manages two kinds of files under the configuration directory:
/// - Settings (`Settings.yaml`): directories, filter defaults, debug flag
/// - Presets (`presets/<name>.yaml`): named overlays for batch configs
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
    presets_dir: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing configuration files (e.g., "GenBatch Data")
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        // Create config directory if it doesn't exist
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {config_dir}"))?;
        }

        Ok(Self {
            settings_path: config_dir.join("Settings.yaml"),
            presets_dir: config_dir.join("presets"),
            config_dir,
        })
    }

    /// Load the settings file.
    ///
    /// # Returns
    /// The loaded Settings, or defaults if the file doesn't exist
    pub fn load_settings(&self) -> Result<Settings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
            return Ok(Settings::default());
        }

        let file_contents = fs::read_to_string(&self.settings_path)
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        let settings: Settings = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Save the settings file.
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Load a named preset from the presets directory.
    ///
    /// Accepts a bare name (`portrait`) or a file name (`portrait.yaml`).
    pub fn load_preset(&self, name: &str) -> Result<PresetConfig> {
        let file_name = if name.ends_with(".yaml") {
            name.to_string()
        } else {
            format!("{name}.yaml")
        };
        let preset_path = self.presets_dir.join(file_name);

        let file_contents = fs::read_to_string(&preset_path)
            .with_context(|| format!("Preset {name} not found at {preset_path}"))?;

        let mut preset: PresetConfig = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse preset: {preset_path}"))?;

        if preset.name.is_empty() {
            preset.name = name.trim_end_matches(".yaml").to_string();
        }

        tracing::info!("Loaded preset {} from {}", preset.name, preset_path);
        Ok(preset)
    }

    /// Save a named preset to the presets directory.
    pub fn save_preset(&self, preset: &PresetConfig) -> Result<()> {
        if !self.presets_dir.exists() {
            fs::create_dir_all(&self.presets_dir).with_context(|| {
                format!("Failed to create presets directory: {}", self.presets_dir)
            })?;
        }

        let preset_path = self.presets_dir.join(format!("{}.yaml", preset.name));
        let yaml_string =
            serde_yaml_ng::to_string(preset).context("Failed to serialize preset to YAML")?;

        fs::write(&preset_path, yaml_string)
            .with_context(|| format!("Failed to write preset: {preset_path}"))?;

        tracing::info!("Saved preset to {}", preset_path);
        Ok(())
    }

    /// List the names of all available presets.
    pub fn list_presets(&self) -> Result<Vec<String>> {
        if !self.presets_dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.presets_dir)
            .with_context(|| format!("Failed to read presets directory: {}", self.presets_dir))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".yaml") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }
}
