use crate::models::{AutomationConfig, Profile, ProfileMetadata};
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use ::config::{Config, Environment, File, FileFormat};
use std::fs;

/// File name of the main configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "EZCAD Automation.yaml";

/// Prefix of environment variables overriding the configuration file,
/// e.g. `EZCAD_SETTINGS__DEBUG_MODE=true`.
pub const ENV_PREFIX: &str = "EZCAD";

/// Configuration manager for loading and saving the automation configuration
/// and named profiles.
///
/// Layout of the configuration directory:
/// - `EZCAD Automation.yaml`: paths and run settings
/// - `profiles/<name>.yaml`: saved profiles
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
    profiles_dir: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// The directory and its `profiles` subdirectory are created if missing.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let profiles_dir = config_dir.join("profiles");

        if !profiles_dir.exists() {
            fs::create_dir_all(&profiles_dir)
                .with_context(|| format!("Failed to create config directory: {}", profiles_dir))?;
        }

        Ok(Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            profiles_dir,
            config_dir,
        })
    }

    /// Load the configuration.
    ///
    /// Sources, later ones winning: built-in defaults, the YAML file (if it
    /// exists), `EZCAD_*` environment variables.
    pub fn load_config(&self) -> Result<AutomationConfig> {
        if !self.config_path.exists() {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                self.config_path
            );
        }

        let settings = Config::builder()
            .add_source(
                File::from(self.config_path.as_std_path())
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        let config: AutomationConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config: {}", self.config_path))?;

        tracing::info!("Loaded config from {}", self.config_path);
        Ok(config)
    }

    /// Save the configuration file.
    pub fn save_config(&self, config: &AutomationConfig) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", self.config_path))?;

        tracing::info!("Saved config to {}", self.config_path);
        Ok(())
    }

    /// Save `config` as the profile `name`, returning the profile path.
    pub fn save_profile(&self, name: &str, config: &AutomationConfig) -> Result<Utf8PathBuf> {
        let path = self.profile_path(name)?;

        let profile = Profile {
            metadata: ProfileMetadata {
                profile_name: name.to_string(),
                created: chrono::Utc::now(),
            },
            config: config.clone(),
        };

        let yaml_string =
            serde_yaml_ng::to_string(&profile).context("Failed to serialize profile to YAML")?;
        fs::write(&path, yaml_string)
            .with_context(|| format!("Failed to write profile: {}", path))?;

        tracing::info!("Saved profile '{}' to {}", name, path);
        Ok(path)
    }

    /// Load profile `name` and make it the current configuration file.
    pub fn load_profile(&self, name: &str) -> Result<AutomationConfig> {
        let path = self.profile_path(name)?;
        if !path.exists() {
            bail!("Profile '{}' not found", name);
        }

        let file_contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read profile: {}", path))?;
        let profile: Profile = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse profile: {}", path))?;

        self.save_config(&profile.config)?;
        tracing::info!(
            "Loaded profile '{}' (created {})",
            profile.metadata.profile_name,
            profile.metadata.created
        );
        Ok(profile.config)
    }

    /// Names of all saved profiles, sorted.
    pub fn list_profiles(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.profiles_dir)
            .with_context(|| format!("Failed to read profiles directory: {}", self.profiles_dir))?;

        let mut profiles = Vec::new();
        for entry in entries {
            let entry = entry.context("Failed to read profiles directory entry")?;
            let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
                continue;
            };
            if path.extension() == Some("yaml") {
                if let Some(stem) = path.file_stem() {
                    profiles.push(stem.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }

    fn profile_path(&self, name: &str) -> Result<Utf8PathBuf> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Profile name cannot be empty");
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            bail!("Invalid profile name: {}", name);
        }
        Ok(self.profiles_dir.join(format!("{name}.yaml")))
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}
