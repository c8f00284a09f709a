use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "DUOSHADE_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "DUOSHADE_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "Duoshade";
const APPLICATION: &str = "duoshade";

const CONFIG_FILE: &str = "stage.toml";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let config_override = env_override(ENV_CONFIG_DIR);
        let data_override = env_override(ENV_DATA_DIR);
        if let (Some(config_dir), Some(data_dir)) = (&config_override, &data_override) {
            return Ok(Self {
                config_dir: config_dir.clone(),
                data_dir: data_dir.clone(),
            });
        }

        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;
        Ok(Self {
            config_dir: config_override.unwrap_or_else(|| project_dirs.config_dir().to_path_buf()),
            data_dir: data_override.unwrap_or_else(|| project_dirs.data_dir().to_path_buf()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Default destination for `--capture` snapshots.
    pub fn capture_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }

    /// Directories searched, in order, for texture and asset references.
    pub fn texture_roots(&self, program_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        if let Some(dir) = program_dir {
            roots.push(dir.to_path_buf());
        }
        for candidate in [
            self.config_dir.join("textures"),
            self.data_dir.join("textures"),
        ] {
            if !roots.contains(&candidate) {
                roots.push(candidate);
            }
        }
        roots
    }
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
