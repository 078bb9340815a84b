use std::path::{Path, PathBuf};

use log::{debug, info};
use toml_edit::{value, DocumentMut, Item, Table};

use crate::config::{sanitize_config, Config, ConfigError};

const APP_DIR_NAME: &str = "radiosync";
const CONFIG_FILE_NAME: &str = "config.toml";
const CACHE_FILE_NAME: &str = "cache.db";

pub fn config_template_text() -> &'static str {
    include_str!("../config/radiosync.template.toml")
}

/// `<config_dir>/radiosync/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoDefaultLocation("the config file"))
}

/// `<data_dir>/radiosync/cache.db`.
pub fn default_cache_path() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(CACHE_FILE_NAME))
        .ok_or(ConfigError::NoDefaultLocation("the cache database"))
}

/// Cache database location: the configured path, or the platform default.
pub fn resolve_cache_path(config: &Config) -> Result<PathBuf, ConfigError> {
    let configured = config.cache.path.trim();
    if configured.is_empty() {
        default_cache_path()
    } else {
        Ok(PathBuf::from(configured))
    }
}

/// Reads, parses and sanitizes a config file. Validation is left to the caller.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config = toml::from_str::<Config>(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    debug!("Loaded config from {}", path.display());
    Ok(sanitize_config(config))
}

/// Writes the commented template to `path` unless a file is already there.
/// Returns whether a file was written.
pub fn write_default_config(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        info!("Config file {} already exists; leaving it untouched", path.display());
        return Ok(false);
    }
    let write_error = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
    }
    std::fs::write(path, config_template_text()).map_err(write_error)?;
    info!("Wrote config template to {}", path.display());
    Ok(true)
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

/// Returns `existing_text` with `spotify.refresh_token` replaced, keeping
/// comments and formatting intact.
pub fn serialize_refresh_token_update(
    existing_text: &str,
    refresh_token: &str,
) -> Result<String, String> {
    let mut document = existing_text
        .parse::<DocumentMut>()
        .map_err(|err| format!("failed to parse existing config as TOML document: {}", err))?;
    let Some(spotify) = document
        .as_table_mut()
        .get_mut("spotify")
        .and_then(Item::as_table_mut)
    else {
        return Err("config has no [spotify] table".to_string());
    };
    set_table_value_preserving_decor(spotify, "refresh_token", value(refresh_token));
    Ok(document.to_string())
}

/// Persists a rotated refresh token into the config file at `path`.
pub fn update_refresh_token(path: &Path, refresh_token: &str) -> Result<(), ConfigError> {
    let existing_text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let updated_text = serialize_refresh_token_update(&existing_text, refresh_token).map_err(
        |reason| ConfigError::Edit {
            path: path.display().to_string(),
            reason,
        },
    )?;
    std::fs::write(path, updated_text).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })?;
    info!("Saved rotated refresh token to {}", path.display());
    Ok(())
}
