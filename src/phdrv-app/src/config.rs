// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Locating and reading `phdrv.toml`.
//!
//! One file holds a section per program; each program deserializes only
//! its own section.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FILE_NAME: &str = "phdrv.toml";
const PATH_ENV: &str = "PHDRV_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {0}: {1}")]
    Read(PathBuf, String),

    #[error("cannot parse {0}: {1}")]
    Parse(PathBuf, String),

    #[error("{0} has no [{1}] section")]
    MissingSection(PathBuf, String),
}

/// `$PHDRV_CONFIG`, then the working directory, the user config
/// directory and `/etc/phdrv`.
fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(explicit) = std::env::var_os(PATH_ENV) {
        paths.push(PathBuf::from(explicit));
    }
    paths.push(PathBuf::from(FILE_NAME));
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("phdrv").join(FILE_NAME));
    }
    paths.push(Path::new("/etc/phdrv").join(FILE_NAME));
    paths
}

fn read_section<T: DeserializeOwned>(path: &Path, key: &str) -> Result<Option<T>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.to_path_buf(), e.to_string()))?;
    let mut table: toml::Table = toml::from_str(&content)
        .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
    let Some(section) = table.remove(key) else {
        return Ok(None);
    };
    section
        .try_into()
        .map(Some)
        .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
}

/// A program section of `phdrv.toml`.
pub trait ConfigFile: Sized + Default + DeserializeOwned {
    /// Name of the section, e.g. `"phdrv-server"`.
    fn section_key() -> &'static str;

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        read_section(path, Self::section_key())?.ok_or_else(|| {
            ConfigError::MissingSection(path.to_path_buf(), Self::section_key().to_string())
        })
    }

    /// First file on the search path that has our section. Defaults and
    /// `None` when there is none.
    fn load_from_default_paths() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in search_paths() {
            if !path.is_file() {
                continue;
            }
            if let Some(config) = read_section(&path, Self::section_key())? {
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Probe {
        name: String,
        retries: u32,
    }

    impl ConfigFile for Probe {
        fn section_key() -> &'static str {
            "probe"
        }
    }

    fn write(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join(FILE_NAME);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_section_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[other]\nx = 1\n\n[probe]\nname = \"p1\"\n");
        let probe = Probe::load_from_file(&path).unwrap();
        assert_eq!(
            probe,
            Probe {
                name: "p1".into(),
                retries: 0
            }
        );
    }

    #[test]
    fn test_missing_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[other]\nx = 1\n");
        assert!(matches!(
            Probe::load_from_file(&path),
            Err(ConfigError::MissingSection(_, _))
        ));
    }

    #[test]
    fn test_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[probe]\nretries = \"many\"\n");
        assert!(matches!(
            Probe::load_from_file(&path),
            Err(ConfigError::Parse(_, _))
        ));
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Probe::load_from_file(&missing),
            Err(ConfigError::Read(_, _))
        ));
    }
}
