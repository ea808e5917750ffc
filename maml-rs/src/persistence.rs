//! Content-addressed storage of run results.
//!
//! Each configuration maps to one JSON file:
//! `<root>/<task>_result_files/maml_<task>_<hash>.json`, where `<hash>` is
//! [`MamlConfig::config_hash`]. Writing goes through a temporary file and a
//! rename so an interrupted run never leaves a truncated record behind.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::MamlConfig;
use crate::error::{MamlError, Result};
use crate::logger::Logger;

/// Directory of stored run results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    /// Store rooted at `root`; nothing is created until the first save.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the result of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be hashed.
    pub fn path_for(&self, config: &MamlConfig) -> Result<PathBuf> {
        let hash = config.config_hash()?;
        Ok(self
            .root
            .join(format!("{}_result_files", config.task))
            .join(format!("maml_{}_{hash}.json", config.task)))
    }

    /// Whether a result for `config` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be hashed.
    pub fn contains(&self, config: &MamlConfig) -> Result<bool> {
        Ok(self.path_for(config)?.is_file())
    }

    /// Stored result for `config`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(&self, config: &MamlConfig) -> Result<Option<Logger>> {
        let path = self.path_for(config)?;
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| {
            MamlError::Persistence(format!("failed to open {}: {e}", path.display()))
        })?;
        let logger = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(logger))
    }

    /// Write `logger` as the result of `config`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, config: &MamlConfig, logger: &Logger) -> Result<PathBuf> {
        let path = self.path_for(config)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let tmp = path.with_extension("json.tmp");
        {
            let file = File::create(&tmp).map_err(|e| {
                MamlError::Persistence(format!("failed to create {}: {e}", tmp.display()))
            })?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, logger)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), "saved run result");
        Ok(path)
    }
}
