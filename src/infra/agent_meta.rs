//! Per-agent side-metadata.
//!
//! The rendered backend config is the registry of record, but recovering a
//! value from it after install would mean scraping a text format that may
//! change. Install records here the two fields later verbs need back — the
//! agent's port (status enrichment) and its custom log directory (launchd
//! log tailing); uninstall drops the entry.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The recorded-at-install fields for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Durable name→meta map with atomic writes (temp file + rename, so a
/// crashed writer can never leave a torn file).
pub struct AgentMetaStore {
    path: PathBuf,
}

impl AgentMetaStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the whole map; a missing file is an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<BTreeMap<String, AgentMeta>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading agent metadata {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing agent metadata {}", self.path.display()))
    }

    /// The registered port for one agent, if any. Read errors degrade to
    /// `None` — this file is an enrichment, never a gate.
    #[must_use]
    pub fn port(&self, name: &str) -> Option<u16> {
        self.load().ok()?.get(name)?.port
    }

    /// The custom log directory recorded for one agent, if any.
    #[must_use]
    pub fn log_dir(&self, name: &str) -> Option<PathBuf> {
        self.load().ok()?.get(name)?.log_dir.clone()
    }

    /// Record an agent's metadata at install time, replacing any previous
    /// entry. An all-empty meta still gets an entry; install is the only
    /// writer and uninstall the only remover.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be persisted.
    pub fn record(&self, name: &str, port: Option<u16>, log_dir: Option<&Path>) -> Result<()> {
        let mut map = self.load()?;
        map.insert(
            name.to_string(),
            AgentMeta {
                port,
                log_dir: log_dir.map(Path::to_path_buf),
            },
        );
        self.save(&map)
    }

    /// Drop an agent's entry at uninstall time.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be persisted.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut map = self.load()?;
        if map.remove(name).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }

    fn save(&self, map: &BTreeMap<String, AgentMeta>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("metadata path has no parent directory"))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
        let content = serde_json::to_string_pretty(map).context("serializing agent metadata")?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        tmp.write_all(content.as_bytes())
            .context("writing agent metadata")?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
