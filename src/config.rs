use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::storage::BackingOptions;

/// store 配置（TOML）。
///
/// ```toml
/// working_dir = "/var/lib/dirstore"
/// indexed_attributes = ["cn", "mail", "uidNumber"]
/// fsync = false
/// checkpoint_bytes = 4194304
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 为空时整个 store 只在内存里（测试用）
    pub working_dir: Option<PathBuf>,
    /// 启动时打开（必要时从主表补建）的属性索引
    pub indexed_attributes: Vec<String>,
    pub fsync: bool,
    pub checkpoint_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let backing = BackingOptions::default();
        Self {
            working_dir: None,
            indexed_attributes: Vec::new(),
            fsync: backing.fsync,
            checkpoint_bytes: backing.checkpoint_bytes,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_index(mut self, attribute: &str) -> Self {
        self.indexed_attributes.push(attribute.to_string());
        self
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: StoreConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        if cfg.checkpoint_bytes == 0 {
            anyhow::bail!("checkpoint_bytes must be positive");
        }
        Ok(cfg)
    }

    /// `~/.config/dirstore/config.toml`（平台对应目录）
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dirstore").join("config.toml"))
    }

    /// CLI 未指定目录时使用的数据目录
    pub fn default_working_dir() -> PathBuf {
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dirstore")
    }

    pub fn backing_options(&self) -> BackingOptions {
        BackingOptions {
            fsync: self.fsync,
            checkpoint_bytes: self.checkpoint_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::unique_tmp_dir;

    #[test]
    fn partial_file_uses_defaults() {
        let dir = unique_tmp_dir("config");
        let path = dir.join("config.toml");
        std::fs::write(&path, "indexed_attributes = [\"cn\", \"mail\"]\n").unwrap();
        let cfg = StoreConfig::load(&path).unwrap();
        assert_eq!(cfg.indexed_attributes, vec!["cn", "mail"]);
        assert_eq!(cfg.working_dir, None);
        assert!(!cfg.fsync);
        assert_eq!(cfg.checkpoint_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn full_file_round_trips() {
        let dir = unique_tmp_dir("config-full");
        let path = dir.join("config.toml");
        let cfg = StoreConfig::at(dir.join("data")).with_index("uid");
        std::fs::write(&path, toml::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(StoreConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn zero_checkpoint_threshold_is_rejected() {
        let dir = unique_tmp_dir("config-bad");
        let path = dir.join("config.toml");
        std::fs::write(&path, "checkpoint_bytes = 0\n").unwrap();
        assert!(StoreConfig::load(&path).is_err());
        assert!(StoreConfig::load(&dir.join("missing.toml")).is_err());
    }
}
