//! JSON 目录持久层
//!
//! 每个缓存键对应目录下一个 `<url 编码后的键>.json` 文件。
//! 占用字节数在打开时统计一次，之后随写入与删除增量维护。

use super::DurableLayer;
use crate::data::cache::entry::CacheEntry;
use crate::data::{DataError, Result};
use crate::utils::file_helpers::{atomic_write, dir_size, remove_if_exists};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const EXTENSION: &str = "json";

/// 基于 JSON 文件目录的持久层
#[derive(Debug, Clone)]
pub struct JsonDirLayer {
    dir: PathBuf,
    usage: Arc<AtomicU64>,
}

impl JsonDirLayer {
    /// 打开（必要时创建）缓存目录
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| DataError::io(&dir, e))?;
        let usage = dir_size(&dir, EXTENSION)?;
        Ok(Self {
            dir,
            usage: Arc::new(AtomicU64::new(usage)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(DataError::InvalidKey(key.to_string()));
        }
        let file_name = format!("{}.{}", urlencoding::encode(key), EXTENSION);
        Ok(self.dir.join(file_name))
    }

    fn adjust_usage(&self, removed: u64, added: u64) {
        // 闭包始终返回 Some，不会失败
        let _ = self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |usage| {
                Some(usage.saturating_sub(removed).saturating_add(added))
            });
    }
}

/// 文件当前大小，不存在时为 0
fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

impl DurableLayer for JsonDirLayer {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DataError::io(&path, e)),
        };
        let mut entry: CacheEntry = serde_json::from_slice(&content)?;
        entry.key = key.to_string();
        Ok(Some(entry))
    }

    fn store(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.key)?;
        let content = serde_json::to_vec(entry)?;
        let previous = file_len(&path);
        atomic_write(&path, &content)?;
        self.adjust_usage(previous, content.len() as u64);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        let previous = file_len(&path);
        remove_if_exists(&path)?;
        self.adjust_usage(previous, 0);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| DataError::io(&self.dir, e))? {
            let entry = entry.map_err(|e| DataError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(key) => keys.push(key.into_owned()),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "无法解码缓存文件名，跳过");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn usage_bytes(&self) -> Result<u64> {
        Ok(self.usage.load(Ordering::SeqCst))
    }

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json_dir:{}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let layer = JsonDirLayer::open(temp_dir.path())?;
        let entry = CacheEntry::new("dataset:library:drafts,published", json!({"n": 1}), 10, 100);

        layer.store(&entry)?;
        let loaded = layer.load(&entry.key)?.unwrap();
        assert_eq!(loaded, entry);
        assert_eq!(layer.keys()?, vec![entry.key.clone()]);
        assert!(layer.usage_bytes()? > 0);
        Ok(())
    }

    #[test]
    fn test_keys_with_path_characters_are_encoded() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let layer = JsonDirLayer::open(temp_dir.path())?;
        let entry = CacheEntry::new("notes/../secret", json!(true), 0, 1);
        layer.store(&entry)?;

        // 文件必须落在缓存目录内
        let files: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(layer.keys()?, vec!["notes/../secret".to_string()]);
        Ok(())
    }

    #[test]
    fn test_load_missing_and_remove_missing() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let layer = JsonDirLayer::open(temp_dir.path())?;
        assert!(layer.load("nope")?.is_none());
        layer.remove("nope")?;
        Ok(())
    }

    #[test]
    fn test_unparseable_file_is_serialization_error() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let layer = JsonDirLayer::open(temp_dir.path())?;
        fs::write(temp_dir.path().join("broken.json"), "{not json").unwrap();
        let err = layer.load("broken").unwrap_err();
        assert!(matches!(err, DataError::JsonSerialization(_)));
        Ok(())
    }

    #[test]
    fn test_empty_key_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let layer = JsonDirLayer::open(temp_dir.path()).unwrap();
        assert!(matches!(layer.load(""), Err(DataError::InvalidKey(_))));
    }

    #[test]
    fn test_usage_tracks_overwrite_and_remove() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("old.json"), "{}").unwrap();
        let layer = JsonDirLayer::open(temp_dir.path())?;
        assert_eq!(layer.usage_bytes()?, 2);

        layer.store(&CacheEntry::new("k", json!("x".repeat(100)), 0, 1))?;
        layer.store(&CacheEntry::new("k", json!("y"), 0, 1))?;
        assert_eq!(layer.usage_bytes()?, dir_size(temp_dir.path(), EXTENSION)?);

        layer.remove("k")?;
        layer.remove("k")?;
        assert_eq!(layer.usage_bytes()?, 2);
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let layer = JsonDirLayer::open(temp_dir.path())?;
        for i in 0..3 {
            layer.store(&CacheEntry::new(format!("k{i}"), json!(i), 0, 1))?;
        }
        layer.clear()?;
        assert!(layer.keys()?.is_empty());
        assert_eq!(layer.usage_bytes()?, 0);
        Ok(())
    }
}
