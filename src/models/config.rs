// 同步层配置，集中放在 models 以便各模块共享

use crate::data::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// 解析字符串为日志级别
    pub fn parse(level_str: &str) -> Option<Self> {
        match level_str.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 日志输出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

/// 日志配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub output: LogOutput,
    /// 日志目录（仅 file/both 输出时使用）
    #[serde(default)]
    pub file_path: Option<String>,
}

/// 缓存持久层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// 仅内存
    #[default]
    Memory,
    /// 每个键一个 JSON 文件
    JsonDir,
    /// SQLite 单表
    Sqlite,
}

/// 缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// 默认 TTL（毫秒）
    pub default_ttl_ms: u64,
    /// 存储软上限（字节）
    pub soft_cap_bytes: u64,
    /// 使用量超过 `soft_cap_bytes * sweep_threshold` 时触发清扫
    pub sweep_threshold: f64,
    pub backend: CacheBackend,
    /// 持久层路径（JSON 目录或 SQLite 文件），为空时使用默认数据目录
    pub path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,           // 5 分钟
            soft_cap_bytes: 25 * 1024 * 1024, // 25MB
            sweep_threshold: 0.9,
            backend: CacheBackend::Memory,
            path: None,
        }
    }
}

impl CacheSettings {
    /// 触发清扫的使用量阈值（字节）
    pub fn sweep_trigger_bytes(&self) -> u64 {
        (self.soft_cap_bytes as f64 * self.sweep_threshold) as u64
    }

    /// 获取有效的持久层路径
    pub fn effective_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        let base = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("docsync");
        match self.backend {
            CacheBackend::Sqlite => base.join("cache.db"),
            _ => base.join("cache"),
        }
    }
}

/// 批量写入配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// 提供方单批上限
    pub provider_batch_limit: usize,
    /// 同时提交的批次数上限
    pub max_concurrent_chunks: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            provider_batch_limit: 500,
            max_concurrent_chunks: 4,
        }
    }
}

/// 同步层总配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl SyncConfig {
    /// 从 TOML 文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 用环境变量覆盖部分配置
    ///
    /// - `DOCSYNC_BATCH_LIMIT`
    /// - `DOCSYNC_CACHE_TTL_MS`
    /// - `DOCSYNC_CACHE_DIR`
    /// - `DOCSYNC_LOG_LEVEL`
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(limit) = std::env::var("DOCSYNC_BATCH_LIMIT") {
            self.batch.provider_batch_limit = limit.trim().parse().map_err(|_| {
                DataError::InvalidConfig(format!("DOCSYNC_BATCH_LIMIT 不是有效整数: {limit}"))
            })?;
        }

        if let Ok(ttl) = std::env::var("DOCSYNC_CACHE_TTL_MS") {
            self.cache.default_ttl_ms = ttl.trim().parse().map_err(|_| {
                DataError::InvalidConfig(format!("DOCSYNC_CACHE_TTL_MS 不是有效整数: {ttl}"))
            })?;
        }

        if let Ok(dir) = std::env::var("DOCSYNC_CACHE_DIR") {
            self.cache.path = Some(PathBuf::from(dir));
        }

        if let Ok(level) = std::env::var("DOCSYNC_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&level) {
                self.log.level = level;
            }
        }

        self.validate()?;
        Ok(self)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.batch.provider_batch_limit == 0 {
            return Err(DataError::InvalidConfig(
                "provider_batch_limit 必须大于 0".to_string(),
            ));
        }
        if self.batch.max_concurrent_chunks == 0 {
            return Err(DataError::InvalidConfig(
                "max_concurrent_chunks 必须大于 0".to_string(),
            ));
        }
        if self.cache.default_ttl_ms == 0 {
            return Err(DataError::InvalidConfig(
                "default_ttl_ms 必须大于 0".to_string(),
            ));
        }
        if !(self.cache.sweep_threshold > 0.0 && self.cache.sweep_threshold <= 1.0) {
            return Err(DataError::InvalidConfig(format!(
                "sweep_threshold 必须在 (0, 1] 之间: {}",
                self.cache.sweep_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch.provider_batch_limit, 500);
        assert_eq!(config.cache.default_ttl_ms, 300_000);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("docsync.toml");
        fs::write(
            &path,
            r#"
[cache]
default_ttl_ms = 1000
backend = "sqlite"

[batch]
provider_batch_limit = 200

[log]
level = "debug"
format = "json"
"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.cache.default_ttl_ms, 1000);
        assert_eq!(config.cache.backend, CacheBackend::Sqlite);
        assert_eq!(config.cache.soft_cap_bytes, 25 * 1024 * 1024);
        assert_eq!(config.batch.provider_batch_limit, 200);
        assert_eq!(config.batch.max_concurrent_chunks, 4);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SyncConfig::from_toml_str("[batch]\nprovider_batch_limit = 0\n").unwrap_err();
        assert!(matches!(err, DataError::InvalidConfig(_)));

        let err = SyncConfig::from_toml_str("[cache]\nsweep_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, DataError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = SyncConfig::from_toml_str("[cache\n").unwrap_err();
        assert!(matches!(err, DataError::TomlDeserialization(_)));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("DOCSYNC_BATCH_LIMIT", "250");
        std::env::set_var("DOCSYNC_CACHE_DIR", "/tmp/docsync-test-cache");
        let config = SyncConfig::default().apply_env_overrides();
        std::env::remove_var("DOCSYNC_BATCH_LIMIT");
        std::env::remove_var("DOCSYNC_CACHE_DIR");

        let config = config.unwrap();
        assert_eq!(config.batch.provider_batch_limit, 250);
        assert_eq!(
            config.cache.effective_path(),
            PathBuf::from("/tmp/docsync-test-cache")
        );
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_number() {
        std::env::set_var("DOCSYNC_CACHE_TTL_MS", "soon");
        let result = SyncConfig::default().apply_env_overrides();
        std::env::remove_var("DOCSYNC_CACHE_TTL_MS");
        assert!(matches!(result, Err(DataError::InvalidConfig(_))));
    }

    #[test]
    fn test_sweep_trigger_bytes() {
        let settings = CacheSettings {
            soft_cap_bytes: 1000,
            sweep_threshold: 0.5,
            ..Default::default()
        };
        assert_eq!(settings.sweep_trigger_bytes(), 500);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }
}
