//! SQLite 持久层
//!
//! 所有条目存放在单表 `cache_entries(key, value, stored_at)` 中，
//! `value` 为条目的 JSON 序列化结果。占用字节数在打开时统计一次，之后随写入与删除增量维护。

use super::DurableLayer;
use crate::data::cache::entry::CacheEntry;
use crate::data::{DataError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    stored_at INTEGER NOT NULL
)";

/// 单行占用字节数（按字节而非字符计）
const ROW_BYTES: &str = "LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))";

/// 基于 SQLite 的持久层
pub struct SqliteLayer {
    conn: Mutex<Connection>,
    /// 数据库路径（用于日志与错误报告）
    db_path: PathBuf,
    usage: AtomicU64,
}

impl SqliteLayer {
    /// 打开（必要时创建）数据库文件
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DataError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, path.to_path_buf())
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, PathBuf::from(":memory:"))
    }

    fn with_connection(conn: Connection, db_path: PathBuf) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let usage = count_usage(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            usage: AtomicU64::new(usage),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DataError::Concurrency(e.to_string()))
    }

    /// 已有行的占用字节数，行不存在时为 0
    fn row_bytes(conn: &Connection, key: &str) -> Result<u64> {
        let size: Option<i64> = conn
            .query_row(
                &format!("SELECT {ROW_BYTES} FROM cache_entries WHERE key = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(size.unwrap_or(0).max(0) as u64)
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

fn count_usage(conn: &Connection) -> Result<u64> {
    let total: i64 = conn.query_row(
        &format!("SELECT COALESCE(SUM({ROW_BYTES}), 0) FROM cache_entries"),
        [],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

impl DurableLayer for SqliteLayer {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        match value {
            Some(text) => {
                let mut entry: CacheEntry = serde_json::from_str(&text)?;
                entry.key = key.to_string();
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn store(&self, entry: &CacheEntry) -> Result<()> {
        let text = serde_json::to_string(entry)?;
        let conn = self.conn()?;
        let previous = Self::row_bytes(&conn, &entry.key)?;
        conn.execute(
            "INSERT INTO cache_entries (key, value, stored_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, stored_at = excluded.stored_at",
            params![entry.key, text, entry.stored_at],
        )?;
        self.adjust_usage(previous, (entry.key.len() + text.len()) as u64);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        let previous = Self::row_bytes(&conn, key)?;
        conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        self.adjust_usage(previous, 0);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM cache_entries ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn usage_bytes(&self) -> Result<u64> {
        Ok(self.usage.load(Ordering::SeqCst))
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cache_entries", [])?;
        self.usage.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.db_path.display())
    }
}
