//! 文件操作辅助函数
//!
//! 提供持久化缓存需要的原子写入、权限设置和目录占用统计。

use crate::data::{DataError, Result};
use std::fs;
use std::path::Path;

/// 原子写入文件
///
/// 先写入同目录下的临时文件再重命名，避免读到写了一半的内容。
/// 自动创建父目录并设置权限（Unix 平台 0o600）。
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DataError::io(parent, e))?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).map_err(|e| DataError::io(&tmp_path, e))?;
    set_permissions(&tmp_path)?;
    fs::rename(&tmp_path, path).map_err(|e| DataError::io(path, e))?;
    Ok(())
}

/// 删除文件，不存在时视为成功
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DataError::io(path, e)),
    }
}

/// 统计目录下指定扩展名文件的总大小（不递归）
pub fn dir_size(dir: &Path, extension: &str) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(dir).map_err(|e| DataError::io(dir, e))? {
        let entry = entry.map_err(|e| DataError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
            total += entry.metadata().map_err(|e| DataError::io(&path, e))?.len();
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn set_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path).map_err(|e| DataError::io(path, e))?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).map_err(|e| DataError::io(path, e))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parent() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("entry.json");

        atomic_write(&path, b"{}")?;
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        assert!(!path.with_extension("tmp").exists());

        // 覆盖写入
        atomic_write(&path, b"[1]")?;
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_permissions() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry.json");
        atomic_write(&path, b"{}")?;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }

    #[test]
    fn test_remove_if_exists() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gone.json");
        remove_if_exists(&path)?;
        fs::write(&path, "x").unwrap();
        remove_if_exists(&path)?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_dir_size_filters_extension() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.json"), "1234").unwrap();
        fs::write(temp_dir.path().join("b.json"), "12").unwrap();
        fs::write(temp_dir.path().join("c.tmp"), "123456789").unwrap();
        assert_eq!(dir_size(temp_dir.path(), "json")?, 6);
        assert_eq!(dir_size(&temp_dir.path().join("missing"), "json")?, 0);
        Ok(())
    }
}
