use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indicatif::ProgressStyle;

use crate::error::Result;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) ETA {eta} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// 计算不平衡度，1.0 表示完全均匀
pub fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0f64, 0.0f64);
    for &h in hist {
        let h = h as f64;
        tot += h;
        uf += h * h;
    }
    if tot == 0.0 {
        return 0.0;
    }
    (uf * hist.len() as f64 / (tot * tot)) as f32
}

/// 平方 L2 距离
#[inline]
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 返回 `path` 对应的临时文件路径
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// 先写入临时文件再重命名，避免留下写了一半的文件
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imbalance_factor() {
        assert_eq!(imbalance_factor(&[10, 10, 10, 10]), 1.0);
        assert_eq!(imbalance_factor(&[40, 0, 0, 0]), 4.0);
        assert_eq!(imbalance_factor(&[]), 0.0);
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        assert!(!tmp_path(&path).exists());
    }
}
