//! 全局基础类型与错误定义

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

// ── Dimension ─────────────────────────────────────────────────────────────────

/// 世界中的一个独立空间分区（主世界 / 下界 / 末地 ...）
///
/// 维度之间从不共享存储句柄；`directory` 为空表示主维度，直接位于世界根目录。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dimension {
    name:      Arc<str>,
    directory: Arc<str>,
}

impl Dimension {
    pub fn new(name: &str, directory: &str) -> Self {
        Self { name: name.into(), directory: directory.into() }
    }

    pub fn overworld() -> Self { Self::new("overworld", "") }
    pub fn nether()    -> Self { Self::new("the_nether", "DIM-1") }
    pub fn end()       -> Self { Self::new("the_end", "DIM1") }

    pub fn name(&self)      -> &str { &self.name }
    pub fn directory(&self) -> &str { &self.directory }

    /// 维度在世界目录下的根路径
    pub fn resolve(&self, world_dir: &std::path::Path) -> PathBuf {
        if self.directory.is_empty() {
            world_dir.to_path_buf()
        } else {
            world_dir.join(&*self.directory)
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.name)
    }
}

// ── 坐标 ──────────────────────────────────────────────────────────────────────

/// 地形列坐标 (x, z)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnPos {
    pub x: i32,
    pub z: i32,
}

impl ColumnPos {
    pub fn new(x: i32, z: i32) -> Self { Self { x, z } }

    /// 该列上第 `y` 个立方体的坐标
    pub fn cube(self, y: i32) -> CubePos { CubePos::new(self.x, y, self.z) }

    /// 所属 32×32 区域的坐标
    pub fn region(self) -> RegionKey { RegionKey::new(self.x >> 5, self.z >> 5) }

    /// 在所属区域内的下标 (0..1024)
    pub fn region_index(self) -> usize {
        ((self.x & 31) as usize) | (((self.z & 31) as usize) << 5)
    }
}

impl std::fmt::Display for ColumnPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.x, self.z)
    }
}

/// 立方体坐标 (x, y, z)，属于 (x, z) 处的列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CubePos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CubePos {
    pub fn new(x: i32, y: i32, z: i32) -> Self { Self { x, y, z } }
    pub fn column(self) -> ColumnPos { ColumnPos::new(self.x, self.z) }

    /// 所属 16×16×16 立方体区域的坐标
    pub fn region(self) -> CubeRegionKey { CubeRegionKey::new(self.x >> 4, self.y >> 4, self.z >> 4) }

    /// 在所属立方体区域内的下标 (0..4096)
    pub fn region_index(self) -> usize {
        (((self.x & 15) as usize) << 8) | (((self.y & 15) as usize) << 4) | ((self.z & 15) as usize)
    }
}

impl std::fmt::Display for CubePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// 旧格式区域文件的坐标（列坐标 >> 5）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub x: i32,
    pub z: i32,
}

impl RegionKey {
    pub fn new(x: i32, z: i32) -> Self { Self { x, z } }

    /// 区域内下标 `index` 对应的列坐标
    pub fn column_at(self, index: usize) -> ColumnPos {
        ColumnPos::new((self.x << 5) | (index & 31) as i32, (self.z << 5) | ((index >> 5) & 31) as i32)
    }
}

impl std::fmt::Display for RegionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r.{}.{}", self.x, self.z)
    }
}

/// 立方体区域文件的坐标（立方体坐标 >> 4）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CubeRegionKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CubeRegionKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self { Self { x, y, z } }

    pub fn cube_at(self, index: usize) -> CubePos {
        CubePos::new(
            (self.x << 4) | ((index >> 8) & 15) as i32,
            (self.y << 4) | ((index >> 4) & 15) as i32,
            (self.z << 4) | (index & 15) as i32,
        )
    }
}

impl std::fmt::Display for CubeRegionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.x, self.y, self.z)
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("payload of {size} bytes does not compress below {limit} bytes")]
    OversizedPayload { size: usize, limit: usize },
    #[error("unsupported compression format: {0}")]
    UnsupportedFormat(u8),
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),
    #[error("{0} already closed")]
    Closed(&'static str),
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },
    #[error("region entry of {size} bytes exceeds {limit} bytes")]
    RegionEntryTooLarge { size: usize, limit: usize },
    #[error("record framing mismatch: expected {expected:?}, got {actual:?}")]
    FramingMismatch {
        expected: crate::compression::Framing,
        actual:   crate::compression::Framing,
    },
    #[error("close failed for {} dimension(s): {}", .0.len(), describe_failures(.0))]
    CloseFailed(Vec<(Dimension, ConvertError)>),
}

impl ConvertError {
    /// 只影响单条记录的错误，交给错误谓词决定跳过还是中止。
    ///
    /// 其余错误（I/O、存储、已关闭）意味着目标本身不可用，对整个阶段是致命的。
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            ConvertError::OversizedPayload { .. }
                | ConvertError::UnsupportedFormat(_)
                | ConvertError::CorruptPayload(_)
                | ConvertError::InvalidKey { .. }
                | ConvertError::RegionEntryTooLarge { .. }
                | ConvertError::FramingMismatch { .. }
        )
    }
}

fn describe_failures(failures: &[(Dimension, ConvertError)]) -> String {
    failures.iter()
        .map(|(dim, e)| format!("{dim}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_index_round_trips_through_region_key() {
        for &(x, z) in &[(0, 0), (31, 31), (-1, -1), (-33, 64), (1000, -1000)] {
            let pos = ColumnPos::new(x, z);
            assert_eq!(pos.region().column_at(pos.region_index()), pos);
        }
    }

    #[test]
    fn cube_region_index_round_trips_through_key() {
        for &(x, y, z) in &[(0, 0, 0), (15, 15, 15), (-1, -1, -1), (-17, 40, 33), (1000, -5, -1000)] {
            let pos = CubePos::new(x, y, z);
            assert!(pos.region_index() < 4096);
            assert_eq!(pos.region().cube_at(pos.region_index()), pos);
        }
        assert_eq!(CubePos::new(-1, 16, 15).region(), CubeRegionKey::new(-1, 1, 0));
    }

    #[test]
    fn storage_failures_are_not_record_errors() {
        assert!(ConvertError::OversizedPayload { size: 2, limit: 1 }.is_record_error());
        assert!(ConvertError::CorruptPayload("bad".into()).is_record_error());
        assert!(!ConvertError::Storage("disk full".into()).is_record_error());
        assert!(!ConvertError::Closed("writer").is_record_error());
        assert!(!ConvertError::Io(std::io::ErrorKind::PermissionDenied.into()).is_record_error());
    }

    #[test]
    fn dimension_resolves_relative_directory() {
        let root = std::path::Path::new("/world");
        assert_eq!(Dimension::overworld().resolve(root), root);
        assert_eq!(Dimension::nether().resolve(root), root.join("DIM-1"));
    }

    #[test]
    fn close_failed_lists_every_dimension() {
        let err = ConvertError::CloseFailed(vec![
            (Dimension::overworld(), ConvertError::Storage("disk full".into())),
            (Dimension::end(), ConvertError::Closed("storage")),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 dimension(s)"));
        assert!(msg.contains("overworld: storage error: disk full"));
        assert!(msg.contains("the_end: storage already closed"));
    }
}
