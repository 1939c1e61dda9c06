//! 区域文件
//!
//! 一个区域句柄覆盖一组固定数量的条目：旧格式与立方体世界的列区域是 32×32 列，
//! 立方体区域是 16×16×16 个立方体。句柄由 `RegionProvider` 打开，
//! 由 `RegionCache` 持有并按区域坐标逐键串行访问。

pub mod cache;
pub mod file;

use std::fmt::{Debug, Display};
use std::hash::Hash;

use crate::common::{CubeRegionKey, RegionKey, Result};

pub use cache::{RegionCache, RegionCacheConfig};
pub use file::{RegionDir, RegionFile, SectorLayout};

/// 打开的区域句柄；同一时刻只被一个持有者访问
pub trait Region: Send {
    /// 读取区域内第 `index` 个条目，不存在时返回 None
    fn read(&mut self, index: usize) -> Result<Option<Vec<u8>>>;
    fn write(&mut self, index: usize, data: &[u8]) -> Result<()>;
    /// 已占用的条目下标（升序）
    fn entries(&self) -> Vec<usize>;
    fn flush(&mut self) -> Result<()>;

    /// 释放前调用，之后句柄即被丢弃
    fn close(&mut self) -> Result<()> { self.flush() }
}

/// 区域坐标，同时决定文件名中的坐标部分
pub trait RegionCoord: Copy + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static {
    /// 文件名里的坐标字段
    fn fields(&self) -> Vec<i32>;
    fn from_fields(fields: &[i32]) -> Option<Self>;
}

impl RegionCoord for RegionKey {
    fn fields(&self) -> Vec<i32> { vec![self.x, self.z] }

    fn from_fields(fields: &[i32]) -> Option<Self> {
        match *fields {
            [x, z] => Some(RegionKey::new(x, z)),
            _ => None,
        }
    }
}

impl RegionCoord for CubeRegionKey {
    fn fields(&self) -> Vec<i32> { vec![self.x, self.y, self.z] }

    fn from_fields(fields: &[i32]) -> Option<Self> {
        match *fields {
            [x, y, z] => Some(CubeRegionKey::new(x, y, z)),
            _ => None,
        }
    }
}

pub trait RegionProvider: Send + Sync {
    type Key: RegionCoord;
    type Region: Region;

    /// 打开 `key` 处的区域；`create` 为 false 且区域不存在时返回 None
    fn open(&self, key: Self::Key, create: bool) -> Result<Option<Self::Region>>;
    fn region_keys(&self) -> Result<Vec<Self::Key>>;
    fn close(&self) -> Result<()>;
}
