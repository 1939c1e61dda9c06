//! 立方体存储引擎抽象
//!
//! 底层是有序的嵌入式 KV 引擎，逻辑上分为两个命名空间：
//!
//! ```text
//! ┌──────────────────────── CubeStorage ────────────────────────┐
//! │  "columns" : encode_column(x,z)   (8 B)  → 列负载            │
//! │  "cubes"   : encode_cube(x,y,z)   (12 B) → 立方体负载        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! 遍历顺序即编码键顺序（Morton 序）。批量写入是原子的：要么全部可见，要么全部不可见。
//! `close()` 之后的任何调用都返回 `ConvertError::Closed`。

pub mod local;
pub mod memory;
pub mod options;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use crate::common::{ColumnPos, CubePos, Result};

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use options::StorageOptions;

/// 列族 / 命名空间名称
pub const NAMESPACE_COLUMNS: &str = "columns";
pub const NAMESPACE_CUBES:   &str = "cubes";

// ── 批量结构 ──────────────────────────────────────────────────────────────────

/// 一组列坐标 + 立方体坐标
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosBatch {
    pub columns: BTreeSet<ColumnPos>,
    pub cubes:   BTreeSet<CubePos>,
}

impl PosBatch {
    pub fn new(columns: BTreeSet<ColumnPos>, cubes: BTreeSet<CubePos>) -> Self {
        Self { columns, cubes }
    }

    pub fn len(&self)      -> usize { self.columns.len() + self.cubes.len() }
    pub fn is_empty(&self) -> bool  { self.columns.is_empty() && self.cubes.is_empty() }
}

/// 待写入的 坐标 → 负载
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryBatch {
    pub columns: BTreeMap<ColumnPos, Vec<u8>>,
    pub cubes:   BTreeMap<CubePos, Vec<u8>>,
}

impl BinaryBatch {
    pub fn len(&self)      -> usize { self.columns.len() + self.cubes.len() }
    pub fn is_empty(&self) -> bool  { self.columns.is_empty() && self.cubes.is_empty() }

    /// 所有负载的字节数之和
    pub fn payload_bytes(&self) -> usize {
        self.columns.values().chain(self.cubes.values()).map(Vec::len).sum()
    }
}

/// 批量读取结果；不存在的位置映射为 None
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub columns: BTreeMap<ColumnPos, Option<Vec<u8>>>,
    pub cubes:   BTreeMap<CubePos, Option<Vec<u8>>>,
}

// ── 回调类型 ──────────────────────────────────────────────────────────────────

pub type ColumnKeyFn<'a>   = dyn FnMut(ColumnPos) -> ControlFlow<()> + 'a;
pub type CubeKeyFn<'a>     = dyn FnMut(CubePos) -> ControlFlow<()> + 'a;
pub type ColumnEntryFn<'a> = dyn FnMut(ColumnPos, &[u8]) -> ControlFlow<()> + 'a;
pub type CubeEntryFn<'a>   = dyn FnMut(CubePos, &[u8]) -> ControlFlow<()> + 'a;

// ── CubeStorage ───────────────────────────────────────────────────────────────

/// 存储后端自行负责读 / 写 / 遍历之间的并发安全，调用方不再额外加锁。
pub trait CubeStorage: Send + Sync {
    fn column_exists(&self, pos: ColumnPos) -> Result<bool>;
    fn cube_exists(&self, pos: CubePos) -> Result<bool>;

    /// 批量存在性检查，返回存在的那部分坐标。
    ///
    /// 默认实现：逐个检查，但在多个线程上并行执行。
    fn exists_batch(&self, positions: &PosBatch) -> Result<PosBatch> {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let columns: Vec<ColumnPos> = positions.columns.iter().copied().collect();
        let cubes:   Vec<CubePos>   = positions.cubes.iter().copied().collect();

        std::thread::scope(|s| {
            let col_chunk  = columns.len().div_ceil(workers).max(1);
            let cube_chunk = cubes.len().div_ceil(workers).max(1);

            let col_tasks: Vec<_> = columns.chunks(col_chunk)
                .map(|chunk| s.spawn(move || -> Result<Vec<ColumnPos>> {
                    let mut found = Vec::new();
                    for &pos in chunk {
                        if self.column_exists(pos)? { found.push(pos); }
                    }
                    Ok(found)
                }))
                .collect();
            let cube_tasks: Vec<_> = cubes.chunks(cube_chunk)
                .map(|chunk| s.spawn(move || -> Result<Vec<CubePos>> {
                    let mut found = Vec::new();
                    for &pos in chunk {
                        if self.cube_exists(pos)? { found.push(pos); }
                    }
                    Ok(found)
                }))
                .collect();

            let mut out = PosBatch::default();
            for task in col_tasks {
                out.columns.extend(join_task(task)?);
            }
            for task in cube_tasks {
                out.cubes.extend(join_task(task)?);
            }
            Ok(out)
        })
    }

    fn read_column(&self, pos: ColumnPos) -> Result<Option<Vec<u8>>>;
    fn read_cube(&self, pos: CubePos) -> Result<Option<Vec<u8>>>;
    fn read_batch(&self, positions: &PosBatch) -> Result<ReadBatch>;

    fn write_column(&self, pos: ColumnPos, data: &[u8]) -> Result<()>;
    fn write_cube(&self, pos: CubePos, data: &[u8]) -> Result<()>;
    /// 原子批量写入
    fn write_batch(&self, batch: &BinaryBatch) -> Result<()>;

    fn for_each_column(&self, f: &mut ColumnKeyFn<'_>) -> Result<()>;
    fn for_each_column_entry(&self, f: &mut ColumnEntryFn<'_>) -> Result<()>;
    fn for_each_cube(&self, f: &mut CubeKeyFn<'_>) -> Result<()>;
    fn for_each_cube_entry(&self, f: &mut CubeEntryFn<'_>) -> Result<()>;

    /// 阻塞直到此前发出的所有写入落盘
    fn flush(&self) -> Result<()>;

    /// 刷盘并释放资源；只能调用一次
    fn close(&self) -> Result<()>;
}

fn join_task<T>(task: std::thread::ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    match task.join() {
        Ok(r) => r,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
