//! 内存存储后端
//!
//! 与 `LocalStorage` 使用相同的编码键和遍历顺序，便于测试和临时目标。
//! 额外记录批量写入次数，并支持注入一次写入失败。

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::common::{ColumnPos, ConvertError, CubePos, Result};
use crate::position::{decode_column, decode_cube, encode_column, encode_cube};
use crate::storage::{
    BinaryBatch, ColumnEntryFn, ColumnKeyFn, CubeEntryFn, CubeKeyFn, CubeStorage, PosBatch,
    ReadBatch,
};

#[derive(Default)]
struct Tables {
    columns: BTreeMap<[u8; 8], Vec<u8>>,
    cubes:   BTreeMap<[u8; 12], Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables:        RwLock<Tables>,
    closed:        AtomicBool,
    batch_writes:  AtomicUsize,
    fail_next:     AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self { Self::default() }

    /// 已执行的 `write_batch` 次数（失败的不计）
    pub fn batch_writes(&self) -> usize { self.batch_writes.load(Ordering::SeqCst) }

    /// 下一次写入返回存储错误，且不产生任何可见修改
    pub fn fail_next_write(&self) { self.fail_next.store(true, Ordering::SeqCst); }

    pub fn column_count(&self) -> usize { self.tables.read().columns.len() }
    pub fn cube_count(&self)   -> usize { self.tables.read().cubes.len() }
    pub fn is_closed(&self)    -> bool  { self.closed.load(Ordering::SeqCst) }

    /// 当前内容的快照；关闭后仍可调用
    pub fn snapshot(&self) -> BinaryBatch {
        let tables = self.tables.read();
        BinaryBatch {
            columns: tables.columns.iter()
                .filter_map(|(k, v)| decode_column(k).ok().map(|p| (p, v.clone())))
                .collect(),
            cubes: tables.cubes.iter()
                .filter_map(|(k, v)| decode_cube(k).ok().map(|p| (p, v.clone())))
                .collect(),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvertError::Closed("storage"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_open()?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ConvertError::Storage("injected write failure".into()));
        }
        Ok(())
    }
}

impl CubeStorage for MemoryStorage {
    fn column_exists(&self, pos: ColumnPos) -> Result<bool> {
        self.check_open()?;
        Ok(self.tables.read().columns.contains_key(&encode_column(pos)))
    }

    fn cube_exists(&self, pos: CubePos) -> Result<bool> {
        self.check_open()?;
        Ok(self.tables.read().cubes.contains_key(&encode_cube(pos)))
    }

    fn read_column(&self, pos: ColumnPos) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.tables.read().columns.get(&encode_column(pos)).cloned())
    }

    fn read_cube(&self, pos: CubePos) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.tables.read().cubes.get(&encode_cube(pos)).cloned())
    }

    fn read_batch(&self, positions: &PosBatch) -> Result<ReadBatch> {
        self.check_open()?;
        let tables = self.tables.read();
        Ok(ReadBatch {
            columns: positions.columns.iter()
                .map(|&p| (p, tables.columns.get(&encode_column(p)).cloned()))
                .collect(),
            cubes: positions.cubes.iter()
                .map(|&p| (p, tables.cubes.get(&encode_cube(p)).cloned()))
                .collect(),
        })
    }

    fn write_column(&self, pos: ColumnPos, data: &[u8]) -> Result<()> {
        self.check_write()?;
        self.tables.write().columns.insert(encode_column(pos), data.to_vec());
        Ok(())
    }

    fn write_cube(&self, pos: CubePos, data: &[u8]) -> Result<()> {
        self.check_write()?;
        self.tables.write().cubes.insert(encode_cube(pos), data.to_vec());
        Ok(())
    }

    fn write_batch(&self, batch: &BinaryBatch) -> Result<()> {
        self.check_write()?;
        // 整个批次在一把写锁内完成，读者看不到中间状态
        let mut tables = self.tables.write();
        for (&pos, data) in &batch.columns {
            tables.columns.insert(encode_column(pos), data.clone());
        }
        for (&pos, data) in &batch.cubes {
            tables.cubes.insert(encode_cube(pos), data.clone());
        }
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn for_each_column(&self, f: &mut ColumnKeyFn<'_>) -> Result<()> {
        self.for_each_column_entry(&mut |p, _| f(p))
    }

    fn for_each_column_entry(&self, f: &mut ColumnEntryFn<'_>) -> Result<()> {
        self.check_open()?;
        let tables = self.tables.read();
        for (k, v) in &tables.columns {
            if f(decode_column(k)?, v).is_break() { break; }
        }
        Ok(())
    }

    fn for_each_cube(&self, f: &mut CubeKeyFn<'_>) -> Result<()> {
        self.for_each_cube_entry(&mut |p, _| f(p))
    }

    fn for_each_cube_entry(&self, f: &mut CubeEntryFn<'_>) -> Result<()> {
        self.check_open()?;
        let tables = self.tables.read();
        for (k, v) in &tables.cubes {
            if f(decode_cube(k)?, v).is_break() { break; }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> { self.check_open() }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConvertError::Closed("storage"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_batch_leaves_nothing_visible() {
        let storage = MemoryStorage::new();
        let mut batch = BinaryBatch::default();
        for i in 0..10 {
            batch.columns.insert(ColumnPos::new(i, 0), vec![1; 4]);
        }
        for y in 0..5 {
            batch.cubes.insert(CubePos::new(0, y, 0), vec![2; 4]);
        }

        storage.fail_next_write();
        assert!(storage.write_batch(&batch).is_err());
        assert_eq!(storage.column_count() + storage.cube_count(), 0);
        assert_eq!(storage.batch_writes(), 0);

        storage.write_batch(&batch).unwrap();
        assert_eq!(storage.column_count(), 10);
        assert_eq!(storage.cube_count(), 5);
        assert_eq!(storage.batch_writes(), 1);
    }

    #[test]
    fn iteration_order_matches_encoded_keys() {
        let storage = MemoryStorage::new();
        let cubes = [CubePos::new(0, 0, 0), CubePos::new(-1, 5, 2), CubePos::new(4, -4, 4)];
        for &c in &cubes {
            storage.write_cube(c, b"").unwrap();
        }
        let mut seen = Vec::new();
        storage.for_each_cube(&mut |c| { seen.push(c); ControlFlow::Continue(()) }).unwrap();
        let mut expected = cubes.to_vec();
        expected.sort_by_key(|&c| encode_cube(c));
        assert_eq!(seen, expected);
    }

    #[test]
    fn closed_storage_rejects_everything() {
        let storage = MemoryStorage::new();
        storage.close().unwrap();
        assert!(storage.is_closed());
        assert!(matches!(storage.column_exists(ColumnPos::new(0, 0)), Err(ConvertError::Closed(_))));
        assert!(matches!(storage.flush(), Err(ConvertError::Closed(_))));
        assert!(matches!(storage.close(), Err(ConvertError::Closed(_))));
    }
}
