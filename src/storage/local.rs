//! 基于 RocksDB 的本地存储（`columns` / `cubes` 两个列族）

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, FlushOptions, WriteBatch, DB};

use crate::common::{ColumnPos, ConvertError, CubePos, Result};
use crate::position::{decode_column, decode_cube, encode_column, encode_cube};
use crate::storage::{
    BinaryBatch, ColumnEntryFn, ColumnKeyFn, CubeEntryFn, CubeKeyFn, CubeStorage, PosBatch,
    ReadBatch, StorageOptions, NAMESPACE_COLUMNS, NAMESPACE_CUBES,
};

fn storage_err(e: rocksdb::Error) -> ConvertError {
    ConvertError::Storage(e.to_string())
}

pub struct LocalStorage {
    path: PathBuf,
    /// close() 之后为 None
    db:   RwLock<Option<DB>>,
}

impl LocalStorage {
    /// 在维度根目录 `root` 下打开（或创建）存储
    pub fn open(root: &Path, options: &StorageOptions) -> Result<Self> {
        let path = root.join(&options.subdirectory);
        std::fs::create_dir_all(&path)?;

        let cf_opts = options.cf_options();
        let descriptors = vec![
            ColumnFamilyDescriptor::new(NAMESPACE_COLUMNS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(NAMESPACE_CUBES, cf_opts),
        ];
        let db = DB::open_cf_descriptors(&options.db_options(), &path, descriptors)
            .map_err(|e| ConvertError::Storage(format!("failed to open {}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "opened local cube storage");
        Ok(Self { path, db: RwLock::new(Some(db)) })
    }

    /// 维度根目录下是否已经存在数据库
    pub fn exists_at(root: &Path, options: &StorageOptions) -> bool {
        root.join(&options.subdirectory).join("CURRENT").exists()
    }

    pub fn path(&self) -> &Path { &self.path }

    fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(ConvertError::Closed("storage"))?;
        f(db)
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| ConvertError::Storage(format!("missing column family `{name}`")))
}

fn get(db: &DB, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    db.get_cf(cf(db, ns)?, key).map_err(storage_err)
}

fn contains(db: &DB, ns: &str, key: &[u8]) -> Result<bool> {
    Ok(db.get_pinned_cf(cf(db, ns)?, key).map_err(storage_err)?.is_some())
}

/// 按键序遍历一个列族；回调返回 Break 时提前结束
fn scan(db: &DB, ns: &str, mut f: impl FnMut(&[u8], &[u8]) -> Result<ControlFlow<()>>) -> Result<()> {
    let mut iter = db.raw_iterator_cf(cf(db, ns)?);
    iter.seek_to_first();
    while iter.valid() {
        if let (Some(k), Some(v)) = (iter.key(), iter.value()) {
            if f(k, v)?.is_break() {
                return Ok(());
            }
        }
        iter.next();
    }
    iter.status().map_err(storage_err)
}

fn flush_db(db: &DB) -> Result<()> {
    let mut opts = FlushOptions::default();
    opts.set_wait(true);
    for ns in [NAMESPACE_COLUMNS, NAMESPACE_CUBES] {
        db.flush_cf_opt(cf(db, ns)?, &opts).map_err(storage_err)?;
    }
    db.flush_wal(true).map_err(storage_err)
}

impl CubeStorage for LocalStorage {
    fn column_exists(&self, pos: ColumnPos) -> Result<bool> {
        self.with_db(|db| contains(db, NAMESPACE_COLUMNS, &encode_column(pos)))
    }

    fn cube_exists(&self, pos: CubePos) -> Result<bool> {
        self.with_db(|db| contains(db, NAMESPACE_CUBES, &encode_cube(pos)))
    }

    /// 原生 multi-get 实现
    fn exists_batch(&self, positions: &PosBatch) -> Result<PosBatch> {
        let found = self.read_batch(positions)?;
        Ok(PosBatch {
            columns: found.columns.into_iter().filter(|(_, v)| v.is_some()).map(|(p, _)| p).collect(),
            cubes:   found.cubes.into_iter().filter(|(_, v)| v.is_some()).map(|(p, _)| p).collect(),
        })
    }

    fn read_column(&self, pos: ColumnPos) -> Result<Option<Vec<u8>>> {
        self.with_db(|db| get(db, NAMESPACE_COLUMNS, &encode_column(pos)))
    }

    fn read_cube(&self, pos: CubePos) -> Result<Option<Vec<u8>>> {
        self.with_db(|db| get(db, NAMESPACE_CUBES, &encode_cube(pos)))
    }

    fn read_batch(&self, positions: &PosBatch) -> Result<ReadBatch> {
        self.with_db(|db| {
            let cf_columns = cf(db, NAMESPACE_COLUMNS)?;
            let cf_cubes   = cf(db, NAMESPACE_CUBES)?;

            let keys = positions.columns.iter()
                .map(|&p| (cf_columns, encode_column(p).to_vec()))
                .chain(positions.cubes.iter().map(|&p| (cf_cubes, encode_cube(p).to_vec())));
            let mut values = db.multi_get_cf(keys).into_iter();

            let mut out = ReadBatch::default();
            for &pos in &positions.columns {
                let v = values.next().transpose().map_err(storage_err)?.flatten();
                out.columns.insert(pos, v);
            }
            for &pos in &positions.cubes {
                let v = values.next().transpose().map_err(storage_err)?.flatten();
                out.cubes.insert(pos, v);
            }
            Ok(out)
        })
    }

    fn write_column(&self, pos: ColumnPos, data: &[u8]) -> Result<()> {
        self.with_db(|db| {
            db.put_cf(cf(db, NAMESPACE_COLUMNS)?, encode_column(pos), data).map_err(storage_err)
        })
    }

    fn write_cube(&self, pos: CubePos, data: &[u8]) -> Result<()> {
        self.with_db(|db| {
            db.put_cf(cf(db, NAMESPACE_CUBES)?, encode_cube(pos), data).map_err(storage_err)
        })
    }

    fn write_batch(&self, batch: &BinaryBatch) -> Result<()> {
        self.with_db(|db| {
            let cf_columns = cf(db, NAMESPACE_COLUMNS)?;
            let cf_cubes   = cf(db, NAMESPACE_CUBES)?;

            let mut wb = WriteBatch::default();
            for (&pos, data) in &batch.columns {
                wb.put_cf(cf_columns, encode_column(pos), data);
            }
            for (&pos, data) in &batch.cubes {
                wb.put_cf(cf_cubes, encode_cube(pos), data);
            }
            db.write(wb).map_err(storage_err)
        })
    }

    fn for_each_column(&self, f: &mut ColumnKeyFn<'_>) -> Result<()> {
        self.with_db(|db| scan(db, NAMESPACE_COLUMNS, |k, _| Ok(f(decode_column(k)?))))
    }

    fn for_each_column_entry(&self, f: &mut ColumnEntryFn<'_>) -> Result<()> {
        self.with_db(|db| scan(db, NAMESPACE_COLUMNS, |k, v| Ok(f(decode_column(k)?, v))))
    }

    fn for_each_cube(&self, f: &mut CubeKeyFn<'_>) -> Result<()> {
        self.with_db(|db| scan(db, NAMESPACE_CUBES, |k, _| Ok(f(decode_cube(k)?))))
    }

    fn for_each_cube_entry(&self, f: &mut CubeEntryFn<'_>) -> Result<()> {
        self.with_db(|db| scan(db, NAMESPACE_CUBES, |k, v| Ok(f(decode_cube(k)?, v))))
    }

    fn flush(&self) -> Result<()> {
        self.with_db(flush_db)
    }

    fn close(&self) -> Result<()> {
        let db = self.db.write().take().ok_or(ConvertError::Closed("storage"))?;
        let flushed = flush_db(&db);
        drop(db);
        tracing::debug!(path = %self.path.display(), ok = flushed.is_ok(), "closed local cube storage");
        flushed
    }
}
