//! 基于 `CubeStorage` 的读取端与写入端

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{ColumnPos, ConvertError, Dimension, Result};
use crate::compression::Framing;
use crate::convert::{
    join_workers, ChunkReader, ChunkRecord, ChunkWriter, PhaseContext, RecordSink, WriteSession,
};
use crate::storage::{BinaryBatch, CubeStorage, LocalStorage, PosBatch, StorageOptions};

/// 按列分组读取时每次 multi-get 的列数
const GROUP_BATCH: usize = 256;

// ── LocalReader ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// 列扫描与立方体扫描各一个线程，各自产出单独的记录
    #[default]
    Split,
    /// 按列分组：一条记录带上该列及其所有立方体
    Grouped,
}

type GroupIndex = BTreeMap<ColumnPos, (bool, BTreeSet<i32>)>;

pub struct LocalReader {
    sources: Vec<(Dimension, Arc<dyn CubeStorage>)>,
    mode:    ScanMode,
    framing: Framing,
    /// Grouped 模式下计数阶段建立的 列 → (是否有列负载, 立方体 y)
    index:   Mutex<BTreeMap<Dimension, GroupIndex>>,
}

impl LocalReader {
    pub fn new(sources: Vec<(Dimension, Arc<dyn CubeStorage>)>, mode: ScanMode) -> Self {
        Self { sources, mode, framing: Framing::Raw, index: Mutex::new(BTreeMap::new()) }
    }

    /// 打开世界目录下各维度的本地存储；没有存储的维度直接跳过
    pub fn open(world: &Path, dimensions: &[Dimension], options: &StorageOptions, mode: ScanMode) -> Result<Self> {
        let mut sources: Vec<(Dimension, Arc<dyn CubeStorage>)> = Vec::new();
        for dim in dimensions {
            let root = dim.resolve(world);
            if !LocalStorage::exists_at(&root, options) {
                tracing::debug!(dimension = %dim, "no local storage, skipping");
                continue;
            }
            sources.push((dim.clone(), Arc::new(LocalStorage::open(&root, options)?)));
        }
        Ok(Self::new(sources, mode))
    }

    /// 源数据负载的封装方式（默认 Raw）
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.sources.iter().map(|(d, _)| d)
    }

    fn build_index(ctx: &PhaseContext<'_>, storage: &dyn CubeStorage) -> Result<GroupIndex> {
        let mut index = GroupIndex::new();
        storage.for_each_column(&mut |pos| {
            if ctx.should_stop() { return ControlFlow::Break(()); }
            index.entry(pos).or_default().0 = true;
            ControlFlow::Continue(())
        })?;
        storage.for_each_cube(&mut |pos| {
            if ctx.should_stop() { return ControlFlow::Break(()); }
            index.entry(pos.column()).or_default().1.insert(pos.y);
            ControlFlow::Continue(())
        })?;
        Ok(index)
    }

    fn load_grouped(
        &self,
        ctx:     &PhaseContext<'_>,
        sink:    &RecordSink<'_>,
        dim:     &Dimension,
        storage: &dyn CubeStorage,
    ) -> Result<()> {
        let cached = self.index.lock().remove(dim);
        let index = match cached {
            Some(index) => index,
            None => Self::build_index(ctx, storage)?,
        };
        let groups: Vec<_> = index.into_iter().collect();

        for chunk in groups.chunks(GROUP_BATCH) {
            if ctx.should_stop() {
                return Ok(());
            }
            let mut query = PosBatch::default();
            for (pos, (has_column, ys)) in chunk {
                if *has_column {
                    query.columns.insert(*pos);
                }
                query.cubes.extend(ys.iter().map(|&y| pos.cube(y)));
            }
            let mut found = match storage.read_batch(&query) {
                Ok(found) => found,
                Err(e) => {
                    ctx.report(e);
                    continue;
                }
            };

            for (pos, (_, ys)) in chunk {
                if ctx.should_stop() {
                    return Ok(());
                }
                let column = found.columns.remove(pos).flatten();
                let cubes: BTreeMap<i32, Vec<u8>> = ys.iter()
                    .filter_map(|&y| found.cubes.remove(&pos.cube(y)).flatten().map(|d| (y, d)))
                    .collect();
                // 两个阶段之间被删除的位置直接跳过
                let record = ChunkRecord::cubic(dim.clone(), *pos, self.framing, column, cubes);
                if record.is_empty() {
                    continue;
                }
                if sink.send(record).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

impl ChunkReader for LocalReader {
    fn count_all(&self, ctx: &PhaseContext<'_>, increment: &(dyn Fn(usize) + Sync)) -> Result<()> {
        std::thread::scope(|s| {
            let mut handles = Vec::new();
            for (dim, storage) in &self.sources {
                match self.mode {
                    ScanMode::Split => {
                        handles.push(s.spawn(move || storage.for_each_column(&mut |_| {
                            if ctx.should_stop() { return ControlFlow::Break(()); }
                            increment(1);
                            ControlFlow::Continue(())
                        })));
                        handles.push(s.spawn(move || storage.for_each_cube(&mut |_| {
                            if ctx.should_stop() { return ControlFlow::Break(()); }
                            increment(1);
                            ControlFlow::Continue(())
                        })));
                    }
                    ScanMode::Grouped => {
                        handles.push(s.spawn(move || {
                            let index = Self::build_index(ctx, storage.as_ref())?;
                            increment(index.len());
                            self.index.lock().insert(dim.clone(), index);
                            Ok(())
                        }));
                    }
                }
            }
            join_workers(handles)
        })
    }

    fn load_all(&self, ctx: &PhaseContext<'_>, sink: &RecordSink<'_>) -> Result<()> {
        let framing = self.framing;
        std::thread::scope(|s| {
            let mut handles = Vec::new();
            for (dim, storage) in &self.sources {
                match self.mode {
                    ScanMode::Split => {
                        handles.push(s.spawn(move || storage.for_each_column_entry(&mut |pos, data| {
                            if ctx.should_stop() { return ControlFlow::Break(()); }
                            sink.send(ChunkRecord::column(dim.clone(), pos, framing, data.to_vec()))
                        })));
                        handles.push(s.spawn(move || storage.for_each_cube_entry(&mut |pos, data| {
                            if ctx.should_stop() { return ControlFlow::Break(()); }
                            sink.send(ChunkRecord::cube(dim.clone(), pos, framing, data.to_vec()))
                        })));
                    }
                    ScanMode::Grouped => {
                        handles.push(s.spawn(move || self.load_grouped(ctx, sink, dim, storage.as_ref())));
                    }
                }
            }
            join_workers(handles)
        })
    }

    fn close(&self) -> Result<()> {
        close_all(self.sources.iter().map(|(d, s)| (d.clone(), s.clone())))
    }
}

/// 逐个关闭，失败汇总为 `CloseFailed`
fn close_all(storages: impl Iterator<Item = (Dimension, Arc<dyn CubeStorage>)>) -> Result<()> {
    let mut failures = Vec::new();
    for (dim, storage) in storages {
        if let Err(e) = storage.close() {
            tracing::error!(dimension = %dim, error = %e, "failed to close storage");
            failures.push((dim, e));
        }
    }
    if failures.is_empty() { Ok(()) } else { Err(ConvertError::CloseFailed(failures)) }
}

// ── WriteQueue ────────────────────────────────────────────────────────────────

/// 单个 worker 的写入缓冲；同一刷写窗口内同一位置后写覆盖先写
#[derive(Debug, Default)]
pub struct WriteQueue {
    batch:   BinaryBatch,
    bytes:   usize,
    /// 自上次刷出以来接收的记录数（含被覆盖的）
    records: usize,
}

impl WriteQueue {
    pub fn push(&mut self, record: ChunkRecord) {
        let ChunkRecord { position, column, cubes, .. } = record;
        self.records += 1;
        if let Some(data) = column {
            self.bytes += data.len();
            if let Some(old) = self.batch.columns.insert(position, data) {
                self.bytes -= old.len();
            }
        }
        for (y, data) in cubes {
            self.bytes += data.len();
            if let Some(old) = self.batch.cubes.insert(position.cube(y), data) {
                self.bytes -= old.len();
            }
        }
    }

    /// 当前缓冲的负载字节数
    pub fn bytes(&self)    -> usize { self.bytes }
    pub fn len(&self)      -> usize { self.batch.len() }
    pub fn is_empty(&self) -> bool  { self.batch.is_empty() }

    /// 作为一个原子批次写出并清空，返回提交的记录数。
    ///
    /// 写入失败时这批数据被丢弃，调用方应把它当作目标不可用处理。
    pub fn flush_to(&mut self, storage: &dyn CubeStorage) -> Result<usize> {
        let records = std::mem::take(&mut self.records);
        if self.batch.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batch);
        self.bytes = 0;
        tracing::debug!(records, entries = batch.len(), bytes = batch.payload_bytes(), "flushing write queue");
        storage.write_batch(&batch)?;
        Ok(records)
    }
}

// ── LocalWriter ───────────────────────────────────────────────────────────────

/// 某个维度的写入目标
pub struct Destination {
    pub storage: Arc<dyn CubeStorage>,
    /// 磁盘上的目录；`discard_all` 时删除
    pub path:    Option<PathBuf>,
}

type StorageOpener = dyn Fn(&Dimension) -> Result<Destination> + Send + Sync;

pub struct LocalWriter {
    opener:  Box<StorageOpener>,
    opened:  Mutex<BTreeMap<Dimension, Destination>>,
    /// 未 finish 就被丢弃的会话留下的缓冲，close 时刷出
    pending: Mutex<Vec<(Dimension, WriteQueue)>>,
    closed:  AtomicBool,
}

impl LocalWriter {
    pub fn new(opener: impl Fn(&Dimension) -> Result<Destination> + Send + Sync + 'static) -> Self {
        Self {
            opener:  Box::new(opener),
            opened:  Mutex::new(BTreeMap::new()),
            pending: Mutex::new(Vec::new()),
            closed:  AtomicBool::new(false),
        }
    }

    /// 写入世界目录下各维度的 RocksDB 存储
    pub fn rocksdb(world: impl Into<PathBuf>, options: StorageOptions) -> Self {
        let world = world.into();
        Self::new(move |dim| {
            let storage = LocalStorage::open(&dim.resolve(&world), &options)?;
            Ok(Destination { path: Some(storage.path().to_path_buf()), storage: Arc::new(storage) })
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvertError::Closed("writer"));
        }
        Ok(())
    }

    /// 某维度的目标存储，首次访问时打开
    pub fn storage(&self, dim: &Dimension) -> Result<Arc<dyn CubeStorage>> {
        self.check_open()?;
        let mut opened = self.opened.lock();
        if let Some(dest) = opened.get(dim) {
            return Ok(dest.storage.clone());
        }
        let dest = (self.opener)(dim)?;
        tracing::debug!(dimension = %dim, "opened destination storage");
        let storage = dest.storage.clone();
        opened.insert(dim.clone(), dest);
        Ok(storage)
    }
}

impl ChunkWriter for LocalWriter {
    fn session(&self, flush_threshold: usize) -> Result<Box<dyn WriteSession + '_>> {
        self.check_open()?;
        Ok(Box::new(LocalSession { writer: self, flush_threshold, queues: BTreeMap::new() }))
    }

    fn discard_all(&self) -> Result<()> {
        self.check_open()?;
        self.pending.lock().clear();
        let opened = std::mem::take(&mut *self.opened.lock());
        let mut failures = Vec::new();
        for (dim, dest) in opened {
            let discarded = dest.storage.close().and_then(|()| match dest.path.filter(|p| p.exists()) {
                Some(path) => Ok(std::fs::remove_dir_all(&path)?),
                None => Ok(()),
            });
            match discarded {
                Ok(()) => tracing::info!(dimension = %dim, "discarded destination"),
                Err(e) => {
                    tracing::error!(dimension = %dim, error = %e, "failed to discard destination");
                    failures.push((dim, e));
                }
            }
        }
        if failures.is_empty() { Ok(()) } else { Err(ConvertError::CloseFailed(failures)) }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConvertError::Closed("writer"));
        }
        let opened = std::mem::take(&mut *self.opened.lock());
        let mut failures = Vec::new();

        for (dim, mut queue) in std::mem::take(&mut *self.pending.lock()) {
            let Some(dest) = opened.get(&dim) else { continue };
            if let Err(e) = queue.flush_to(dest.storage.as_ref()) {
                tracing::error!(dimension = %dim, error = %e, "failed to flush pending writes");
                failures.push((dim, e));
            }
        }
        if let Err(ConvertError::CloseFailed(more)) = close_all(opened.into_iter().map(|(d, dest)| (d, dest.storage))) {
            failures.extend(more);
        }
        if failures.is_empty() { Ok(()) } else { Err(ConvertError::CloseFailed(failures)) }
    }
}

struct LocalSession<'w> {
    writer:          &'w LocalWriter,
    flush_threshold: usize,
    queues:          BTreeMap<Dimension, WriteQueue>,
}

impl WriteSession for LocalSession<'_> {
    fn accept(&mut self, record: ChunkRecord) -> Result<usize> {
        let storage = self.writer.storage(&record.dimension)?;
        let queue = self.queues.entry(record.dimension.clone()).or_default();
        queue.push(record);
        if queue.bytes() >= self.flush_threshold {
            return queue.flush_to(storage.as_ref());
        }
        Ok(0)
    }

    fn finish(&mut self) -> Result<usize> {
        let mut committed = 0;
        let mut first_err = None;
        for (dim, queue) in self.queues.iter_mut().filter(|(_, q)| !q.is_empty()) {
            match self.writer.storage(dim).and_then(|s| queue.flush_to(s.as_ref())) {
                Ok(n)  => committed += n,
                Err(e) => { first_err.get_or_insert(e); }
            }
        }
        first_err.map_or(Ok(committed), Err)
    }
}

impl Drop for LocalSession<'_> {
    fn drop(&mut self) {
        let leftover: Vec<_> = std::mem::take(&mut self.queues)
            .into_iter()
            .filter(|(_, q)| !q.is_empty())
            .collect();
        if !leftover.is_empty() {
            self.writer.pending.lock().extend(leftover);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CubePos;
    use crate::convert::{CancelToken, PhaseStatus};
    use crate::storage::MemoryStorage;

    fn memory_writer() -> (LocalWriter, Arc<Mutex<BTreeMap<Dimension, Arc<MemoryStorage>>>>) {
        let stores: Arc<Mutex<BTreeMap<Dimension, Arc<MemoryStorage>>>> = Arc::default();
        let handle = stores.clone();
        let writer = LocalWriter::new(move |dim| {
            let storage = handle.lock().entry(dim.clone()).or_default().clone();
            Ok(Destination { storage, path: None })
        });
        (writer, stores)
    }

    fn column(dim: &Dimension, x: i32, size: usize) -> ChunkRecord {
        ChunkRecord::column(dim.clone(), ColumnPos::new(x, 0), Framing::Raw, vec![7; size])
    }

    fn keep_going(_: &ConvertError) -> bool { true }

    #[test]
    fn queue_overwrites_same_position() {
        let dim = Dimension::overworld();
        let mut queue = WriteQueue::default();
        queue.push(column(&dim, 0, 100));
        queue.push(column(&dim, 0, 30));
        queue.push(ChunkRecord::cube(dim.clone(), CubePos::new(0, 1, 0), Framing::Raw, vec![0; 5]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.bytes(), 35);
    }

    #[test]
    fn no_write_until_threshold_then_one_batch() {
        let dim = Dimension::overworld();
        let (writer, stores) = memory_writer();
        let mut session = writer.session(1000).unwrap();

        for x in 0..9 {
            assert_eq!(session.accept(column(&dim, x, 100)).unwrap(), 0);
        }
        let storage = stores.lock()[&dim].clone();
        assert_eq!(storage.batch_writes(), 0);
        assert_eq!(storage.column_count(), 0);

        assert_eq!(session.accept(column(&dim, 9, 100)).unwrap(), 10);
        assert_eq!(storage.batch_writes(), 1);
        assert_eq!(storage.column_count(), 10);

        assert_eq!(session.finish().unwrap(), 0);
        assert_eq!(storage.batch_writes(), 1);
    }

    #[test]
    fn finish_flushes_partial_queue() {
        let dim = Dimension::end();
        let (writer, stores) = memory_writer();
        let mut session = writer.session(1 << 20).unwrap();
        session.accept(column(&dim, 1, 10)).unwrap();
        session.accept(column(&dim, 1, 12)).unwrap();
        assert_eq!(session.finish().unwrap(), 2);
        assert_eq!(stores.lock()[&dim].column_count(), 1);
    }

    #[test]
    fn failed_flush_commits_nothing_and_later_batches_count_only_themselves() {
        let dim = Dimension::overworld();
        let (writer, stores) = memory_writer();
        writer.storage(&dim).unwrap();
        let storage = stores.lock()[&dim].clone();
        storage.fail_next_write();

        let mut session = writer.session(300).unwrap();
        assert_eq!(session.accept(column(&dim, 0, 100)).unwrap(), 0);
        assert_eq!(session.accept(column(&dim, 1, 100)).unwrap(), 0);
        let err = session.accept(column(&dim, 2, 100)).unwrap_err();
        assert!(!err.is_record_error());
        assert_eq!(storage.column_count(), 0);

        for x in 3..5 {
            assert_eq!(session.accept(column(&dim, x, 100)).unwrap(), 0);
        }
        assert_eq!(session.accept(column(&dim, 5, 100)).unwrap(), 3);
        assert_eq!(session.finish().unwrap(), 0);
        assert_eq!(storage.column_count(), 3);
    }

    #[test]
    fn close_flushes_queues_left_by_dropped_sessions() {
        let dim = Dimension::overworld();
        let (writer, stores) = memory_writer();
        {
            let mut session = writer.session(1 << 20).unwrap();
            session.accept(column(&dim, 1, 10)).unwrap();
        }
        writer.close().unwrap();
        let storage = stores.lock()[&dim].clone();
        assert_eq!(storage.column_count(), 1);
        assert!(storage.is_closed());
        assert!(matches!(writer.close(), Err(ConvertError::Closed(_))));
        assert!(matches!(writer.session(1), Err(ConvertError::Closed(_))));
    }

    #[test]
    fn close_collects_failures_from_every_dimension() {
        let (writer, stores) = memory_writer();
        for dim in [Dimension::overworld(), Dimension::nether(), Dimension::end()] {
            let mut session = writer.session(1 << 20).unwrap();
            session.accept(column(&dim, 0, 10)).unwrap();
        }
        stores.lock()[&Dimension::overworld()].fail_next_write();
        stores.lock()[&Dimension::end()].fail_next_write();

        match writer.close() {
            Err(ConvertError::CloseFailed(failures)) => {
                let dims: BTreeSet<_> = failures.iter().map(|(d, _)| d.name().to_string()).collect();
                assert_eq!(dims, BTreeSet::from(["overworld".to_string(), "the_end".to_string()]));
            }
            other => panic!("unexpected close result: {other:?}"),
        }
        assert_eq!(stores.lock()[&Dimension::nether()].column_count(), 1);
    }

    #[test]
    fn discard_keeps_going_after_a_failed_dimension() {
        let (writer, stores) = memory_writer();
        let mut session = writer.session(1).unwrap();
        for dim in [Dimension::overworld(), Dimension::nether()] {
            session.accept(column(&dim, 0, 10)).unwrap();
        }
        drop(session);
        stores.lock()[&Dimension::overworld()].close().unwrap();

        match writer.discard_all() {
            Err(ConvertError::CloseFailed(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, Dimension::overworld());
            }
            other => panic!("unexpected discard result: {other:?}"),
        }
        assert!(stores.lock()[&Dimension::nether()].is_closed());
        writer.close().unwrap();
        assert!(matches!(writer.discard_all(), Err(ConvertError::Closed(_))));
    }

    #[test]
    fn rocksdb_writer_discard_removes_destination() {
        let world = tempfile::TempDir::new().unwrap();
        let writer = LocalWriter::rocksdb(world.path(), StorageOptions::small());
        let dim = Dimension::nether();
        let mut session = writer.session(1).unwrap();
        session.accept(column(&dim, 0, 10)).unwrap();
        drop(session);

        let db_dir = dim.resolve(world.path()).join(&StorageOptions::small().subdirectory);
        assert!(db_dir.exists());
        writer.discard_all().unwrap();
        assert!(!db_dir.exists());
        writer.close().unwrap();
    }

    fn populated_sources() -> Vec<(Dimension, Arc<dyn CubeStorage>)> {
        let a = MemoryStorage::new();
        for x in 0..3 {
            a.write_column(ColumnPos::new(x, 0), b"col").unwrap();
        }
        a.write_cube(CubePos::new(0, 0, 0), b"c0").unwrap();
        a.write_cube(CubePos::new(0, 1, 0), b"c1").unwrap();
        a.write_cube(CubePos::new(5, 0, 5), b"lonely").unwrap();
        vec![(Dimension::overworld(), Arc::new(a) as Arc<dyn CubeStorage>)]
    }

    #[test]
    fn split_reader_emits_columns_and_cubes_separately() {
        let reader = LocalReader::new(populated_sources(), ScanMode::Split);
        let ctx = PhaseContext::new(CancelToken::new(), &keep_going);
        let counted = std::sync::atomic::AtomicUsize::new(0);
        reader.count_all(&ctx, &|n| { counted.fetch_add(n, Ordering::SeqCst); }).unwrap();
        assert_eq!(counted.load(Ordering::SeqCst), 6);

        let seen = Mutex::new(Vec::new());
        let sink = RecordSink::new(|r| { seen.lock().push(r); ControlFlow::Continue(()) });
        reader.load_all(&ctx, &sink).unwrap();
        assert_eq!(sink.sent(), 6);
        assert_eq!(ctx.status(), PhaseStatus::Completed);
    }

    #[test]
    fn grouped_reader_merges_cubes_into_their_column() {
        let reader = LocalReader::new(populated_sources(), ScanMode::Grouped);
        let ctx = PhaseContext::new(CancelToken::new(), &keep_going);
        let counted = std::sync::atomic::AtomicUsize::new(0);
        reader.count_all(&ctx, &|n| { counted.fetch_add(n, Ordering::SeqCst); }).unwrap();
        assert_eq!(counted.load(Ordering::SeqCst), 4);

        let seen = Mutex::new(Vec::new());
        let sink = RecordSink::new(|r| { seen.lock().push(r); ControlFlow::Continue(()) });
        reader.load_all(&ctx, &sink).unwrap();
        drop(sink);

        let records = seen.into_inner();
        assert_eq!(records.len(), 4);
        let origin = records.iter().find(|r| r.position == ColumnPos::new(0, 0)).unwrap();
        assert_eq!(origin.column.as_deref(), Some(&b"col"[..]));
        assert_eq!(origin.cubes.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        let lonely = records.iter().find(|r| r.position == ColumnPos::new(5, 5)).unwrap();
        assert!(lonely.column.is_none());
    }

    #[test]
    fn cancelled_reader_emits_nothing() {
        let reader = LocalReader::new(populated_sources(), ScanMode::Split);
        let token = CancelToken::new();
        token.cancel();
        let ctx = PhaseContext::new(token, &keep_going);
        let sink = RecordSink::new(|_| ControlFlow::Continue(()));
        reader.load_all(&ctx, &sink).unwrap();
        assert_eq!(sink.sent(), 0);
        assert_eq!(ctx.status(), PhaseStatus::Cancelled);
    }
}
