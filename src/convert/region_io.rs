//! 区域文件的读取端与写入端，统一经由 `RegionCache` 访问句柄
//!
//! ```text
//!   旧格式世界            <dim>/region/r.<x>.<z>.mca       列，Tagged 封装
//!   立方体世界            <dim>/region2d/<x>.<z>.2dr       列，Gzip 封装
//!                         <dim>/region3d/<x>.<y>.<z>.3dr   立方体，Gzip 封装
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{ConvertError, CubeRegionKey, Dimension, RegionKey, Result};
use crate::compression::{Framing, MAX_COMPRESSED_SIZE};
use crate::convert::{
    join_workers, ChunkReader, ChunkRecord, ChunkWriter, PhaseContext, RecordSink, WriteSession,
};
use crate::region::{Region, RegionCache, RegionCacheConfig, RegionDir, RegionProvider};

pub const DEFAULT_REGION_SUBDIR:    &str = "region";
pub const DEFAULT_REGION_EXTENSION: &str = "mca";
pub const CUBIC_COLUMN_SUBDIR:      &str = "region2d";
pub const CUBIC_CUBE_SUBDIR:        &str = "region3d";

type ColumnCache = RegionCache<RegionDir<RegionKey>>;
type CubeCache   = RegionCache<RegionDir<CubeRegionKey>>;

fn anvil_cache(world: &Path, dim: &Dimension, subdir: &str, ext: &str, config: RegionCacheConfig) -> ColumnCache {
    RegionCache::new(RegionDir::anvil(dim.resolve(world).join(subdir), ext), config)
}

/// 逐维度收集失败，汇总为 `CloseFailed`
fn aggregate(results: impl IntoIterator<Item = (Dimension, Result<()>)>, action: &str) -> Result<()> {
    let mut failures = Vec::new();
    for (dim, result) in results {
        if let Err(e) = result {
            tracing::error!(dimension = %dim, error = %e, "failed to {action} region files");
            failures.push((dim, e));
        }
    }
    if failures.is_empty() { Ok(()) } else { Err(ConvertError::CloseFailed(failures)) }
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}

// ── 通用扫描 ──────────────────────────────────────────────────────────────────

fn count_regions<P: RegionProvider>(
    ctx:       &PhaseContext<'_>,
    cache:     &RegionCache<P>,
    increment: &(dyn Fn(usize) + Sync),
) -> Result<()> {
    for key in cache.region_keys()? {
        if ctx.should_stop() {
            break;
        }
        match cache.with_existing_region(key, |r| Ok(r.entries().len())) {
            Ok(Some(n)) => increment(n),
            Ok(None)    => {}
            Err(e)      => ctx.report(e),
        }
    }
    Ok(())
}

/// 逐区域、逐条目读取，`record` 把 (区域, 下标, 负载) 组装成记录
fn load_regions<P: RegionProvider>(
    ctx:    &PhaseContext<'_>,
    sink:   &RecordSink<'_>,
    cache:  &RegionCache<P>,
    record: impl Fn(P::Key, usize, Vec<u8>) -> ChunkRecord,
) -> Result<()> {
    for key in cache.region_keys()? {
        if ctx.should_stop() {
            return Ok(());
        }
        let entries = match cache.with_existing_region(key, |r| Ok(r.entries())) {
            Ok(Some(entries)) => entries,
            Ok(None) => continue,
            Err(e) => {
                ctx.report(e);
                continue;
            }
        };
        // 每个条目单独取一次句柄，其他 worker 和清理可以在条目之间插入
        for index in entries {
            if ctx.should_stop() {
                return Ok(());
            }
            match cache.with_existing_region(key, |r| r.read(index)) {
                Ok(Some(Some(data))) => {
                    if sink.send(record(key, index, data)).is_break() {
                        return Ok(());
                    }
                }
                Ok(_)  => {}
                Err(e) => ctx.report(e),
            }
        }
    }
    Ok(())
}

// ── RegionColumnReader ────────────────────────────────────────────────────────

/// 逐区域、逐条目读取列负载（Tagged 封装）
pub struct RegionColumnReader {
    sources: Vec<(Dimension, ColumnCache)>,
}

impl RegionColumnReader {
    pub fn new(sources: Vec<(Dimension, ColumnCache)>) -> Self {
        Self { sources }
    }

    /// 世界目录下各维度的 `<dim>/region/*.mca`
    pub fn open(world: &Path, dimensions: &[Dimension], config: RegionCacheConfig) -> Self {
        Self::new(dimensions.iter()
            .map(|d| (d.clone(), anvil_cache(world, d, DEFAULT_REGION_SUBDIR, DEFAULT_REGION_EXTENSION, config)))
            .collect())
    }
}

impl ChunkReader for RegionColumnReader {
    fn count_all(&self, ctx: &PhaseContext<'_>, increment: &(dyn Fn(usize) + Sync)) -> Result<()> {
        std::thread::scope(|s| {
            let handles = self.sources.iter()
                .map(|(_, cache)| s.spawn(move || count_regions(ctx, cache, increment)))
                .collect();
            join_workers(handles)
        })
    }

    fn load_all(&self, ctx: &PhaseContext<'_>, sink: &RecordSink<'_>) -> Result<()> {
        std::thread::scope(|s| {
            let handles = self.sources.iter()
                .map(|(dim, cache)| s.spawn(move || load_regions(ctx, sink, cache, |key, index, data| {
                    ChunkRecord::column(dim.clone(), key.column_at(index), Framing::Tagged, data)
                })))
                .collect();
            join_workers(handles)
        })
    }

    fn close(&self) -> Result<()> {
        aggregate(self.sources.iter().map(|(d, c)| (d.clone(), c.close())), "close")
    }
}

// ── RegionColumnWriter ────────────────────────────────────────────────────────

/// 把 Tagged 封装的列负载写入区域文件，区域按需创建
pub struct RegionColumnWriter {
    world:     PathBuf,
    subdir:    String,
    extension: String,
    config:    RegionCacheConfig,
    caches:    Mutex<BTreeMap<Dimension, Arc<ColumnCache>>>,
    closed:    AtomicBool,
}

impl RegionColumnWriter {
    pub fn new(world: impl Into<PathBuf>, config: RegionCacheConfig) -> Self {
        Self {
            world:     world.into(),
            subdir:    DEFAULT_REGION_SUBDIR.into(),
            extension: DEFAULT_REGION_EXTENSION.into(),
            config,
            caches:    Mutex::new(BTreeMap::new()),
            closed:    AtomicBool::new(false),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.into();
        self
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvertError::Closed("writer"));
        }
        Ok(())
    }

    fn cache(&self, dim: &Dimension) -> Result<Arc<ColumnCache>> {
        self.check_open()?;
        Ok(self.caches.lock()
            .entry(dim.clone())
            .or_insert_with(|| Arc::new(anvil_cache(&self.world, dim, &self.subdir, &self.extension, self.config)))
            .clone())
    }
}

impl ChunkWriter for RegionColumnWriter {
    fn session(&self, _flush_threshold: usize) -> Result<Box<dyn WriteSession + '_>> {
        self.check_open()?;
        Ok(Box::new(RegionSession { writer: self }))
    }

    fn discard_all(&self) -> Result<()> {
        self.check_open()?;
        let caches = std::mem::take(&mut *self.caches.lock());
        aggregate(caches.into_iter().map(|(dim, cache)| {
            let result = cache.close().and_then(|()| remove_dir(cache.provider().dir()));
            if result.is_ok() {
                tracing::info!(dimension = %dim, "discarded region files");
            }
            (dim, result)
        }), "discard")
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConvertError::Closed("writer"));
        }
        let caches = std::mem::take(&mut *self.caches.lock());
        aggregate(caches.into_iter().map(|(d, c)| (d, c.close())), "close")
    }
}

/// 区域写入直接落到文件，没有额外缓冲
struct RegionSession<'w> {
    writer: &'w RegionColumnWriter,
}

impl WriteSession for RegionSession<'_> {
    fn accept(&mut self, record: ChunkRecord) -> Result<usize> {
        if record.framing != Framing::Tagged {
            return Err(ConvertError::FramingMismatch { expected: Framing::Tagged, actual: record.framing });
        }
        if !record.cubes.is_empty() {
            return Err(ConvertError::CorruptPayload(format!(
                "region files hold columns only, got {} cube(s) at {}", record.cubes.len(), record.position
            )));
        }
        let pos = record.position;
        let Some(data) = record.column else {
            return Ok(0);
        };
        if data.len() >= MAX_COMPRESSED_SIZE {
            return Err(ConvertError::OversizedPayload { size: data.len(), limit: MAX_COMPRESSED_SIZE });
        }
        let cache = self.writer.cache(&record.dimension)?;
        cache.with_region(pos.region(), true, |r| r.write(pos.region_index(), &data))?;
        Ok(1)
    }

    fn finish(&mut self) -> Result<usize> { Ok(0) }
}

// ── 立方体世界 ────────────────────────────────────────────────────────────────

/// 一个维度的立方体世界区域：列区域与立方体区域并列存放
pub struct CubicRegions {
    columns: ColumnCache,
    cubes:   CubeCache,
}

impl CubicRegions {
    /// 维度根目录下的 `region2d/` 与 `region3d/`
    pub fn open(root: &Path, config: RegionCacheConfig) -> Self {
        Self {
            columns: RegionCache::new(RegionDir::cubic_columns(root.join(CUBIC_COLUMN_SUBDIR)), config),
            cubes:   RegionCache::new(RegionDir::cubic_cubes(root.join(CUBIC_CUBE_SUBDIR)), config),
        }
    }

    /// 两个缓存都尝试关闭，返回第一个错误
    fn close(&self) -> Result<()> {
        let columns = self.columns.close();
        let cubes = self.cubes.close();
        columns.and(cubes)
    }

    fn remove(&self) -> Result<()> {
        remove_dir(self.columns.provider().dir())?;
        remove_dir(self.cubes.provider().dir())
    }
}

/// 读取立方体世界：列与立方体各一个扫描线程，负载为 Gzip 封装
pub struct CubicRegionReader {
    sources: Vec<(Dimension, CubicRegions)>,
}

impl CubicRegionReader {
    pub fn new(sources: Vec<(Dimension, CubicRegions)>) -> Self {
        Self { sources }
    }

    pub fn open(world: &Path, dimensions: &[Dimension], config: RegionCacheConfig) -> Self {
        Self::new(dimensions.iter()
            .map(|d| (d.clone(), CubicRegions::open(&d.resolve(world), config)))
            .collect())
    }
}

impl ChunkReader for CubicRegionReader {
    fn count_all(&self, ctx: &PhaseContext<'_>, increment: &(dyn Fn(usize) + Sync)) -> Result<()> {
        std::thread::scope(|s| {
            let mut handles = Vec::new();
            for (_, regions) in &self.sources {
                handles.push(s.spawn(move || count_regions(ctx, &regions.columns, increment)));
                handles.push(s.spawn(move || count_regions(ctx, &regions.cubes, increment)));
            }
            join_workers(handles)
        })
    }

    fn load_all(&self, ctx: &PhaseContext<'_>, sink: &RecordSink<'_>) -> Result<()> {
        std::thread::scope(|s| {
            let mut handles = Vec::new();
            for (dim, regions) in &self.sources {
                handles.push(s.spawn(move || load_regions(ctx, sink, &regions.columns, |key, index, data| {
                    ChunkRecord::column(dim.clone(), key.column_at(index), Framing::Gzip, data)
                })));
                handles.push(s.spawn(move || load_regions(ctx, sink, &regions.cubes, |key, index, data| {
                    ChunkRecord::cube(dim.clone(), key.cube_at(index), Framing::Gzip, data)
                })));
            }
            join_workers(handles)
        })
    }

    fn close(&self) -> Result<()> {
        aggregate(self.sources.iter().map(|(d, r)| (d.clone(), r.close())), "close")
    }
}

/// 把 Gzip 封装的列与立方体写入立方体世界的区域文件
pub struct CubicRegionWriter {
    world:   PathBuf,
    config:  RegionCacheConfig,
    regions: Mutex<BTreeMap<Dimension, Arc<CubicRegions>>>,
    closed:  AtomicBool,
}

impl CubicRegionWriter {
    pub fn new(world: impl Into<PathBuf>, config: RegionCacheConfig) -> Self {
        Self {
            world:   world.into(),
            config,
            regions: Mutex::new(BTreeMap::new()),
            closed:  AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvertError::Closed("writer"));
        }
        Ok(())
    }

    fn regions(&self, dim: &Dimension) -> Result<Arc<CubicRegions>> {
        self.check_open()?;
        Ok(self.regions.lock()
            .entry(dim.clone())
            .or_insert_with(|| Arc::new(CubicRegions::open(&dim.resolve(&self.world), self.config)))
            .clone())
    }
}

impl ChunkWriter for CubicRegionWriter {
    fn session(&self, _flush_threshold: usize) -> Result<Box<dyn WriteSession + '_>> {
        self.check_open()?;
        Ok(Box::new(CubicSession { writer: self }))
    }

    fn discard_all(&self) -> Result<()> {
        self.check_open()?;
        let regions = std::mem::take(&mut *self.regions.lock());
        aggregate(regions.into_iter().map(|(dim, r)| {
            let result = r.close().and_then(|()| r.remove());
            if result.is_ok() {
                tracing::info!(dimension = %dim, "discarded cubic region files");
            }
            (dim, result)
        }), "discard")
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConvertError::Closed("writer"));
        }
        let regions = std::mem::take(&mut *self.regions.lock());
        aggregate(regions.into_iter().map(|(d, r)| (d, r.close())), "close")
    }
}

struct CubicSession<'w> {
    writer: &'w CubicRegionWriter,
}

impl WriteSession for CubicSession<'_> {
    /// 列与立方体分别写入各自的区域；条目超出扇区上限时整条记录被拒绝
    fn accept(&mut self, record: ChunkRecord) -> Result<usize> {
        if record.framing != Framing::Gzip {
            return Err(ConvertError::FramingMismatch { expected: Framing::Gzip, actual: record.framing });
        }
        let regions = self.writer.regions(&record.dimension)?;
        let limit = regions.cubes.provider().layout().max_entry_payload();
        let largest = record.column.iter().chain(record.cubes.values()).map(Vec::len).max().unwrap_or(0);
        if largest > limit {
            return Err(ConvertError::RegionEntryTooLarge { size: largest, limit });
        }

        let pos = record.position;
        if let Some(data) = &record.column {
            regions.columns.with_region(pos.region(), true, |r| r.write(pos.region_index(), data))?;
        }
        for (&y, data) in &record.cubes {
            let cube = pos.cube(y);
            regions.cubes.with_region(cube.region(), true, |r| r.write(cube.region_index(), data))?;
        }
        Ok(1)
    }

    fn finish(&mut self) -> Result<usize> { Ok(0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ColumnPos, CubePos};
    use crate::compression::ChunkCodec;
    use crate::convert::CancelToken;
    use std::ops::ControlFlow;
    use std::sync::atomic::AtomicUsize;

    fn keep_going(_: &ConvertError) -> bool { true }

    #[test]
    fn written_columns_are_read_back() {
        let world = tempfile::TempDir::new().unwrap();
        let config = RegionCacheConfig { hard_cap: 1 };
        let mut codec = ChunkCodec::new();
        let dims = [Dimension::overworld(), Dimension::nether()];

        let writer = RegionColumnWriter::new(world.path(), config);
        let mut session = writer.session(0).unwrap();
        for dim in &dims {
            for x in -20..20 {
                let data = codec.compress_tagged(format!("{dim}:{x}").as_bytes()).unwrap();
                session.accept(ChunkRecord::column(dim.clone(), ColumnPos::new(x, 3), Framing::Tagged, data)).unwrap();
            }
        }
        session.finish().unwrap();
        drop(session);
        writer.close().unwrap();

        let reader = RegionColumnReader::open(world.path(), &dims, config);
        let ctx = PhaseContext::new(CancelToken::new(), &keep_going);
        let counted = AtomicUsize::new(0);
        reader.count_all(&ctx, &|n| { counted.fetch_add(n, Ordering::SeqCst); }).unwrap();
        assert_eq!(counted.load(Ordering::SeqCst), 80);

        let seen = Mutex::new(Vec::new());
        let sink = RecordSink::new(|r| { seen.lock().push(r); ControlFlow::Continue(()) });
        reader.load_all(&ctx, &sink).unwrap();
        drop(sink);
        reader.close().unwrap();

        let records = seen.into_inner();
        assert_eq!(records.len(), 80);
        let rec = records.iter()
            .find(|r| r.dimension == Dimension::nether() && r.position == ColumnPos::new(-7, 3))
            .unwrap();
        let raw = codec.decompress_tagged(rec.column.as_deref().unwrap()).unwrap();
        assert_eq!(raw, b"the_nether:-7");
    }

    #[test]
    fn writer_rejects_untagged_records() {
        let world = tempfile::TempDir::new().unwrap();
        let writer = RegionColumnWriter::new(world.path(), RegionCacheConfig::default());
        let mut session = writer.session(0).unwrap();
        let err = session
            .accept(ChunkRecord::column(Dimension::overworld(), ColumnPos::new(0, 0), Framing::Raw, vec![1]))
            .unwrap_err();
        assert!(matches!(err, ConvertError::FramingMismatch { actual: Framing::Raw, .. }));
    }

    #[test]
    fn missing_region_directory_reads_as_empty() {
        let world = tempfile::TempDir::new().unwrap();
        let reader = RegionColumnReader::open(world.path(), &[Dimension::end()], RegionCacheConfig::default());
        let ctx = PhaseContext::new(CancelToken::new(), &keep_going);
        let counted = AtomicUsize::new(0);
        reader.count_all(&ctx, &|n| { counted.fetch_add(n, Ordering::SeqCst); }).unwrap();
        assert_eq!(counted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discard_after_close_fails_fast() {
        let world = tempfile::TempDir::new().unwrap();
        let writer = RegionColumnWriter::new(world.path(), RegionCacheConfig::default());
        writer.close().unwrap();
        assert!(matches!(writer.discard_all(), Err(ConvertError::Closed(_))));

        let cubic = CubicRegionWriter::new(world.path(), RegionCacheConfig::default());
        cubic.close().unwrap();
        assert!(matches!(cubic.discard_all(), Err(ConvertError::Closed(_))));
    }

    #[test]
    fn cubic_regions_keep_columns_and_cubes_side_by_side() {
        let world = tempfile::TempDir::new().unwrap();
        let config = RegionCacheConfig { hard_cap: 2 };
        let mut codec = ChunkCodec::new();
        let dim = Dimension::nether();

        let writer = CubicRegionWriter::new(world.path(), config);
        let mut session = writer.session(0).unwrap();
        for x in -3..3 {
            let pos = ColumnPos::new(x * 11, 40);
            let column = codec.compress_gzip(format!("column {x}").as_bytes()).unwrap();
            let cubes = (-20..20).step_by(7)
                .map(|y| (y, codec.compress_gzip(format!("cube {x}/{y}").as_bytes()).unwrap()))
                .collect();
            let record = ChunkRecord::cubic(dim.clone(), pos, Framing::Gzip, Some(column), cubes);
            assert_eq!(session.accept(record).unwrap(), 1);
        }
        let err = session.accept(ChunkRecord::column(dim.clone(), ColumnPos::new(0, 0), Framing::Tagged, vec![2])).unwrap_err();
        assert!(matches!(err, ConvertError::FramingMismatch { expected: Framing::Gzip, .. }));
        drop(session);
        writer.close().unwrap();

        let root = dim.resolve(world.path());
        assert!(root.join(CUBIC_COLUMN_SUBDIR).join("-2.1.2dr").exists());
        assert!(root.join(CUBIC_CUBE_SUBDIR).join("-3.-2.2.3dr").exists());

        let reader = CubicRegionReader::open(world.path(), &[dim.clone()], config);
        let ctx = PhaseContext::new(CancelToken::new(), &keep_going);
        let counted = AtomicUsize::new(0);
        reader.count_all(&ctx, &|n| { counted.fetch_add(n, Ordering::SeqCst); }).unwrap();
        assert_eq!(counted.load(Ordering::SeqCst), 6 + 6 * 6);

        let seen = Mutex::new(Vec::new());
        let sink = RecordSink::new(|r| { seen.lock().push(r); ControlFlow::Continue(()) });
        reader.load_all(&ctx, &sink).unwrap();
        drop(sink);
        reader.close().unwrap();

        let records = seen.into_inner();
        assert_eq!(records.len(), 42);
        assert!(records.iter().all(|r| r.framing == Framing::Gzip));
        let cube = records.iter()
            .find(|r| r.cube_positions().any(|c| c == CubePos::new(-22, -6, 40)))
            .unwrap();
        assert_eq!(codec.decompress_gzip(&cube.cubes[&-6]).unwrap(), b"cube -2/-6");
    }
}
