//! 两阶段转换管线
//!
//! ```text
//!   ChunkReader ──RecordSink──► [bounded channel] ──► worker × N
//!   (每维度 × 扫描类型一个线程)                          │ ChunkCodec（每 worker 独占）
//!                                                     │ ChunkConverter::convert
//!                                                     ▼
//!                                               WriteSession（每 worker 独占）
//!                                                     │ 达到阈值 / finish
//!                                                     ▼
//!                                               ChunkWriter → CubeStorage / RegionCache
//!                                                     │ 提交的记录数 → ConversionReport::written
//! ```
//!
//! 计数阶段只枚举位置；加载阶段重新枚举并读取负载。两个阶段都共享同一个 `CancelToken`。

pub mod cancel;
pub mod converters;
pub mod local;
pub mod pipeline;
pub mod record;
pub mod region_io;

use crate::common::Result;
use crate::compression::ChunkCodec;

pub use cancel::{CancelToken, ErrorPredicate, PhaseContext, PhaseStatus, RecordSink};
pub use converters::{IdentityConverter, ReframeConverter};
pub use local::{Destination, LocalReader, LocalWriter, ScanMode, WriteQueue};
pub use pipeline::{ConversionPipeline, ConversionReport, PipelineConfig};
pub use record::ChunkRecord;
pub use region_io::{CubicRegionReader, CubicRegionWriter, RegionColumnReader, RegionColumnWriter};

/// 默认的写入缓冲阈值
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 << 20;

// ── 角色 trait ────────────────────────────────────────────────────────────────

pub trait ChunkReader: Send + Sync {
    /// 只枚举位置，每发现 n 条记录调用一次 `increment(n)`
    fn count_all(&self, ctx: &PhaseContext<'_>, increment: &(dyn Fn(usize) + Sync)) -> Result<()>;

    /// 重新枚举并读取负载，逐条推给 `sink`。
    ///
    /// 单条记录的失败交给 `ctx.report()`；枚举本身失败时返回 Err。
    fn load_all(&self, ctx: &PhaseContext<'_>, sink: &RecordSink<'_>) -> Result<()>;

    fn close(&self) -> Result<()> { Ok(()) }
}

/// 纯函数：一条输入记录 → 零或多条输出记录
pub trait ChunkConverter: Send + Sync {
    fn convert(&self, record: ChunkRecord, codec: &mut ChunkCodec) -> Result<Vec<ChunkRecord>>;
}

pub trait ChunkWriter: Send + Sync {
    /// 为一个 worker 创建独占的写入会话
    fn session(&self, flush_threshold: usize) -> Result<Box<dyn WriteSession + '_>>;

    /// 删除已写出的全部数据
    fn discard_all(&self) -> Result<()>;

    /// 刷出所有未完成的缓冲，再逐维度关闭目标；失败会汇总后一起返回
    fn close(&self) -> Result<()>;
}

/// 单个 worker 独占的写入会话。
///
/// 两个方法都返回本次调用真正提交到目标的记录数；缓冲中尚未落盘的记录不计入。
/// 返回的错误若 `is_record_error()` 只涉及这一条记录，否则说明目标已不可用。
pub trait WriteSession: Send {
    fn accept(&mut self, record: ChunkRecord) -> Result<usize>;

    /// 刷出剩余缓冲
    fn finish(&mut self) -> Result<usize>;
}

/// 等待一组 scoped 线程，返回第一个错误
pub(crate) fn join_workers<'scope>(
    handles: Vec<std::thread::ScopedJoinHandle<'scope, Result<()>>>,
) -> Result<()> {
    let mut first_err = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(()))  => {}
            Ok(Err(e))  => { first_err.get_or_insert(e); }
            Err(panic)  => std::panic::resume_unwind(panic),
        }
    }
    first_err.map_or(Ok(()), Err)
}
