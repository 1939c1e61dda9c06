//! 计数 / 加载两阶段执行
//!
//! 加载阶段中读取端运行在调用线程上（内部再按维度 × 扫描类型派生线程），
//! 记录经有界通道交给 `workers` 个消费线程。每个消费线程独占一个 `ChunkCodec`
//! 和一个 `WriteSession`。停止后消费线程继续排空通道但不再处理，读取端因此不会阻塞在发送上。
//!
//! 单条记录的失败交给错误谓词；写入目标本身失败（I/O、存储、已关闭）则中止阶段，
//! 并在关闭读写两端之后作为 `run` 的错误返回。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};

use parking_lot::Mutex;

use crate::common::{ConvertError, Result};
use crate::compression::ChunkCodec;
use crate::convert::{
    join_workers, CancelToken, ChunkConverter, ChunkReader, ChunkRecord, ChunkWriter,
    ErrorPredicate, PhaseContext, PhaseStatus, RecordSink, DEFAULT_FLUSH_THRESHOLD,
};

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// 消费线程数
    pub workers:          usize,
    /// 读取端与消费线程之间的通道容量（条）
    pub channel_capacity: usize,
    /// 单个会话缓冲达到该字节数后刷出
    pub flush_threshold:  usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers:          std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            channel_capacity: 1024,
            flush_threshold:  DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionReport {
    /// 计数阶段发现的记录数
    pub counted: usize,
    /// 加载阶段读取端送出的记录数
    pub loaded:  usize,
    /// 已提交到写入目标的输出记录数
    pub written: usize,
    /// 交给错误谓词的失败数（两个阶段合计）
    pub failed:  usize,
    pub status:  PhaseStatus,
}

pub struct ConversionPipeline<R, C, W> {
    reader:    R,
    converter: C,
    writer:    W,
    config:    PipelineConfig,
}

impl<R: ChunkReader, C: ChunkConverter, W: ChunkWriter> ConversionPipeline<R, C, W> {
    pub fn new(reader: R, converter: C, writer: W, config: PipelineConfig) -> Self {
        Self { reader, converter, writer, config }
    }

    /// 执行两个阶段，最后关闭读取端和写入端。
    ///
    /// 取消和谓词中止都不是错误，体现在 `ConversionReport::status` 中；
    /// 返回 Err 表示枚举、写入目标或关闭本身失败。
    pub fn run(self, cancel: &CancelToken, on_error: &ErrorPredicate<'_>) -> Result<ConversionReport> {
        let count_ctx = PhaseContext::new(cancel.clone(), on_error);
        let counted = AtomicUsize::new(0);
        tracing::info!("count phase started");
        let count_result = self.reader.count_all(&count_ctx, &|n| {
            counted.fetch_add(n, Ordering::Relaxed);
        });
        let counted = counted.into_inner();
        tracing::info!(counted, status = ?count_ctx.status(), "count phase finished");

        let mut report = ConversionReport {
            counted,
            loaded:  0,
            written: 0,
            failed:  count_ctx.failed(),
            status:  count_ctx.status(),
        };

        let load_result = match (&count_result, report.status) {
            (Ok(()), PhaseStatus::Completed) => {
                let load_ctx = PhaseContext::new(cancel.clone(), on_error);
                tracing::info!(workers = self.config.workers, "load phase started");
                let result = self.load(&load_ctx, &mut report);
                report.failed += load_ctx.failed();
                report.status = load_ctx.status();
                tracing::info!(
                    loaded  = report.loaded,
                    written = report.written,
                    failed  = report.failed,
                    status  = ?report.status,
                    "load phase finished"
                );
                result
            }
            _ => Ok(()),
        };

        let writer_closed = self.writer.close();
        let reader_closed = self.reader.close();
        count_result?;
        load_result?;
        writer_closed?;
        reader_closed?;
        Ok(report)
    }

    fn load(&self, ctx: &PhaseContext<'_>, report: &mut ConversionReport) -> Result<()> {
        let (tx, rx) = sync_channel::<ChunkRecord>(self.config.channel_capacity.max(1));
        let rx = Mutex::new(rx);
        let written = AtomicUsize::new(0);

        let (read_result, consumed) = std::thread::scope(|s| {
            let (rx, counter) = (&rx, &written);
            let handles: Vec<_> = (0..self.config.workers.max(1))
                .map(|_| s.spawn(move || self.consume(ctx, rx, counter)))
                .collect();

            let sink = RecordSink::channel(tx);
            let read_result = self.reader.load_all(ctx, &sink);
            report.loaded = sink.sent();
            // 关闭通道，消费线程排空后退出
            drop(sink);
            (read_result, join_workers(handles))
        });

        report.written = written.into_inner();
        read_result?;
        consumed
    }

    fn consume(&self, ctx: &PhaseContext<'_>, rx: &Mutex<Receiver<ChunkRecord>>, written: &AtomicUsize) -> Result<()> {
        let mut codec = ChunkCodec::new();
        let mut session = match self.writer.session(self.config.flush_threshold) {
            Ok(session) => session,
            Err(e) => {
                ctx.abort();
                tracing::error!(error = %e, "failed to open write session");
                drain(rx);
                return Err(e);
            }
        };

        let mut fatal = None;
        loop {
            let received = rx.lock().recv();
            let Ok(record) = received else { break };
            if ctx.should_stop() {
                continue;
            }
            let outputs = match self.converter.convert(record, &mut codec) {
                Ok(outputs) => outputs,
                Err(e) => {
                    ctx.report(e);
                    continue;
                }
            };
            for output in outputs {
                match session.accept(output) {
                    Ok(committed) => { written.fetch_add(committed, Ordering::Relaxed); }
                    Err(e) if e.is_record_error() => ctx.report(e),
                    Err(e) => {
                        tracing::error!(error = %e, "write failed, aborting load phase");
                        ctx.abort();
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }

        // 取消或中止后已缓冲的记录照样刷出
        match session.finish() {
            Ok(committed) => { written.fetch_add(committed, Ordering::Relaxed); }
            Err(e) => {
                tracing::error!(error = %e, "failed to flush write session");
                ctx.abort();
                fatal.get_or_insert(e);
            }
        }
        fatal.map_or(Ok(()), Err)
    }
}

fn drain(rx: &Mutex<Receiver<ChunkRecord>>) {
    while rx.lock().recv().is_ok() {}
}

/// 记录失败并继续的谓词
pub fn skip_failures(_: &ConvertError) -> bool { true }

/// 第一个失败即中止的谓词
pub fn abort_on_failure(_: &ConvertError) -> bool { false }
