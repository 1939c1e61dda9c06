//! 协作式取消与逐记录错误处理
//!
//! 每个阶段构造一个 `PhaseContext`，所有 worker 共享它：
//! 循环的每一步都检查 `should_stop()`，单条记录的失败通过 `report()` 交给调用方的谓词。
//! 取消不是错误，阶段结束时以 `PhaseStatus::Cancelled` 体现。

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use crate::common::ConvertError;
use crate::convert::ChunkRecord;

/// 可克隆的取消标志
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Completed,
    /// 外部取消；已写出的数据保留
    Cancelled,
    /// 错误谓词要求中止
    Aborted,
}

/// 错误谓词：返回 true 跳过该记录继续，false 中止阶段
pub type ErrorPredicate<'a> = dyn Fn(&ConvertError) -> bool + Sync + 'a;

pub struct PhaseContext<'a> {
    cancel:   CancelToken,
    aborted:  AtomicBool,
    failed:   AtomicUsize,
    on_error: &'a ErrorPredicate<'a>,
}

impl<'a> PhaseContext<'a> {
    pub fn new(cancel: CancelToken, on_error: &'a ErrorPredicate<'a>) -> Self {
        Self { cancel, aborted: AtomicBool::new(false), failed: AtomicUsize::new(0), on_error }
    }

    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.aborted.load(Ordering::SeqCst)
    }

    /// `should_stop()` 的 ControlFlow 形式，方便在遍历回调里使用
    pub fn step(&self) -> ControlFlow<()> {
        if self.should_stop() { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
    }

    pub fn abort(&self) { self.aborted.store(true, Ordering::SeqCst); }

    /// 上报一条失败的记录
    pub fn report(&self, err: ConvertError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(error = %err, "record failed");
        if !(self.on_error)(&err) {
            self.abort();
        }
    }

    pub fn failed(&self) -> usize { self.failed.load(Ordering::SeqCst) }

    pub fn status(&self) -> PhaseStatus {
        if self.aborted.load(Ordering::SeqCst) {
            PhaseStatus::Aborted
        } else if self.cancel.is_cancelled() {
            PhaseStatus::Cancelled
        } else {
            PhaseStatus::Completed
        }
    }
}

// ── RecordSink ────────────────────────────────────────────────────────────────

type PushFn<'a> = dyn Fn(ChunkRecord) -> ControlFlow<()> + Send + Sync + 'a;

/// 读取端把记录推给下游的出口
pub struct RecordSink<'a> {
    push: Box<PushFn<'a>>,
    sent: AtomicUsize,
}

impl<'a> RecordSink<'a> {
    pub fn new(push: impl Fn(ChunkRecord) -> ControlFlow<()> + Send + Sync + 'a) -> Self {
        Self { push: Box::new(push), sent: AtomicUsize::new(0) }
    }

    /// 有界通道：下游消费不过来时阻塞读取端，接收端全部退出后返回 Break
    pub fn channel(tx: SyncSender<ChunkRecord>) -> Self {
        Self::new(move |record| match tx.send(record) {
            Ok(())  => ControlFlow::Continue(()),
            Err(_)  => ControlFlow::Break(()),
        })
    }

    pub fn send(&self, record: ChunkRecord) -> ControlFlow<()> {
        let flow = (self.push)(record);
        if flow.is_continue() {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        flow
    }

    /// 成功送出的记录数
    pub fn sent(&self) -> usize { self.sent.load(Ordering::SeqCst) }
}
