//! 只改变负载封装、不解析负载内容的转换器

use crate::common::Result;
use crate::compression::{ChunkCodec, Framing};
use crate::convert::{ChunkConverter, ChunkRecord};

/// 原样转发
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConverter;

impl ChunkConverter for IdentityConverter {
    fn convert(&self, record: ChunkRecord, _codec: &mut ChunkCodec) -> Result<Vec<ChunkRecord>> {
        Ok(vec![record])
    }
}

/// 把记录中所有负载重新封装为 `target`。
///
/// 区域文件 → 本地存储时用 `Raw`（解压），反方向用 `Tagged`（压缩）。
/// 压缩后超出上限的负载返回 `OversizedPayload`，整条记录不会输出。
#[derive(Debug, Clone, Copy)]
pub struct ReframeConverter {
    pub target: Framing,
}

impl ReframeConverter {
    pub fn new(target: Framing) -> Self { Self { target } }
}

impl ChunkConverter for ReframeConverter {
    fn convert(&self, mut record: ChunkRecord, codec: &mut ChunkCodec) -> Result<Vec<ChunkRecord>> {
        let from = record.framing;
        if from == self.target {
            return Ok(vec![record]);
        }
        if let Some(column) = record.column.take() {
            record.column = Some(codec.reframe(column, from, self.target)?);
        }
        for data in record.cubes.values_mut() {
            *data = codec.reframe(std::mem::take(data), from, self.target)?;
        }
        record.framing = self.target;
        Ok(vec![record])
    }
}
