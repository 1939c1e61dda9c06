//! 区块负载压缩/解压（zlib / gzip，带格式标记字节）
//!
//! ```text
//! Tagged 负载：┌──────────┬──────────────────────────┐
//!              │ tag (u8) │ 压缩流                     │   tag: 1 = gzip, 2 = zlib
//!              └──────────┴──────────────────────────┘
//! ```
//!
//! 整个 Tagged 负载必须严格小于 `MAX_COMPRESSED_SIZE`，否则无法放入旧格式区域文件
//! （255 个 4 KiB 扇区减去长度头）。
//!
//! `ChunkCodec` 持有可复用的 deflate/inflate 状态和暂存缓冲区，每个工作线程一份，
//! 互不共享。

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::common::{ConvertError, Result};

/// Tagged 负载的大小上限（不含）
pub const MAX_COMPRESSED_SIZE: usize = 1_044_475;

/// 解压暂存缓冲区的默认大小，覆盖绝大多数区块
pub const DEFAULT_INFLATE_SCRATCH: usize = 1 << 20;

pub const TAG_GZIP: u8 = 1;
pub const TAG_ZLIB: u8 = 2;

// ── Framing ───────────────────────────────────────────────────────────────────

/// 负载当前的封装方式；在记录外部跟踪，从不根据内容猜测
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// 未压缩
    Raw,
    /// 标记字节 + 压缩流（旧格式区域文件）
    Tagged,
    /// 无标记 gzip 流（立方体区域文件）
    Gzip,
}

// ── ChunkCodec ────────────────────────────────────────────────────────────────

pub struct ChunkCodec {
    deflate:      Compress,
    deflate_best: Compress,
    inflate:      Decompress,
    /// 压缩输出暂存，容量固定为 `MAX_COMPRESSED_SIZE`
    deflate_buf:  Vec<u8>,
    inflate_buf:  Vec<u8>,
}

impl ChunkCodec {
    pub fn new() -> Self { Self::with_inflate_scratch(DEFAULT_INFLATE_SCRATCH) }

    pub fn with_inflate_scratch(scratch: usize) -> Self {
        Self::with_level(Compression::default(), scratch)
    }

    /// 指定首次压缩使用的级别；放不下时仍以最高级别重试
    pub fn with_level(level: Compression, scratch: usize) -> Self {
        Self {
            deflate:      Compress::new(level, true),
            deflate_best: Compress::new(Compression::best(), true),
            inflate:      Decompress::new(true),
            deflate_buf:  vec![0u8; MAX_COMPRESSED_SIZE],
            inflate_buf:  vec![0u8; scratch.max(1)],
        }
    }

    // ── Tagged ────────────────────────────────────────────────────────────────

    /// zlib 压缩并加上标记字节。
    ///
    /// 默认级别放不下时以最高级别重试一次；仍放不下则返回 `OversizedPayload`。
    pub fn compress_tagged(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        if let Some(len) = deflate_bounded(&mut self.deflate, raw, &mut self.deflate_buf)? {
            return Ok(self.deflate_buf[..len].to_vec());
        }
        tracing::debug!(size = raw.len(), "payload too large at default level, retrying at best compression");
        if let Some(len) = deflate_bounded(&mut self.deflate_best, raw, &mut self.deflate_buf)? {
            return Ok(self.deflate_buf[..len].to_vec());
        }
        Err(ConvertError::OversizedPayload { size: raw.len(), limit: MAX_COMPRESSED_SIZE })
    }

    /// 按标记字节分派解压
    pub fn decompress_tagged(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let (&tag, stream) = data.split_first()
            .ok_or_else(|| ConvertError::CorruptPayload("empty payload".into()))?;
        match tag {
            TAG_ZLIB => self.inflate_zlib(stream),
            TAG_GZIP => read_all(GzDecoder::new(stream)),
            other    => Err(ConvertError::UnsupportedFormat(other)),
        }
    }

    fn inflate_zlib(&mut self, stream: &[u8]) -> Result<Vec<u8>> {
        self.inflate.reset(true);
        let status = self.inflate
            .decompress(stream, &mut self.inflate_buf, FlushDecompress::Finish)
            .map_err(|e| ConvertError::CorruptPayload(e.to_string()))?;
        if status == Status::StreamEnd {
            let len = self.inflate.total_out() as usize;
            return Ok(self.inflate_buf[..len].to_vec());
        }
        // 暂存区放不下：退回到无上限的流式解压
        tracing::trace!(scratch = self.inflate_buf.len(), "inflated payload exceeds scratch, streaming");
        read_all(ZlibDecoder::new(stream))
    }

    // ── Gzip ──────────────────────────────────────────────────────────────────

    pub fn compress_gzip(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut enc = GzEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
        enc.write_all(raw)?;
        Ok(enc.finish()?)
    }

    pub fn decompress_gzip(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        read_all(GzDecoder::new(data))
    }

    // ── 通用入口 ──────────────────────────────────────────────────────────────

    pub fn decode(&mut self, data: Vec<u8>, framing: Framing) -> Result<Vec<u8>> {
        match framing {
            Framing::Raw    => Ok(data),
            Framing::Tagged => self.decompress_tagged(&data),
            Framing::Gzip   => self.decompress_gzip(&data),
        }
    }

    pub fn encode(&mut self, raw: Vec<u8>, framing: Framing) -> Result<Vec<u8>> {
        match framing {
            Framing::Raw    => Ok(raw),
            Framing::Tagged => self.compress_tagged(&raw),
            Framing::Gzip   => self.compress_gzip(&raw),
        }
    }

    /// 将负载从一种封装转换为另一种
    pub fn reframe(&mut self, data: Vec<u8>, from: Framing, to: Framing) -> Result<Vec<u8>> {
        if from == to {
            return Ok(data);
        }
        let raw = self.decode(data, from)?;
        self.encode(raw, to)
    }
}

impl Default for ChunkCodec {
    fn default() -> Self { Self::new() }
}

/// 压缩到 `buf[1..]`，成功时返回含标记字节的总长度；放不下返回 None
fn deflate_bounded(deflate: &mut Compress, raw: &[u8], buf: &mut [u8]) -> Result<Option<usize>> {
    deflate.reset();
    buf[0] = TAG_ZLIB;
    let status = deflate
        .compress(raw, &mut buf[1..], FlushCompress::Finish)
        .map_err(|e| ConvertError::CorruptPayload(e.to_string()))?;
    let len = 1 + deflate.total_out() as usize;
    if status != Status::StreamEnd || len >= MAX_COMPRESSED_SIZE {
        return Ok(None);
    }
    Ok(Some(len))
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)
        .map_err(|e| ConvertError::CorruptPayload(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 不可压缩的伪随机数据（xorshift）
    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed as u8
            })
            .collect()
    }

    #[test]
    fn tagged_round_trip_uses_zlib_marker() {
        let mut codec = ChunkCodec::new();
        let raw = b"column payload ".repeat(1000);
        let packed = codec.compress_tagged(&raw).unwrap();
        assert_eq!(packed[0], TAG_ZLIB);
        assert!(packed.len() < raw.len());
        assert_eq!(codec.decompress_tagged(&packed).unwrap(), raw);
    }

    #[test]
    fn gzip_tag_is_understood() {
        let mut codec = ChunkCodec::new();
        let raw = b"legacy gzip chunk".to_vec();
        let mut tagged = vec![TAG_GZIP];
        tagged.extend(codec.compress_gzip(&raw).unwrap());
        assert_eq!(codec.decompress_tagged(&tagged).unwrap(), raw);
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let mut codec = ChunkCodec::new();
        assert!(matches!(codec.decompress_tagged(&[7, 1, 2, 3]), Err(ConvertError::UnsupportedFormat(7))));
        assert!(matches!(codec.decompress_tagged(&[]), Err(ConvertError::CorruptPayload(_))));
    }

    #[test]
    fn incompressible_payload_over_limit_is_rejected() {
        let mut codec = ChunkCodec::new();
        let raw = noise(MAX_COMPRESSED_SIZE + 4096, 0x9E37_79B9_7F4A_7C15);
        match codec.compress_tagged(&raw) {
            Err(ConvertError::OversizedPayload { size, limit }) => {
                assert_eq!(size, raw.len());
                assert_eq!(limit, MAX_COMPRESSED_SIZE);
            }
            other => panic!("expected OversizedPayload, got {other:?}"),
        }
        // 失败后编解码器仍可继续使用
        let ok = codec.compress_tagged(b"small").unwrap();
        assert_eq!(codec.decompress_tagged(&ok).unwrap(), b"small");
    }

    #[test]
    fn large_compressible_payload_fits() {
        let mut codec = ChunkCodec::new();
        let raw = vec![0u8; 8 << 20];
        let packed = codec.compress_tagged(&raw).unwrap();
        assert!(packed.len() < MAX_COMPRESSED_SIZE);
        assert_eq!(codec.decompress_tagged(&packed).unwrap().len(), raw.len());
    }

    #[test]
    fn retries_at_best_level_when_first_pass_does_not_fit() {
        // 不压缩的首轮输出必然超过上限，只有最高级别的重试能放下
        let mut codec = ChunkCodec::with_level(Compression::none(), DEFAULT_INFLATE_SCRATCH);
        let raw = b"sixteen byte row".repeat(MAX_COMPRESSED_SIZE / 16 + 1);
        assert!(raw.len() >= MAX_COMPRESSED_SIZE);

        let packed = codec.compress_tagged(&raw).unwrap();
        assert_eq!(packed[0], TAG_ZLIB);
        assert!(packed.len() < raw.len() / 100);
        assert_eq!(codec.decompress_tagged(&packed).unwrap(), raw);
    }

    #[test]
    fn inflate_falls_back_to_streaming_when_scratch_is_small() {
        let mut codec = ChunkCodec::with_inflate_scratch(64);
        let raw = b"0123456789abcdef".repeat(512);
        let packed = codec.compress_tagged(&raw).unwrap();
        assert_eq!(codec.decompress_tagged(&packed).unwrap(), raw);
    }

    #[test]
    fn corrupt_stream_is_reported() {
        let mut codec = ChunkCodec::new();
        let err = codec.decompress_tagged(&[TAG_ZLIB, 0xDE, 0xAD, 0xBE, 0xEF]).unwrap_err();
        assert!(matches!(err, ConvertError::CorruptPayload(_)));
    }

    #[test]
    fn reframe_between_tagged_and_gzip() {
        let mut codec = ChunkCodec::new();
        let raw = b"cube section data".repeat(64);
        let tagged = codec.encode(raw.clone(), Framing::Tagged).unwrap();
        let gz = codec.reframe(tagged, Framing::Tagged, Framing::Gzip).unwrap();
        assert_eq!(codec.decompress_gzip(&gz).unwrap(), raw);
        let same = codec.reframe(raw.clone(), Framing::Raw, Framing::Raw).unwrap();
        assert_eq!(same, raw);
    }

    proptest! {
        #[test]
        fn tagged_round_trip(raw in prop::collection::vec(any::<u8>(), 0..4096)) {
            let mut codec = ChunkCodec::new();
            let packed = codec.compress_tagged(&raw).unwrap();
            prop_assert_eq!(codec.decompress_tagged(&packed).unwrap(), raw);
        }
    }
}
