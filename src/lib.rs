//! # cube-converter
//!
//! 世界存档的区块格式转换引擎：在旧格式区域文件、立方体区域文件与嵌入式 KV 存储之间搬运
//! 列（column）与立方体（cube）负载。负载内容对引擎不透明，只理解它们的封装方式。
//!
//! ## 整体架构
//!
//! ```text
//! ┌─────────────────────────── ConversionPipeline ───────────────────────────┐
//! │                                                                          │
//! │   count_all ──► 总数                                                      │
//! │   load_all  ──► RecordSink ──► bounded channel ──► worker × N            │
//! │      │                                              │                    │
//! │   ChunkReader                                 ChunkConverter              │
//! │   ├─ LocalReader        (Split / Grouped)       ├─ IdentityConverter      │
//! │   ├─ RegionColumnReader                         └─ ReframeConverter       │
//! │   └─ CubicRegionReader                              │                    │
//! │      │                                              │                    │
//! │      │                                        WriteSession (WriteQueue)   │
//! │      │                                              │                    │
//! │      │                                        ChunkWriter                 │
//! │      │                                        ├─ LocalWriter              │
//! │      │                                        ├─ RegionColumnWriter       │
//! │      │                                        └─ CubicRegionWriter        │
//! └──────┼──────────────────────────────────────────────┼────────────────────┘
//!        ▼                                              ▼
//! ┌──────────────────────────┐            ┌──────────────────────────────┐
//! │ CubeStorage              │            │ RegionCache (hard cap 64)     │
//! │  ├─ LocalStorage (RocksDB)│            │  └─ RegionDir → RegionFile    │
//! │  └─ MemoryStorage         │            │ SectorLayout                  │
//! │  key = position::encode_* │            │  ├─ ANVIL   4 KiB, 32×32 列   │
//! │                           │            │  ├─ region2d 512 B, 32×32 列  │
//! │                           │            │  └─ region3d 512 B, 16³ 立方体│
//! └──────────────────────────┘            └──────────────────────────────┘
//! ```

// ── 基础层 ────────────────────────────────────────────────────────────────────
pub mod common;
pub mod position;
pub mod compression;

// ── 存储层 ────────────────────────────────────────────────────────────────────
pub mod storage;
pub mod region;

// ── 转换层 ────────────────────────────────────────────────────────────────────
pub mod convert;

pub use common::{ColumnPos, ConvertError, CubePos, CubeRegionKey, Dimension, RegionKey, Result};
