//! 流经转换管线的记录

use std::collections::BTreeMap;

use crate::common::{ColumnPos, CubePos, Dimension};
use crate::compression::Framing;

/// 一条待转换的区块记录。
///
/// 同一条记录可以只带列负载、只带立方体负载，或两者兼有（按列分组读取时）。
/// 负载对管线不透明，`framing` 记录它们当前的封装方式。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub dimension: Dimension,
    pub position:  ColumnPos,
    pub framing:   Framing,
    pub column:    Option<Vec<u8>>,
    /// 立方体 y → 负载
    pub cubes:     BTreeMap<i32, Vec<u8>>,
}

impl ChunkRecord {
    pub fn column(dimension: Dimension, position: ColumnPos, framing: Framing, data: Vec<u8>) -> Self {
        Self { dimension, position, framing, column: Some(data), cubes: BTreeMap::new() }
    }

    pub fn cube(dimension: Dimension, position: CubePos, framing: Framing, data: Vec<u8>) -> Self {
        Self {
            dimension,
            position: position.column(),
            framing,
            column: None,
            cubes: BTreeMap::from([(position.y, data)]),
        }
    }

    pub fn cubic(
        dimension: Dimension,
        position:  ColumnPos,
        framing:   Framing,
        column:    Option<Vec<u8>>,
        cubes:     BTreeMap<i32, Vec<u8>>,
    ) -> Self {
        Self { dimension, position, framing, column, cubes }
    }

    /// 所有负载的字节数
    pub fn payload_size(&self) -> usize {
        self.column.as_ref().map_or(0, Vec::len) + self.cubes.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool { self.column.is_none() && self.cubes.is_empty() }

    pub fn cube_positions(&self) -> impl Iterator<Item = CubePos> + '_ {
        self.cubes.keys().map(move |&y| self.position.cube(y))
    }
}
