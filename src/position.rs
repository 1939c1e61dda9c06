//! 坐标 ⇄ 存储键 编解码（Morton / Z-order）
//!
//! 键格式：N 个 i32 坐标按位交织成一个 32·N 位的大端整数。
//!
//! ```text
//!   bit (N·i + N-1-k)  ←  坐标 k 的第 i 位      （k = 0 为 x）
//!
//!   2D: [x31 z31 x30 z30 ... x0 z0]            →  8 字节
//!   3D: [x31 y31 z31 x30 y30 z30 ... x0 y0 z0]  → 12 字节
//! ```
//!
//! 高位在前，因此空间上相邻的位置在字节序上也相邻，
//! KV 引擎按键有序遍历时天然具有空间局部性。
//! 符号位和其它位一样参与交织（不做偏移），负坐标与已有数据保持一致。

use byteorder::{BigEndian, ByteOrder};

use crate::common::{ColumnPos, ConvertError, CubePos, Result};

pub const COLUMN_KEY_LEN: usize = 8;
pub const CUBE_KEY_LEN:   usize = 12;

// ── 2D：打包整数 ─────────────────────────────────────────────────────────────

/// 将 32 位值的每一位展开到偶数位上
#[inline]
fn spread2(v: u32) -> u64 {
    let mut x = v as u64;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8))  & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4))  & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2))  & 0x3333_3333_3333_3333;
    x = (x | (x << 1))  & 0x5555_5555_5555_5555;
    x
}

/// `spread2` 的逆运算
#[inline]
fn compact2(v: u64) -> u32 {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | (x >> 1))  & 0x3333_3333_3333_3333;
    x = (x | (x >> 2))  & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x >> 4))  & 0x00FF_00FF_00FF_00FF;
    x = (x | (x >> 8))  & 0x0000_FFFF_0000_FFFF;
    x = (x | (x >> 16)) & 0x0000_0000_FFFF_FFFF;
    x as u32
}

pub fn encode_column(pos: ColumnPos) -> [u8; COLUMN_KEY_LEN] {
    let packed = (spread2(pos.x as u32) << 1) | spread2(pos.z as u32);
    let mut key = [0u8; COLUMN_KEY_LEN];
    BigEndian::write_u64(&mut key, packed);
    key
}

pub fn decode_column(key: &[u8]) -> Result<ColumnPos> {
    check_len(key, COLUMN_KEY_LEN)?;
    let packed = BigEndian::read_u64(key);
    Ok(ColumnPos::new(compact2(packed >> 1) as i32, compact2(packed) as i32))
}

// ── 3D / 通用 ─────────────────────────────────────────────────────────────────

pub fn encode_cube(pos: CubePos) -> [u8; CUBE_KEY_LEN] {
    let mut key = [0u8; CUBE_KEY_LEN];
    interleave_into(&[pos.x, pos.y, pos.z], &mut key);
    key
}

pub fn decode_cube(key: &[u8]) -> Result<CubePos> {
    check_len(key, CUBE_KEY_LEN)?;
    let c = deinterleave(key, 3)?;
    Ok(CubePos::new(c[0], c[1], c[2]))
}

/// 任意元数的交织编码，输出长度为 `4 * coords.len()`
///
/// 对 2 元组与 `encode_column` 逐字节一致。
pub fn interleave(coords: &[i32]) -> Vec<u8> {
    let mut out = vec![0u8; coords.len() * 4];
    interleave_into(coords, &mut out);
    out
}

fn interleave_into(coords: &[i32], out: &mut [u8]) {
    let n = coords.len();
    let Some(last) = out.len().checked_sub(1) else { return };
    for (k, &c) in coords.iter().enumerate() {
        let offset = n - 1 - k;
        for shift in 0..32 {
            let bit = ((c as u32) >> shift) & 1;
            let target = offset + shift * n;
            out[last - (target >> 3)] |= (bit as u8) << (target & 7);
        }
    }
}

pub fn deinterleave(key: &[u8], n: usize) -> Result<Vec<i32>> {
    check_len(key, n * 4)?;
    let Some(last) = key.len().checked_sub(1) else { return Ok(Vec::new()) };
    let coords = (0..n)
        .map(|k| {
            let offset = n - 1 - k;
            (0..32).fold(0u32, |acc, shift| {
                let target = offset + shift * n;
                let bit = (key[last - (target >> 3)] >> (target & 7)) & 1;
                acc | ((bit as u32) << shift)
            }) as i32
        })
        .collect();
    Ok(coords)
}

fn check_len(key: &[u8], expected: usize) -> Result<()> {
    if key.len() != expected {
        return Err(ConvertError::InvalidKey { expected, actual: key.len() });
    }
    Ok(())
}
