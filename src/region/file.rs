//! 扇区式区域文件
//!
//! ```text
//! ┌──────────────────────────────────────────┐  header
//! │ location[entries]  (u32 BE)              │  = sector_offset << 8 | sector_count
//! ├──────────────────────────────────────────┤
//! │ timestamp[entries] (u32 BE, 秒)          │  仅旧格式
//! ├──────────────────────────────────────────┤  header 之后的扇区
//! │ entry: length (u32 BE) + payload          │
//! │ ...                                       │
//! └──────────────────────────────────────────┘
//! ```
//!
//! 单个条目最多 255 个扇区。重写时若原位置放得下则原地覆盖，否则追加到文件末尾。
//! 以只读方式打开（`create = false`）的文件不会被修改，头部不完整时视为损坏。

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{ConvertError, CubeRegionKey, RegionKey, Result};
use crate::region::{Region, RegionCoord, RegionProvider};

const MAX_ENTRY_SECTORS: u64 = 255;

/// 旧格式（`.mca`）单个条目负载的上限（扣除 4 字节长度头）
pub const MAX_ENTRY_PAYLOAD: usize = SectorLayout::ANVIL.max_entry_payload();

// ── SectorLayout ──────────────────────────────────────────────────────────────

/// 区域文件的几何参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLayout {
    pub entries:      usize,
    pub sector_bytes: u64,
    /// 位置表之后是否跟一张时间戳表
    pub timestamps:   bool,
}

impl SectorLayout {
    /// 旧格式：32×32 列，4 KiB 扇区，带时间戳
    pub const ANVIL: Self = Self { entries: 1024, sector_bytes: 4096, timestamps: true };
    /// 立方体世界的列区域（`.2dr`）：32×32 列，512 B 扇区
    pub const CUBIC_COLUMNS: Self = Self { entries: 1024, sector_bytes: 512, timestamps: false };
    /// 立方体区域（`.3dr`）：16×16×16 个立方体，512 B 扇区
    pub const CUBIC_CUBES: Self = Self { entries: 4096, sector_bytes: 512, timestamps: false };

    fn header_bytes(&self) -> u64 {
        let tables = if self.timestamps { 2 } else { 1 };
        (self.entries * 4 * tables) as u64
    }

    fn header_sectors(&self) -> u64 { self.header_bytes().div_ceil(self.sector_bytes) }

    pub const fn max_entry_payload(&self) -> usize {
        (MAX_ENTRY_SECTORS * self.sector_bytes) as usize - 4
    }
}

// ── RegionFile ────────────────────────────────────────────────────────────────

pub struct RegionFile {
    path:       PathBuf,
    file:       File,
    layout:     SectorLayout,
    writable:   bool,
    locations:  Vec<u32>,
    timestamps: Vec<u32>,
    /// 文件当前长度（扇区数）
    sectors:    u64,
}

impl RegionFile {
    /// 打开旧格式区域文件；`create` 为 false 且文件不存在时返回 None
    pub fn open(path: &Path, create: bool) -> Result<Option<Self>> {
        Self::open_with(path, SectorLayout::ANVIL, create)
    }

    /// `create` 为 false 时只读打开，不会改动文件
    pub fn open_with(path: &Path, layout: SectorLayout, create: bool) -> Result<Option<Self>> {
        if !create && !path.exists() {
            return Ok(None);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(create)
            .create(create)
            .open(path)?;

        let header_len = layout.header_sectors() * layout.sector_bytes;
        let len = file.metadata()?.len();
        if len < header_len {
            if !create {
                return Err(ConvertError::CorruptPayload(format!(
                    "{}: {len} bytes is shorter than the {header_len} byte header", path.display()
                )));
            }
            file.set_len(header_len)?;
        }

        let mut header = vec![0u8; layout.header_bytes() as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let mut cursor = Cursor::new(header);
        let mut locations = Vec::with_capacity(layout.entries);
        for _ in 0..layout.entries {
            locations.push(cursor.read_u32::<BigEndian>()?);
        }
        let mut timestamps = Vec::new();
        if layout.timestamps {
            for _ in 0..layout.entries {
                timestamps.push(cursor.read_u32::<BigEndian>()?);
            }
        }

        let sectors = file.metadata()?.len().div_ceil(layout.sector_bytes);
        Ok(Some(Self { path: path.to_path_buf(), file, layout, writable: create, locations, timestamps, sectors }))
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn layout(&self) -> SectorLayout { self.layout }

    /// 条目最后写入的时间（秒）；没有时间戳表的格式恒为 0
    pub fn timestamp(&self, index: usize) -> u32 {
        self.timestamps.get(index).copied().unwrap_or(0)
    }

    fn location(&self, index: usize) -> (u64, u64) {
        let loc = self.locations[index];
        ((loc >> 8) as u64, (loc & 0xFF) as u64)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.layout.entries {
            return Err(ConvertError::CorruptPayload(format!("region entry index {index} out of range")));
        }
        Ok(())
    }

    fn write_header_entry(&mut self, index: usize) -> Result<()> {
        self.file.seek(SeekFrom::Start(index as u64 * 4))?;
        self.file.write_u32::<BigEndian>(self.locations[index])?;
        if self.layout.timestamps {
            let table = self.layout.entries as u64 * 4;
            self.file.seek(SeekFrom::Start(table + index as u64 * 4))?;
            self.file.write_u32::<BigEndian>(self.timestamps[index])?;
        }
        Ok(())
    }
}

impl Region for RegionFile {
    fn read(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
        self.check_index(index)?;
        let (offset, count) = self.location(index);
        if count == 0 {
            return Ok(None);
        }
        if offset < self.layout.header_sectors() || offset + count > self.sectors {
            return Err(ConvertError::CorruptPayload(format!(
                "{}: entry {index} points outside the file", self.path.display()
            )));
        }

        let sector = self.layout.sector_bytes;
        self.file.seek(SeekFrom::Start(offset * sector))?;
        let length = self.file.read_u32::<BigEndian>()? as u64;
        if length == 0 || length + 4 > count * sector {
            return Err(ConvertError::CorruptPayload(format!(
                "{}: entry {index} has invalid length {length}", self.path.display()
            )));
        }
        let mut data = vec![0u8; length as usize];
        self.file.read_exact(&mut data)?;
        Ok(Some(data))
    }

    fn write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        self.check_index(index)?;
        if !self.writable {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} was opened read-only", self.path.display()),
            ).into());
        }
        let limit = self.layout.max_entry_payload();
        if data.is_empty() || data.len() > limit {
            return Err(ConvertError::RegionEntryTooLarge { size: data.len(), limit });
        }
        let sector = self.layout.sector_bytes;
        let header = self.layout.header_sectors();
        let needed = (data.len() as u64 + 4).div_ceil(sector);
        let (old_offset, old_count) = self.location(index);

        let offset = if old_count >= needed && old_offset >= header {
            old_offset
        } else {
            let end = self.sectors.max(header);
            self.sectors = end + needed;
            end
        };

        let mut buf = Vec::with_capacity((needed * sector) as usize);
        buf.write_u32::<BigEndian>(data.len() as u32)?;
        buf.extend_from_slice(data);
        buf.resize((needed * sector) as usize, 0);
        self.file.seek(SeekFrom::Start(offset * sector))?;
        self.file.write_all(&buf)?;

        self.locations[index] = ((offset as u32) << 8) | needed as u32;
        if self.layout.timestamps {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
            self.timestamps[index] = now;
        }
        self.write_header_entry(index)
    }

    fn entries(&self) -> Vec<usize> {
        (0..self.layout.entries).filter(|&i| self.locations[i] & 0xFF != 0).collect()
    }

    fn flush(&mut self) -> Result<()> {
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

// ── RegionDir ─────────────────────────────────────────────────────────────────

/// 目录中的一组区域文件，文件名为 `[<prefix>.]<坐标...>.<ext>`
pub struct RegionDir<K> {
    dir:       PathBuf,
    prefix:    Option<&'static str>,
    extension: String,
    layout:    SectorLayout,
    _key:      PhantomData<fn() -> K>,
}

impl RegionDir<RegionKey> {
    /// 旧格式 `r.<x>.<z>.<ext>`
    pub fn anvil(dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self::with_layout(dir, Some("r"), extension, SectorLayout::ANVIL)
    }

    /// 立方体世界的列区域 `<x>.<z>.2dr`
    pub fn cubic_columns(dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(dir, None, "2dr", SectorLayout::CUBIC_COLUMNS)
    }
}

impl RegionDir<CubeRegionKey> {
    /// 立方体区域 `<x>.<y>.<z>.3dr`
    pub fn cubic_cubes(dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(dir, None, "3dr", SectorLayout::CUBIC_CUBES)
    }
}

impl<K: RegionCoord> RegionDir<K> {
    pub fn with_layout(
        dir:       impl Into<PathBuf>,
        prefix:    Option<&'static str>,
        extension: &str,
        layout:    SectorLayout,
    ) -> Self {
        Self { dir: dir.into(), prefix, extension: extension.into(), layout, _key: PhantomData }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn layout(&self) -> SectorLayout { self.layout }

    pub fn region_path(&self, key: K) -> PathBuf {
        let mut name: Vec<String> = self.prefix.iter().map(|p| p.to_string()).collect();
        name.extend(key.fields().iter().map(i32::to_string));
        name.push(self.extension.clone());
        self.dir.join(name.join("."))
    }

    fn parse_name(&self, name: &str) -> Option<K> {
        let mut parts: Vec<&str> = name.split('.').collect();
        if parts.pop()? != self.extension {
            return None;
        }
        if let Some(prefix) = self.prefix {
            if parts.is_empty() || parts.remove(0) != prefix {
                return None;
            }
        }
        let fields = parts.iter().map(|p| p.parse().ok()).collect::<Option<Vec<i32>>>()?;
        K::from_fields(&fields)
    }
}

impl<K: RegionCoord> RegionProvider for RegionDir<K> {
    type Key = K;
    type Region = RegionFile;

    fn open(&self, key: K, create: bool) -> Result<Option<RegionFile>> {
        if create {
            std::fs::create_dir_all(&self.dir)?;
        }
        let path = self.region_path(key);
        let region = RegionFile::open_with(&path, self.layout, create)?;
        if region.is_some() {
            tracing::trace!(path = %path.display(), "opened region file");
        }
        Ok(region)
    }

    fn region_keys(&self) -> Result<Vec<K>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(|n| self.parse_name(n)) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn close(&self) -> Result<()> { Ok(()) }
}
