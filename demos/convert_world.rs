//! # cube-converter 使用案例
//!
//! 1. 在本地存储中造一个两维度的小世界
//! 2. 本地存储 → 区域文件（压缩为 Tagged）
//! 3. 区域文件 → 本地存储（解压为 Raw），按列分组再导出一份 Gzip
//!    以及立方体区域（region2d / region3d）
//! 4. 演示取消

use std::ops::ControlFlow;

use cubeconv::{
    compression::Framing,
    convert::{
        pipeline::skip_failures, CancelToken, ConversionPipeline, LocalReader, LocalWriter,
        CubicRegionWriter, PipelineConfig, RegionColumnReader, RegionColumnWriter, ReframeConverter, ScanMode,
    },
    region::RegionCacheConfig,
    storage::{CubeStorage, LocalStorage, StorageOptions},
    ColumnPos, ConvertError, Dimension,
};

fn main() -> cubeconv::Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   cube-converter 演示                                      ");
    println!("═══════════════════════════════════════════════════════════\n");

    let scratch = tempfile::TempDir::new()?;
    let source  = scratch.path().join("source");
    let regions = scratch.path().join("regions");
    let target  = scratch.path().join("target");
    let dims    = [Dimension::overworld(), Dimension::nether()];
    let options = StorageOptions::small();

    // =========================================================================
    // 1. 造数据
    // =========================================================================
    println!("【1】写入源世界 ...");
    for dim in &dims {
        let storage = LocalStorage::open(&dim.resolve(&source), &options)?;
        for x in -64..64 {
            for z in -2..2 {
                let pos = ColumnPos::new(x, z);
                storage.write_column(pos, format!("{dim} column {pos}").repeat(32).as_bytes())?;
                storage.write_cube(pos.cube(0), format!("{dim} cube {pos}").as_bytes())?;
            }
        }
        println!("    {dim:<12} → {}", storage.path().display());
        storage.close()?;
    }
    println!();

    // =========================================================================
    // 2. 本地存储 → 区域文件
    // =========================================================================
    println!("【2】本地存储 → 区域文件 ...");
    let cache = RegionCacheConfig { hard_cap: 4 };
    let report = ConversionPipeline::new(
        LocalReader::open(&source, &dims, &options, ScanMode::Split)?,
        ReframeConverter::new(Framing::Tagged),
        RegionColumnWriter::new(&regions, cache),
        PipelineConfig::default(),
    )
    .run(&CancelToken::new(), &|e: &ConvertError| {
        // 区域文件只存列，立方体记录逐条报告后跳过
        !matches!(e, ConvertError::Io(_))
    })?;
    println!("    {report:?}\n");

    // =========================================================================
    // 3. 区域文件 → 本地存储
    // =========================================================================
    println!("【3】区域文件 → 本地存储 ...");
    let report = ConversionPipeline::new(
        RegionColumnReader::open(&regions, &dims, cache),
        ReframeConverter::new(Framing::Raw),
        LocalWriter::rocksdb(&target, options.clone()),
        PipelineConfig::default(),
    )
    .run(&CancelToken::new(), &skip_failures)?;
    println!("    {report:?}");

    let storage = LocalStorage::open(&dims[1].resolve(&target), &options)?;
    let mut first = None;
    storage.for_each_column_entry(&mut |pos, data| {
        first = Some((pos, data.len()));
        ControlFlow::Break(())
    })?;
    println!("    first nether column (Morton order) = {first:?}");
    storage.close()?;

    println!("    按列分组导出 Gzip ...");
    let grouped = scratch.path().join("grouped");
    let report = ConversionPipeline::new(
        LocalReader::open(&source, &dims, &options, ScanMode::Grouped)?,
        ReframeConverter::new(Framing::Gzip),
        LocalWriter::rocksdb(&grouped, options.clone()),
        PipelineConfig::default(),
    )
    .run(&CancelToken::new(), &skip_failures)?;
    println!("    {report:?}");

    println!("    按列分组导出立方体区域 ...");
    let cubic = scratch.path().join("cubic");
    let report = ConversionPipeline::new(
        LocalReader::open(&source, &dims, &options, ScanMode::Grouped)?,
        ReframeConverter::new(Framing::Gzip),
        CubicRegionWriter::new(&cubic, cache),
        PipelineConfig::default(),
    )
    .run(&CancelToken::new(), &skip_failures)?;
    println!("    {report:?}\n");

    // =========================================================================
    // 4. 取消
    // =========================================================================
    println!("【4】启动后立即取消 ...");
    let token = CancelToken::new();
    token.cancel();
    let report = ConversionPipeline::new(
        LocalReader::open(&source, &dims, &options, ScanMode::Split)?,
        ReframeConverter::new(Framing::Tagged),
        RegionColumnWriter::new(scratch.path().join("cancelled"), cache),
        PipelineConfig::default(),
    )
    .run(&token, &skip_failures)?;
    println!("    status = {:?}, written = {}", report.status, report.written);

    println!("\n✓ 完成");
    Ok(())
}
