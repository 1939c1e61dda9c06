//! RocksDB 调优参数
//!
//! 每个存储实例在构造时拿到一份 `StorageOptions`，不存在进程级的全局配置。

use rocksdb::{BlockBasedOptions, Cache, DBCompressionType, Options};

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// 维度根目录下的数据库子目录
    pub subdirectory:          String,
    pub create_if_missing:     bool,
    /// 后台线程 / 压实并行度
    pub parallelism:           i32,
    pub max_open_files:        i32,
    pub max_write_buffers:     i32,
    pub target_file_size:      u64,
    pub block_size:            usize,
    /// LRU block cache 容量（字节）
    pub block_cache_bytes:     usize,
    /// SST 文件压缩（负载本身以原始字节存储）
    pub zstd:                  bool,
    pub use_fsync:             bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(4);
        Self {
            subdirectory:      "cubestore/db".into(),
            create_if_missing: true,
            parallelism:       cpus,
            max_open_files:    256,
            max_write_buffers: cpus.max(2),
            target_file_size:  64 << 20,
            block_size:        1 << 20,
            block_cache_bytes: 128 << 20,
            zstd:              true,
            use_fsync:         false,
        }
    }
}

impl StorageOptions {
    /// 适合测试的小内存配置
    pub fn small() -> Self {
        Self {
            parallelism:       2,
            max_open_files:    64,
            max_write_buffers: 2,
            block_size:        16 << 10,
            block_cache_bytes: 8 << 20,
            zstd:              false,
            ..Self::default()
        }
    }

    /// DB 级参数
    pub(crate) fn db_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(self.create_if_missing);
        opts.create_missing_column_families(true);
        opts.increase_parallelism(self.parallelism);
        opts.set_max_background_jobs(self.parallelism.max(2));
        opts.set_max_open_files(self.max_open_files);
        opts.set_use_fsync(self.use_fsync);
        opts.set_allow_concurrent_memtable_write(true);
        opts.set_skip_stats_update_on_db_open(true);
        opts.set_advise_random_on_open(true);
        opts.set_paranoid_checks(false);
        opts
    }

    /// 列族级参数（columns / cubes 共用）
    pub(crate) fn cf_options(&self) -> Options {
        let mut opts = Options::default();
        opts.set_max_write_buffer_number(self.max_write_buffers);
        opts.set_target_file_size_base(self.target_file_size);
        opts.set_target_file_size_multiplier(1);
        opts.set_compression_type(if self.zstd { DBCompressionType::Zstd } else { DBCompressionType::None });

        let mut table = BlockBasedOptions::default();
        table.set_block_size(self.block_size);
        table.set_block_cache(&Cache::new_lru_cache(self.block_cache_bytes));
        opts.set_block_based_table_factory(&table);
        opts
    }
}
