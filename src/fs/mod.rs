mod block_cache;
mod block_dev;
mod error;
mod fs;
mod layout;
mod wal;

/// Use a block size of 4096 bytes
pub const BLOCK_SIZE: usize = 4096;
/// 块的 bit 数量, 也是一个位图块能够管理的块数 (布局计算中的 block capacity)
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// 每个块中的 inode 记录数 (每条记录 128 字节)
pub const INODES_PER_BLOCK: usize = 32;
/// 每个日志描述块中的描述项数量, 每项是一个 u64 块号
pub const DESCRIPTORS_PER_BLOCK: usize = BLOCK_BITS / 64;
/// 块缓存默认容量 (块数)
pub const BLOCK_CACHE_SIZE: usize = 100_000;
/// 日志可以写入的第一个块, 块 0 留给超级块
pub const DATA_START: usize = 1;
/// Magic number for log header sanity check
pub const LOG_MAGIC: u64 = 0x4c4f_4746_5321_0001;

/// 一个完整的磁盘块
pub type Block = [u8; BLOCK_SIZE];

pub use block_cache::{BlockCache, CacheStats};
pub use block_dev::BlockDevice;
pub use error::{FsError, Result};
pub use fs::{FileSystem, MountConfig};
pub use layout::{compute_layout, Layout, LogParams};
pub use wal::{Recovery, TxnState, WriteAheadLog};
