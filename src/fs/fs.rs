//! 挂载: 把布局计算, 块缓存和写前日志组装成一个可以使用的存储实例
//!
//! [`FileSystem`] 知道每个布局区域所在的位置, 所有对数据区域的读写都要经过它的日志.
//! 挂载返回 `Arc<Mutex<FileSystem>>`: 整个可变状态 (写集合 + 块缓存) 由同一把锁保护,
//! 每个操作持锁完成, 同一时间最多只有一个事务.

use std::sync::Arc;

use ::log::info;
use spin::Mutex;

use super::{
    Block, BlockCache, BlockDevice, CacheStats, Layout, Recovery, Result, TxnState, WriteAheadLog,
    BLOCK_CACHE_SIZE,
};

/// 挂载参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountConfig {
    /// 数据块位图块数
    pub data_bitmaps: usize,
    /// inode 位图块数
    pub inode_bitmaps: usize,
    /// 日志描述块数
    pub log_descr_blocks: usize,
    /// 块缓存容量 (块数)
    pub cache_size: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            data_bitmaps: 1,
            inode_bitmaps: 1,
            log_descr_blocks: 256,
            cache_size: BLOCK_CACHE_SIZE,
        }
    }
}

impl MountConfig {
    pub fn layout(&self) -> Result<Layout> {
        Layout::new(self.data_bitmaps, self.inode_bitmaps, self.log_descr_blocks)
    }
}

pub struct FileSystem {
    layout: Layout,
    log: WriteAheadLog,
    recovery: Recovery,
}

impl FileSystem {
    /// 在块设备上挂载: 计算布局并检查设备大小, 初始化块缓存和日志, 然后执行日志恢复
    pub fn mount(
        block_device: Arc<dyn BlockDevice>,
        config: MountConfig,
    ) -> Result<Arc<Mutex<Self>>> {
        let layout = config.layout()?;
        layout.check_device(block_device.block_count())?;

        let cache = BlockCache::new(block_device, config.cache_size);
        let mut log = WriteAheadLog::new(cache, layout.log_params());
        let recovery = log.recover()?;

        let params = log.params();
        info!(
            "mounted: {} blocks (writable [{}, {}), log capacity {} blocks), cache {} blocks, {:?}",
            layout.max_addr,
            params.data_start,
            params.log_hdr,
            params.log_data_size,
            log.cache().capacity(),
            recovery
        );

        Ok(Arc::new(Mutex::new(Self {
            layout,
            log,
            recovery,
        })))
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// 挂载时日志恢复的结果
    pub fn recovery(&self) -> Recovery {
        self.recovery
    }

    pub fn txn_state(&self) -> TxnState {
        self.log.state()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.log.cache().stats()
    }

    pub fn log(&self) -> &WriteAheadLog {
        &self.log
    }

    pub fn log_read(&mut self, block_id: usize) -> Result<&Block> {
        self.log.log_read(block_id)
    }

    pub fn log_write(&mut self, block_id: usize, data: &Block) -> Result<()> {
        self.log.log_write(block_id, data)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.log.commit()
    }

    pub fn abort(&mut self) {
        self.log.abort()
    }

    /// 把已提交的数据全部写回磁盘并清空日志
    pub fn sync(&mut self) -> Result<()> {
        self.log.sync()
    }
}
