//! 块设备仅支持以块为单位进行随机读写, 需要由具体的块设备驱动来实现这两个方法.
//! 块缓存层和日志层会调用这些方法, 进行块缓存的管理和日志的持久化.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的块设备驱动程序.

use std::any::Any;

use super::Result;

// 块设备接口层
// 定义设备驱动需要实现的块读写接口 BlockDevice trait
//
// 读写失败时返回 FsError::Device, 重试策略 (如果有) 属于驱动自身.

pub trait BlockDevice: Send + Sync + Any {
    // read_block 将编号为 block_id 的块从磁盘读入内存中的缓冲区 buf ;
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<()>;

    // write_block 将内存中的缓冲区 buf 中的数据写入磁盘编号为 block_id 的块.
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<()>;

    /// 写屏障: 返回时此前的所有写入都已落盘
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// 设备总块数
    fn block_count(&self) -> usize;
}
