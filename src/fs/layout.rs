//! 磁盘布局计算
//!
//! 根据三个容量参数 (数据位图块数, inode 位图块数, 日志描述块数) 计算整个磁盘的分区布局.
//! 按照块编号从小到大顺序地分成若干个互不重叠的连续区域:
//!
//! - 数据块区域, 共 `data_bitmaps * BLOCK_BITS` 个块
//! - inode 区域, 每个块存放 [`INODES_PER_BLOCK`] 个 inode 记录
//! - inode 位图区域
//! - 两份数据块位图区域 (A/B)
//! - 一个保留块之后是日志头, 日志描述块区域, 日志数据区域
//!
//! 布局计算是纯函数, 只做算术, 不访问设备.

use std::fmt::{Debug, Formatter, Result as FmtResult};

use super::{
    FsError, Result, BLOCK_BITS, DATA_START, DESCRIPTORS_PER_BLOCK, INODES_PER_BLOCK,
};

/// 一段连续的块区域 `[base, base + len)`
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub base: usize,
    pub len: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn contains(&self, block_id: usize) -> bool {
        block_id >= self.base && block_id < self.end()
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}[{}, {})", self.name, self.base, self.end())
    }
}

/// 日志层需要知道的那部分布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogParams {
    /// 日志可以写入的第一个块
    pub data_start: usize,
    /// 日志头所在块
    pub log_hdr: usize,
    /// 日志描述块区域起始块
    pub log_descr: usize,
    /// 日志描述块数
    pub log_descr_blocks: usize,
    /// 日志数据区域起始块
    pub log_data: usize,
    /// 日志数据区域块数, 也就是一个事务最多能写的块数
    pub log_data_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub data_bitmaps: usize,
    pub inode_bitmaps: usize,
    pub log_descr_blocks: usize,

    /// 数据块区域大小
    pub data_blocks: usize,
    /// inode 区域大小
    pub inode_blocks: usize,
    /// inode 区域起始块号
    pub inode_base: usize,
    /// inode 位图区域起始块号
    pub inode_bitmap_base: usize,
    /// 数据块位图 A 起始块号
    pub balloc_base1: usize,
    /// 数据块位图 B 起始块号
    pub balloc_base2: usize,
    pub log_hdr: usize,
    pub log_descr: usize,
    pub log_data: usize,
    pub log_data_size: usize,
    /// 整个布局需要的设备块数
    pub max_addr: usize,
}

impl Layout {
    /// 计算布局. 只有在结果超出 usize 地址宽度时才会失败
    pub fn new(data_bitmaps: usize, inode_bitmaps: usize, log_descr_blocks: usize) -> Result<Self> {
        let overflow = || {
            FsError::LayoutOverflow(format!(
                "data_bitmaps={}, inode_bitmaps={}, log_descr_blocks={} overflows the address width",
                data_bitmaps, inode_bitmaps, log_descr_blocks
            ))
        };

        let data_blocks = data_bitmaps.checked_mul(BLOCK_BITS).ok_or_else(overflow)?;
        let inode_blocks = inode_bitmaps.checked_mul(BLOCK_BITS).ok_or_else(overflow)? / INODES_PER_BLOCK;
        let inode_base = data_blocks;
        let inode_bitmap_base = inode_base.checked_add(inode_blocks).ok_or_else(overflow)?;
        let balloc_base1 = inode_bitmap_base.checked_add(inode_bitmaps).ok_or_else(overflow)?;
        let balloc_base2 = balloc_base1.checked_add(data_bitmaps).ok_or_else(overflow)?;
        // balloc_base2 + data_bitmaps 之后保留一个块, 再放日志头
        let log_hdr = balloc_base2
            .checked_add(data_bitmaps)
            .and_then(|x| x.checked_add(1))
            .ok_or_else(overflow)?;
        let log_descr = log_hdr.checked_add(1).ok_or_else(overflow)?;
        let log_data = log_descr.checked_add(log_descr_blocks).ok_or_else(overflow)?;
        let log_data_size = log_descr_blocks
            .checked_mul(DESCRIPTORS_PER_BLOCK)
            .ok_or_else(overflow)?;
        let max_addr = log_data.checked_add(log_data_size).ok_or_else(overflow)?;

        Ok(Self {
            data_bitmaps,
            inode_bitmaps,
            log_descr_blocks,
            data_blocks,
            inode_blocks,
            inode_base,
            inode_bitmap_base,
            balloc_base1,
            balloc_base2,
            log_hdr,
            log_descr,
            log_data,
            log_data_size,
            max_addr,
        })
    }

    /// 检查布局能否放进一个有 `block_count` 个块的设备
    pub fn check_device(&self, block_count: usize) -> Result<()> {
        if self.max_addr > block_count {
            return Err(FsError::LayoutOverflow(format!(
                "layout needs {} blocks but the device only has {}",
                self.max_addr, block_count
            )));
        }
        Ok(())
    }

    pub fn log_params(&self) -> LogParams {
        LogParams {
            data_start: DATA_START,
            log_hdr: self.log_hdr,
            log_descr: self.log_descr,
            log_descr_blocks: self.log_descr_blocks,
            log_data: self.log_data,
            log_data_size: self.log_data_size,
        }
    }

    /// 所有区域, 按块编号递增排列
    pub fn regions(&self) -> [Region; 8] {
        [
            Region {
                name: "data",
                base: 0,
                len: self.data_blocks,
            },
            Region {
                name: "inode",
                base: self.inode_base,
                len: self.inode_blocks,
            },
            Region {
                name: "inode_bitmap",
                base: self.inode_bitmap_base,
                len: self.inode_bitmaps,
            },
            Region {
                name: "data_bitmap_a",
                base: self.balloc_base1,
                len: self.data_bitmaps,
            },
            Region {
                name: "data_bitmap_b",
                base: self.balloc_base2,
                len: self.data_bitmaps,
            },
            Region {
                name: "log_header",
                base: self.log_hdr,
                len: 1,
            },
            Region {
                name: "log_descriptor",
                base: self.log_descr,
                len: self.log_descr_blocks,
            },
            Region {
                name: "log_data",
                base: self.log_data,
                len: self.log_data_size,
            },
        ]
    }
}

/// 布局计算器
pub fn compute_layout(
    data_bitmaps: usize,
    inode_bitmaps: usize,
    log_descr_blocks: usize,
) -> Result<Layout> {
    Layout::new(data_bitmaps, inode_bitmaps, log_descr_blocks)
}
