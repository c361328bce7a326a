//! 块缓存层: 在内存中缓存磁盘块的数据, 避免频繁读写磁盘
//!
//! 先通过 read_block 将一个块上的数据从磁盘读到内存中的一个缓冲区中,
//! 这个缓冲区中的内容是可以直接读写的, 那么后续对这个数据块的大部分访问就可以在内存中完成了.
//! 如果缓冲区中的内容被修改了, 那么后续还需要通过 write_block 将缓冲区中的内容写回到磁盘块中.
//!
//! 对于缓冲区中的同一个块的多次修改没有必要每次都写回磁盘,
//! 只需等到 [`BlockCache::sync`] 或者该块被替换出去的时候统一写回磁盘即可 (write-back).
//!
//! 缓存容量有限, 满了之后使用 LRU 替换算法选出最久未使用的块,
//! 如果它被修改过, 会先同步写回磁盘再从缓存中移除, 因此替换永远不会丢失修改.
//!
//! 每个 [`BlockCache`] 由持有它的日志独占, 只缓存自己那块设备上的块.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use ::log::{debug, trace, warn};

use super::{Block, BlockDevice, Result, BLOCK_SIZE};

/// Cached block inside memory
struct CacheEntry {
    /// 位于内存中的缓冲区, 恰好为一个块
    cache: Box<Block>,
    /// modified 记录这个块从磁盘载入内存缓存之后, 它有没有被修改过
    modified: bool,
    /// 最近一次访问的时间戳, 越小越久未使用
    stamp: u64,
}

/// 缓存命中/替换统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// 写回磁盘的次数 (sync 和替换)
    pub writebacks: u64,
}

pub struct BlockCache {
    /// 底层块设备的引用, 可通过它进行块读写
    block_device: Arc<dyn BlockDevice>,
    capacity: usize,
    entries: HashMap<usize, CacheEntry>,
    /// 时间戳 -> 块号. 时间戳单调递增, 最小的就是 LRU 的替换对象,
    /// 同时也保证了访问顺序相同时按插入顺序替换
    lru: BTreeMap<u64, usize>,
    clock: u64,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(block_device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        if capacity == 0 {
            warn!("block cache capacity 0 requested, using 1");
        }
        Self {
            block_device,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn block_device(&self) -> &Arc<dyn BlockDevice> {
        &self.block_device
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, block_id: usize) -> bool {
        self.entries.contains_key(&block_id)
    }

    pub fn is_modified(&self, block_id: usize) -> bool {
        self.entries.get(&block_id).map_or(false, |e| e.modified)
    }

    /// 所有被修改过但还没写回的块号, 升序
    pub fn modified_blocks(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, e)| e.modified)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// 读取一个块. 命中时直接返回缓冲区并更新访问时间,
    /// 否则从磁盘读入, 作为未修改的块加入缓存 (可能触发替换)
    pub fn read(&mut self, block_id: usize) -> Result<&Block> {
        let entry = self.entry(block_id, true)?;
        Ok(&*entry.cache)
    }

    /// 写入一个块: 以修改过的状态插入/覆盖缓存, 不会访问磁盘 (替换写回除外)
    pub fn write(&mut self, block_id: usize, data: &Block) -> Result<()> {
        let entry = self.entry(block_id, false)?;
        entry.cache.copy_from_slice(data);
        entry.modified = true;
        Ok(())
    }

    /// 在缓冲区上执行闭包 f 修改块内容, 并将该块标记为已修改
    pub fn modify<V>(&mut self, block_id: usize, f: impl FnOnce(&mut Block) -> V) -> Result<V> {
        let entry = self.entry(block_id, true)?;
        entry.modified = true;
        Ok(f(&mut *entry.cache))
    }

    /// 如果该块在缓存中且被修改过, 写回磁盘并清除修改标记; 否则什么都不做
    pub fn sync(&mut self, block_id: usize) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(&block_id) {
            if entry.modified {
                self.block_device.write_block(block_id, &entry.cache[..])?;
                entry.modified = false;
                self.stats.writebacks += 1;
                trace!("block cache: synced block {}", block_id);
            }
        }
        Ok(())
    }

    /// 按块号升序写回所有被修改过的块, 返回时缓存中不再有修改过的块
    pub fn sync_all(&mut self) -> Result<()> {
        let modified = self.modified_blocks();
        if !modified.is_empty() {
            debug!("block cache: syncing {} modified blocks", modified.len());
        }
        for block_id in modified {
            self.sync(block_id)?;
        }
        Ok(())
    }

    /// 显式移除一个块, 修改过的块会先写回
    pub fn evict(&mut self, block_id: usize) -> Result<()> {
        self.sync(block_id)?;
        if let Some(entry) = self.entries.remove(&block_id) {
            self.lru.remove(&entry.stamp);
        }
        Ok(())
    }

    /// 绕过缓存直接读设备
    pub fn read_direct(&self, block_id: usize, buf: &mut Block) -> Result<()> {
        self.block_device.read_block(block_id, buf)
    }

    /// 绕过缓存直接写设备. 如果该块恰好在缓存中, 同时更新缓存中的副本
    /// 并视为已写回, 保证缓存和磁盘一致
    pub fn write_direct(&mut self, block_id: usize, data: &Block) -> Result<()> {
        self.block_device.write_block(block_id, data)?;
        if let Some(entry) = self.entries.get_mut(&block_id) {
            entry.cache.copy_from_slice(data);
            entry.modified = false;
        }
        Ok(())
    }

    /// 找到 block_id 对应的缓存项并更新访问时间.
    /// 不在缓存中时先腾出空位, fetch 为真则从磁盘读入内容, 否则用全零块占位
    fn entry(&mut self, block_id: usize, fetch: bool) -> Result<&mut CacheEntry> {
        let mut fetched = None;
        if self.entries.contains_key(&block_id) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            let mut cache = Box::new([0u8; BLOCK_SIZE]);
            if fetch {
                self.block_device.read_block(block_id, &mut cache[..])?;
            }
            self.make_room()?;
            fetched = Some(cache);
        }

        self.clock += 1;
        let stamp = self.clock;
        self.lru.insert(stamp, block_id);
        let lru = &mut self.lru;
        Ok(self
            .entries
            .entry(block_id)
            .and_modify(|entry| {
                lru.remove(&entry.stamp);
                entry.stamp = stamp;
            })
            .or_insert_with(|| CacheEntry {
                cache: fetched.unwrap_or_else(|| Box::new([0u8; BLOCK_SIZE])),
                modified: false,
                stamp,
            }))
    }

    /// 缓存已满时替换出最久未使用的块.
    /// 写回失败时不移除任何块, 错误返回给调用者
    fn make_room(&mut self) -> Result<()> {
        while self.entries.len() >= self.capacity {
            let (stamp, victim) = match self.lru.first_key_value() {
                Some((stamp, victim)) => (*stamp, *victim),
                None => break,
            };
            self.sync(victim)?;
            self.lru.remove(&stamp);
            self.entries.remove(&victim);
            self.stats.evictions += 1;
            trace!("block cache: evicted block {}", victim);
        }
        Ok(())
    }
}
