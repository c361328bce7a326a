//! 写前日志 (write-ahead log): 把若干个块的写入组成一个原子事务
//!
//! 事务的状态机为 `Empty -> Active -> Committing -> Empty`.
//! 事务进行中的写入只缓存在内存的写集合里, 读的时候写集合会遮蔽块缓存.
//!
//! 提交分两个阶段:
//!
//! 1. 持久化: 把写集合的目标块号写入日志描述块区域, 把数据写入日志数据区域,
//!    刷盘之后再写日志头, 标记该事务有效. 日志头落盘就是提交点.
//! 2. 应用: 把写集合逐项写进块缓存 (write-back, 之后再写回磁盘).
//!
//! 日志头在 checkpoint 时才会被清除: 先把已经应用的块写回磁盘, 再把日志头改写为空.
//! 下一次提交之前会先做 checkpoint, 这样日志区域才能被复用.
//!
//! 挂载时的 [`WriteAheadLog::recover`] 检查日志头: 如果存在一个有效但没有 checkpoint 的事务,
//! 就按照第二阶段的方式重新应用它, 然后 checkpoint.
//!
//! 日志头格式 (小端序):
//!
//! | 偏移 | 长度 | 内容 |
//! |------|------|------|
//! | 0    | 8    | [`LOG_MAGIC`] |
//! | 8    | 8    | 最近一次提交的事务序号 |
//! | 16   | 8    | 日志中的块数, 0 表示日志为空 |
//! | 24   | 4    | 描述项和数据的 crc32c |
//! | 28   | 4    | 前 28 字节的 crc32c |
//!
//! 全零的日志头表示一个刚格式化的日志.

use std::collections::BTreeMap;

use ::log::{debug, info, warn};

use super::{
    Block, BlockCache, FsError, LogParams, Result, BLOCK_SIZE, DESCRIPTORS_PER_BLOCK, LOG_MAGIC,
};

/// 事务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    /// 没有进行中的事务
    Empty,
    /// 写集合非空, 还没有提交
    Active,
    /// 已经越过提交点, 还没有全部应用到缓存
    Committing,
}

/// 挂载时恢复的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// 日志为空, 不需要做任何事
    Clean { seq: u64 },
    /// 重放了一个已提交的事务
    Replayed { seq: u64, blocks: usize },
}

const HEADER_CRC_OFFSET: usize = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LogHeader {
    seq: u64,
    count: usize,
    payload_crc: u32,
}

impl LogHeader {
    fn clean(seq: u64) -> Self {
        Self {
            seq,
            count: 0,
            payload_crc: 0,
        }
    }

    fn encode(&self) -> Block {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..8].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        block[8..16].copy_from_slice(&self.seq.to_le_bytes());
        block[16..24].copy_from_slice(&(self.count as u64).to_le_bytes());
        block[24..28].copy_from_slice(&self.payload_crc.to_le_bytes());
        let crc = crc32c::crc32c(&block[..HEADER_CRC_OFFSET]);
        block[28..32].copy_from_slice(&crc.to_le_bytes());
        block
    }

    /// 解析日志头. `Ok(None)` 表示日志头全零 (从未写过)
    fn decode(block: &Block, block_id: usize, capacity: usize) -> Result<Option<Self>> {
        if block.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let corrupt = |detail: String| FsError::CorruptLogHeader { block_id, detail };

        let magic = le_u64(block, 0);
        if magic != LOG_MAGIC {
            return Err(corrupt(format!("bad magic {:#x}", magic)));
        }
        let stored_crc = le_u32(block, HEADER_CRC_OFFSET);
        let crc = crc32c::crc32c(&block[..HEADER_CRC_OFFSET]);
        if stored_crc != crc {
            return Err(corrupt(format!(
                "header checksum {:#010x} does not match {:#010x}",
                stored_crc, crc
            )));
        }
        let count = le_u64(block, 16);
        if count > capacity as u64 {
            return Err(corrupt(format!(
                "header claims {} logged blocks, the log holds {}",
                count, capacity
            )));
        }
        Ok(Some(Self {
            seq: le_u64(block, 8),
            count: count as usize,
            payload_crc: le_u32(block, 24),
        }))
    }
}

fn le_u64(block: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&block[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn le_u32(block: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&block[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// 描述项 (块号) 和数据依次累加的校验和, 顺序和日志区域中的顺序一致
fn payload_crc<'a>(entries: impl Iterator<Item = (usize, &'a Block)>) -> u32 {
    entries.fold(0, |crc, (block_id, data)| {
        let crc = crc32c::crc32c_append(crc, &(block_id as u64).to_le_bytes());
        crc32c::crc32c_append(crc, data)
    })
}

pub struct WriteAheadLog {
    cache: BlockCache,
    params: LogParams,
    /// 当前事务的写集合. 同一个块只保留最后一次写入, 按块号升序排列
    pending: BTreeMap<usize, Box<Block>>,
    state: TxnState,
    /// 最近一次提交的事务序号
    seq: u64,
    /// 已经提交并应用到缓存, 但还没有 checkpoint 的块
    installed: Vec<usize>,
}

impl WriteAheadLog {
    pub fn new(cache: BlockCache, params: LogParams) -> Self {
        Self {
            cache,
            params,
            pending: BTreeMap::new(),
            state: TxnState::Empty,
            seq: 0,
            installed: Vec::new(),
        }
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BlockCache {
        &mut self.cache
    }

    pub fn params(&self) -> LogParams {
        self.params
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// 最近一次提交的事务序号
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// 一个事务最多能写的块数
    pub fn capacity(&self) -> usize {
        self.params.log_data_size
    }

    /// 当前事务写集合中的块号, 升序
    pub fn pending_blocks(&self) -> Vec<usize> {
        self.pending.keys().copied().collect()
    }

    /// 读一个块. 当前事务写过的块返回写集合中的内容, 否则从块缓存读取
    pub fn log_read(&mut self, block_id: usize) -> Result<&Block> {
        if let Some(data) = self.pending.get(&block_id) {
            return Ok(&**data);
        }
        self.cache.read(block_id)
    }

    /// 把一次写入记入当前事务, 覆盖该事务中对同一个块的更早写入
    pub fn log_write(&mut self, block_id: usize, data: &Block) -> Result<()> {
        if self.state == TxnState::Committing {
            // 上一次提交在应用阶段失败了, 先把它完成
            self.apply_pending()?;
        }
        if !self.writable(block_id) {
            return Err(FsError::AddressOutOfRange {
                block_id,
                start: self.params.data_start,
                limit: self.params.log_hdr,
            });
        }
        if !self.pending.contains_key(&block_id) && self.pending.len() >= self.capacity() {
            return Err(FsError::TransactionCapacityExceeded {
                requested: self.pending.len() + 1,
                capacity: self.capacity(),
            });
        }
        self.pending.insert(block_id, Box::new(*data));
        self.state = TxnState::Active;
        Ok(())
    }

    /// 丢弃还没有提交的写集合
    pub fn abort(&mut self) {
        match self.state {
            TxnState::Active => {
                debug!("log: aborting transaction with {} blocks", self.pending.len());
                self.pending.clear();
                self.state = TxnState::Empty;
            }
            TxnState::Committing => {
                warn!(
                    "log: transaction {} is already durable, it can only be finished by commit",
                    self.seq
                );
            }
            TxnState::Empty => {}
        }
    }

    /// 提交当前事务. 返回时事务已经持久化在日志中, 写集合已经应用到块缓存.
    ///
    /// 第一阶段失败时事务保持 `Active`, 可以重试或者 abort;
    /// 第二阶段失败时事务保持 `Committing`, 再次调用 commit 只会重做第二阶段.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TxnState::Empty => return Ok(()),
            TxnState::Active => {
                // 日志区域只能容纳一个事务, 复用之前先把上一个事务 checkpoint 掉
                self.checkpoint()?;
                self.write_log()?;
                self.state = TxnState::Committing;
            }
            TxnState::Committing => {}
        }
        self.apply_pending()
    }

    /// 把已经应用到缓存的块写回磁盘, 然后清除日志头, 日志区域可以复用
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.installed.is_empty() {
            return Ok(());
        }
        for block_id in self.installed.iter() {
            self.cache.sync(*block_id)?;
        }
        self.flush()?;
        self.cache
            .write_direct(self.params.log_hdr, &LogHeader::clean(self.seq).encode())?;
        self.flush()?;
        debug!(
            "log: checkpointed transaction {} ({} blocks)",
            self.seq,
            self.installed.len()
        );
        self.installed.clear();
        Ok(())
    }

    /// checkpoint 之后写回块缓存中的所有修改
    pub fn sync(&mut self) -> Result<()> {
        self.checkpoint()?;
        self.cache.sync_all()?;
        self.flush()
    }

    /// 挂载时调用一次, 必须在任何 log_read/log_write 之前.
    /// 日志头中如果有一个有效的事务, 重新应用它并 checkpoint
    pub fn recover(&mut self) -> Result<Recovery> {
        let LogParams {
            log_hdr,
            log_descr,
            log_data,
            ..
        } = self.params;
        self.pending.clear();
        self.installed.clear();
        self.state = TxnState::Empty;

        let mut block = [0u8; BLOCK_SIZE];
        self.cache.read_direct(log_hdr, &mut block)?;
        let header = match LogHeader::decode(&block, log_hdr, self.capacity())? {
            Some(header) => header,
            None => {
                self.seq = 0;
                return Ok(Recovery::Clean { seq: 0 });
            }
        };
        self.seq = header.seq;
        if header.count == 0 {
            return Ok(Recovery::Clean { seq: header.seq });
        }

        let corrupt = |detail: String| FsError::CorruptLogHeader {
            block_id: log_hdr,
            detail,
        };

        let mut targets = Vec::with_capacity(header.count);
        for (i, start) in (0..header.count).step_by(DESCRIPTORS_PER_BLOCK).enumerate() {
            self.cache.read_direct(log_descr + i, &mut block)?;
            let n = (header.count - start).min(DESCRIPTORS_PER_BLOCK);
            targets.extend((0..n).map(|j| le_u64(&block, j * 8) as usize));
        }

        let mut entries = Vec::with_capacity(header.count);
        for (i, block_id) in targets.iter().enumerate() {
            if !self.writable(*block_id) {
                return Err(corrupt(format!(
                    "descriptor {} targets block {} outside the logged area",
                    i, block_id
                )));
            }
            let mut data = Box::new([0u8; BLOCK_SIZE]);
            self.cache.read_direct(log_data + i, &mut *data)?;
            entries.push((*block_id, data));
        }

        let crc = payload_crc(entries.iter().map(|(id, data)| (*id, &**data)));
        if crc != header.payload_crc {
            return Err(corrupt(format!(
                "payload checksum {:#010x} does not match header {:#010x}",
                crc, header.payload_crc
            )));
        }

        for (block_id, data) in entries.iter() {
            self.cache.write(*block_id, data)?;
        }
        self.installed = targets;
        self.checkpoint()?;
        info!(
            "log: replayed transaction {} ({} blocks)",
            header.seq, header.count
        );
        Ok(Recovery::Replayed {
            seq: header.seq,
            blocks: header.count,
        })
    }

    /// 第一阶段: 描述块, 数据块, 刷盘, 日志头, 刷盘
    fn write_log(&mut self) -> Result<()> {
        let seq = self.seq + 1;
        let targets = self.pending_blocks();

        for (i, chunk) in targets.chunks(DESCRIPTORS_PER_BLOCK).enumerate() {
            let mut block = [0u8; BLOCK_SIZE];
            for (j, block_id) in chunk.iter().enumerate() {
                block[j * 8..j * 8 + 8].copy_from_slice(&(*block_id as u64).to_le_bytes());
            }
            self.cache.write_direct(self.params.log_descr + i, &block)?;
        }
        for (i, data) in self.pending.values().enumerate() {
            self.cache.write_direct(self.params.log_data + i, data)?;
        }
        self.flush()?;

        let header = LogHeader {
            seq,
            count: targets.len(),
            payload_crc: payload_crc(self.pending.iter().map(|(id, data)| (*id, &**data))),
        };
        self.cache
            .write_direct(self.params.log_hdr, &header.encode())?;
        self.flush()?;
        self.seq = seq;
        debug!("log: transaction {} durable ({} blocks)", seq, targets.len());
        Ok(())
    }

    /// 第二阶段: 写集合逐项写入块缓存. 重复执行是安全的
    fn apply_pending(&mut self) -> Result<()> {
        for (block_id, data) in self.pending.iter() {
            self.cache.write(*block_id, data)?;
        }
        self.installed.extend(self.pending.keys().copied());
        self.pending.clear();
        self.state = TxnState::Empty;
        Ok(())
    }

    /// 日志只能写 `[data_start, log_hdr)` 之间的块
    fn writable(&self, block_id: usize) -> bool {
        block_id >= self.params.data_start && block_id < self.params.log_hdr
    }

    fn flush(&self) -> Result<()> {
        self.cache.block_device().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::fs::BlockDevice;
    use std::sync::Arc;

    const PARAMS: LogParams = LogParams {
        data_start: 1,
        log_hdr: 10,
        log_descr: 11,
        log_descr_blocks: 1,
        log_data: 12,
        log_data_size: 4,
    };

    fn block_of(byte: u8) -> Block {
        [byte; BLOCK_SIZE]
    }

    fn new_log(device: &Arc<MemDevice>, cache_size: usize) -> WriteAheadLog {
        let cache = BlockCache::new(device.clone(), cache_size);
        WriteAheadLog::new(cache, PARAMS)
    }

    fn device_block(device: &MemDevice, block_id: usize) -> Block {
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(block_id, &mut buf).unwrap();
        buf
    }

    #[test]
    fn pending_writes_shadow_cache() {
        let device = Arc::new(MemDevice::new(16));
        device.write_block(2, &block_of(1)).unwrap();
        let mut log = new_log(&device, 8);
        assert_eq!(log.log_read(2).unwrap(), &block_of(1));
        log.log_write(2, &block_of(2)).unwrap();
        assert_eq!(log.state(), TxnState::Active);
        assert_eq!(log.log_read(2).unwrap(), &block_of(2));
        // 缓存里还是旧值
        assert_eq!(log.cache_mut().read(2).unwrap(), &block_of(1));
    }

    #[test]
    fn last_write_wins() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        log.log_write(3, &block_of(1)).unwrap();
        log.log_write(3, &block_of(2)).unwrap();
        assert_eq!(log.pending_blocks(), vec![3]);
        log.commit().unwrap();
        assert_eq!(log.log_read(3).unwrap(), &block_of(2));
    }

    #[test]
    fn capacity_is_enforced() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        for i in 1..5 {
            log.log_write(i, &block_of(i as u8)).unwrap();
        }
        // 重写已有的块不占用新的位置
        log.log_write(1, &block_of(9)).unwrap();
        match log.log_write(5, &block_of(5)) {
            Err(FsError::TransactionCapacityExceeded {
                requested,
                capacity,
            }) => assert_eq!((requested, capacity), (5, 4)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(log.pending_blocks(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn log_region_is_not_writable() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        assert_eq!(log.params(), PARAMS);
        assert!(matches!(
            log.log_write(0, &block_of(1)),
            Err(FsError::AddressOutOfRange {
                block_id: 0,
                start: 1,
                limit: 10
            })
        ));
        assert!(matches!(
            log.log_write(PARAMS.log_hdr, &block_of(1)),
            Err(FsError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            log.log_write(PARAMS.log_data, &block_of(1)),
            Err(FsError::AddressOutOfRange { .. })
        ));
        assert_eq!(log.state(), TxnState::Empty);
    }

    #[test]
    fn commit_moves_writes_into_cache() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        log.log_write(1, &block_of(0x11)).unwrap();
        log.log_write(5, &block_of(0x55)).unwrap();
        log.commit().unwrap();
        assert_eq!(log.state(), TxnState::Empty);
        assert_eq!(log.seq(), 1);
        assert!(log.pending_blocks().is_empty());
        assert_eq!(log.cache().modified_blocks(), vec![1, 5]);
        // 数据还在缓存里, 日志头有效
        assert_eq!(device_block(&device, 1), block_of(0));
        let header = LogHeader::decode(&device_block(&device, PARAMS.log_hdr), PARAMS.log_hdr, 4)
            .unwrap()
            .unwrap();
        assert_eq!((header.seq, header.count), (1, 2));

        log.sync().unwrap();
        assert_eq!(device_block(&device, 1), block_of(0x11));
        assert_eq!(device_block(&device, 5), block_of(0x55));
        let header = LogHeader::decode(&device_block(&device, PARAMS.log_hdr), PARAMS.log_hdr, 4)
            .unwrap()
            .unwrap();
        assert_eq!(header, LogHeader::clean(1));
    }

    #[test]
    fn empty_commit_is_a_noop() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        log.commit().unwrap();
        assert_eq!(log.seq(), 0);
        assert!(device.snapshot().is_empty());
    }

    #[test]
    fn abort_drops_pending_writes() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        log.log_write(4, &block_of(4)).unwrap();
        log.abort();
        assert_eq!(log.state(), TxnState::Empty);
        assert_eq!(log.log_read(4).unwrap(), &block_of(0));
        log.commit().unwrap();
        assert!(device.snapshot().is_empty());
    }

    #[test]
    fn recover_replays_committed_transaction() {
        let device = Arc::new(MemDevice::new(16));
        {
            let mut log = new_log(&device, 8);
            log.log_write(1, &block_of(7)).unwrap();
            log.log_write(9, &block_of(8)).unwrap();
            log.commit().unwrap();
            // 不做 checkpoint 直接丢弃: 缓存里的数据全部丢失
        }
        assert_eq!(device_block(&device, 1), block_of(0));

        let mut log = new_log(&device, 8);
        assert_eq!(
            log.recover().unwrap(),
            Recovery::Replayed { seq: 1, blocks: 2 }
        );
        assert_eq!(device_block(&device, 1), block_of(7));
        assert_eq!(device_block(&device, 9), block_of(8));
        // 再次恢复什么都不做, 序号继续
        assert_eq!(log.recover().unwrap(), Recovery::Clean { seq: 1 });
        log.log_write(1, &block_of(1)).unwrap();
        log.commit().unwrap();
        assert_eq!(log.seq(), 2);
    }

    #[test]
    fn fresh_log_is_clean() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        assert_eq!(log.recover().unwrap(), Recovery::Clean { seq: 0 });
    }

    #[test]
    fn garbage_header_is_rejected() {
        let device = Arc::new(MemDevice::new(16));
        device.write_block(PARAMS.log_hdr, &block_of(0x5a)).unwrap();
        let mut log = new_log(&device, 8);
        assert!(matches!(
            log.recover(),
            Err(FsError::CorruptLogHeader { block_id: 10, .. })
        ));
    }

    #[test]
    fn header_checksum_is_checked() {
        let device = Arc::new(MemDevice::new(16));
        let mut header = LogHeader::clean(3).encode();
        header[8] ^= 1;
        device.write_block(PARAMS.log_hdr, &header).unwrap();
        let mut log = new_log(&device, 8);
        assert!(matches!(
            log.recover(),
            Err(FsError::CorruptLogHeader { .. })
        ));
    }

    #[test]
    fn oversized_count_is_rejected() {
        let device = Arc::new(MemDevice::new(16));
        let header = LogHeader {
            seq: 1,
            count: 5,
            payload_crc: 0,
        };
        device.write_block(PARAMS.log_hdr, &header.encode()).unwrap();
        let mut log = new_log(&device, 8);
        assert!(matches!(
            log.recover(),
            Err(FsError::CorruptLogHeader { .. })
        ));
    }

    #[test]
    fn descriptor_into_reserved_block_is_rejected() {
        let device = Arc::new(MemDevice::new(16));
        let mut descr = [0u8; BLOCK_SIZE];
        descr[0..8].copy_from_slice(&0u64.to_le_bytes());
        let data = block_of(6);
        device.write_block(PARAMS.log_descr, &descr).unwrap();
        device.write_block(PARAMS.log_data, &data).unwrap();
        let header = LogHeader {
            seq: 4,
            count: 1,
            payload_crc: payload_crc([(0usize, &data)].into_iter()),
        };
        device.write_block(PARAMS.log_hdr, &header.encode()).unwrap();
        let mut log = new_log(&device, 8);
        assert!(matches!(
            log.recover(),
            Err(FsError::CorruptLogHeader { block_id: 10, .. })
        ));
        assert_eq!(device_block(&device, 0), block_of(0));
    }

    #[test]
    fn damaged_payload_is_rejected() {
        let device = Arc::new(MemDevice::new(16));
        {
            let mut log = new_log(&device, 8);
            log.log_write(2, &block_of(2)).unwrap();
            log.commit().unwrap();
        }
        device.write_block(PARAMS.log_data, &block_of(3)).unwrap();
        let mut log = new_log(&device, 8);
        assert!(matches!(
            log.recover(),
            Err(FsError::CorruptLogHeader { .. })
        ));
        // 不猜测修复: 目标块保持原样
        assert_eq!(device_block(&device, 2), block_of(0));
    }

    #[test]
    fn failed_apply_resumes_on_next_commit() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 1);
        log.log_write(1, &block_of(1)).unwrap();
        log.log_write(2, &block_of(2)).unwrap();
        // 描述块 1 + 数据块 2 + 日志头 1, 之后替换写回失败
        device.fail_writes_after(4);
        assert!(log.commit().is_err());
        assert_eq!(log.state(), TxnState::Committing);
        assert_eq!(log.log_read(2).unwrap(), &block_of(2));

        device.heal();
        log.commit().unwrap();
        assert_eq!(log.state(), TxnState::Empty);
        assert_eq!(log.log_read(1).unwrap(), &block_of(1));
        assert_eq!(log.log_read(2).unwrap(), &block_of(2));
    }

    #[test]
    fn failed_log_write_keeps_transaction_active() {
        let device = Arc::new(MemDevice::new(16));
        let mut log = new_log(&device, 8);
        log.log_write(1, &block_of(1)).unwrap();
        device.fail_writes_after(1);
        assert!(log.commit().is_err());
        assert_eq!(log.state(), TxnState::Active);
        assert_eq!(log.seq(), 0);
        device.heal();
        log.commit().unwrap();
        assert_eq!(log.seq(), 1);
        assert_eq!(log.log_read(1).unwrap(), &block_of(1));
    }
}
