use crate::fs::{Block, BlockDevice, FsError, Result, BLOCK_SIZE};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

pub struct BlockFile {
    file: Mutex<File>,
    block_count: usize,
}

// std::file::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的，
// 在访问一个特定的块的时候，我们必须先 seek 到这个块的开头位置

impl BlockFile {
    /// 创建 (或截断) 一个 `block_count` 个块大小的磁盘镜像, 内容全零
    pub fn create(path: impl AsRef<Path>, block_count: usize) -> io::Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.set_len((block_count * BLOCK_SIZE) as u64)?;
        Ok(Self {
            file: Mutex::new(f),
            block_count,
        })
    }

    /// 打开一个已有的磁盘镜像
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = OpenOptions::new().read(true).write(true).open(path)?;
        let block_count = (f.metadata()?.len() / BLOCK_SIZE as u64) as usize;
        Ok(Self {
            file: Mutex::new(f),
            block_count,
        })
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "block file lock poisoned"))
    }
}

impl BlockDevice for BlockFile {
    /// 读取一个块从文件
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<()> {
        let mut file = self.lock().map_err(|e| FsError::device(block_id, e))?;
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .and_then(|_| file.read_exact(&mut buf[..BLOCK_SIZE]))
            .map_err(|e| FsError::device(block_id, e))
    }

    /// 写一个块到文件
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<()> {
        let mut file = self.lock().map_err(|e| FsError::device(block_id, e))?;
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .and_then(|_| file.write_all(&buf[..BLOCK_SIZE]))
            .map_err(|e| FsError::device(block_id, e))
    }

    fn flush(&self) -> Result<()> {
        let file = self.lock().map_err(|e| FsError::device(0, e))?;
        file.sync_data().map_err(|e| FsError::device(0, e))
    }

    fn block_count(&self) -> usize {
        self.block_count
    }
}

/// 内存中的稀疏磁盘, 没写过的块读出来全是零
pub struct MemDevice {
    blocks: Mutex<HashMap<usize, Box<Block>>>,
    block_count: usize,
    /// 剩余允许成功的写次数, None 表示不限制. 用来模拟掉电:
    /// 预算用完之后所有写入都会失败
    write_budget: Mutex<Option<usize>>,
}

impl MemDevice {
    pub fn new(block_count: usize) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            block_count,
            write_budget: Mutex::new(None),
        }
    }

    /// 再成功写 n 个块之后, 之后的写入全部失败
    #[cfg(test)]
    pub fn fail_writes_after(&self, n: usize) {
        *self.write_budget.lock().unwrap() = Some(n);
    }

    /// 取消写失败注入 ("重启")
    #[cfg(test)]
    pub fn heal(&self) {
        *self.write_budget.lock().unwrap() = None;
    }

    /// 所有非零块的拷贝, 用来比较两次的磁盘状态
    #[cfg(test)]
    pub fn snapshot(&self) -> std::collections::BTreeMap<usize, Vec<u8>> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, data)| data.iter().any(|b| *b != 0))
            .map(|(id, data)| (*id, data.to_vec()))
            .collect()
    }

    fn check(&self, block_id: usize) -> Result<()> {
        if block_id >= self.block_count {
            return Err(FsError::device(
                block_id,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("block {} beyond device end {}", block_id, self.block_count),
                ),
            ));
        }
        Ok(())
    }

    fn poisoned(block_id: usize) -> FsError {
        FsError::device(block_id, io::Error::new(io::ErrorKind::Other, "memory device lock poisoned"))
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<()> {
        self.check(block_id)?;
        let blocks = self.blocks.lock().map_err(|_| Self::poisoned(block_id))?;
        match blocks.get(&block_id) {
            Some(data) => buf[..BLOCK_SIZE].copy_from_slice(&data[..]),
            None => buf[..BLOCK_SIZE].fill(0),
        }
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<()> {
        self.check(block_id)?;
        {
            let mut budget = self.write_budget.lock().map_err(|_| Self::poisoned(block_id))?;
            match budget.as_mut() {
                Some(0) => {
                    return Err(FsError::device(
                        block_id,
                        io::Error::new(io::ErrorKind::Other, "simulated power loss"),
                    ))
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }
        let mut data = Box::new([0u8; BLOCK_SIZE]);
        data.copy_from_slice(&buf[..BLOCK_SIZE]);
        self.blocks
            .lock()
            .map_err(|_| Self::poisoned(block_id))?
            .insert(block_id, data);
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.block_count
    }
}
