//! 存储核心的错误类型
//!
//! 所有错误都以 [`Result`] 的形式返回给调用者, 核心内部不会自动重试.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// 底层块设备读写失败
    #[error("device I/O failed on block {block_id}: {source}")]
    Device {
        block_id: usize,
        #[source]
        source: std::io::Error,
    },

    /// 布局超出地址宽度或设备容量, 挂载时致命
    #[error("layout overflow: {0}")]
    LayoutOverflow(String),

    /// 事务写集合超出日志区域容量, 调用者需要把工作拆分到多个事务
    #[error("transaction needs {requested} log blocks but the log holds {capacity}")]
    TransactionCapacityExceeded { requested: usize, capacity: usize },

    /// 恢复时无法识别的日志头, 需要人工介入
    #[error("corrupt log header at block {block_id}: {detail}")]
    CorruptLogHeader { block_id: usize, detail: String },

    /// 日志写入的目标块不在 `[start, limit)` 内
    #[error("block {block_id} is outside the logged area [{start}, {limit})")]
    AddressOutOfRange {
        block_id: usize,
        start: usize,
        limit: usize,
    },
}

impl FsError {
    pub fn device(block_id: usize, source: std::io::Error) -> Self {
        Self::Device { block_id, source }
    }
}

pub type Result<T> = core::result::Result<T, FsError>;
