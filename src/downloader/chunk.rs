use serde::{Deserialize, Serialize};

/// 默认分片大小: 512KB
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

/// 分片字节范围（闭区间 `[begin, end]`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRange {
    /// 起始偏移
    pub begin: u64,
    /// 结束偏移（包含）
    pub end: u64,
}

impl ChunkRange {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end, "invalid chunk range {}-{}", begin, end);
        Self { begin, end }
    }

    /// 分片大小
    pub fn len(&self) -> u64 {
        self.end - self.begin + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.begin, self.end)
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// 等待下载
    Pending,
    /// 下载中（记录所用镜像的索引）
    InFlight { mirror: usize },
    /// 已完成
    Done,
    /// 上次下载失败，等待重新分配
    Failed,
}

impl ChunkState {
    /// 是否可以被分配给工作线程
    pub fn is_assignable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// 分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: ChunkRange,
    /// 分片状态
    pub state: ChunkState,
}

impl Chunk {
    pub fn new(index: usize, range: ChunkRange) -> Self {
        Self {
            index,
            range,
            state: ChunkState::Pending,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.len()
    }
}

/// 按分片大小切分 `[0, total_size)`
///
/// 切分结果首尾相接、互不重叠，最后一个分片可能较小
pub fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if chunk_size == 0 {
        return chunks;
    }

    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + chunk_size, total_size);
        chunks.push(Chunk::new(index, ChunkRange::new(offset, end - 1)));
        offset = end;
        index += 1;
    }

    chunks
}

/// 按已完成的范围重建分片表
///
/// `done` 须已排序、互不重叠且位于文件范围内。已完成的范围各自成为一个分片，
/// 其间的空隙按 `chunk_size` 切分
pub fn rebuild_chunks(total_size: u64, chunk_size: u64, done: &[ChunkRange]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if chunk_size == 0 {
        return chunks;
    }

    let mut offset = 0u64;
    for range in done.iter().chain(std::iter::once(&ChunkRange::new(total_size, total_size))) {
        while offset < range.begin {
            let end = std::cmp::min(offset + chunk_size, range.begin);
            chunks.push(Chunk::new(chunks.len(), ChunkRange::new(offset, end - 1)));
            offset = end;
        }
        if range.begin >= total_size {
            break;
        }
        let mut chunk = Chunk::new(chunks.len(), *range);
        chunk.state = ChunkState::Done;
        chunks.push(chunk);
        offset = range.end + 1;
    }

    chunks
}
