//! 续传记录文件操作
//!
//! ## 文件格式
//!
//! 续传记录为纯文本格式，首行为记录头，之后每行一个已完成分片：
//! ```text
//! map-resume v1,{file_size},{chunk_size}
//! {begin},{end}
//! ```
//!
//! - `begin` / `end`: 分片的闭区间字节范围
//!
//! 分片不要求与 `chunk_size` 对齐（手工构建的分片表也能原样恢复）。
//!
//! 写入时先写 `{resume}.tmp`，fsync 后再 rename 覆盖，
//! 读取时跳过任何无法解析、越界或与前面分片重叠的行，
//! 因此损坏的记录只会少报进度，永远不会多报。

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::downloader::chunk::ChunkRange;

/// 续传记录扩展名
pub const RESUME_EXTENSION: &str = "resume";

/// 下载中文件扩展名
pub const DOWNLOADING_EXTENSION: &str = "downloading";

/// 记录头标识
const HEADER_TAG: &str = "map-resume v1";

/// 续传记录错误
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("续传记录读写失败: {0}")]
    Io(#[from] io::Error),

    #[error("续传记录头无效: {0:?}")]
    BadHeader(String),

    #[error("续传记录不匹配: 记录为 ({recorded_size}, {recorded_chunk}), 请求为 ({file_size}, {chunk_size})")]
    Mismatch {
        recorded_size: u64,
        recorded_chunk: u64,
        file_size: u64,
        chunk_size: u64,
    },
}

// ============================================================================
// 辅助函数
// ============================================================================

fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

/// 续传记录路径：`{file_path}.resume`
pub fn resume_path(file_path: &Path) -> PathBuf {
    with_suffix(file_path, RESUME_EXTENSION)
}

/// 下载中文件路径：`{file_path}.downloading`
pub fn downloading_path(file_path: &Path) -> PathBuf {
    with_suffix(file_path, DOWNLOADING_EXTENSION)
}

/// 删除文件（不存在时返回 `Ok(false)`）
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("已删除文件: {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// ============================================================================
// ResumeRecord
// ============================================================================

/// 续传记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    /// 文件总大小
    pub file_size: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 已完成的分片（按起始偏移排序、去重）
    pub done: Vec<ChunkRange>,
}

impl ResumeRecord {
    pub fn new(file_size: u64, chunk_size: u64, done: impl IntoIterator<Item = ChunkRange>) -> Self {
        Self {
            file_size,
            chunk_size,
            done: without_overlaps(done.into_iter().collect()),
        }
    }

    /// 已完成的字节数
    pub fn bytes_done(&self) -> u64 {
        self.done.iter().map(|r| r.len()).sum()
    }

    /// 序列化为文本
    pub fn to_text(&self) -> String {
        let mut text = format!("{},{},{}\n", HEADER_TAG, self.file_size, self.chunk_size);
        for range in &self.done {
            text.push_str(&format!("{},{}\n", range.begin, range.end));
        }
        text
    }

    /// 从文本解析
    ///
    /// 记录头无效时返回错误；分片行无效时跳过并记录警告
    pub fn parse(text: &str) -> Result<Self, ResumeError> {
        let mut lines = text.lines();
        let header = lines.next().unwrap_or("").trim();
        let (file_size, chunk_size) =
            parse_header(header).ok_or_else(|| ResumeError::BadHeader(header.to_string()))?;

        let mut done = BTreeSet::new();
        for (line_num, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_range(line, file_size) {
                Some(range) => {
                    done.insert(range);
                }
                None => {
                    warn!("跳过无效的续传记录行 {}: {:?}", line_num + 2, line);
                }
            }
        }

        let before = done.len();
        let done = without_overlaps(done);
        if done.len() < before {
            warn!("跳过 {} 个与其他分片重叠的续传记录行", before - done.len());
        }

        Ok(Self {
            file_size,
            chunk_size,
            done,
        })
    }
}

/// 按起始偏移排序，丢弃与前一个保留分片重叠的范围
fn without_overlaps(ranges: BTreeSet<ChunkRange>) -> Vec<ChunkRange> {
    let mut kept: Vec<ChunkRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match kept.last() {
            Some(last) if range.begin <= last.end => {}
            _ => kept.push(range),
        }
    }
    kept
}

fn parse_header(header: &str) -> Option<(u64, u64)> {
    let rest = header.strip_prefix(HEADER_TAG)?.strip_prefix(',')?;
    let (size, chunk) = rest.split_once(',')?;
    let file_size = size.trim().parse::<u64>().ok()?;
    let chunk_size = chunk.trim().parse::<u64>().ok()?;
    if file_size == 0 || chunk_size == 0 {
        return None;
    }
    Some((file_size, chunk_size))
}

/// 解析一行分片范围，要求 `begin <= end < file_size`
fn parse_range(line: &str, file_size: u64) -> Option<ChunkRange> {
    let (begin, end) = line.split_once(',')?;
    let begin = begin.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;

    if begin > end || end >= file_size {
        return None;
    }
    Some(ChunkRange::new(begin, end))
}

// ============================================================================
// 读写
// ============================================================================

/// 原子写入续传记录
///
/// 写 `{path}.tmp` → fsync → rename
pub async fn save_record(path: &Path, record: &ResumeRecord) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp = with_suffix(path, "tmp");
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(record.to_text().as_bytes()).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await?;

    debug!(
        "已保存续传记录: {:?}, 完成分片数 {}",
        path,
        record.done.len()
    );
    Ok(())
}

/// 读取并校验续传记录
///
/// `(file_size, chunk_size)` 不一致时返回 `ResumeError::Mismatch`
pub async fn load_record(path: &Path, file_size: u64, chunk_size: u64) -> Result<ResumeRecord, ResumeError> {
    let text = tokio::fs::read_to_string(path).await?;
    let record = ResumeRecord::parse(&text)?;

    if record.file_size != file_size || record.chunk_size != chunk_size {
        return Err(ResumeError::Mismatch {
            recorded_size: record.file_size,
            recorded_chunk: record.chunk_size,
            file_size,
            chunk_size,
        });
    }

    Ok(record)
}
