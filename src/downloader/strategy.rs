//! 分片下载策略
//!
//! 负责分片表、镜像选择和续传记录的读写。
//! 只由请求的编排循环调用，不需要内部加锁。

use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::downloader::chunk::{calculate_chunks, rebuild_chunks, Chunk, ChunkRange, ChunkState};
use crate::persistence::resume::{self, ResumeError, ResumeRecord};

/// 默认最大并发分片数
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 4;

/// 默认镜像连续失败阈值
pub const DEFAULT_MIRROR_FAILURE_THRESHOLD: u32 = 3;

/// `next_chunk` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextChunk {
    /// 分配到一个分片
    Assigned { url: String, range: ChunkRange },
    /// 暂无可分配的分片，等待在途分片结束
    Wait,
    /// 所有分片已完成
    Succeeded,
    /// 镜像已耗尽且无在途分片
    Failed,
}

/// 策略参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyOptions {
    /// 最大并发分片数
    pub max_concurrent: usize,
    /// 当前镜像连续失败多少次后切换到下一个镜像
    pub mirror_failure_threshold: u32,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_CHUNKS,
            mirror_failure_threshold: DEFAULT_MIRROR_FAILURE_THRESHOLD,
        }
    }
}

/// 分片下载策略
///
/// 镜像切换是会话级的：当前镜像被放弃后，之后所有新分配的分片都使用下一个镜像
#[derive(Debug)]
pub struct ChunksDownloadStrategy {
    /// 镜像地址（按优先级排序）
    urls: Vec<String>,
    /// 分片表
    chunks: Vec<Chunk>,
    /// 分片大小
    chunk_size: u64,
    /// 当前镜像索引（等于 `urls.len()` 表示镜像已耗尽）
    current_mirror: usize,
    /// 当前镜像的连续失败次数
    consecutive_failures: u32,
    options: StrategyOptions,
}

impl ChunksDownloadStrategy {
    pub fn new(urls: Vec<String>, options: StrategyOptions) -> Self {
        Self {
            urls,
            chunks: Vec::new(),
            chunk_size: 0,
            current_mirror: 0,
            consecutive_failures: 0,
            options: StrategyOptions {
                max_concurrent: options.max_concurrent.max(1),
                mirror_failure_threshold: options.mirror_failure_threshold.max(1),
            },
        }
    }

    /// 从零切分分片表
    pub fn init_chunks(&mut self, file_size: u64, chunk_size: u64) {
        self.chunks = calculate_chunks(file_size, chunk_size);
        self.chunk_size = chunk_size;
    }

    /// 手动追加一个分片
    pub fn add_chunk(&mut self, range: ChunkRange, state: ChunkState) {
        let index = self.chunks.len();
        self.chunk_size = self.chunk_size.max(range.len());
        self.chunks.push(Chunk {
            index,
            range,
            state,
        });
    }

    /// 加载续传记录，无效或不存在时从零切分
    ///
    /// 返回已下载的字节数
    pub async fn load_or_init_chunks(&mut self, resume_path: &Path, file_size: u64, chunk_size: u64) -> u64 {
        self.init_chunks(file_size, chunk_size);

        let record = match resume::load_record(resume_path, file_size, chunk_size).await {
            Ok(record) => record,
            Err(ResumeError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("丢弃续传记录 {:?}: {}", resume_path, e);
                return 0;
            }
        };

        self.chunks = rebuild_chunks(file_size, chunk_size, &record.done);
        let restored = record.bytes_done();

        info!(
            "从续传记录恢复: {:?}, 已完成 {}/{} 个分片, {} bytes",
            resume_path,
            record.done.len(),
            self.chunks.len(),
            restored
        );
        restored
    }

    /// 保存续传记录（只记录已完成的分片）
    pub async fn save_chunks(&self, file_size: u64, resume_path: &Path) -> io::Result<()> {
        let record = ResumeRecord::new(
            file_size,
            self.chunk_size,
            self.chunks
                .iter()
                .filter(|c| c.state == ChunkState::Done)
                .map(|c| c.range),
        );
        resume::save_record(resume_path, &record).await
    }

    /// 获取下一个要下载的分片
    pub fn next_chunk(&mut self) -> NextChunk {
        if self.chunks.iter().all(|c| c.state == ChunkState::Done) {
            return NextChunk::Succeeded;
        }

        let in_flight = self.in_flight_count();
        if self.current_mirror >= self.urls.len() {
            return if in_flight > 0 {
                NextChunk::Wait
            } else {
                NextChunk::Failed
            };
        }

        if in_flight >= self.options.max_concurrent {
            return NextChunk::Wait;
        }

        let mirror = self.current_mirror;
        match self.chunks.iter_mut().find(|c| c.state.is_assignable()) {
            Some(chunk) => {
                chunk.state = ChunkState::InFlight { mirror };
                debug!("分配分片 #{} ({}) → 镜像 #{}", chunk.index, chunk.range, mirror);
                NextChunk::Assigned {
                    url: self.urls[mirror].clone(),
                    range: chunk.range,
                }
            }
            None => NextChunk::Wait,
        }
    }

    /// 报告分片结束
    ///
    /// 返回是否找到对应的在途分片
    pub fn chunk_finished(&mut self, success: bool, range: ChunkRange) -> bool {
        let Some(chunk) = self.chunks.iter_mut().find(|c| c.range == range) else {
            warn!("未知分片结束: {}", range);
            return false;
        };

        let mirror = match chunk.state {
            ChunkState::InFlight { mirror } => mirror,
            other => {
                warn!("分片 #{} 不在下载中 ({:?})，忽略结束通知", chunk.index, other);
                return false;
            }
        };

        if success {
            chunk.state = ChunkState::Done;
            if mirror == self.current_mirror {
                self.consecutive_failures = 0;
            }
            return true;
        }

        chunk.state = ChunkState::Failed;
        let index = chunk.index;

        // 已被放弃的镜像上的失败不再推动指针
        if mirror != self.current_mirror {
            return true;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.options.mirror_failure_threshold {
            warn!(
                "🚫 镜像 #{} 连续失败 {} 次（最近失败分片 #{}），切换到下一个镜像",
                mirror, self.consecutive_failures, index
            );
            self.current_mirror += 1;
            self.consecutive_failures = 0;
            if self.current_mirror >= self.urls.len() {
                warn!("所有镜像均已放弃");
            }
        }
        true
    }

    /// 在途分片数
    pub fn in_flight_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| matches!(c.state, ChunkState::InFlight { .. }))
            .count()
    }

    /// 已完成分片数
    pub fn done_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.state == ChunkState::Done).count()
    }

    /// 已完成的字节数
    pub fn bytes_done(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Done)
            .map(|c| c.size())
            .sum()
    }

    /// 当前镜像（镜像耗尽时为 None）
    pub fn current_mirror_url(&self) -> Option<&str> {
        self.urls.get(self.current_mirror).map(String::as_str)
    }

    /// 分片表
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn assigned(result: NextChunk) -> (String, ChunkRange) {
        match result {
            NextChunk::Assigned { url, range } => (url, range),
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_flow() {
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1", "http://s2"]), StrategyOptions::default());
        strategy.init_chunks(800, 250);
        assert_eq!(strategy.chunks().len(), 4);

        // 所有分片都从第一个镜像开始
        let mut ranges = Vec::new();
        for _ in 0..4 {
            let (url, range) = assigned(strategy.next_chunk());
            assert_eq!(url, "http://s1");
            ranges.push(range);
        }
        assert_eq!(ranges[0], ChunkRange::new(0, 249));
        assert_eq!(ranges[3], ChunkRange::new(750, 799));

        // 并发已满 / 没有可分配分片
        assert_eq!(strategy.next_chunk(), NextChunk::Wait);

        for range in &ranges {
            assert!(strategy.chunk_finished(true, *range));
        }
        assert_eq!(strategy.next_chunk(), NextChunk::Succeeded);
        assert_eq!(strategy.bytes_done(), 800);
    }

    #[test]
    fn test_concurrency_limit() {
        let options = StrategyOptions {
            max_concurrent: 2,
            mirror_failure_threshold: 3,
        };
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), options);
        strategy.init_chunks(800, 250);

        let (_, r1) = assigned(strategy.next_chunk());
        assigned(strategy.next_chunk());
        assert_eq!(strategy.next_chunk(), NextChunk::Wait);

        strategy.chunk_finished(true, r1);
        let (_, r3) = assigned(strategy.next_chunk());
        assert_eq!(r3, ChunkRange::new(500, 749));
    }

    #[test]
    fn test_mirror_failover_is_session_wide() {
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://a", "http://b"]), StrategyOptions::default());
        strategy.init_chunks(3_000_000, 1_000_000);
        assert_eq!(strategy.chunks().len(), 3);

        let (_, r0) = assigned(strategy.next_chunk());
        let (_, r1) = assigned(strategy.next_chunk());
        let (url2, r2) = assigned(strategy.next_chunk());
        assert_eq!(url2, "http://a");

        strategy.chunk_finished(true, r0);

        // 第二个分片在镜像 A 上反复失败
        strategy.chunk_finished(false, r1);
        for _ in 0..DEFAULT_MIRROR_FAILURE_THRESHOLD - 1 {
            let (url, range) = assigned(strategy.next_chunk());
            assert_eq!(url, "http://a");
            assert_eq!(range, r1);
            strategy.chunk_finished(false, r1);
        }
        assert_eq!(strategy.current_mirror_url(), Some("http://b"));

        let (url, range) = assigned(strategy.next_chunk());
        assert_eq!((url.as_str(), range), ("http://b", r1));

        // 第三个分片在已放弃的镜像 A 上失败，不会再移动指针，重新分配到 B
        strategy.chunk_finished(false, r2);
        assert_eq!(strategy.current_mirror_url(), Some("http://b"));
        let (url, range) = assigned(strategy.next_chunk());
        assert_eq!((url.as_str(), range), ("http://b", r2));

        strategy.chunk_finished(true, r1);
        strategy.chunk_finished(true, r2);
        assert_eq!(strategy.next_chunk(), NextChunk::Succeeded);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let options = StrategyOptions {
            max_concurrent: 1,
            mirror_failure_threshold: 2,
        };
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://a", "http://b"]), options);
        strategy.init_chunks(800, 250);

        let (_, r) = assigned(strategy.next_chunk());
        strategy.chunk_finished(false, r);
        let (_, r) = assigned(strategy.next_chunk());
        strategy.chunk_finished(true, r);
        let (url, r) = assigned(strategy.next_chunk());
        assert_eq!(url, "http://a");
        strategy.chunk_finished(false, r);
        let (url, _) = assigned(strategy.next_chunk());
        assert_eq!(url, "http://a");
    }

    #[test]
    fn test_all_mirrors_exhausted() {
        let options = StrategyOptions {
            max_concurrent: 2,
            mirror_failure_threshold: 1,
        };
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1", "http://s2"]), options);
        strategy.init_chunks(800, 250);

        let (_, r1) = assigned(strategy.next_chunk());
        let (_, r2) = assigned(strategy.next_chunk());
        strategy.chunk_finished(false, r1);

        let (url, r3) = assigned(strategy.next_chunk());
        assert_eq!(url, "http://s2");
        strategy.chunk_finished(false, r3);

        // 镜像耗尽但 r2 仍在途
        assert_eq!(strategy.current_mirror_url(), None);
        assert_eq!(strategy.next_chunk(), NextChunk::Wait);

        strategy.chunk_finished(true, r2);
        assert_eq!(strategy.next_chunk(), NextChunk::Failed);
    }

    #[test]
    fn test_unknown_chunk_finished() {
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        strategy.init_chunks(800, 250);
        assert!(!strategy.chunk_finished(true, ChunkRange::new(1, 2)));
        // 尚未分配的分片
        assert!(!strategy.chunk_finished(true, ChunkRange::new(0, 249)));
    }

    #[test]
    fn test_add_chunk() {
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        strategy.add_chunk(ChunkRange::new(0, 249), ChunkState::Done);
        strategy.add_chunk(ChunkRange::new(250, 499), ChunkState::Pending);

        assert_eq!(strategy.chunk_size(), 250);
        assert_eq!(strategy.bytes_done(), 250);
        let (_, range) = assigned(strategy.next_chunk());
        assert_eq!(range, ChunkRange::new(250, 499));
    }

    #[tokio::test]
    async fn test_save_and_load_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let resume_path = temp_dir.path().join("file.resume");

        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        strategy.init_chunks(800, 250);
        let (_, r1) = assigned(strategy.next_chunk());
        let (_, r2) = assigned(strategy.next_chunk());
        let (_, r3) = assigned(strategy.next_chunk());
        strategy.chunk_finished(true, r1);
        strategy.chunk_finished(true, r3);
        strategy.chunk_finished(false, r2);
        strategy.save_chunks(800, &resume_path).await.unwrap();

        let mut restored = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        let bytes = restored.load_or_init_chunks(&resume_path, 800, 250).await;
        assert_eq!(bytes, 500);
        assert_eq!(restored.done_count(), 2);

        // 只会重新分配未完成的分片
        let (_, a) = assigned(restored.next_chunk());
        let (_, b) = assigned(restored.next_chunk());
        assert_eq!(a, r2);
        assert_eq!(b, ChunkRange::new(750, 799));
        assert_eq!(restored.next_chunk(), NextChunk::Wait);
    }

    #[tokio::test]
    async fn test_hand_built_table_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let resume_path = temp_dir.path().join("file.resume");

        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        strategy.add_chunk(ChunkRange::new(0, 99), ChunkState::Done);
        strategy.add_chunk(ChunkRange::new(100, 399), ChunkState::Pending);
        strategy.add_chunk(ChunkRange::new(400, 499), ChunkState::Done);
        strategy.add_chunk(ChunkRange::new(500, 799), ChunkState::Pending);
        assert_eq!(strategy.chunk_size(), 300);
        strategy.save_chunks(800, &resume_path).await.unwrap();

        let mut restored = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        assert_eq!(restored.load_or_init_chunks(&resume_path, 800, 300).await, 200);

        let table: Vec<(ChunkRange, ChunkState)> = restored.chunks().iter().map(|c| (c.range, c.state)).collect();
        let original: Vec<(ChunkRange, ChunkState)> = strategy.chunks().iter().map(|c| (c.range, c.state)).collect();
        assert_eq!(table, original);

        let (_, a) = assigned(restored.next_chunk());
        let (_, b) = assigned(restored.next_chunk());
        assert_eq!(a, ChunkRange::new(100, 399));
        assert_eq!(b, ChunkRange::new(500, 799));
    }

    #[tokio::test]
    async fn test_resume_rejected_for_other_size() {
        let temp_dir = TempDir::new().unwrap();
        let resume_path = temp_dir.path().join("file.resume");

        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        strategy.add_chunk(ChunkRange::new(0, 249), ChunkState::Done);
        strategy.add_chunk(ChunkRange::new(250, 499), ChunkState::Done);
        strategy.add_chunk(ChunkRange::new(500, 749), ChunkState::Pending);
        strategy.add_chunk(ChunkRange::new(750, 799), ChunkState::Pending);
        strategy.save_chunks(800, &resume_path).await.unwrap();

        let mut other = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        assert_eq!(other.load_or_init_chunks(&resume_path, 1000, 250).await, 0);
        assert_eq!(other.done_count(), 0);
        assert_eq!(other.chunks().len(), 4);

        let mut same = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        assert_eq!(same.load_or_init_chunks(&resume_path, 800, 250).await, 500);
    }

    #[tokio::test]
    async fn test_corrupt_record_under_claims() {
        let temp_dir = TempDir::new().unwrap();
        let resume_path = temp_dir.path().join("file.resume");
        std::fs::write(&resume_path, "map-resume v1,800,250\n0,249\n250,4").unwrap();

        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        assert_eq!(strategy.load_or_init_chunks(&resume_path, 800, 250).await, 250);

        std::fs::write(&resume_path, "garbage").unwrap();
        let mut strategy = ChunksDownloadStrategy::new(urls(&["http://s1"]), StrategyOptions::default());
        assert_eq!(strategy.load_or_init_chunks(&resume_path, 800, 250).await, 0);
    }
}
