//! 文件请求：分片、多镜像、可续传的下载
//!
//! 所有工作线程的 `Write` / `Finish` 事件都通过同一个 channel 汇入编排循环，
//! 文件句柄和分片策略只被这个循环访问。
//!
//! 磁盘上的三个文件：
//! - `{path}`：最终文件
//! - `{path}.downloading`：预分配到完整大小的下载中文件
//! - `{path}.resume`：续传记录

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DownloadConfig;
use crate::downloader::chunk::{ChunkRange, DEFAULT_CHUNK_SIZE};
use crate::downloader::request::{Callbacks, RequestError, RequestHandle, RequestOutcome, SnapshotPublisher};
use crate::downloader::status::{
    describe_code, DownloadStatus, ErrorCode, Progress, RequestStatus, StatusCode, HTTP_NOT_FOUND, HTTP_OK,
};
use crate::downloader::strategy::{ChunksDownloadStrategy, NextChunk, StrategyOptions};
use crate::downloader::worker::{HttpWorkerFactory, WorkerEvent, WorkerId, WorkerRequest};
use crate::persistence::resume::{downloading_path, remove_if_exists, resume_path};

/// 文件请求参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRequestOptions {
    /// 分片大小
    pub chunk_size: u64,
    /// 取消时是否删除 `.downloading` 和 `.resume`
    pub clean_on_cancel: bool,
    /// 每成功多少个分片保存一次续传记录
    pub resume_save_interval: u64,
    /// 分片策略参数
    pub strategy: StrategyOptions,
}

impl Default for FileRequestOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            clean_on_cancel: true,
            resume_save_interval: 10,
            strategy: StrategyOptions::default(),
        }
    }
}

impl FileRequestOptions {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size(),
            clean_on_cancel: config.clean_on_cancel,
            resume_save_interval: config.resume_save_interval,
            strategy: StrategyOptions {
                max_concurrent: config.max_concurrent_chunks,
                mirror_failure_threshold: config.mirror_failure_threshold,
            },
        }
    }
}

/// 按目标路径串行化文件请求
///
/// 同一路径上的新请求要等旧请求的收尾（清理或保存进度）结束后才能开始
#[derive(Debug, Clone, Default)]
pub(crate) struct PathLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PathLocks {
    /// 获取路径锁，编排循环退出时释放
    pub(crate) async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // 没有持有者也没有等待者的锁直接回收
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(path.to_path_buf()).or_default().clone()
        };
        if let Ok(guard) = lock.clone().try_lock_owned() {
            return guard;
        }
        debug!("等待同一路径上的上一个请求收尾: {:?}", path);
        lock.lock_owned().await
    }
}

/// 在途工作线程
#[derive(Debug)]
struct ActiveWorker {
    range: ChunkRange,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    /// 写入失败后，该分片无论返回什么状态码都按失败处理
    write_failed: bool,
}

/// 调度结果
enum Step {
    Continue,
    Finished(DownloadStatus),
}

pub struct FileRequest {
    workers: Arc<dyn HttpWorkerFactory>,
    strategy: ChunksDownloadStrategy,
    options: FileRequestOptions,
    file_size: u64,
    file_path: PathBuf,
    downloading_path: PathBuf,
    resume_path: PathBuf,
    /// 下载中文件句柄，终态或取消时释放
    file: Option<File>,
    active: HashMap<WorkerId, ActiveWorker>,
    next_worker_id: WorkerId,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    /// 本次会话成功的分片数
    succeeded_chunks: u64,
    last_code: StatusCode,
    callbacks: Callbacks,
    publisher: SnapshotPublisher,
    cancel: CancellationToken,
    workers_cancel: CancellationToken,
    /// 目标路径的独占权
    _path_guard: OwnedMutexGuard<()>,
}

impl FileRequest {
    /// 准备下载文件并启动编排循环
    pub(crate) async fn start(
        workers: Arc<dyn HttpWorkerFactory>,
        paths: &PathLocks,
        urls: Vec<String>,
        file_path: PathBuf,
        file_size: u64,
        callbacks: Callbacks,
        options: FileRequestOptions,
    ) -> Result<RequestHandle, RequestError> {
        if urls.is_empty() {
            return Err(RequestError::NoMirrors);
        }
        if options.chunk_size == 0 {
            return Err(RequestError::ZeroChunkSize);
        }

        let path_guard = paths.acquire(&file_path).await;
        let downloading = downloading_path(&file_path);
        let resume = resume_path(&file_path);
        let mut strategy = ChunksDownloadStrategy::new(urls, options.strategy);

        let (file, restored) = Self::prepare_file(&downloading, &resume, file_size, options.chunk_size, &mut strategy)
            .await
            .map_err(|source| RequestError::Prepare {
                path: downloading.clone(),
                source,
            })?;

        let (publisher, snapshot) = SnapshotPublisher::new(Progress::new(restored, file_size));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!(
            "创建文件请求: {:?}, 大小 {} bytes, 分片 {} 个, 已完成 {} bytes",
            file_path,
            file_size,
            strategy.chunks().len(),
            restored
        );

        let request = Self {
            workers,
            strategy,
            options,
            file_size,
            file_path,
            downloading_path: downloading,
            resume_path: resume,
            file: Some(file),
            active: HashMap::new(),
            next_worker_id: 1,
            events_tx,
            succeeded_chunks: 0,
            last_code: HTTP_OK,
            callbacks,
            publisher,
            workers_cancel: cancel.child_token(),
            cancel: cancel.clone(),
            _path_guard: path_guard,
        };

        let task = tokio::spawn(request.run(events_rx));
        Ok(RequestHandle::new(snapshot, cancel, task))
    }

    /// 打开或新建 `.downloading` 文件
    ///
    /// 存在续传记录且磁盘文件不大于目标大小时复用已有进度，否则截断重来
    async fn prepare_file(
        downloading: &Path,
        resume: &Path,
        file_size: u64,
        chunk_size: u64,
        strategy: &mut ChunksDownloadStrategy,
    ) -> std::io::Result<(File, u64)> {
        if let Some(parent) = downloading.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let reusable = match (
            tokio::fs::metadata(resume).await,
            tokio::fs::metadata(downloading).await,
        ) {
            (Ok(_), Ok(meta)) => meta.len() <= file_size,
            _ => false,
        };

        if reusable {
            let file = OpenOptions::new().write(true).open(downloading).await?;
            file.set_len(file_size).await?;
            let restored = strategy.load_or_init_chunks(resume, file_size, chunk_size).await;
            return Ok((file, restored));
        }

        if remove_if_exists(resume).await? {
            warn!("续传记录与下载文件不一致，重新下载: {:?}", downloading);
        }
        let file = File::create(downloading).await?;
        file.set_len(file_size).await?;
        strategy.init_chunks(file_size, chunk_size);
        Ok((file, 0))
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        self.publisher.transition(RequestStatus::Running);

        let restored = self.publisher.current().progress;
        if restored.downloaded > 0 {
            self.callbacks.progress(restored);
        }

        let status = loop {
            if let Step::Finished(status) = self.schedule() {
                break status;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.teardown(&mut events).await;
                    return;
                }
                event = events.recv() => match event {
                    Some(WorkerEvent::Write { worker, offset, data }) => {
                        self.on_write(worker, offset, &data).await;
                    }
                    Some(WorkerEvent::Finish { worker, code, .. }) => {
                        self.on_finish(worker, code).await;
                    }
                    // 本结构体持有发送端，channel 不会关闭
                    None => break DownloadStatus::Failed,
                }
            }
        };

        let status = match status {
            DownloadStatus::Completed => self.complete().await,
            other => self.fail(other).await,
        };
        self.report(status);
    }

    /// 向策略申请分片，填满空闲的并发槽位
    fn schedule(&mut self) -> Step {
        loop {
            match self.strategy.next_chunk() {
                NextChunk::Assigned { url, range } => self.spawn_worker(url, range),
                NextChunk::Wait => return Step::Continue,
                NextChunk::Succeeded => return Step::Finished(DownloadStatus::Completed),
                NextChunk::Failed => {
                    let status = if self.last_code == HTTP_NOT_FOUND {
                        DownloadStatus::FileNotFound
                    } else {
                        DownloadStatus::Failed
                    };
                    return Step::Finished(status);
                }
            }
        }
    }

    fn spawn_worker(&mut self, url: String, range: ChunkRange) {
        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let cancel = self.workers_cancel.child_token();
        let request = WorkerRequest::ranged(id, url, range.begin, range.end, self.file_size);
        debug!("启动工作线程 #{}: {} ({})", id, request.url, range);

        let handle = self.workers.spawn(request, self.events_tx.clone(), cancel.clone());
        self.active.insert(
            id,
            ActiveWorker {
                range,
                handle,
                cancel,
                write_failed: false,
            },
        );
    }

    async fn on_write(&mut self, worker: WorkerId, offset: u64, data: &[u8]) {
        let Some(active) = self.active.get_mut(&worker) else {
            return;
        };
        if active.write_failed {
            return;
        }

        let result = match self.file.as_mut() {
            Some(file) => write_at(file, offset, data).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "文件已关闭")),
        };

        if let Err(e) = result {
            error!(
                "写入失败 {:?} @ {}: {}，放弃分片 {}",
                self.downloading_path, offset, e, active.range
            );
            active.write_failed = true;
            active.cancel.cancel();
        }
    }

    async fn on_finish(&mut self, worker: WorkerId, code: StatusCode) {
        let Some(active) = self.active.remove(&worker) else {
            return;
        };

        let code = if active.write_failed {
            ErrorCode::WriteException.code()
        } else {
            code
        };
        self.last_code = code;

        let success = code == HTTP_OK;
        self.strategy.chunk_finished(success, active.range);

        if !success {
            warn!(
                "分片 {} 下载失败: {}",
                active.range,
                describe_code(code)
            );
            return;
        }

        debug!("分片 {} 下载完成", active.range);
        let progress = self.publisher.current().progress.advanced(active.range.len());
        self.publisher.set_progress(progress);
        self.callbacks.progress(progress);

        self.succeeded_chunks += 1;
        let interval = self.options.resume_save_interval.max(1);
        if self.succeeded_chunks % interval == 0 {
            if let Err(e) = self.persist().await {
                error!("保存续传记录失败 {:?}: {}", self.resume_path, e);
            }
        }
    }

    /// 刷盘并保存续传记录
    ///
    /// 先落盘文件内容再写记录，记录中的分片一定已经写入磁盘
    async fn persist(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        self.publisher.record_resume_save();
        self.strategy.save_chunks(self.file_size, &self.resume_path).await
    }

    /// 成功收尾：删除续传记录，rename 到最终路径
    ///
    /// 任何一步失败都按失败收尾处理，已下载的分片留给下次续传
    async fn complete(&mut self) -> DownloadStatus {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = sync_file(file).await {
                error!("刷新下载文件失败 {:?}: {}", self.downloading_path, e);
                return self.fail(DownloadStatus::Failed).await;
            }
        }
        self.file = None;

        match finalize(&self.downloading_path, &self.resume_path, &self.file_path).await {
            Ok(()) => {
                info!("✅ 下载完成: {:?}", self.file_path);
                DownloadStatus::Completed
            }
            Err(e) => {
                error!(
                    "重命名 {:?} → {:?} 失败: {}",
                    self.downloading_path, self.file_path, e
                );
                self.fail(DownloadStatus::Failed).await
            }
        }
    }

    /// 失败收尾：保留已完成的进度供下次续传
    ///
    /// 一个分片都没有完成且允许清理时，直接删除两个临时文件
    async fn fail(&mut self, status: DownloadStatus) -> DownloadStatus {
        if self.strategy.done_count() == 0 && self.options.clean_on_cancel {
            self.file = None;
            remove_artifacts(&self.downloading_path, &self.resume_path).await;
        } else {
            if let Err(e) = self.persist().await {
                error!("保存续传记录失败 {:?}: {}", self.resume_path, e);
            }
            self.file = None;
        }

        error!(
            "下载失败: {:?}, 状态 {}, 最后状态码 {}",
            self.file_path,
            status,
            describe_code(self.last_code)
        );
        status
    }

    /// 取消：停止所有工作线程，丢弃剩余事件，按配置清理或保存进度
    async fn teardown(&mut self, events: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
        self.workers_cancel.cancel();
        for (_, active) in self.active.drain() {
            active.handle.abort();
            let _ = active.handle.await;
        }
        while events.try_recv().is_ok() {}

        if self.options.clean_on_cancel {
            self.file = None;
            remove_artifacts(&self.downloading_path, &self.resume_path).await;
        } else {
            if let Err(e) = self.persist().await {
                error!("保存续传记录失败 {:?}: {}", self.resume_path, e);
            }
            self.file = None;
        }

        self.publisher.transition(RequestStatus::Cancelled);
        info!("下载已取消: {:?}", self.file_path);
    }

    /// 发布终态并触发回调（文件句柄此时已释放）
    fn report(&mut self, status: DownloadStatus) {
        let mut progress = self.publisher.current().progress;
        if status == DownloadStatus::Completed {
            progress = Progress::new(self.file_size, self.file_size);
            self.publisher.set_progress(progress);
        }
        self.publisher.transition(RequestStatus::from_terminal(status));

        let outcome = RequestOutcome {
            status,
            progress,
            last_code: self.last_code,
            data: Vec::new(),
            file_path: Some(self.file_path.clone()),
        };
        self.callbacks.finish(outcome);
    }
}

async fn write_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await
}

async fn sync_file(file: &mut File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

/// 删除续传记录和旧的最终文件，再把下载中文件改名过去
async fn finalize(downloading: &Path, resume: &Path, file_path: &Path) -> std::io::Result<()> {
    remove_if_exists(resume).await?;
    remove_if_exists(file_path).await?;
    tokio::fs::rename(downloading, file_path).await
}

async fn remove_artifacts(downloading: &Path, resume: &Path) {
    for path in [downloading, resume] {
        if let Err(e) = remove_if_exists(path).await {
            warn!("删除临时文件失败 {:?}: {}", path, e);
        }
    }
}
