//! 请求公共部分：回调、快照、句柄和请求工厂

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DownloadConfig;
use crate::downloader::file_request::{FileRequest, FileRequestOptions, PathLocks};
use crate::downloader::memory_request::MemoryRequest;
use crate::downloader::status::{DownloadStatus, Progress, RequestStatus, StatusCode};
use crate::downloader::worker::{HttpWorkerFactory, ReqwestWorkerFactory};

/// 创建请求时的错误
///
/// 只覆盖调用方的编程错误和准备阶段的本地 I/O 错误，
/// 下载过程中的失败一律通过终态回调报告
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("镜像列表为空")]
    NoMirrors,

    #[error("分片大小不能为 0")]
    ZeroChunkSize,

    #[error("准备下载文件失败 {path:?}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("创建 HTTP 客户端失败: {0}")]
    Client(#[from] reqwest::Error),
}

/// 请求终态结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// 终态
    pub status: DownloadStatus,
    /// 最终进度
    pub progress: Progress,
    /// 最后一个工作线程的状态码
    pub last_code: StatusCode,
    /// 响应内容（仅内存请求）
    pub data: Vec<u8>,
    /// 最终文件路径（仅文件请求）
    pub file_path: Option<PathBuf>,
}

/// 终态回调（恰好调用一次）
pub type FinishCallback = Box<dyn FnOnce(RequestOutcome) + Send>;

/// 进度回调（只会在终态回调之前调用）
pub type ProgressCallback = Box<dyn FnMut(Progress) + Send>;

/// 请求回调
#[derive(Default)]
pub struct Callbacks {
    pub(crate) on_finish: Option<FinishCallback>,
    pub(crate) on_progress: Option<ProgressCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_finish(mut self, f: impl FnOnce(RequestOutcome) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(Progress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub(crate) fn progress(&mut self, progress: Progress) {
        if let Some(f) = self.on_progress.as_mut() {
            f(progress);
        }
    }

    /// 触发终态回调，之后进度回调也会被丢弃
    pub(crate) fn finish(&mut self, outcome: RequestOutcome) {
        self.on_progress = None;
        if let Some(f) = self.on_finish.take() {
            f(outcome);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_finish", &self.on_finish.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// 请求状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSnapshot {
    /// 内部状态
    pub status: RequestStatus,
    /// 进度
    pub progress: Progress,
    /// 续传记录保存次数
    pub resume_saves: u64,
}

impl RequestSnapshot {
    pub(crate) fn new(progress: Progress) -> Self {
        Self {
            status: RequestStatus::Pending,
            progress,
            resume_saves: 0,
        }
    }
}

/// 编排循环持有的状态发布端
#[derive(Debug)]
pub(crate) struct SnapshotPublisher {
    tx: watch::Sender<RequestSnapshot>,
    current: RequestSnapshot,
}

impl SnapshotPublisher {
    pub(crate) fn new(progress: Progress) -> (Self, watch::Receiver<RequestSnapshot>) {
        let current = RequestSnapshot::new(progress);
        let (tx, rx) = watch::channel(current);
        (Self { tx, current }, rx)
    }

    pub(crate) fn current(&self) -> RequestSnapshot {
        self.current
    }

    /// 状态转换，非法转换会被忽略
    pub(crate) fn transition(&mut self, next: RequestStatus) -> bool {
        if !self.current.status.can_transition_to(next) {
            warn!("忽略非法状态转换: {:?} → {:?}", self.current.status, next);
            return false;
        }
        debug!("请求状态: {:?} → {:?}", self.current.status, next);
        self.current.status = next;
        self.tx.send_replace(self.current);
        true
    }

    pub(crate) fn set_progress(&mut self, progress: Progress) {
        // 进度单调不减
        if progress.downloaded < self.current.progress.downloaded {
            return;
        }
        self.current.progress = progress;
        self.tx.send_replace(self.current);
    }

    pub(crate) fn record_resume_save(&mut self) {
        self.current.resume_saves += 1;
        self.tx.send_replace(self.current);
    }
}

/// 请求句柄（调用方独占）
///
/// 在终态之前丢弃句柄即取消请求。收尾在后台进行，同一 `DownloadContext`
/// 上针对同一路径的新文件请求会等它结束后再开始
#[derive(Debug)]
pub struct RequestHandle {
    snapshot: watch::Receiver<RequestSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RequestHandle {
    pub(crate) fn new(
        snapshot: watch::Receiver<RequestSnapshot>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            snapshot,
            cancel,
            task: Some(task),
        }
    }

    /// 对外状态
    pub fn status(&self) -> DownloadStatus {
        self.snapshot.borrow().status.public()
    }

    /// 当前快照
    pub fn snapshot(&self) -> RequestSnapshot {
        *self.snapshot.borrow()
    }

    /// 当前进度
    pub fn progress(&self) -> Progress {
        self.snapshot.borrow().progress
    }

    /// 订阅快照变化
    pub fn subscribe(&self) -> watch::Receiver<RequestSnapshot> {
        self.snapshot.clone()
    }

    /// 等待请求进入终态
    pub async fn wait(&mut self) -> RequestSnapshot {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("请求编排任务异常退出: {}", e);
            }
        }
        *self.snapshot.borrow()
    }

    /// 取消请求，并等待工作线程与文件清理全部结束
    pub async fn cancel(mut self) -> RequestSnapshot {
        self.cancel.cancel();
        self.wait().await
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.snapshot.borrow().status.is_terminal() {
            self.cancel.cancel();
        }
    }
}

/// 请求工厂
///
/// 所有请求共享同一个工作线程工厂（以及其中的 HTTP 连接池）
#[derive(Debug, Clone)]
pub struct DownloadContext {
    workers: Arc<dyn HttpWorkerFactory>,
    config: DownloadConfig,
    /// 文件请求的路径锁，克隆出的上下文共享
    paths: PathLocks,
}

impl DownloadContext {
    /// 使用 reqwest 工作线程
    pub fn new(config: DownloadConfig) -> Result<Self, RequestError> {
        let workers = ReqwestWorkerFactory::new(&config)?;
        Ok(Self::with_workers(Arc::new(workers), config))
    }

    /// 使用自定义工作线程工厂
    pub fn with_workers(workers: Arc<dyn HttpWorkerFactory>, config: DownloadConfig) -> Self {
        Self {
            workers,
            config,
            paths: PathLocks::default(),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// 单次内存 GET
    pub fn get(&self, url: impl Into<String>, callbacks: Callbacks) -> RequestHandle {
        MemoryRequest::start(self.workers.clone(), url.into(), None, callbacks)
    }

    /// 单次内存 POST（Content-Type 固定为 JSON）
    pub fn post_json(&self, url: impl Into<String>, body: impl Into<String>, callbacks: Callbacks) -> RequestHandle {
        MemoryRequest::start(self.workers.clone(), url.into(), Some(body.into()), callbacks)
    }

    /// 分片续传下载，使用配置中的分片参数
    pub async fn get_file(
        &self,
        urls: Vec<String>,
        file_path: impl Into<PathBuf>,
        file_size: u64,
        callbacks: Callbacks,
    ) -> Result<RequestHandle, RequestError> {
        let options = FileRequestOptions::from_config(&self.config);
        self.get_file_with(urls, file_path, file_size, callbacks, options).await
    }

    /// 分片续传下载，显式指定分片大小与取消时是否清理
    pub async fn get_file_with(
        &self,
        urls: Vec<String>,
        file_path: impl Into<PathBuf>,
        file_size: u64,
        callbacks: Callbacks,
        options: FileRequestOptions,
    ) -> Result<RequestHandle, RequestError> {
        FileRequest::start(
            self.workers.clone(),
            &self.paths,
            urls,
            file_path.into(),
            file_size,
            callbacks,
            options,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callbacks_finish_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let finished = Arc::new(AtomicUsize::new(0));
        let progressed = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        let p = progressed.clone();

        let mut callbacks = Callbacks::new()
            .on_finish(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .on_progress(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            });

        callbacks.progress(Progress::new(1, 10));
        let outcome = RequestOutcome {
            status: DownloadStatus::Completed,
            progress: Progress::new(10, 10),
            last_code: 200,
            data: Vec::new(),
            file_path: None,
        };
        callbacks.finish(outcome.clone());
        callbacks.finish(outcome);
        // 终态之后的进度通知被丢弃
        callbacks.progress(Progress::new(10, 10));

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(progressed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publisher_rejects_illegal_transitions() {
        let (mut publisher, rx) = SnapshotPublisher::new(Progress::new(0, 100));
        assert!(publisher.transition(RequestStatus::Running));
        publisher.set_progress(Progress::new(50, 100));
        publisher.set_progress(Progress::new(20, 100));
        assert_eq!(rx.borrow().progress.downloaded, 50);

        assert!(publisher.transition(RequestStatus::Completed));
        assert!(!publisher.transition(RequestStatus::Failed));
        assert_eq!(rx.borrow().status, RequestStatus::Completed);
    }
}
