//! 内存请求：单个工作线程，整体 GET/POST，响应保存在内存中

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::request::{Callbacks, RequestHandle, RequestOutcome, SnapshotPublisher};
use crate::downloader::status::{describe_code, DownloadStatus, ErrorCode, Progress, RequestStatus};
use crate::downloader::worker::{HttpWorkerFactory, WorkerEvent, WorkerRequest};

const WORKER_ID: u64 = 1;

pub struct MemoryRequest {
    url: String,
    data: Vec<u8>,
    callbacks: Callbacks,
    publisher: SnapshotPublisher,
}

impl MemoryRequest {
    /// 启动请求，`post_body` 为 None 时发送 GET
    pub(crate) fn start(
        workers: Arc<dyn HttpWorkerFactory>,
        url: String,
        post_body: Option<String>,
        callbacks: Callbacks,
    ) -> RequestHandle {
        let (publisher, snapshot) = SnapshotPublisher::new(Progress::unknown());
        let cancel = CancellationToken::new();

        let mut request = WorkerRequest::whole(WORKER_ID, url.clone());
        request.post_body = post_body;

        let this = Self {
            url,
            data: Vec::new(),
            callbacks,
            publisher,
        };
        let task = tokio::spawn(this.run(workers, request, cancel.clone()));

        RequestHandle::new(snapshot, cancel, task)
    }

    async fn run(mut self, workers: Arc<dyn HttpWorkerFactory>, request: WorkerRequest, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker_cancel = cancel.child_token();

        self.publisher.transition(RequestStatus::Running);
        debug!("内存请求开始: {}", self.url);
        let handle = workers.spawn(request, tx, worker_cancel.clone());

        let code = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    worker_cancel.cancel();
                    handle.abort();
                    let _ = handle.await;
                    while rx.try_recv().is_ok() {}
                    self.publisher.transition(RequestStatus::Cancelled);
                    info!("内存请求已取消: {}", self.url);
                    return;
                }
                event = rx.recv() => match event {
                    Some(WorkerEvent::Write { data, .. }) => {
                        self.data.extend_from_slice(&data);
                        let progress = self.publisher.current().progress.advanced(data.len() as u64);
                        self.publisher.set_progress(progress);
                        self.callbacks.progress(progress);
                    }
                    Some(WorkerEvent::Finish { code, .. }) => break code,
                    None => {
                        warn!("工作线程未报告结束即退出: {}", self.url);
                        break ErrorCode::IoException.code();
                    }
                }
            }
        };

        let status = DownloadStatus::from_http_code(code);
        if status == DownloadStatus::Completed {
            debug!("内存请求完成: {}, {} bytes", self.url, self.data.len());
        } else {
            warn!("内存请求失败: {}, {}", self.url, describe_code(code));
        }

        self.publisher.transition(RequestStatus::from_terminal(status));
        let outcome = RequestOutcome {
            status,
            progress: self.publisher.current().progress,
            last_code: code,
            data: std::mem::take(&mut self.data),
            file_path: None,
        };
        self.callbacks.finish(outcome);
    }
}
