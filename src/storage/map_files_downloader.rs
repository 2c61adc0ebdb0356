//! HTTP 地图下载器
//!
//! 一个 actor 独占下载队列，任何时刻最多只有队首一项在下载，
//! 因此同一路径的 `.downloading` / `.resume` 不会被两个请求同时使用。
//! 队列每次变化后写回 `{data_dir}/download_queue.json`。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::downloader::{Callbacks, DownloadContext, DownloadStatus, Progress, RequestHandle, RequestOutcome};
use crate::storage::country_file::{CountryId, MapFileType};
use crate::storage::diffs::DiffsDataSource;
use crate::storage::integrity;
use crate::storage::queue::Queue;
use crate::storage::queue_store::{load_download_queue, save_download_queue, SavedQueueEntry};
use crate::storage::queued_country::{QueuedCountry, QueuedCountryObserver};

/// 对外命令
enum Command {
    Download(QueuedCountry),
    Remove(CountryId, oneshot::Sender<bool>),
    Clear,
    Restore(Option<Arc<dyn QueuedCountryObserver>>, oneshot::Sender<Vec<CountryId>>),
    QueuedIds(oneshot::Sender<Vec<CountryId>>),
    Contains(CountryId, oneshot::Sender<bool>),
}

/// 请求回调发回 actor 的事件
enum RequestEvent {
    Progress(CountryId, Progress),
    Finished(CountryId, RequestOutcome),
}

/// 拼接镜像地址和相对 URL
pub fn make_url(server: &str, relative_url: &str) -> String {
    format!("{}/{}", server.trim_end_matches('/'), relative_url)
}

/// HTTP 地图下载器句柄
///
/// 丢弃句柄会取消当前下载并停止 actor
#[derive(Debug)]
pub struct MapFilesDownloader {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl MapFilesDownloader {
    pub fn new(context: DownloadContext, storage: StorageConfig, diffs: Arc<DiffsDataSource>) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = DownloaderActor {
            context,
            storage,
            diffs,
            queue: Queue::new(),
            current: None,
            events_tx,
        };
        let task = tokio::spawn(actor.run(commands_rx, events_rx));

        Self { commands, task }
    }

    /// 加入下载队列（已在队列中时忽略）
    pub fn download_map_file(&self, country: QueuedCountry) {
        if self.commands.send(Command::Download(country)).is_err() {
            warn!("地图下载器已停止，忽略下载请求");
        }
    }

    /// 从队列移除，正在下载时会取消下载
    pub async fn remove(&self, country_id: &str) -> bool {
        self.request(|tx| Command::Remove(country_id.to_string(), tx))
            .await
            .unwrap_or(false)
    }

    /// 清空队列并取消当前下载，每一项以失败结束
    pub fn clear(&self) {
        let _ = self.commands.send(Command::Clear);
    }

    /// 把上次保存的队列重新入队，返回实际入队的 ID
    ///
    /// 应在创建后、任何新的入队之前调用，否则保存的队列会先被覆盖
    pub async fn restore_download_queue(&self, observer: Option<Arc<dyn QueuedCountryObserver>>) -> Vec<CountryId> {
        self.request(|tx| Command::Restore(observer, tx))
            .await
            .unwrap_or_default()
    }

    /// 队列中的全部 ID（队首为正在下载的一项）
    pub async fn queued_ids(&self) -> Vec<CountryId> {
        self.request(Command::QueuedIds).await.unwrap_or_default()
    }

    pub async fn contains(&self, country_id: &str) -> bool {
        self.request(|tx| Command::Contains(country_id.to_string(), tx))
            .await
            .unwrap_or(false)
    }

    /// 停止 actor 并等待当前下载清理完毕
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            error!("地图下载器异常退出: {}", e);
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }
}

/// 正在下载的一项
struct CurrentDownload {
    country_id: CountryId,
    handle: RequestHandle,
}

struct DownloaderActor {
    context: DownloadContext,
    storage: StorageConfig,
    diffs: Arc<DiffsDataSource>,
    queue: Queue,
    current: Option<CurrentDownload>,
    events_tx: mpsc::UnboundedSender<RequestEvent>,
}

impl DownloaderActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<RequestEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        if let Some(current) = self.current.take() {
            current.handle.cancel().await;
        }
        debug!("地图下载器已停止");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Download(country) => {
                if self.queue.contains(country.country_id()) {
                    debug!("{} 已在下载队列中", country.country_id());
                    return;
                }
                self.queue.append(country);
                if self.current.is_none() {
                    self.start_next().await;
                }
                self.save_queue().await;
            }
            Command::Remove(country_id, reply) => {
                let removed = self.remove(&country_id).await;
                self.save_queue().await;
                let _ = reply.send(removed);
            }
            Command::Clear => {
                if let Some(current) = self.current.take() {
                    current.handle.cancel().await;
                }
                let cleared = self.queue.clear();
                info!("清空下载队列: {} 项", cleared.len());
                for country in cleared {
                    country.on_download_finished(DownloadStatus::Failed);
                }
                self.save_queue().await;
            }
            Command::Restore(observer, reply) => {
                let restored = self.restore(observer).await;
                let _ = reply.send(restored);
            }
            Command::QueuedIds(reply) => {
                let _ = reply.send(self.queue.ids());
            }
            Command::Contains(country_id, reply) => {
                let _ = reply.send(self.queue.contains(&country_id));
            }
        }
    }

    async fn remove(&mut self, country_id: &str) -> bool {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|c| c.country_id == country_id);

        if is_current {
            if let Some(current) = self.current.take() {
                current.handle.cancel().await;
            }
        }

        let removed = self.queue.remove(country_id).is_some();
        if is_current {
            self.start_next().await;
        }
        removed
    }

    async fn handle_event(&mut self, event: RequestEvent) {
        match event {
            RequestEvent::Progress(country_id, progress) => {
                if self.is_current(&country_id) {
                    if let Some(front) = self.queue.front() {
                        front.on_download_progress(progress);
                    }
                }
            }
            RequestEvent::Finished(country_id, outcome) => {
                // 已被移除的下载
                if !self.is_current(&country_id) {
                    return;
                }
                self.current = None;

                if let Some(country) = self.queue.pop_front() {
                    self.finish(country, outcome).await;
                }
                self.start_next().await;
                self.save_queue().await;
            }
        }
    }

    async fn restore(&mut self, observer: Option<Arc<dyn QueuedCountryObserver>>) -> Vec<CountryId> {
        let saved = load_download_queue(&self.storage.data_dir).await;
        let mut restored = Vec::new();
        for entry in saved {
            if self.queue.contains(&entry.country_id) {
                continue;
            }
            let mut country = entry.into_queued_country(&self.storage.data_dir, self.diffs.clone());
            if let Some(observer) = &observer {
                country.subscribe(observer.clone());
            }
            restored.push(country.country_id().clone());
            self.queue.append(country);
        }

        if !restored.is_empty() {
            info!("恢复下载队列: {:?}", restored);
            if self.current.is_none() {
                self.start_next().await;
            }
        }
        self.save_queue().await;
        restored
    }

    /// 写回队列文件，失败只记录日志
    async fn save_queue(&self) {
        let mut entries = Vec::new();
        self.queue
            .for_each_country(|c| entries.push(SavedQueueEntry::from_country(c)));
        if let Err(e) = save_download_queue(&self.storage.data_dir, &entries).await {
            error!("保存下载队列失败 {:?}: {}", self.storage.data_dir, e);
        }
    }

    fn is_current(&self, country_id: &str) -> bool {
        self.current.as_ref().is_some_and(|c| c.country_id == country_id)
    }

    /// 启动队首下载，无法启动的项直接以失败结束
    async fn start_next(&mut self) {
        while self.current.is_none() {
            let Some(country) = self.queue.front_mut() else {
                return;
            };
            country.clarify_downloading_type();
            let country_id = country.country_id().clone();

            match self.start(&country_id).await {
                Ok(handle) => {
                    self.current = Some(CurrentDownload { country_id, handle });
                }
                Err(reason) => {
                    error!("无法开始下载 {}: {}", country_id, reason);
                    if let Some(country) = self.queue.pop_front() {
                        country.on_download_finished(DownloadStatus::Failed);
                    }
                }
            }
        }
    }

    async fn start(&self, country_id: &CountryId) -> Result<RequestHandle, String> {
        let country = self.queue.front().ok_or("队列为空")?;
        let relative_url = country.relative_url().ok_or("差分版本缺失")?;
        let size = country.download_size().ok_or("差分大小缺失")?;
        let path = country.file_download_path();
        let urls: Vec<String> = self
            .storage
            .servers
            .iter()
            .map(|server| make_url(server, &relative_url))
            .collect();

        info!(
            "开始下载 {} ({}), {} bytes, 镜像 {} 个",
            country_id,
            country.file_type(),
            size,
            urls.len()
        );
        country.on_start_downloading();

        let progress_tx = self.events_tx.clone();
        let finish_tx = self.events_tx.clone();
        let progress_id = country_id.clone();
        let finish_id = country_id.clone();
        let callbacks = Callbacks::new()
            .on_progress(move |progress| {
                let _ = progress_tx.send(RequestEvent::Progress(progress_id.clone(), progress));
            })
            .on_finish(move |outcome| {
                let _ = finish_tx.send(RequestEvent::Finished(finish_id, outcome));
            });

        self.context
            .get_file(urls, path, size, callbacks)
            .await
            .map_err(|e| e.to_string())
    }

    async fn finish(&mut self, country: QueuedCountry, outcome: RequestOutcome) {
        let mut status = outcome.status;

        if status == DownloadStatus::Completed
            && self.storage.integrity_check
            && country.file_type() == MapFileType::Map
            && !country.country_file().sha1.is_empty()
        {
            let path: PathBuf = country.file_download_path();
            let expected = country.country_file().sha1.clone();
            if !integrity::verify_or_remove(path, expected).await {
                status = DownloadStatus::FailedSha;
            }
        }

        if status == DownloadStatus::FileNotFound && country.file_type() == MapFileType::Diff {
            self.abort_diff_scheme_for_queue();
        }

        info!("{} 下载结束: {}", country.country_id(), status);
        country.on_download_finished(status);
    }

    /// 放弃差分方案，队列中剩余的差分全部改为完整地图
    fn abort_diff_scheme_for_queue(&mut self) {
        self.diffs.abort_diff_scheme();
        let mut demoted = Vec::new();
        self.queue.for_each_country_mut(|c| {
            if c.file_type() == MapFileType::Diff {
                c.set_file_type(MapFileType::Map);
                demoted.push(c.country_id().clone());
            }
        });
        if !demoted.is_empty() {
            warn!("差分不存在，以下国家改为下载完整地图: {:?}", demoted);
        }
    }
}
