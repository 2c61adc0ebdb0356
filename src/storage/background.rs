//! 平台后台下载器
//!
//! 部分平台由操作系统执行传输，进程内只能拿到一个不透明的任务句柄。
//! 这类传输不做分片，镜像切换通过对 URL 列表递归实现。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_recursion::async_recursion;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::downloader::DownloadStatus;
use crate::storage::country_file::CountryId;
use crate::storage::map_files_downloader::make_url;
use crate::storage::queue::BackgroundDownloaderQueue;
use crate::storage::queued_country::QueuedCountry;

/// 平台后台传输服务
#[async_trait]
pub trait BackgroundTransport: Send + Sync + 'static {
    /// 平台任务句柄
    type TaskInfo: Clone + fmt::Debug + Send + Sync + 'static;

    /// 创建后台传输任务
    fn start(&self, url: &str, destination: &Path) -> Self::TaskInfo;

    /// 等待任务结束
    async fn wait(&self, task: &Self::TaskInfo) -> DownloadStatus;

    /// 取消任务
    fn cancel(&self, task: &Self::TaskInfo);
}

type SharedQueue<T> = Arc<Mutex<BackgroundDownloaderQueue<T>>>;

/// 基于平台后台传输的地图下载器
pub struct BackgroundMapFilesDownloader<T: BackgroundTransport> {
    transport: Arc<T>,
    queue: SharedQueue<T::TaskInfo>,
    storage: StorageConfig,
}

impl<T: BackgroundTransport> BackgroundMapFilesDownloader<T> {
    pub fn new(transport: Arc<T>, storage: StorageConfig) -> Self {
        Self {
            transport,
            queue: Arc::new(Mutex::new(BackgroundDownloaderQueue::new())),
            storage,
        }
    }

    /// 开始下载，返回驱动这次下载的任务
    ///
    /// 已在队列中时返回 None
    pub fn download_map_file(&self, mut country: QueuedCountry) -> Option<JoinHandle<()>> {
        if self.queue.lock().contains(country.country_id()) {
            debug!("{} 已在后台下载队列中", country.country_id());
            return None;
        }

        country.clarify_downloading_type();
        let country_id = country.country_id().clone();
        let path = country.file_download_path();
        let urls: Vec<String> = match country.relative_url() {
            Some(relative_url) => self
                .storage
                .servers
                .iter()
                .map(|server| make_url(server, &relative_url))
                .collect(),
            None => Vec::new(),
        };

        self.queue.lock().append(country);

        let transport = self.transport.clone();
        let queue = self.queue.clone();
        Some(tokio::spawn(async move {
            let status = download_with_failover(transport, queue.clone(), country_id.clone(), urls, path).await;

            // 条目已被移除说明下载被取消，不再通知
            let Some(entry) = queue.lock().remove(&country_id) else {
                return;
            };
            info!("{} 后台下载结束: {}", country_id, status);
            entry.queued_country.on_download_finished(status);
        }))
    }

    /// 移除并取消平台任务
    pub fn remove(&self, country_id: &str) -> bool {
        let Some(entry) = self.queue.lock().remove(country_id) else {
            return false;
        };
        if let Some(task) = entry.task_info {
            debug!("取消后台任务 {}: {:?}", country_id, task);
            self.transport.cancel(&task);
        }
        true
    }

    /// 清空队列并取消全部平台任务，每一项以失败结束
    pub fn clear(&self) {
        let entries = self.queue.lock().clear();
        for entry in entries {
            if let Some(task) = &entry.task_info {
                self.transport.cancel(task);
            }
            entry.queued_country.on_download_finished(DownloadStatus::Failed);
        }
    }

    pub fn contains(&self, country_id: &str) -> bool {
        self.queue.lock().contains(country_id)
    }

    pub fn task_info(&self, country_id: &str) -> Option<T::TaskInfo> {
        self.queue.lock().get_task_info_for_country(country_id).cloned()
    }

    pub fn queued_ids(&self) -> Vec<CountryId> {
        let mut ids = Vec::new();
        self.queue
            .lock()
            .for_each_country(|c| ids.push(c.country_id().clone()));
        ids
    }
}

/// 依次尝试每个镜像，URL 列表为空时失败
#[async_recursion]
async fn download_with_failover<T: BackgroundTransport>(
    transport: Arc<T>,
    queue: SharedQueue<T::TaskInfo>,
    country_id: CountryId,
    urls: Vec<String>,
    path: PathBuf,
) -> DownloadStatus {
    let Some((url, rest)) = urls.split_first() else {
        return DownloadStatus::Failed;
    };

    let task = transport.start(url, &path);
    {
        let mut queue = queue.lock();
        if !queue.set_task_info_for_country(&country_id, task.clone()) {
            // 启动前已被移除
            drop(queue);
            transport.cancel(&task);
            return DownloadStatus::Failed;
        }
        if let Some(entry) = queue.get(&country_id) {
            entry.queued_country.on_start_downloading();
        }
    }

    let status = transport.wait(&task).await;
    if status == DownloadStatus::Completed || !queue.lock().contains(&country_id) {
        return status;
    }

    warn!("镜像下载失败 {}: {}，剩余镜像 {} 个", url, status, rest.len());
    download_with_failover(transport, queue, country_id, rest.to_vec(), path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::country_file::{CountryFile, MapFileType};
    use crate::storage::diffs::DiffsDataSource;
    use crate::storage::queued_country::QueuedCountryObserver;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    /// 按 URL 返回预设结果的传输服务
    #[derive(Default)]
    struct FakeTransport {
        results: HashMap<String, DownloadStatus>,
        started: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<u64>>,
        release: CancellationToken,
    }

    #[async_trait]
    impl BackgroundTransport for FakeTransport {
        type TaskInfo = u64;

        fn start(&self, url: &str, _destination: &Path) -> u64 {
            let mut started = self.started.lock();
            started.push(url.to_string());
            started.len() as u64
        }

        async fn wait(&self, task: &u64) -> DownloadStatus {
            let url = self.started.lock()[*task as usize - 1].clone();
            match self.results.get(&url) {
                Some(status) => *status,
                None => {
                    // 未预设的 URL 一直挂起直到被取消
                    self.release.cancelled().await;
                    DownloadStatus::Failed
                }
            }
        }

        fn cancel(&self, task: &u64) {
            self.cancelled.lock().push(*task);
            self.release.cancel();
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, DownloadStatus)>>);

    impl QueuedCountryObserver for Recorder {
        fn on_download_finished(&self, country: &QueuedCountry, status: DownloadStatus) {
            self.0.lock().push((country.country_id().clone(), status));
        }
    }

    fn storage() -> StorageConfig {
        StorageConfig {
            data_dir: PathBuf::from("/data"),
            servers: vec!["http://a".into(), "http://b".into()],
            os_name: "ios".into(),
            integrity_check: false,
        }
    }

    fn country(id: &str, recorder: &Arc<Recorder>) -> QueuedCountry {
        let mut c = QueuedCountry::new(
            id,
            CountryFile::new(id, 100, ""),
            MapFileType::Map,
            240101,
            "/data",
            Arc::new(DiffsDataSource::new()),
        )
        .with_os_name("ios");
        c.subscribe(recorder.clone());
        c
    }

    #[tokio::test]
    async fn test_failover_to_second_mirror() {
        let mut results = HashMap::new();
        results.insert("http://a/ios/240101/Angola.mwm".to_string(), DownloadStatus::Failed);
        results.insert("http://b/ios/240101/Angola.mwm".to_string(), DownloadStatus::Completed);
        let transport = Arc::new(FakeTransport {
            results,
            ..FakeTransport::default()
        });
        let recorder = Arc::new(Recorder::default());
        let downloader = BackgroundMapFilesDownloader::new(transport.clone(), storage());

        let task = downloader.download_map_file(country("Angola", &recorder)).unwrap();
        task.await.unwrap();

        assert_eq!(
            *transport.started.lock(),
            vec!["http://a/ios/240101/Angola.mwm", "http://b/ios/240101/Angola.mwm"]
        );
        assert_eq!(*recorder.0.lock(), vec![("Angola".to_string(), DownloadStatus::Completed)]);
        assert!(!downloader.contains("Angola"));
    }

    #[tokio::test]
    async fn test_all_mirrors_fail() {
        let mut results = HashMap::new();
        results.insert("http://a/ios/240101/Angola.mwm".to_string(), DownloadStatus::FileNotFound);
        results.insert("http://b/ios/240101/Angola.mwm".to_string(), DownloadStatus::Failed);
        let transport = Arc::new(FakeTransport {
            results,
            ..FakeTransport::default()
        });
        let recorder = Arc::new(Recorder::default());
        let downloader = BackgroundMapFilesDownloader::new(transport.clone(), storage());

        downloader
            .download_map_file(country("Angola", &recorder))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(transport.started.lock().len(), 2);
        assert_eq!(*recorder.0.lock(), vec![("Angola".to_string(), DownloadStatus::Failed)]);
    }

    #[tokio::test]
    async fn test_remove_cancels_platform_task() {
        let transport = Arc::new(FakeTransport::default());
        let recorder = Arc::new(Recorder::default());
        let downloader = BackgroundMapFilesDownloader::new(transport.clone(), storage());

        let task = downloader.download_map_file(country("Angola", &recorder)).unwrap();
        assert!(downloader.download_map_file(country("Angola", &recorder)).is_none());

        // 等待平台任务创建
        while downloader.task_info("Angola").is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(downloader.task_info("Angola"), Some(1));

        assert!(downloader.remove("Angola"));
        task.await.unwrap();

        assert_eq!(*transport.cancelled.lock(), vec![1]);
        // 只尝试了第一个镜像，且没有结束通知
        assert_eq!(transport.started.lock().len(), 1);
        assert!(recorder.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_clear_finishes_every_item() {
        let transport = Arc::new(FakeTransport::default());
        let recorder = Arc::new(Recorder::default());
        let downloader = BackgroundMapFilesDownloader::new(transport.clone(), storage());

        let angola = downloader.download_map_file(country("Angola", &recorder)).unwrap();
        let chad = downloader.download_map_file(country("Chad", &recorder)).unwrap();
        while downloader.task_info("Angola").is_none() || downloader.task_info("Chad").is_none() {
            tokio::task::yield_now().await;
        }

        downloader.clear();
        angola.await.unwrap();
        chad.await.unwrap();

        assert_eq!(transport.cancelled.lock().len(), 2);
        let mut finished = recorder.0.lock().clone();
        finished.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            finished,
            vec![
                ("Angola".to_string(), DownloadStatus::Failed),
                ("Chad".to_string(), DownloadStatus::Failed),
            ]
        );
        assert!(downloader.queued_ids().is_empty());
    }
}
