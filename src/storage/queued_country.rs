//! 下载队列中的一个工作单元

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::downloader::{DownloadStatus, Progress};
use crate::storage::country_file::{file_download_path, CountryFile, CountryId, DataVersion, MapFileType};
use crate::storage::diffs::{DiffStatus, DiffsDataSource};

/// 下载生命周期观察者
///
/// 所有方法都有空的默认实现
pub trait QueuedCountryObserver: Send + Sync {
    /// 进入队列
    fn on_country_in_queue(&self, _country: &QueuedCountry) {}
    /// 开始下载
    fn on_start_downloading(&self, _country: &QueuedCountry) {}
    /// 下载进度
    fn on_download_progress(&self, _country: &QueuedCountry, _progress: Progress) {}
    /// 下载结束
    fn on_download_finished(&self, _country: &QueuedCountry, _status: DownloadStatus) {}
}

/// 排队下载的国家
///
/// `(country_id, country_file, current_version)` 不可变，
/// 文件类型和观察者可变。相等性只比较 `country_id`
#[derive(Clone)]
pub struct QueuedCountry {
    country_id: CountryId,
    country_file: CountryFile,
    file_type: MapFileType,
    current_version: DataVersion,
    data_dir: PathBuf,
    os_name: String,
    diffs: Arc<DiffsDataSource>,
    observer: Option<Arc<dyn QueuedCountryObserver>>,
}

impl QueuedCountry {
    pub fn new(
        country_id: impl Into<CountryId>,
        country_file: CountryFile,
        file_type: MapFileType,
        current_version: DataVersion,
        data_dir: impl Into<PathBuf>,
        diffs: Arc<DiffsDataSource>,
    ) -> Self {
        Self {
            country_id: country_id.into(),
            country_file,
            file_type,
            current_version,
            data_dir: data_dir.into(),
            os_name: std::env::consts::OS.to_string(),
            diffs,
            observer: None,
        }
    }

    /// 完整地图 URL 的平台前缀
    pub fn with_os_name(mut self, os_name: impl Into<String>) -> Self {
        self.os_name = os_name.into();
        self
    }

    pub fn country_id(&self) -> &CountryId {
        &self.country_id
    }

    pub fn country_file(&self) -> &CountryFile {
        &self.country_file
    }

    pub fn file_type(&self) -> MapFileType {
        self.file_type
    }

    pub fn set_file_type(&mut self, file_type: MapFileType) {
        self.file_type = file_type;
    }

    pub fn current_version(&self) -> DataVersion {
        self.current_version
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    /// 设置观察者（替换已有的）
    pub fn subscribe(&mut self, observer: Arc<dyn QueuedCountryObserver>) {
        self.observer = Some(observer);
    }

    pub fn unsubscribe(&mut self) {
        self.observer = None;
    }

    /// 差分不可用时降级为完整地图
    ///
    /// 差分方案整体不可用，或可用但没有该国家的差分时降级；
    /// 方案尚未确定时保持差分
    pub fn clarify_downloading_type(&mut self) {
        if self.file_type != MapFileType::Diff {
            return;
        }

        let demote = match self.diffs.status() {
            DiffStatus::NotAvailable => true,
            DiffStatus::Available => !self.diffs.has_diff_for(&self.country_id),
            DiffStatus::Undefined => false,
        };
        if demote {
            debug!("{} 没有可用差分，改为下载完整地图", self.country_id);
            self.file_type = MapFileType::Map;
        }
    }

    /// 相对 URL
    ///
    /// - 完整地图：`{os}/{version}/{file_name}`
    /// - 差分：`diffs/{version}/{diff_version}/{file_name}`
    ///
    /// 差分类型但数据源中没有差分版本时返回 None（调用方应先调用 `clarify_downloading_type`）
    pub fn relative_url(&self) -> Option<String> {
        let file_name = self.country_file.file_name(self.file_type);
        let encoded = urlencoding::encode(&file_name);

        match self.file_type {
            MapFileType::Map => Some(format!("{}/{}/{}", self.os_name, self.current_version, encoded)),
            MapFileType::Diff => {
                let diff_version = self.diffs.version_for(&self.country_id)?;
                Some(format!(
                    "diffs/{}/{}/{}",
                    self.current_version, diff_version, encoded
                ))
            }
        }
    }

    /// 本地下载路径
    pub fn file_download_path(&self) -> PathBuf {
        file_download_path(&self.data_dir, self.current_version, &self.country_file, self.file_type)
    }

    /// 需要下载的字节数
    pub fn download_size(&self) -> Option<u64> {
        match self.file_type {
            MapFileType::Map => Some(self.country_file.remote_size),
            MapFileType::Diff => self.diffs.size_for(&self.country_id),
        }
    }

    pub fn on_country_in_queue(&self) {
        if let Some(observer) = &self.observer {
            observer.on_country_in_queue(self);
        }
    }

    pub fn on_start_downloading(&self) {
        if let Some(observer) = &self.observer {
            observer.on_start_downloading(self);
        }
    }

    pub fn on_download_progress(&self, progress: Progress) {
        if let Some(observer) = &self.observer {
            observer.on_download_progress(self, progress);
        }
    }

    pub fn on_download_finished(&self, status: DownloadStatus) {
        if let Some(observer) = &self.observer {
            observer.on_download_finished(self, status);
        }
    }
}

impl PartialEq for QueuedCountry {
    fn eq(&self, other: &Self) -> bool {
        self.country_id == other.country_id
    }
}

impl Eq for QueuedCountry {}

impl fmt::Debug for QueuedCountry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCountry")
            .field("country_id", &self.country_id)
            .field("file_type", &self.file_type)
            .field("current_version", &self.current_version)
            .finish()
    }
}
