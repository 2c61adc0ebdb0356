// Map Downloader Library
// 多镜像分片续传的离线地图下载库

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 下载引擎模块
pub mod downloader;

// 断点续传持久化
pub mod persistence;

// 地图存储与下载队列
pub mod storage;

// 导出常用类型
pub use config::{AppConfig, DownloadConfig, StorageConfig};
pub use downloader::{
    Callbacks, DownloadContext, DownloadStatus, Progress, RequestError, RequestHandle,
    RequestOutcome, RequestStatus,
};
pub use storage::{
    BackgroundMapFilesDownloader, BackgroundTransport, CountryFile, DiffsDataSource,
    MapFileType, MapFilesDownloader, QueuedCountry, QueuedCountryObserver, SavedQueueEntry,
};
