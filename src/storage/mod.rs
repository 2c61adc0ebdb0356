//! 地图存储：排队、URL 组装、差分数据源和两种下载器

pub mod background;
pub mod country_file;
pub mod diffs;
pub mod integrity;
pub mod map_files_downloader;
pub mod queue;
pub mod queue_store;
pub mod queued_country;

pub use background::{BackgroundMapFilesDownloader, BackgroundTransport};
pub use country_file::{CountryFile, CountryId, DataVersion, MapFileType};
pub use diffs::{DiffInfo, DiffStatus, DiffsDataSource};
pub use map_files_downloader::MapFilesDownloader;
pub use queue::{BackgroundDownloaderQueue, Queue, TaskData};
pub use queue_store::{load_download_queue, save_download_queue, SavedQueueEntry};
pub use queued_country::{QueuedCountry, QueuedCountryObserver};
