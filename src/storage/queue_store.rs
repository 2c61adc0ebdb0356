//! 下载队列持久化
//!
//! 队列内容保存在 `{data_dir}/download_queue.json`，每次入队、结束、移除和清空后整体重写。
//! 进程重启后由 `MapFilesDownloader::restore_download_queue` 读回并重新入队。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persistence::resume::remove_if_exists;
use crate::storage::country_file::{CountryFile, CountryId, DataVersion, MapFileType};
use crate::storage::diffs::DiffsDataSource;
use crate::storage::queued_country::QueuedCountry;

/// 队列文件名
pub const QUEUE_FILE_NAME: &str = "download_queue.json";

/// 队列中一项的持久化形式（不含观察者）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedQueueEntry {
    pub country_id: CountryId,
    pub country_file: CountryFile,
    pub file_type: MapFileType,
    pub current_version: DataVersion,
    pub os_name: String,
}

impl SavedQueueEntry {
    pub fn from_country(country: &QueuedCountry) -> Self {
        Self {
            country_id: country.country_id().clone(),
            country_file: country.country_file().clone(),
            file_type: country.file_type(),
            current_version: country.current_version(),
            os_name: country.os_name().to_string(),
        }
    }

    /// 还原为队列项，观察者需要调用方重新订阅
    pub fn into_queued_country(self, data_dir: &Path, diffs: Arc<DiffsDataSource>) -> QueuedCountry {
        QueuedCountry::new(
            self.country_id,
            self.country_file,
            self.file_type,
            self.current_version,
            data_dir,
            diffs,
        )
        .with_os_name(self.os_name)
    }
}

pub fn queue_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(QUEUE_FILE_NAME)
}

/// 保存队列，队列为空时删除文件
///
/// 先写临时文件再 rename，中途崩溃只会留下旧的队列
pub async fn save_download_queue(data_dir: &Path, entries: &[SavedQueueEntry]) -> io::Result<()> {
    let path = queue_file_path(data_dir);
    if entries.is_empty() {
        remove_if_exists(&path).await?;
        return Ok(());
    }

    tokio::fs::create_dir_all(data_dir).await?;
    let json = serde_json::to_vec_pretty(entries).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize download queue: {}", e),
        )
    })?;

    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, json).await?;
    tokio::fs::rename(&temp_path, &path).await?;

    debug!("已保存下载队列: {:?}, {} 项", path, entries.len());
    Ok(())
}

/// 读取保存的队列
///
/// 文件不存在或无法解析时返回空队列
pub async fn load_download_queue(data_dir: &Path) -> Vec<SavedQueueEntry> {
    let path = queue_file_path(data_dir);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("读取下载队列失败 {:?}: {}", path, e);
            return Vec::new();
        }
    };

    match serde_json::from_slice::<Vec<SavedQueueEntry>>(&bytes) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("下载队列已损坏，忽略 {:?}: {}", path, e);
            Vec::new()
        }
    }
}
