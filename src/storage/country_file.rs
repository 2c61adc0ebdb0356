//! 地图文件标识与本地路径

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 国家/地区 ID
pub type CountryId = String;

/// 数据版本号（例如 `240101`）
pub type DataVersion = i64;

/// 下载完成但尚未登记的文件后缀
pub const READY_FILE_EXTENSION: &str = ".ready";

/// 地图文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapFileType {
    /// 完整地图
    Map,
    /// 增量差分
    Diff,
}

impl MapFileType {
    /// 文件扩展名
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Map => ".mwm",
            Self::Diff => ".mwmdiff",
        }
    }
}

impl std::fmt::Display for MapFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Map => write!(f, "map"),
            Self::Diff => write!(f, "diff"),
        }
    }
}

/// 远端地图文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryFile {
    /// 文件名（不含扩展名）
    pub name: String,
    /// 完整地图大小（字节）
    pub remote_size: u64,
    /// 完整地图 SHA1（base64）
    #[serde(default)]
    pub sha1: String,
}

impl CountryFile {
    pub fn new(name: impl Into<String>, remote_size: u64, sha1: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_size,
            sha1: sha1.into(),
        }
    }

    /// 带扩展名的文件名
    pub fn file_name(&self, file_type: MapFileType) -> String {
        format!("{}{}", self.name, file_type.extension())
    }
}

/// 下载路径：`{data_dir}/{version}/{file_name}.ready`
pub fn file_download_path(
    data_dir: &Path,
    version: DataVersion,
    country_file: &CountryFile,
    file_type: MapFileType,
) -> PathBuf {
    data_dir
        .join(version.to_string())
        .join(format!("{}{}", country_file.file_name(file_type), READY_FILE_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        let file = CountryFile::new("Germany_Berlin", 1024, "");
        assert_eq!(file.file_name(MapFileType::Map), "Germany_Berlin.mwm");
        assert_eq!(file.file_name(MapFileType::Diff), "Germany_Berlin.mwmdiff");
    }

    #[test]
    fn test_download_path() {
        let file = CountryFile::new("Angola", 1024, "");
        assert_eq!(
            file_download_path(Path::new("/data"), 240101, &file, MapFileType::Map),
            PathBuf::from("/data/240101/Angola.mwm.ready")
        );
        assert_eq!(
            file_download_path(Path::new("/data"), 240101, &file, MapFileType::Diff),
            PathBuf::from("/data/240101/Angola.mwmdiff.ready")
        );
    }
}
