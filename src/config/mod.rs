// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 地图存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 分片大小 (KB)
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: u64,
    /// 单个文件的最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 当前镜像连续失败多少个分片后放弃该镜像
    #[serde(default = "default_mirror_failure_threshold")]
    pub mirror_failure_threshold: u32,
    /// 每成功多少个分片保存一次续传记录
    #[serde(default = "default_resume_save_interval")]
    pub resume_save_interval: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单个分片请求超时（秒）
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 取消下载时是否删除临时文件和续传记录
    #[serde(default = "default_clean_on_cancel")]
    pub clean_on_cancel: bool,
}

fn default_chunk_size_kb() -> u64 {
    512
}

fn default_max_concurrent_chunks() -> usize {
    4
}

fn default_mirror_failure_threshold() -> u32 {
    3
}

fn default_resume_save_interval() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_chunk_timeout_secs() -> u64 {
    120
}

fn default_user_agent() -> String {
    format!("map-downloader/{}", env!("CARGO_PKG_VERSION"))
}

fn default_clean_on_cancel() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size_kb: default_chunk_size_kb(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            mirror_failure_threshold: default_mirror_failure_threshold(),
            resume_save_interval: default_resume_save_interval(),
            connect_timeout_secs: default_connect_timeout_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            user_agent: default_user_agent(),
            clean_on_cancel: default_clean_on_cancel(),
        }
    }
}

impl DownloadConfig {
    /// 分片大小（字节）
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_kb * 1024
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_kb == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.max_concurrent_chunks == 0 {
            anyhow::bail!("最大并发分片数必须大于 0");
        }
        if self.mirror_failure_threshold == 0 {
            anyhow::bail!("镜像失败阈值必须大于 0");
        }
        if self.resume_save_interval == 0 {
            anyhow::bail!("续传记录保存间隔必须大于 0");
        }
        Ok(())
    }
}

/// 地图存储配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 地图数据根目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 镜像服务器地址（按优先级排序）
    #[serde(default)]
    pub servers: Vec<String>,
    /// 完整地图 URL 的平台前缀
    #[serde(default = "default_os_name")]
    pub os_name: String,
    /// 下载完成后是否校验完整地图的 SHA1
    #[serde(default = "default_integrity_check")]
    pub integrity_check: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("maps")
}

fn default_os_name() -> String {
    std::env::consts::OS.to_string()
}

fn default_integrity_check() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            servers: Vec::new(),
            os_name: default_os_name(),
            integrity_check: default_integrity_check(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.download.validate().context("下载配置无效")?;

        for server in &self.storage.servers {
            if !(server.starts_with("http://") || server.starts_with("https://")) {
                anyhow::bail!("镜像地址必须以 http:// 或 https:// 开头: {}", server);
            }
        }
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
