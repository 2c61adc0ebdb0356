//! 请求状态、进度与错误码
//!
//! - `RequestStatus`：请求内部状态机（显式、穷尽匹配）
//! - `DownloadStatus`：对外暴露的终态分类
//! - `Progress`：不可变进度快照
//! - `ErrorCode`：与 HTTP 状态码共用同一通道的负数伪状态码

use serde::{Deserialize, Serialize};

/// HTTP 状态码或负数伪状态码
pub type StatusCode = i64;

/// HTTP 200
pub const HTTP_OK: StatusCode = 200;

/// HTTP 404
pub const HTTP_NOT_FOUND: StatusCode = 404;

/// 本地/传输层错误伪状态码
///
/// 任何负数都表示传输或本地失败，而不是 HTTP 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 网络或读流失败
    IoException,
    /// 写入目标失败
    WriteException,
    /// 服务端返回的大小与期望不符
    InconsistentFileSize,
    /// 不是合法的 HTTP 响应
    NonHttpResponse,
    /// URL 非法
    InvalidUrl,
    /// 请求被取消
    Cancelled,
}

impl ErrorCode {
    /// 转换为状态通道上的数值
    pub const fn code(self) -> StatusCode {
        match self {
            Self::IoException => -1,
            Self::WriteException => -2,
            Self::InconsistentFileSize => -3,
            Self::NonHttpResponse => -4,
            Self::InvalidUrl => -5,
            Self::Cancelled => -6,
        }
    }

    /// 从数值还原（非负数返回 None）
    pub const fn from_code(code: StatusCode) -> Option<Self> {
        match code {
            -1 => Some(Self::IoException),
            -2 => Some(Self::WriteException),
            -3 => Some(Self::InconsistentFileSize),
            -4 => Some(Self::NonHttpResponse),
            -5 => Some(Self::InvalidUrl),
            -6 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoException => write!(f, "IOException"),
            Self::WriteException => write!(f, "WriteException"),
            Self::InconsistentFileSize => write!(f, "InconsistentFileSize"),
            Self::NonHttpResponse => write!(f, "NonHttpResponse"),
            Self::InvalidUrl => write!(f, "InvalidURL"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// 把状态码格式化为日志可读文本
pub fn describe_code(code: StatusCode) -> String {
    match ErrorCode::from_code(code) {
        Some(err) => format!("{}({})", err, code),
        None => format!("HTTP {}", code),
    }
}

/// 对外暴露的下载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// 进行中
    InProgress,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 文件不存在（404）
    FileNotFound,
    /// 内容完整性校验失败
    FailedSha,
}

impl DownloadStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// 按 HTTP 状态码对整体请求分类：200 完成，404 不存在，其余失败
    pub fn from_http_code(code: StatusCode) -> Self {
        match code {
            HTTP_OK => Self::Completed,
            HTTP_NOT_FOUND => Self::FileNotFound,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::FileNotFound => write!(f, "file_not_found"),
            Self::FailedSha => write!(f, "failed_sha"),
        }
    }
}

/// 请求内部状态机
///
/// 合法转换：
/// - Pending → Running
/// - Pending | Running → 任意终态
/// - 终态不可再转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// 已创建，尚未启动工作线程
    Pending,
    /// 下载中
    Running,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 文件不存在
    FileNotFound,
    /// 完整性校验失败
    FailedSha,
    /// 已取消（调用方销毁了请求）
    Cancelled,
}

impl RequestStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Pending | Self::Running => false,
            Self::Completed
            | Self::Failed
            | Self::FileNotFound
            | Self::FailedSha
            | Self::Cancelled => true,
        }
    }

    /// 检查状态转换是否合法
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, n) => n.is_terminal(),
            (
                Self::Completed
                | Self::Failed
                | Self::FileNotFound
                | Self::FailedSha
                | Self::Cancelled,
                _,
            ) => false,
        }
    }

    /// 映射为对外状态
    ///
    /// 取消的请求不会触发终态回调，对外仍视为失败
    pub fn public(&self) -> DownloadStatus {
        match self {
            Self::Pending | Self::Running => DownloadStatus::InProgress,
            Self::Completed => DownloadStatus::Completed,
            Self::Failed | Self::Cancelled => DownloadStatus::Failed,
            Self::FileNotFound => DownloadStatus::FileNotFound,
            Self::FailedSha => DownloadStatus::FailedSha,
        }
    }

    /// 由终态的对外状态反推内部状态
    pub fn from_terminal(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::InProgress => Self::Running,
            DownloadStatus::Completed => Self::Completed,
            DownloadStatus::Failed => Self::Failed,
            DownloadStatus::FileNotFound => Self::FileNotFound,
            DownloadStatus::FailedSha => Self::FailedSha,
        }
    }
}

/// 下载进度快照
///
/// `total` 为 None 表示总大小未知；已知时保证 `downloaded <= total`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    /// 已下载字节数
    pub downloaded: u64,
    /// 总字节数（未知时为 None）
    pub total: Option<u64>,
}

impl Progress {
    /// 总大小已知的进度
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self {
            downloaded: downloaded.min(total),
            total: Some(total),
        }
    }

    /// 总大小未知的进度
    pub fn unknown() -> Self {
        Self {
            downloaded: 0,
            total: None,
        }
    }

    /// 前进指定字节数，返回新快照（不超过已知总量）
    pub fn advanced(&self, bytes: u64) -> Self {
        let downloaded = self.downloaded.saturating_add(bytes);
        Self {
            downloaded: match self.total {
                Some(total) => downloaded.min(total),
                None => downloaded,
            },
            total: self.total,
        }
    }

    /// 百分比（总量未知时为 None）
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some(self.downloaded as f64 / total as f64 * 100.0),
            None => None,
        }
    }
}
