//! HTTP 工作线程
//!
//! 每个工作线程只负责一次 GET/POST（可带 Range），并通过 channel 把
//! `Write` / `Finish` 事件发回唯一的编排循环。工作线程从不写文件，
//! 也不触碰分片表。

use crate::config::DownloadConfig;
use crate::downloader::status::{ErrorCode, StatusCode, HTTP_OK};
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{redirect, Client, Url};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 工作线程 ID（在一个请求内唯一）
pub type WorkerId = u64;

/// 工作线程的请求参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    /// 工作线程 ID
    pub id: WorkerId,
    /// 请求地址
    pub url: String,
    /// 起始偏移
    pub begin: u64,
    /// 结束偏移（闭区间），None 表示直到资源末尾
    pub end: Option<u64>,
    /// 期望的资源总大小，None 表示不校验
    pub expected_size: Option<u64>,
    /// POST 请求体（JSON），None 表示 GET
    pub post_body: Option<String>,
}

impl WorkerRequest {
    /// 整体 GET 请求
    pub fn whole(id: WorkerId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            begin: 0,
            end: None,
            expected_size: None,
            post_body: None,
        }
    }

    /// 分片 GET 请求
    pub fn ranged(id: WorkerId, url: impl Into<String>, begin: u64, end: u64, expected_size: u64) -> Self {
        Self {
            id,
            url: url.into(),
            begin,
            end: Some(end),
            expected_size: Some(expected_size),
            post_body: None,
        }
    }

    /// 是否需要发送 Range 头
    pub fn is_ranged(&self) -> bool {
        self.begin > 0 || self.end.is_some()
    }

    /// 请求的字节数（未知时为 None）
    pub fn range_len(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.begin)
    }
}

/// 工作线程发回编排循环的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// 收到一段数据，应写到绝对偏移 `offset`
    Write {
        worker: WorkerId,
        offset: u64,
        data: Vec<u8>,
    },
    /// 请求结束（每个工作线程恰好一次）
    Finish {
        worker: WorkerId,
        code: StatusCode,
        begin: u64,
        end: Option<u64>,
    },
}

/// 工作线程工厂（平台 HTTP 实现的边界）
///
/// 实现方必须只通过 `events` 回报结果，且在 `cancel` 触发后尽快退出
pub trait HttpWorkerFactory: Send + Sync + fmt::Debug {
    /// 启动一个工作线程
    fn spawn(
        &self,
        request: WorkerRequest,
        events: UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;
}

/// 基于 reqwest 的工作线程工厂
#[derive(Debug, Clone)]
pub struct ReqwestWorkerFactory {
    client: Client,
    /// 单个请求的超时
    request_timeout: Duration,
}

impl ReqwestWorkerFactory {
    /// 按下载配置创建 HTTP 客户端（不跟随重定向）
    pub fn new(config: &DownloadConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            request_timeout: Duration::from_secs(config.chunk_timeout_secs),
        })
    }

    /// 执行一次请求，返回结束状态码
    async fn run(
        client: Client,
        timeout: Duration,
        request: &WorkerRequest,
        events: &UnboundedSender<WorkerEvent>,
    ) -> StatusCode {
        let url = match Url::parse(&request.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("[worker {}] URL 非法: {} ({})", request.id, request.url, e);
                return ErrorCode::InvalidUrl.code();
            }
        };

        let mut builder = match &request.post_body {
            Some(body) => client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone()),
            None => client.get(url),
        };

        if request.is_ranged() {
            let range = match request.end {
                Some(end) => format!("bytes={}-{}", request.begin, end),
                None => format!("bytes={}-", request.begin),
            };
            builder = builder.header(RANGE, range);
        }

        let resp = match builder.timeout(timeout).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => {
                warn!("[worker {}] 构建请求失败: {}", request.id, e);
                return ErrorCode::InvalidUrl.code();
            }
            Err(e) => {
                warn!("[worker {}] 发送请求失败: {}", request.id, e);
                return ErrorCode::IoException.code();
            }
        };

        let status = resp.status().as_u16() as StatusCode;
        let whole_range = request.begin == 0
            && match (request.end, request.expected_size) {
                (None, _) => true,
                (Some(end), Some(size)) => end + 1 == size,
                (Some(_), None) => false,
            };

        match status {
            206 => {
                if let (Some(expected), Some(total)) =
                    (request.expected_size, parse_content_range_total(&resp))
                {
                    if expected != total {
                        warn!(
                            "[worker {}] 文件大小不一致: 期望 {} bytes, 服务器 {} bytes",
                            request.id, expected, total
                        );
                        return ErrorCode::InconsistentFileSize.code();
                    }
                }
            }
            200 if !request.is_ranged() || whole_range => {
                if let (Some(expected), Some(len)) = (request.expected_size, resp.content_length()) {
                    if expected != len {
                        warn!(
                            "[worker {}] 文件大小不一致: 期望 {} bytes, 服务器 {} bytes",
                            request.id, expected, len
                        );
                        return ErrorCode::InconsistentFileSize.code();
                    }
                }
            }
            200 => {
                // 服务器忽略了 Range，返回的是整个文件
                warn!("[worker {}] 服务器不支持 Range 请求", request.id);
                return ErrorCode::InconsistentFileSize.code();
            }
            other => {
                debug!("[worker {}] HTTP 状态 {}: {}", request.id, other, request.url);
                return other;
            }
        }

        let expected_len = request.range_len();
        let mut offset = request.begin;
        let mut received = 0u64;
        let mut stream = resp.bytes_stream();

        while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("[worker {}] 读取数据流失败: {}", request.id, e);
                    return ErrorCode::IoException.code();
                }
            };
            if bytes.is_empty() {
                continue;
            }

            let len = bytes.len() as u64;
            if let Some(expected) = expected_len {
                if received + len > expected {
                    warn!(
                        "[worker {}] 返回数据超出请求范围: 期望 {} bytes",
                        request.id, expected
                    );
                    return ErrorCode::InconsistentFileSize.code();
                }
            }

            let event = WorkerEvent::Write {
                worker: request.id,
                offset,
                data: bytes.to_vec(),
            };
            if events.send(event).is_err() {
                // 编排端已销毁
                return ErrorCode::Cancelled.code();
            }

            offset += len;
            received += len;
        }

        if let Some(expected) = expected_len {
            if received != expected {
                warn!(
                    "[worker {}] 数据不完整: 收到 {} bytes, 期望 {} bytes",
                    request.id, received, expected
                );
                return ErrorCode::InconsistentFileSize.code();
            }
        }

        HTTP_OK
    }
}

impl HttpWorkerFactory for ReqwestWorkerFactory {
    fn spawn(
        &self,
        request: WorkerRequest,
        events: UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let timeout = self.request_timeout;

        tokio::spawn(async move {
            let code = tokio::select! {
                biased;
                _ = cancel.cancelled() => ErrorCode::Cancelled.code(),
                code = Self::run(client, timeout, &request, &events) => code,
            };

            // 编排端可能已经退出，发送失败即为空操作
            let _ = events.send(WorkerEvent::Finish {
                worker: request.id,
                code,
                begin: request.begin,
                end: request.end,
            });
        })
    }
}

/// 解析 `Content-Range: bytes a-b/total` 中的 total
fn parse_content_range_total(resp: &reqwest::Response) -> Option<u64> {
    let value = resp.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_total_from_content_range(value)
}

fn parse_total_from_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}
