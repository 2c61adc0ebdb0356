//! 测试用的脚本化工作线程工厂（不访问网络）

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::downloader::status::{ErrorCode, StatusCode, HTTP_NOT_FOUND, HTTP_OK};
use crate::downloader::worker::{HttpWorkerFactory, WorkerEvent, WorkerRequest};

/// 镜像行为
#[derive(Debug, Clone)]
pub enum MirrorBehavior {
    /// 正常提供内容，可对指定起始偏移的分片失败、挂起或返回无法写入的数据
    Serve {
        body: Arc<Vec<u8>>,
        fail: HashMap<u64, StatusCode>,
        hang: HashSet<u64>,
        /// 起始偏移 → 前几次请求返回无法写入的数据
        unwritable: HashMap<u64, usize>,
    },
    /// 所有请求返回 404
    NotFound,
    /// 所有请求返回指定状态码
    Status(StatusCode),
    /// 所有请求挂起直到取消
    Hang,
}

impl MirrorBehavior {
    pub fn serve(body: Vec<u8>) -> Self {
        Self::Serve {
            body: Arc::new(body),
            fail: HashMap::new(),
            hang: HashSet::new(),
            unwritable: HashMap::new(),
        }
    }

    /// 起始偏移为 `begin` 的请求返回 `code`
    pub fn failing_at(mut self, begin: u64, code: StatusCode) -> Self {
        if let Self::Serve { fail, .. } = &mut self {
            fail.insert(begin, code);
        }
        self
    }

    /// 起始偏移为 `begin` 的请求挂起直到取消
    pub fn hanging_at(mut self, begin: u64) -> Self {
        if let Self::Serve { hang, .. } = &mut self {
            hang.insert(begin);
        }
        self
    }

    /// 起始偏移为 `begin` 的前 `times` 次请求发出一个无法落盘的 `Write`
    /// （偏移超出可寻址范围），之后挂起直到被取消
    pub fn unwritable_at(mut self, begin: u64, times: usize) -> Self {
        if let Self::Serve { unwritable, .. } = &mut self {
            unwritable.insert(begin, times);
        }
        self
    }
}

/// 无法 seek 到的偏移
pub const UNWRITABLE_OFFSET: u64 = u64::MAX;

/// 脚本化工作线程工厂
///
/// 镜像行为可以在请求之间替换，克隆出的工厂共享镜像表和请求日志
#[derive(Debug, Clone)]
pub struct ScriptedWorkerFactory {
    mirrors: Arc<Mutex<HashMap<String, MirrorBehavior>>>,
    piece_size: usize,
    log: Arc<Mutex<Vec<WorkerRequest>>>,
}

impl ScriptedWorkerFactory {
    pub fn new() -> Self {
        Self {
            mirrors: Arc::new(Mutex::new(HashMap::new())),
            piece_size: 64 * 1024,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn mirror(self, url: &str, behavior: MirrorBehavior) -> Self {
        self.set_mirror(url, behavior);
        self
    }

    /// 替换镜像行为，只影响之后发出的请求
    pub fn set_mirror(&self, url: &str, behavior: MirrorBehavior) {
        self.mirrors.lock().insert(url.to_string(), behavior);
    }

    /// 每个 `Write` 事件携带的最大字节数
    pub fn with_piece_size(mut self, piece_size: usize) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    /// 已发出的全部请求
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.log.lock().clone()
    }

    /// 发往指定镜像的请求数
    pub fn request_count(&self, url: &str) -> usize {
        self.log.lock().iter().filter(|r| r.url == url).count()
    }
}

async fn serve(
    request: &WorkerRequest,
    body: &[u8],
    piece_size: usize,
    events: &UnboundedSender<WorkerEvent>,
) -> StatusCode {
    let begin = request.begin as usize;
    let end = match request.end {
        Some(end) => end as usize,
        None => body.len().saturating_sub(1),
    };
    if body.is_empty() && request.end.is_none() {
        return HTTP_OK;
    }
    if begin > end || end >= body.len() {
        return ErrorCode::InconsistentFileSize.code();
    }

    let mut offset = begin;
    for piece in body[begin..=end].chunks(piece_size) {
        let event = WorkerEvent::Write {
            worker: request.id,
            offset: offset as u64,
            data: piece.to_vec(),
        };
        if events.send(event).is_err() {
            return ErrorCode::Cancelled.code();
        }
        offset += piece.len();
        tokio::task::yield_now().await;
    }
    HTTP_OK
}

impl HttpWorkerFactory for ScriptedWorkerFactory {
    fn spawn(
        &self,
        request: WorkerRequest,
        events: UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let attempt = {
            let mut log = self.log.lock();
            let attempt = log
                .iter()
                .filter(|r| r.url == request.url && r.begin == request.begin)
                .count();
            log.push(request.clone());
            attempt
        };
        let behavior = self.mirrors.lock().get(&request.url).cloned();
        let piece_size = self.piece_size;

        tokio::spawn(async move {
            let work = async {
                match behavior {
                    None => ErrorCode::IoException.code(),
                    Some(MirrorBehavior::NotFound) => HTTP_NOT_FOUND,
                    Some(MirrorBehavior::Status(code)) => code,
                    Some(MirrorBehavior::Hang) => std::future::pending().await,
                    Some(MirrorBehavior::Serve {
                        body,
                        fail,
                        hang,
                        unwritable,
                    }) => {
                        if hang.contains(&request.begin) {
                            std::future::pending::<()>().await;
                        }
                        if unwritable.get(&request.begin).is_some_and(|times| attempt < *times) {
                            let _ = events.send(WorkerEvent::Write {
                                worker: request.id,
                                offset: UNWRITABLE_OFFSET,
                                data: vec![0u8; 1],
                            });
                            std::future::pending::<()>().await;
                        }
                        match fail.get(&request.begin) {
                            Some(code) => *code,
                            None => serve(&request, &body, piece_size, &events).await,
                        }
                    }
                }
            };

            let code = tokio::select! {
                biased;
                _ = cancel.cancelled() => ErrorCode::Cancelled.code(),
                code = work => code,
            };

            let _ = events.send(WorkerEvent::Finish {
                worker: request.id,
                code,
                begin: request.begin,
                end: request.end,
            });
        })
    }
}
