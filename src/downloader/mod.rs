//! 下载引擎
//!
//! - `worker`：单次 HTTP 请求的工作线程及其事件协议
//! - `strategy`：分片表、镜像选择、续传记录
//! - `memory_request` / `file_request`：两类请求的编排循环
//! - `request`：回调、句柄与请求工厂

pub mod chunk;
pub mod file_request;
pub mod memory_request;
pub mod request;
pub mod status;
pub mod strategy;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{calculate_chunks, Chunk, ChunkRange, ChunkState};
pub use file_request::FileRequestOptions;
pub use request::{
    Callbacks, DownloadContext, RequestError, RequestHandle, RequestOutcome, RequestSnapshot,
};
pub use status::{DownloadStatus, ErrorCode, Progress, RequestStatus, StatusCode};
pub use strategy::{ChunksDownloadStrategy, NextChunk, StrategyOptions};
pub use worker::{HttpWorkerFactory, ReqwestWorkerFactory, WorkerEvent, WorkerRequest};
