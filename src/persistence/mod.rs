//! 断点续传持久化
//!
//! 每个下载文件旁边保存一份续传记录（`{文件}.resume`），
//! 记录文件大小、分片大小和已完成的分片。

pub mod resume;

pub use resume::{load_record, save_record, ResumeError, ResumeRecord};
