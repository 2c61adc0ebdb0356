//! 差分数据源
//!
//! 记录服务端为哪些国家提供差分以及差分的大小和版本，
//! 由存储层和下载队列共享。

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::country_file::{CountryId, DataVersion};

/// 差分方案状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    /// 尚未获取
    Undefined,
    /// 不可用
    NotAvailable,
    /// 可用
    Available,
}

/// 单个国家的差分信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffInfo {
    /// 差分文件大小
    pub size: u64,
    /// 差分所基于的旧数据版本
    pub version: DataVersion,
    /// 是否已应用
    #[serde(default)]
    pub is_applied: bool,
}

impl DiffInfo {
    pub fn new(size: u64, version: DataVersion) -> Self {
        Self {
            size,
            version,
            is_applied: false,
        }
    }
}

#[derive(Debug)]
struct DiffsState {
    status: DiffStatus,
    diffs: HashMap<CountryId, DiffInfo>,
}

/// 差分数据源（线程安全）
#[derive(Debug)]
pub struct DiffsDataSource {
    state: RwLock<DiffsState>,
}

impl Default for DiffsDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffsDataSource {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DiffsState {
                status: DiffStatus::Undefined,
                diffs: HashMap::new(),
            }),
        }
    }

    /// 当前状态
    pub fn status(&self) -> DiffStatus {
        self.state.read().status
    }

    /// 设置差分信息，空表示服务端没有提供任何差分
    pub fn set_diff_info(&self, diffs: HashMap<CountryId, DiffInfo>) {
        let mut state = self.state.write();
        state.status = if diffs.is_empty() {
            DiffStatus::NotAvailable
        } else {
            DiffStatus::Available
        };
        info!("差分方案: {:?}, {} 个国家", state.status, diffs.len());
        state.diffs = diffs;
    }

    /// 从服务端 JSON 加载：`{"CountryId": {"size": 123, "version": 240101}, ...}`
    pub fn load_from_json(&self, json: &str) -> Result<(), serde_json::Error> {
        let diffs: HashMap<CountryId, DiffInfo> = serde_json::from_str(json)?;
        self.set_diff_info(diffs);
        Ok(())
    }

    fn available_diff<T>(&self, country: &str, f: impl FnOnce(&DiffInfo) -> T) -> Option<T> {
        let state = self.state.read();
        if state.status != DiffStatus::Available {
            return None;
        }
        state.diffs.get(country).filter(|d| !d.is_applied).map(f)
    }

    /// 是否有可用（且未应用）的差分
    pub fn has_diff_for(&self, country: &str) -> bool {
        self.available_diff(country, |_| ()).is_some()
    }

    /// 差分大小
    pub fn size_for(&self, country: &str) -> Option<u64> {
        self.available_diff(country, |d| d.size)
    }

    /// 差分版本
    pub fn version_for(&self, country: &str) -> Option<DataVersion> {
        self.available_diff(country, |d| d.version)
    }

    /// 标记差分已应用
    pub fn mark_as_applied(&self, country: &str) {
        if let Some(diff) = self.state.write().diffs.get_mut(country) {
            diff.is_applied = true;
        }
    }

    /// 移除某个国家的差分，全部移除后方案变为不可用
    pub fn remove_diff_for_country(&self, country: &str) {
        let mut state = self.state.write();
        state.diffs.remove(country);
        if state.diffs.is_empty() && state.status == DiffStatus::Available {
            state.status = DiffStatus::NotAvailable;
        }
    }

    /// 放弃差分方案
    pub fn abort_diff_scheme(&self) {
        let mut state = self.state.write();
        if state.status != DiffStatus::NotAvailable {
            warn!("放弃差分方案，之后全部下载完整地图");
        }
        state.status = DiffStatus::NotAvailable;
        state.diffs.clear();
    }
}
