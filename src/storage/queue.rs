//! 下载队列

use std::collections::{HashMap, VecDeque};

use crate::storage::country_file::CountryId;
use crate::storage::queued_country::QueuedCountry;

/// 先进先出的下载队列
///
/// 同一个国家在队列中最多出现一次，由调用方在 `append` 前用 `contains` 保证
#[derive(Debug, Default)]
pub struct Queue {
    countries: VecDeque<QueuedCountry>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，并触发观察者的入队通知
    pub fn append(&mut self, country: QueuedCountry) {
        country.on_country_in_queue();
        self.countries.push_back(country);
    }

    /// 移除指定国家
    pub fn remove(&mut self, country_id: &str) -> Option<QueuedCountry> {
        let index = self.countries.iter().position(|c| c.country_id() == country_id)?;
        self.countries.remove(index)
    }

    pub fn pop_front(&mut self) -> Option<QueuedCountry> {
        self.countries.pop_front()
    }

    pub fn front(&self) -> Option<&QueuedCountry> {
        self.countries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut QueuedCountry> {
        self.countries.front_mut()
    }

    /// 清空队列，按原顺序返回被移除的项
    pub fn clear(&mut self) -> Vec<QueuedCountry> {
        self.countries.drain(..).collect()
    }

    pub fn contains(&self, country_id: &str) -> bool {
        self.countries.iter().any(|c| c.country_id() == country_id)
    }

    pub fn for_each_country(&self, mut f: impl FnMut(&QueuedCountry)) {
        self.countries.iter().for_each(|c| f(c));
    }

    pub fn for_each_country_mut(&mut self, mut f: impl FnMut(&mut QueuedCountry)) {
        self.countries.iter_mut().for_each(|c| f(c));
    }

    /// 按队列顺序返回全部 ID
    pub fn ids(&self) -> Vec<CountryId> {
        self.countries.iter().map(|c| c.country_id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }
}

/// 后台下载队列中的一项
#[derive(Debug, Clone)]
pub struct TaskData<T> {
    pub queued_country: QueuedCountry,
    /// 平台后台任务句柄，任务真正创建后才有
    pub task_info: Option<T>,
}

/// 平台后台下载队列
///
/// 传输由操作系统负责，这里只记录每个国家对应的平台任务句柄。
/// 移除条目不会取消平台任务
#[derive(Debug)]
pub struct BackgroundDownloaderQueue<T> {
    entries: HashMap<CountryId, TaskData<T>>,
}

impl<T> Default for BackgroundDownloaderQueue<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> BackgroundDownloaderQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，并触发观察者的入队通知
    pub fn append(&mut self, country: QueuedCountry) {
        country.on_country_in_queue();
        let id = country.country_id().clone();
        self.entries.insert(
            id,
            TaskData {
                queued_country: country,
                task_info: None,
            },
        );
    }

    /// 关联平台任务句柄，条目不存在时返回 false
    pub fn set_task_info_for_country(&mut self, country_id: &str, task_info: T) -> bool {
        match self.entries.get_mut(country_id) {
            Some(entry) => {
                entry.task_info = Some(task_info);
                true
            }
            None => false,
        }
    }

    pub fn get_task_info_for_country(&self, country_id: &str) -> Option<&T> {
        self.entries.get(country_id)?.task_info.as_ref()
    }

    pub fn get(&self, country_id: &str) -> Option<&TaskData<T>> {
        self.entries.get(country_id)
    }

    pub fn remove(&mut self, country_id: &str) -> Option<TaskData<T>> {
        self.entries.remove(country_id)
    }

    pub fn contains(&self, country_id: &str) -> bool {
        self.entries.contains_key(country_id)
    }

    pub fn for_each_country(&self, mut f: impl FnMut(&QueuedCountry)) {
        self.entries.values().for_each(|e| f(&e.queued_country));
    }

    /// 清空并返回全部条目（调用方负责取消平台任务）
    pub fn clear(&mut self) -> Vec<TaskData<T>> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::country_file::{CountryFile, MapFileType};
    use crate::storage::diffs::DiffsDataSource;
    use crate::storage::queued_country::QueuedCountryObserver;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct QueuedRecorder(Mutex<Vec<String>>);

    impl QueuedCountryObserver for QueuedRecorder {
        fn on_country_in_queue(&self, country: &QueuedCountry) {
            self.0.lock().push(country.country_id().clone());
        }
    }

    fn country(id: &str, observer: &Arc<QueuedRecorder>) -> QueuedCountry {
        let mut c = QueuedCountry::new(
            id,
            CountryFile::new(id, 100, ""),
            MapFileType::Map,
            1,
            "/data",
            Arc::new(DiffsDataSource::new()),
        );
        c.subscribe(observer.clone());
        c
    }

    #[test]
    fn test_queue_fifo() {
        let observer = Arc::new(QueuedRecorder::default());
        let mut queue = Queue::new();
        queue.append(country("A", &observer));
        queue.append(country("B", &observer));
        queue.append(country("C", &observer));

        assert_eq!(*observer.0.lock(), vec!["A", "B", "C"]);
        assert_eq!(queue.ids(), vec!["A", "B", "C"]);
        assert!(queue.contains("B"));

        assert_eq!(queue.remove("B").unwrap().country_id(), "B");
        assert!(queue.remove("B").is_none());
        assert_eq!(queue.pop_front().unwrap().country_id(), "A");
        assert_eq!(queue.front().unwrap().country_id(), "C");

        let mut seen = Vec::new();
        queue.for_each_country(|c| seen.push(c.country_id().clone()));
        assert_eq!(seen, vec!["C"]);

        let cleared: Vec<_> = queue.clear().iter().map(|c| c.country_id().clone()).collect();
        assert_eq!(cleared, vec!["C"]);
        assert!(queue.is_empty());
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_background_queue() {
        let observer = Arc::new(QueuedRecorder::default());
        let mut queue: BackgroundDownloaderQueue<u64> = BackgroundDownloaderQueue::new();
        queue.append(country("A", &observer));
        queue.append(country("B", &observer));
        assert_eq!(queue.len(), 2);

        assert!(queue.get_task_info_for_country("A").is_none());
        assert!(queue.set_task_info_for_country("A", 42));
        assert!(!queue.set_task_info_for_country("Z", 1));
        assert_eq!(queue.get_task_info_for_country("A"), Some(&42));

        let removed = queue.remove("A").unwrap();
        assert_eq!(removed.task_info, Some(42));
        assert!(!queue.contains("A"));

        let rest = queue.clear();
        assert_eq!(rest.len(), 1);
        assert!(queue.is_empty());
    }
}
