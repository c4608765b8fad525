use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::extractor::VideoProbe;
use crate::fingerprint::Fingerprint;
use crate::repository::VideoMetadataRepository;

/// 默认同时运行的解码任务数
pub const DEFAULT_WORKERS: usize = 2;

/// 一次查询的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    /// 文件不存在，或视频中没有这项信息
    NotFound,
    /// 解码失败，同一文件版本不会重试
    Failed(String),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }

    /// 对找到的值再取一个可选字段，取不到时视为 NotFound
    pub fn filter_map<U>(self, f: impl FnOnce(T) -> Option<U>) -> Lookup<U> {
        match self {
            Lookup::Found(value) => f(value).map_or(Lookup::NotFound, Lookup::Found),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(message) => Lookup::Failed(message),
        }
    }
}

/// 回调投递：把回调送回调用方所在的线程/事件循环执行
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, task: Callback);
}

impl Dispatcher for mpsc::UnboundedSender<Callback> {
    fn dispatch(&self, task: Callback) {
        if self.send(task).is_err() {
            debug!("[缓存] 回调接收方已关闭，丢弃回调");
        }
    }
}

/// 可取消的查询。丢弃时取消等待；已经开始的解码会继续完成并写入缓存。
pub struct Request<T> {
    handle: JoinHandle<Lookup<T>>,
}

impl<T> Request<T> {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl<T> Future for Request<T> {
    type Output = Lookup<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(lookup) => lookup,
            Err(e) if e.is_cancelled() => Lookup::Failed("请求已取消".to_string()),
            Err(e) => Lookup::Failed(e.to_string()),
        })
    }
}

impl<T> Drop for Request<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Entry<T> {
    fingerprint: Fingerprint,
    value: Lookup<T>,
}

type Pending<T> = Shared<BoxFuture<'static, Lookup<T>>>;

/// 异步缓存门面。
///
/// 内存中按路径保存最近一次结果（包括失败），文件指纹一致时直接返回；
/// 未命中时在有限的阻塞线程上调用仓库，同一指纹的并发请求共享一次解码。
pub struct MetadataCache {
    repository: Arc<VideoMetadataRepository>,
    probes: DashMap<String, Entry<VideoProbe>>,
    thumbnails: DashMap<String, Entry<PathBuf>>,
    probe_flights: DashMap<Fingerprint, Pending<VideoProbe>>,
    thumbnail_flights: DashMap<Fingerprint, Pending<PathBuf>>,
    permits: Arc<Semaphore>,
}

impl MetadataCache {
    pub fn new(repository: Arc<VideoMetadataRepository>, workers: usize) -> Self {
        Self {
            repository,
            probes: DashMap::new(),
            thumbnails: DashMap::new(),
            probe_flights: DashMap::new(),
            thumbnail_flights: DashMap::new(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn repository(&self) -> &Arc<VideoMetadataRepository> {
        &self.repository
    }

    pub async fn probe(&self, path: &Path) -> Lookup<VideoProbe> {
        self.resolve(path, &self.probes, &self.probe_flights, |repo, path| {
            repo.probe(&path).map(Some)
        })
        .await
    }

    /// 时长（毫秒）
    pub async fn duration(&self, path: &Path) -> Lookup<i64> {
        self.probe(path).await.filter_map(|p| p.duration_ms)
    }

    pub async fn dimensions(&self, path: &Path) -> Lookup<(u32, u32)> {
        self.probe(path).await.filter_map(|p| p.dimensions())
    }

    pub async fn thumbnail(&self, path: &Path) -> Lookup<PathBuf> {
        self.resolve(path, &self.thumbnails, &self.thumbnail_flights, |repo, path| {
            repo.thumbnail_path(&path)
        })
        .await
    }

    /// 只查内存，不触发解码
    pub fn cached_duration(&self, path: &Path) -> Option<Lookup<i64>> {
        let fp = Fingerprint::of(path).ok()?;
        let entry = self.probes.get(&fp.path)?;
        if entry.fingerprint != fp {
            return None;
        }
        let value = entry.value.clone();
        Some(value.filter_map(|p| p.duration_ms))
    }

    /// 阻塞版本，只能在允许阻塞的线程上调用
    pub fn duration_sync(&self, path: &Path) -> Option<i64> {
        if let Some(cached) = self.cached_duration(path) {
            return cached.found();
        }
        let fp = Fingerprint::of(path).ok()?;
        let value = to_lookup(path, self.repository.probe(path).map(Some));
        self.probes.insert(
            fp.path.clone(),
            Entry {
                fingerprint: fp,
                value: value.clone(),
            },
        );
        value.filter_map(|p| p.duration_ms).found()
    }

    /// 回调形式的时长查询。
    ///
    /// 命中内存时在当前线程立即调用回调并返回 true；否则在后台解码，结果经 `dispatcher` 投递。
    /// 未命中时必须在 tokio 运行时内调用。
    pub fn get_duration_with<D, F>(self: &Arc<Self>, path: PathBuf, dispatcher: D, callback: F) -> bool
    where
        D: Dispatcher,
        F: FnOnce(Option<i64>) + Send + 'static,
    {
        if let Some(cached) = self.cached_duration(&path) {
            callback(cached.found());
            return true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let duration = this.duration(&path).await.found();
            dispatcher.dispatch(Box::new(move || callback(duration)));
        });
        false
    }

    /// 可取消的时长查询，必须在 tokio 运行时内调用
    pub fn request_duration(self: &Arc<Self>, path: impl Into<PathBuf>) -> Request<i64> {
        let this = Arc::clone(self);
        let path = path.into();
        Request {
            handle: tokio::spawn(async move { this.duration(&path).await }),
        }
    }

    /// 可取消的缩略图查询，必须在 tokio 运行时内调用
    pub fn request_thumbnail(self: &Arc<Self>, path: impl Into<PathBuf>) -> Request<PathBuf> {
        let this = Arc::clone(self);
        let path = path.into();
        Request {
            handle: tokio::spawn(async move { this.thumbnail(&path).await }),
        }
    }

    /// 移除某个路径的内存结果
    pub fn invalidate(&self, path: &Path) {
        let key = crate::fingerprint::path_key(path);
        self.probes.remove(&key);
        self.thumbnails.remove(&key);
    }

    /// 清空内存结果，不影响持久化存储
    pub fn clear(&self) {
        let dropped = self.probes.len() + self.thumbnails.len();
        self.probes.clear();
        self.thumbnails.clear();
        debug!("🧹 [缓存] 清空内存缓存，共 {} 条", dropped);
    }

    pub fn len(&self) -> usize {
        self.probes.len() + self.thumbnails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn resolve<T, F>(
        &self,
        path: &Path,
        memory: &DashMap<String, Entry<T>>,
        flights: &DashMap<Fingerprint, Pending<T>>,
        work: F,
    ) -> Lookup<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Arc<VideoMetadataRepository>, PathBuf) -> Result<Option<T>> + Send + 'static,
    {
        let fp = match Fingerprint::of(path) {
            Ok(fp) => fp,
            Err(e) => {
                debug!("[缓存] 无法读取文件信息 {}: {}", path.display(), e);
                return Lookup::NotFound;
            }
        };

        if let Some(entry) = memory.get(&fp.path) {
            if entry.fingerprint == fp {
                return entry.value.clone();
            }
        }

        if !flights.contains_key(&fp) {
            // 同一路径旧版本的请求可能已被取消、无人等待
            flights.retain(|key, _| key.path != fp.path || *key == fp);
        }
        let pending = flights
            .entry(fp.clone())
            .or_insert_with(|| self.spawn_work(path.to_path_buf(), work))
            .value()
            .clone();
        let value = pending.await;

        // 先写入内存再返回，后续请求直接命中
        memory.insert(
            fp.path.clone(),
            Entry {
                fingerprint: fp.clone(),
                value: value.clone(),
            },
        );
        flights.remove(&fp);
        value
    }

    fn spawn_work<T, F>(&self, path: PathBuf, work: F) -> Pending<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Arc<VideoMetadataRepository>, PathBuf) -> Result<Option<T>> + Send + 'static,
    {
        let repository = Arc::clone(&self.repository);
        let permits = Arc::clone(&self.permits);
        async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Lookup::Failed("工作线程池已关闭".to_string());
            };
            let task_path = path.clone();
            match tokio::task::spawn_blocking(move || work(repository, task_path)).await {
                Ok(result) => to_lookup(&path, result),
                Err(e) => {
                    warn!("❌ [缓存] 解码任务异常 {}: {}", path.display(), e);
                    Lookup::Failed(e.to_string())
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn to_lookup<T>(path: &Path, result: Result<Option<T>>) -> Lookup<T> {
    match result {
        Ok(Some(value)) => Lookup::Found(value),
        Ok(None) => Lookup::NotFound,
        Err(e) => {
            if e.is_benign() {
                debug!("[缓存] {}: {}", path.display(), e);
            } else {
                warn!("⚠️  [缓存] 获取视频信息失败 {}: {}", path.display(), e);
            }
            Lookup::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::path_key;
    use crate::retriever::MediaInfo;
    use crate::testing::{self, FakeBackend, FakeVideo};
    use std::time::Duration;

    fn cache(dir: &Path, backend: &FakeBackend) -> Arc<MetadataCache> {
        let repository = Arc::new(testing::repository(dir, backend));
        Arc::new(MetadataCache::new(repository, DEFAULT_WORKERS))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_share_one_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 12_000);
        backend.set_delay(Duration::from_millis(150));
        let cache = cache(dir.path(), &backend);

        let (a, b) = tokio::join!(cache.duration(&clip), cache.duration(&clip));

        assert_eq!(a, Lookup::Found(12_000));
        assert_eq!(b, Lookup::Found(12_000));
        assert_eq!(backend.opens(), 1);
        assert_eq!(cache.repository().store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_hit_skips_repository() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 5_000);
        let cache = cache(dir.path(), &backend);

        assert_eq!(cache.duration(&clip).await, Lookup::Found(5_000));
        assert_eq!(cache.dimensions(&clip).await, Lookup::Found((640, 360)));

        // 删除持久化记录后仍从内存返回
        cache.repository().store().delete_by_path(&path_key(&clip)).unwrap();
        assert_eq!(cache.duration(&clip).await, Lookup::Found(5_000));
        assert_eq!(backend.opens(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.duration(&clip).await, Lookup::Found(5_000));
        assert_eq!(backend.opens(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = dir.path().join("broken.mp4");
        std::fs::write(&clip, b"x").unwrap();
        backend.add_video(clip.clone(), FakeVideo::new(MediaInfo::default()).failing());
        let cache = cache(dir.path(), &backend);

        assert!(matches!(cache.duration(&clip).await, Lookup::Failed(_)));
        assert!(matches!(cache.duration(&clip).await, Lookup::Failed(_)));
        assert_eq!(backend.opens(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let cache = cache(dir.path(), &backend);

        assert_eq!(cache.duration(&dir.path().join("gone.mp4")).await, Lookup::NotFound);
        assert_eq!(backend.opens(), 0);
    }

    #[tokio::test]
    async fn test_thumbnail_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 5_000);
        let cache = cache(dir.path(), &backend);

        let thumb = cache.request_thumbnail(clip.clone()).await.found().unwrap();
        assert!(thumb.exists());
        assert_eq!(cache.thumbnail(&clip).await, Lookup::Found(thumb));
        assert_eq!(backend.opens(), 1);
    }

    #[tokio::test]
    async fn test_callback_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 8_000);
        let cache = cache(dir.path(), &backend);
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback>();

        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let sender = result_tx.clone();
        let immediate = cache.get_duration_with(clip.clone(), tx.clone(), move |d| {
            sender.send(d).unwrap();
        });
        assert!(!immediate);

        // 回调在接收方线程上执行
        let callback = rx.recv().await.unwrap();
        callback();
        assert_eq!(result_rx.recv().unwrap(), Some(8_000));

        let immediate = cache.get_duration_with(clip, tx, move |d| {
            result_tx.send(d).unwrap();
        });
        assert!(immediate);
        assert_eq!(result_rx.recv().unwrap(), Some(8_000));
    }

    #[tokio::test]
    async fn test_request_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 8_000);
        backend.set_delay(Duration::from_millis(100));
        let cache = cache(dir.path(), &backend);

        let request = cache.request_duration(clip.clone());
        request.cancel();
        assert!(matches!(request.await, Lookup::Failed(_)));

        assert_eq!(cache.request_duration(clip).await, Lookup::Found(8_000));
    }

    #[tokio::test]
    async fn test_abandoned_flight_is_dropped_on_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 8_000);
        backend.set_delay(Duration::from_millis(100));
        let cache = cache(dir.path(), &backend);

        let request = cache.request_duration(clip.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.probe_flights.len(), 1);
        drop(request);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.probe_flights.len(), 1);

        // 文件被修改后，旧版本的等待项随新请求一起清理
        std::fs::File::options()
            .write(true)
            .open(&clip)
            .unwrap()
            .set_modified(std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000))
            .unwrap();
        assert_eq!(cache.duration(&clip).await, Lookup::Found(8_000));
        assert!(cache.probe_flights.is_empty());
    }

    #[test]
    fn test_duration_sync() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 3_000);
        let cache = cache(dir.path(), &backend);

        assert_eq!(cache.duration_sync(&clip), Some(3_000));
        assert_eq!(cache.cached_duration(&clip), Some(Lookup::Found(3_000)));
        assert_eq!(cache.duration_sync(&clip), Some(3_000));
        assert_eq!(backend.opens(), 1);
    }
}
