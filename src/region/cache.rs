//! 区域句柄缓存
//!
//! ```text
//! slots: Mutex<HashMap<Key, Arc<Mutex<Slot>>>>
//!          │                          │
//!          │ 只在查找/移除时短暂持有      │ 按键串行：创建、访问、关闭
//!          ▼                          ▼
//!   不同的键互不阻塞             同一个键永远只有一个打开的句柄
//! ```
//!
//! 常驻句柄数超过 `hard_cap` 后，由触发的那次调用关闭所有空闲句柄。
//! 同一时刻只允许一次清理，清理进行中的请求直接跳过。
//! 加锁顺序固定为 slot → map。关闭之后不会再插入新的 slot。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{ConvertError, Result};
use crate::region::{Region, RegionProvider};

#[derive(Debug, Clone, Copy)]
pub struct RegionCacheConfig {
    /// 常驻句柄上限
    pub hard_cap: usize,
}

impl Default for RegionCacheConfig {
    fn default() -> Self { Self { hard_cap: 64 } }
}

struct Slot<R> {
    region:  Option<R>,
    /// 已从 map 中移除；持有旧 Arc 的调用方需要重新查找
    evicted: bool,
}

type SlotRef<R> = Arc<Mutex<Slot<R>>>;

pub struct RegionCache<P: RegionProvider> {
    provider: P,
    config:   RegionCacheConfig,
    slots:    Mutex<HashMap<P::Key, SlotRef<P::Region>>>,
    sweeping: Mutex<()>,
    closed:   AtomicBool,
}

impl<P: RegionProvider> RegionCache<P> {
    pub fn new(provider: P, config: RegionCacheConfig) -> Self {
        Self {
            provider,
            config,
            slots:    Mutex::new(HashMap::new()),
            sweeping: Mutex::new(()),
            closed:   AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &P { &self.provider }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvertError::Closed("region cache"));
        }
        Ok(())
    }

    /// 取出或插入 `key` 的 slot。
    ///
    /// `close` 先置位 `closed` 再清空 map，这里在 map 锁内复查，
    /// 因此关闭后插入的 slot 不可能存在。
    fn slot(&self, key: P::Key) -> Result<SlotRef<P::Region>> {
        let mut slots = self.slots.lock();
        self.check_open()?;
        Ok(slots
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Slot { region: None, evicted: false })))
            .clone())
    }

    /// 仅当 map 中仍是同一个 slot 时才移除
    fn remove_slot(&self, key: P::Key, slot: &SlotRef<P::Region>) {
        let mut slots = self.slots.lock();
        if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&key);
        }
    }

    /// 在 `key` 对应的区域上执行 `f`。
    ///
    /// 区域不存在且 `can_create` 为 false 时返回 `Ok(None)`，不会留下句柄。
    /// `f` 执行期间持有该键的锁，`f` 内不能再访问同一个键。
    pub fn with_region<T>(
        &self,
        key: P::Key,
        can_create: bool,
        f: impl FnOnce(&mut P::Region) -> Result<T>,
    ) -> Result<Option<T>> {
        loop {
            let slot = self.slot(key)?;
            let mut guard = slot.lock();
            if guard.evicted {
                continue;
            }
            if guard.region.is_none() {
                match self.provider.open(key, can_create) {
                    Ok(Some(region)) => guard.region = Some(region),
                    Ok(None) => {
                        guard.evicted = true;
                        self.remove_slot(key, &slot);
                        return Ok(None);
                    }
                    Err(e) => {
                        guard.evicted = true;
                        self.remove_slot(key, &slot);
                        return Err(e);
                    }
                }
            }
            let result = match guard.region.as_mut() {
                Some(region) => f(region),
                None => continue,
            };
            drop(guard);

            // 清理失败只涉及被清理的其他句柄，不改变本次调用的结果
            if self.resident() > self.config.hard_cap {
                if let Err(e) = self.clear_idle() {
                    tracing::warn!(error = %e, "idle region sweep failed");
                }
            }
            return result.map(Some);
        }
    }

    pub fn with_existing_region<T>(
        &self,
        key: P::Key,
        f: impl FnOnce(&mut P::Region) -> Result<T>,
    ) -> Result<Option<T>> {
        self.with_region(key, false, f)
    }

    /// 来源中存在的全部区域坐标（不论是否已打开）
    pub fn region_keys(&self) -> Result<Vec<P::Key>> {
        self.check_open()?;
        self.provider.region_keys()
    }

    /// 当前常驻的句柄数
    pub fn resident(&self) -> usize { self.slots.lock().len() }

    /// 关闭所有空闲句柄；已有清理在进行时直接返回。
    ///
    /// 正在被访问的句柄跳过。单个句柄关闭失败不影响其余句柄，返回第一个错误。
    pub fn clear_idle(&self) -> Result<()> {
        let Some(_sweep) = self.sweeping.try_lock() else {
            return Ok(());
        };
        let snapshot: Vec<_> = self.slots.lock()
            .iter()
            .map(|(&k, s)| (k, s.clone()))
            .collect();

        let mut closed = 0usize;
        let mut first_err = None;
        for (key, slot) in snapshot {
            let Some(mut guard) = slot.try_lock() else { continue };
            if guard.evicted {
                continue;
            }
            if let Some(mut region) = guard.region.take() {
                closed += 1;
                if let Err(e) = region.close() {
                    tracing::warn!(region = %key, error = %e, "failed to close idle region");
                    first_err.get_or_insert(e);
                }
            }
            guard.evicted = true;
            self.remove_slot(key, &slot);
        }
        tracing::debug!(closed, "swept idle regions");
        first_err.map_or(Ok(()), Err)
    }

    /// 强制关闭所有句柄和底层 provider；只能调用一次
    pub fn close(&self) -> Result<()> {
        let _sweep = self.sweeping.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConvertError::Closed("region cache"));
        }
        let slots: Vec<_> = self.slots.lock().drain().collect();

        let mut first_err = None;
        for (key, slot) in slots {
            let mut guard = slot.lock();
            guard.evicted = true;
            if let Some(mut region) = guard.region.take() {
                if let Err(e) = region.close() {
                    tracing::error!(region = %key, error = %e, "failed to close region");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.provider.close() {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RegionKey;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Shared {
        existing:  Mutex<HashSet<RegionKey>>,
        live:      Mutex<HashSet<RegionKey>>,
        bad_close: Mutex<HashSet<RegionKey>>,
        opens:     AtomicUsize,
        duplicate: AtomicBool,
    }

    struct FakeRegion {
        key:     RegionKey,
        shared:  Arc<Shared>,
        entries: BTreeMap<usize, Vec<u8>>,
    }

    impl Region for FakeRegion {
        fn read(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
            Ok(self.entries.get(&index).cloned())
        }
        fn write(&mut self, index: usize, data: &[u8]) -> Result<()> {
            self.entries.insert(index, data.to_vec());
            Ok(())
        }
        fn entries(&self) -> Vec<usize> { self.entries.keys().copied().collect() }
        fn flush(&mut self) -> Result<()> { Ok(()) }
        fn close(&mut self) -> Result<()> {
            self.shared.live.lock().remove(&self.key);
            if self.shared.bad_close.lock().contains(&self.key) {
                return Err(ConvertError::Storage(format!("cannot close {}", self.key)));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeProvider(Arc<Shared>);

    impl RegionProvider for FakeProvider {
        type Key = RegionKey;
        type Region = FakeRegion;

        fn open(&self, key: RegionKey, create: bool) -> Result<Option<FakeRegion>> {
            let mut existing = self.0.existing.lock();
            if !existing.contains(&key) {
                if !create {
                    return Ok(None);
                }
                existing.insert(key);
            }
            self.0.opens.fetch_add(1, Ordering::SeqCst);
            if !self.0.live.lock().insert(key) {
                self.0.duplicate.store(true, Ordering::SeqCst);
            }
            Ok(Some(FakeRegion { key, shared: self.0.clone(), entries: BTreeMap::new() }))
        }

        fn region_keys(&self) -> Result<Vec<RegionKey>> {
            let mut keys: Vec<_> = self.0.existing.lock().iter().copied().collect();
            keys.sort();
            Ok(keys)
        }

        fn close(&self) -> Result<()> { Ok(()) }
    }

    fn cache(hard_cap: usize) -> (RegionCache<FakeProvider>, Arc<Shared>) {
        let provider = FakeProvider::default();
        let shared = provider.0.clone();
        (RegionCache::new(provider, RegionCacheConfig { hard_cap }), shared)
    }

    #[test]
    fn absent_region_is_not_created_until_asked() {
        let (cache, shared) = cache(8);
        let key = RegionKey::new(1, 2);

        assert_eq!(cache.with_existing_region(key, |_| Ok(())).unwrap(), None);
        assert_eq!(cache.resident(), 0);
        assert_eq!(shared.opens.load(Ordering::SeqCst), 0);

        cache.with_region(key, true, |r| r.write(3, b"abc")).unwrap().unwrap();
        let read = cache.with_existing_region(key, |r| r.read(3)).unwrap();
        assert_eq!(read, Some(Some(b"abc".to_vec())));
        assert_eq!(cache.region_keys().unwrap(), vec![key]);
    }

    #[test]
    fn resident_never_exceeds_hard_cap_after_a_call() {
        let (cache, shared) = cache(4);
        for i in 0..50 {
            cache.with_region(RegionKey::new(i, -i), true, |_| Ok(())).unwrap();
            assert!(cache.resident() <= 4);
        }
        assert!(shared.live.lock().len() <= 4);
    }

    #[test]
    fn clear_idle_closes_everything_not_in_use() {
        let (cache, shared) = cache(64);
        for i in 0..10 {
            cache.with_region(RegionKey::new(i, 0), true, |_| Ok(())).unwrap();
        }
        assert_eq!(cache.resident(), 10);
        cache.clear_idle().unwrap();
        assert_eq!(cache.resident(), 0);
        assert!(shared.live.lock().is_empty());
    }

    #[test]
    fn closed_cache_fails_fast() {
        let (cache, shared) = cache(64);
        cache.with_region(RegionKey::new(0, 0), true, |_| Ok(())).unwrap();
        cache.close().unwrap();

        assert!(shared.live.lock().is_empty());
        assert!(matches!(cache.with_region(RegionKey::new(0, 0), true, |_| Ok(())), Err(ConvertError::Closed(_))));
        assert!(matches!(cache.region_keys(), Err(ConvertError::Closed(_))));
        assert!(matches!(cache.close(), Err(ConvertError::Closed(_))));
    }

    #[test]
    fn concurrent_access_never_duplicates_a_handle() {
        let (cache, shared) = cache(3);
        std::thread::scope(|s| {
            for t in 0..8 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..200 {
                        let key = RegionKey::new((i + t) % 6, 0);
                        cache.with_region(key, true, |r| r.write(t as usize, &[i as u8])).unwrap();
                    }
                });
            }
        });
        assert!(!shared.duplicate.load(Ordering::SeqCst));
        cache.clear_idle().unwrap();
        assert_eq!(cache.resident(), 0);
    }

    #[test]
    fn no_slot_is_inserted_after_close() {
        let (cache, shared) = cache(64);
        cache.close().unwrap();
        assert!(matches!(cache.slot(RegionKey::new(2, 2)), Err(ConvertError::Closed(_))));
        assert_eq!(cache.resident(), 0);
        assert_eq!(shared.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_sweep_does_not_fail_the_caller() {
        let (cache, shared) = cache(1);
        let stuck = RegionKey::new(0, 0);
        shared.bad_close.lock().insert(stuck);

        cache.with_region(stuck, true, |r| r.write(0, b"a")).unwrap().unwrap();
        let written = cache.with_region(RegionKey::new(1, 0), true, |r| r.write(0, b"b")).unwrap();
        assert_eq!(written, Some(()));
        assert_eq!(cache.resident(), 0);
        assert!(matches!(cache.clear_idle(), Ok(())));
    }
}
