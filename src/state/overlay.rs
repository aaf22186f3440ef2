//! Confirmed / Pending overlay
//!
//! # Design Decision
//!
//! 확인된 레저 상태와 낙관적 UI 상태를 하나의 레코드에 섞지 않음:
//!
//! ```text
//! Tracked<T> = Confirmed(T)
//!            | Pending { confirmed: T, proposed: T, since }
//! ```
//!
//! - per-id 토큰(tokio Mutex)을 왕복 동안 보유 → 같은 id에 두 번째 전이 불가
//! - `PendingGuard`가 drop되면(취소) overlay를 되돌리고 id를 stale로 표시
//! - stale id는 다음 전이 전에 확인된 상태를 재조회

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 확인된 상태 또는 확인 대기 중인 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tracked<T> {
    Confirmed(T),
    Pending {
        confirmed: T,
        proposed: T,
        since: DateTime<Utc>,
    },
}

impl<T> Tracked<T> {
    /// 마지막으로 확인된 레저 상태
    pub fn confirmed(&self) -> &T {
        match self {
            Tracked::Confirmed(value) => value,
            Tracked::Pending { confirmed, .. } => confirmed,
        }
    }

    /// UI 표시용 (대기 중이면 제안 상태)
    pub fn optimistic(&self) -> &T {
        match self {
            Tracked::Confirmed(value) => value,
            Tracked::Pending { proposed, .. } => proposed,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Tracked::Pending { .. })
    }

    pub fn pending_since(&self) -> Option<DateTime<Utc>> {
        match self {
            Tracked::Confirmed(_) => None,
            Tracked::Pending { since, .. } => Some(*since),
        }
    }
}

#[derive(Debug)]
struct OverlayInner<K, V> {
    entries: HashMap<K, Tracked<V>>,
    stale: HashSet<K>,
}

/// id별 Tracked 캐시 (single-writer-per-id)
#[derive(Debug)]
pub struct Overlay<K, V> {
    inner: Arc<RwLock<OverlayInner<K, V>>>,
}

impl<K, V> Clone for Overlay<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V> Default for Overlay<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(OverlayInner {
                entries: HashMap::new(),
                stale: HashSet::new(),
            })),
        }
    }
}

impl<K, V> Overlay<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmed(&self, key: K) -> Option<V> {
        self.read(|inner| inner.entries.get(&key).map(|t| t.confirmed().clone()))
    }

    pub fn view(&self, key: K) -> Option<Tracked<V>> {
        self.read(|inner| inner.entries.get(&key).cloned())
    }

    /// 확인된 상태 기록 (overlay 대체, stale 해제)
    pub fn confirm(&self, key: K, value: V) {
        self.write(|inner| {
            inner.entries.insert(key, Tracked::Confirmed(value));
            inner.stale.remove(&key);
        });
    }

    pub fn is_stale(&self, key: K) -> bool {
        self.read(|inner| inner.stale.contains(&key))
    }

    pub fn keys(&self) -> Vec<K> {
        self.read(|inner| inner.entries.keys().copied().collect())
    }

    /// 낙관적 전이 시작
    ///
    /// 호출자는 해당 id의 토큰을 보유한 상태에서 방금 읽은 확인 상태를 넘김
    pub fn begin(&self, key: K, confirmed: V, proposed: V) -> PendingGuard<K, V> {
        self.write(|inner| {
            inner.entries.insert(
                key,
                Tracked::Pending {
                    confirmed,
                    proposed: proposed.clone(),
                    since: Utc::now(),
                },
            );
        });
        PendingGuard {
            overlay: self.clone(),
            key,
            proposed,
            armed: true,
        }
    }

    /// 대기 상태 제거, 확인된 상태로 복귀
    fn revert(&self, key: K, stale: bool) {
        self.write(|inner| {
            if let Some(Tracked::Pending { confirmed, .. }) = inner.entries.get(&key) {
                let confirmed = confirmed.clone();
                inner.entries.insert(key, Tracked::Confirmed(confirmed));
            }
            if stale {
                inner.stale.insert(key);
            }
        });
    }

    fn read<R>(&self, f: impl FnOnce(&OverlayInner<K, V>) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut OverlayInner<K, V>) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

/// 진행 중인 낙관적 전이
///
/// 명시적으로 해소되지 않고 drop되면 취소로 간주:
/// overlay를 지우고 id를 stale로 표시 (결과가 나중에 반영될 수 있음)
#[must_use = "dropping the guard cancels the pending transition"]
pub struct PendingGuard<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    overlay: Overlay<K, V>,
    key: K,
    proposed: V,
    armed: bool,
}

impl<K, V> PendingGuard<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    pub fn proposed(&self) -> &V {
        &self.proposed
    }

    /// 오라클이 확인한 값으로 확정
    pub fn confirm(mut self, value: V) {
        self.armed = false;
        self.overlay.confirm(self.key, value);
    }

    /// 제안 상태 그대로 확정
    pub fn confirm_proposed(mut self) {
        self.armed = false;
        let value = self.proposed.clone();
        self.overlay.confirm(self.key, value);
    }

    /// 확인 상태가 이미 별도로 기록됨 (overlay 변경 없이 해제)
    pub fn settle(mut self) {
        self.armed = false;
    }

    /// 확정적 실패: 확인된 상태 유지
    pub fn reject(mut self) {
        self.armed = false;
        self.overlay.revert(self.key, false);
    }

    /// 결과 불명 (네트워크 단절 등): 되돌리고 재조회 대상으로 표시
    pub fn abandon(mut self) {
        self.armed = false;
        self.overlay.revert(self.key, true);
    }
}

impl<K, V> Drop for PendingGuard<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("pending transition dropped before resolution; marking for reconciliation");
            self.overlay.revert(self.key, true);
        }
    }
}

/// per-id 상호배제 토큰
#[derive(Debug)]
pub struct IdLocks<K> {
    tokens: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for IdLocks<K> {
    fn default() -> Self {
        Self { tokens: Mutex::new(HashMap::new()) }
    }
}

impl<K> IdLocks<K>
where
    K: Eq + Hash + Copy,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 토큰 획득 (같은 id의 이전 왕복이 끝날 때까지 대기)
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let token = {
            let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
            tokens.entry(key).or_default().clone()
        };
        token.lock_owned().await
    }

    pub fn is_held(&self, key: K) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.get(&key).map(|t| t.try_lock().is_err()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tracked_views() {
        let tracked = Tracked::Pending { confirmed: 1, proposed: 2, since: Utc::now() };
        assert_eq!(*tracked.confirmed(), 1);
        assert_eq!(*tracked.optimistic(), 2);
        assert!(tracked.is_pending());

        let tracked = Tracked::Confirmed(3);
        assert_eq!(*tracked.optimistic(), 3);
        assert!(tracked.pending_since().is_none());
    }

    #[test]
    fn test_pending_never_replaces_confirmed() {
        let overlay: Overlay<u64, &str> = Overlay::new();
        overlay.confirm(1, "requested");

        let guard = overlay.begin(1, "requested", "funded");
        assert_eq!(overlay.confirmed(1), Some("requested"));
        assert!(overlay.view(1).unwrap().is_pending());

        guard.confirm_proposed();
        assert_eq!(overlay.view(1), Some(Tracked::Confirmed("funded")));
    }

    #[test]
    fn test_reject_restores_confirmed_without_stale() {
        let overlay: Overlay<u64, &str> = Overlay::new();
        overlay.confirm(1, "requested");

        overlay.begin(1, "requested", "funded").reject();
        assert_eq!(overlay.view(1), Some(Tracked::Confirmed("requested")));
        assert!(!overlay.is_stale(1));
    }

    #[test]
    fn test_dropped_guard_marks_stale() {
        let overlay: Overlay<u64, &str> = Overlay::new();
        overlay.confirm(1, "requested");

        {
            let _guard = overlay.begin(1, "requested", "funded");
        }
        assert_eq!(overlay.view(1), Some(Tracked::Confirmed("requested")));
        assert!(overlay.is_stale(1));

        // 재조회 결과 확정 시 stale 해제
        overlay.confirm(1, "funded");
        assert!(!overlay.is_stale(1));
    }

    #[test]
    fn test_settle_keeps_external_confirmation() {
        let overlay: Overlay<u64, &str> = Overlay::new();
        overlay.confirm(1, "registered");

        let guard = overlay.begin(1, "registered", "locked");
        overlay.confirm(1, "locked");
        guard.settle();
        assert_eq!(overlay.view(1), Some(Tracked::Confirmed("locked")));
        assert!(!overlay.is_stale(1));
    }

    #[tokio::test]
    async fn test_id_lock_serializes_same_id() {
        let locks = Arc::new(IdLocks::<u64>::new());

        let first = locks.acquire(1).await;
        assert!(locks.is_held(1));
        assert!(!locks.is_held(2));

        // 다른 id는 독립적
        let _other = locks.acquire(2).await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _token = locks2.acquire(1).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }
}
