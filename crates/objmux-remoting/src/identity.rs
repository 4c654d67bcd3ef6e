//! Per-connection object identity.
//!
//! The lending side keeps every object it has sent in a [`LentTable`],
//! strongly, until the peer reports the proxy collected. The receiving side
//! keeps proxies in a [`ProxyTable`] that only holds them weakly; dropping
//! the last proxy handle nudges the session's sweeper, which reports the
//! dead entries back to the lender.
//!
//! Both sides count descriptors per id: the lender every `Wrapped` or
//! `Reference` it sends, the receiver every one it materializes. A collect
//! report carries the receiver's count and the lender only releases the id
//! when nothing it sent is still in flight. Until the lender confirms, the
//! receiver keeps the dead entry so a late `Reference` can still be
//! materialized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use crate::object::{LocalDelegate, RemoteObject};
use crate::proxy::{ProxyInner, ProxyMeta};
use crate::wire::Collected;

/// Something this side lent to the peer.
#[derive(Clone)]
pub(crate) enum Lent {
    Object(Arc<dyn RemoteObject>),
    Delegate(Arc<LocalDelegate>),
}

impl Lent {
    fn addr(&self) -> usize {
        match self {
            Lent::Object(object) => Arc::as_ptr(object) as *const () as usize,
            Lent::Delegate(delegate) => Arc::as_ptr(delegate) as usize,
        }
    }
}

/// Outcome of [`LentTable::get_or_wrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wrap {
    pub id: i64,
    /// First time this object is sent: the peer needs a full descriptor.
    pub fresh: bool,
}

struct LentEntry {
    lent: Lent,
    /// Descriptors sent for this id.
    sent: AtomicU64,
}

struct LentState {
    next_id: i64,
    by_id: HashMap<i64, LentEntry>,
    by_addr: HashMap<usize, i64>,
}

/// Strong id table of objects lent to the peer.
pub(crate) struct LentTable {
    state: RwLock<LentState>,
}

impl LentTable {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(LentState {
                next_id: 1,
                by_id: HashMap::new(),
                by_addr: HashMap::new(),
            }),
        }
    }

    /// Id for `lent`, allocating one the first time it is seen. Every call
    /// counts as one descriptor sent.
    pub(crate) fn get_or_wrap(&self, lent: &Lent) -> Wrap {
        let addr = lent.addr();
        {
            let state = self.read();
            if let Some(id) = Self::mark_sent(&state, addr) {
                return Wrap { id, fresh: false };
            }
        }

        let mut state = self.write();
        if let Some(id) = Self::mark_sent(&state, addr) {
            return Wrap { id, fresh: false };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.by_addr.insert(addr, id);
        state.by_id.insert(
            id,
            LentEntry {
                lent: lent.clone(),
                sent: AtomicU64::new(1),
            },
        );
        Wrap { id, fresh: true }
    }

    fn mark_sent(state: &LentState, addr: usize) -> Option<i64> {
        let id = *state.by_addr.get(&addr)?;
        state.by_id.get(&id)?.sent.fetch_add(1, Ordering::SeqCst);
        Some(id)
    }

    pub(crate) fn get(&self, id: i64) -> Option<Lent> {
        self.read().by_id.get(&id).map(|entry| entry.lent.clone())
    }

    /// Release the objects whose every sent descriptor the peer has seen.
    /// Unknown ids are ignored, so repeated reports are harmless. Returns
    /// the released ids.
    pub(crate) fn collect(&self, reports: &[Collected]) -> Vec<i64> {
        let released: Vec<(i64, Lent)> = {
            let mut state = self.write();
            let mut released = Vec::new();
            for report in reports {
                let settled = state
                    .by_id
                    .get(&report.id)
                    .is_some_and(|entry| entry.sent.load(Ordering::SeqCst) == report.received);
                if settled {
                    released.extend(Self::remove(&mut state, report.id));
                }
            }
            released
        };
        // Objects are dropped outside the lock; their destructors may call
        // back into the session.
        released.into_iter().map(|(id, _)| id).collect()
    }

    /// Take back descriptors that never left this side. An id whose count
    /// drops to zero was never described to the peer and is released.
    pub(crate) fn unsend(&self, ids: &[i64]) {
        let released: Vec<(i64, Lent)> = {
            let mut state = self.write();
            let mut released = Vec::new();
            for &id in ids {
                let Some(entry) = state.by_id.get(&id) else {
                    continue;
                };
                let sent = entry.sent.load(Ordering::SeqCst).saturating_sub(1);
                entry.sent.store(sent, Ordering::SeqCst);
                if sent == 0 {
                    released.extend(Self::remove(&mut state, id));
                }
            }
            released
        };
        drop(released);
    }

    /// Drop one entry regardless of its count.
    pub(crate) fn forget(&self, id: i64) {
        let released = Self::remove(&mut self.write(), id);
        drop(released);
    }

    fn remove(state: &mut LentState, id: i64) -> Option<(i64, Lent)> {
        let entry = state.by_id.remove(&id)?;
        state.by_addr.remove(&entry.lent.addr());
        Some((id, entry.lent))
    }

    pub(crate) fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Forget everything, returning the entries so the caller can drop them
    /// outside the lock.
    pub(crate) fn clear(&self) -> Vec<Lent> {
        let mut state = self.write();
        state.by_addr.clear();
        state.by_id.drain().map(|(_, entry)| entry.lent).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
struct ProxyEntry {
    proxy: Weak<ProxyInner>,
    /// Kept until the lender confirms the release so a `Reference` arriving
    /// after the last handle dropped can still be materialized.
    meta: Arc<ProxyMeta>,
    /// Descriptors received for this id. Shared by every snapshot.
    received: Arc<AtomicU64>,
}

impl ProxyEntry {
    fn new(proxy: &Arc<ProxyInner>, meta: Arc<ProxyMeta>, received: u64) -> Self {
        Self {
            proxy: Arc::downgrade(proxy),
            meta,
            received: Arc::new(AtomicU64::new(received)),
        }
    }

    fn note_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    fn is_dead(&self) -> bool {
        self.proxy.strong_count() == 0
    }
}

type ProxyMap = HashMap<i64, ProxyEntry>;

/// Weak id table of proxies for objects the peer lent us.
///
/// Readers take a snapshot of the map; writers copy it only while a
/// snapshot is outstanding.
pub(crate) struct ProxyTable {
    entries: RwLock<Arc<ProxyMap>>,
}

impl ProxyTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn snapshot(&self) -> Arc<ProxyMap> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update<R>(&self, f: impl FnOnce(&mut ProxyMap) -> R) -> R {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }

    /// The proxy for a `Wrapped` descriptor, creating it when absent.
    pub(crate) fn get_or_insert<F>(&self, id: i64, meta: Arc<ProxyMeta>, make: F) -> Arc<ProxyInner>
    where
        F: FnOnce(i64, Arc<ProxyMeta>) -> Arc<ProxyInner>,
    {
        if let Some(entry) = self.snapshot().get(&id) {
            if let Some(live) = entry.proxy.upgrade() {
                entry.note_received();
                return live;
            }
        }
        self.update(|map| {
            if let Some(entry) = map.get_mut(&id) {
                entry.note_received();
                if let Some(live) = entry.proxy.upgrade() {
                    return live;
                }
                let proxy = make(id, Arc::clone(&entry.meta));
                entry.proxy = Arc::downgrade(&proxy);
                return proxy;
            }
            let proxy = make(id, Arc::clone(&meta));
            map.insert(id, ProxyEntry::new(&proxy, meta, 1));
            proxy
        })
    }

    /// The proxy for a `Reference` descriptor. A dead entry the lender has
    /// not released yet is brought back from its metadata; an unknown id
    /// yields `None`.
    pub(crate) fn revive<F>(&self, id: i64, make: F) -> Option<Arc<ProxyInner>>
    where
        F: FnOnce(i64, Arc<ProxyMeta>) -> Arc<ProxyInner>,
    {
        let entry = self.snapshot().get(&id).cloned()?;
        if let Some(live) = entry.proxy.upgrade() {
            entry.note_received();
            return Some(live);
        }
        self.update(|map| {
            let entry = map.get_mut(&id)?;
            entry.note_received();
            if let Some(live) = entry.proxy.upgrade() {
                return Some(live);
            }
            let proxy = make(id, Arc::clone(&entry.meta));
            entry.proxy = Arc::downgrade(&proxy);
            Some(proxy)
        })
    }

    /// Register an existing proxy under `id`, replacing the proxy there but
    /// keeping its received count.
    pub(crate) fn adopt(&self, id: i64, proxy: &Arc<ProxyInner>) {
        self.update(|map| match map.get_mut(&id) {
            Some(entry) => {
                entry.proxy = Arc::downgrade(proxy);
                entry.meta = proxy.meta();
            }
            None => {
                map.insert(id, ProxyEntry::new(proxy, proxy.meta(), 0));
            }
        });
    }

    /// Entries whose proxies were dropped, with their received counts. The
    /// entries stay until [`ProxyTable::remove_released`].
    pub(crate) fn sweep(&self) -> Vec<Collected> {
        let mut dead: Vec<Collected> = self
            .snapshot()
            .iter()
            .filter(|(_, e)| e.is_dead())
            .map(|(&id, e)| Collected {
                id,
                received: e.received(),
            })
            .collect();
        dead.sort_by_key(|c| c.id);
        dead
    }

    /// Remove entries the lender released. An entry that came back to life
    /// or received more descriptors since the report is kept.
    pub(crate) fn remove_released(&self, released: &[Collected]) -> usize {
        if released.is_empty() {
            return 0;
        }
        self.update(|map| {
            released
                .iter()
                .filter(|report| {
                    let unchanged = map
                        .get(&report.id)
                        .is_some_and(|e| e.is_dead() && e.received() == report.received);
                    unchanged && map.remove(&report.id).is_some()
                })
                .count()
        })
    }

    /// Remove `ids` because the lender no longer knows them; returns the
    /// proxies still alive so the caller can mark them stale.
    pub(crate) fn invalidate(&self, ids: &[i64]) -> Vec<Arc<ProxyInner>> {
        self.update(|map| {
            ids.iter()
                .filter_map(|id| map.remove(id))
                .filter_map(|entry| entry.proxy.upgrade())
                .collect()
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.snapshot()
            .values()
            .filter(|e| e.proxy.strong_count() > 0)
            .count()
    }

    pub(crate) fn clear(&self) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(HashMap::new());
    }
}

/// Why the sweeper woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Sweep,
    Stop,
}

#[derive(Default)]
struct SignalState {
    nudged: bool,
    stopped: bool,
}

/// Wakes a session's sweeper early when proxies are dropped.
#[derive(Default)]
pub(crate) struct SweepSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl SweepSignal {
    pub(crate) fn nudge(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.nudged {
            state.nudged = true;
            self.cv.notify_one();
        }
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stopped = true;
        self.cv.notify_all();
    }

    /// Block until nudged, stopped, or `interval` passes.
    pub(crate) fn wait(&self, interval: Duration) -> Wake {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.nudged && !state.stopped {
            state = self
                .cv
                .wait_timeout_while(state, interval, |s| !s.nudged && !s.stopped)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if state.stopped {
            return Wake::Stop;
        }
        state.nudged = false;
        Wake::Sweep
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use super::*;
    use crate::error::RemoteException;
    use crate::object::CallContext;
    use crate::proxy::{ProxyHost, ProxyKind};
    use crate::shape::{DelegateShape, InterfaceShape, MemberRef};
    use crate::value::Value;

    struct Dummy;

    impl RemoteObject for Dummy {
        fn interfaces(&self) -> Vec<InterfaceShape> {
            vec![InterfaceShape::new("Dummy")]
        }

        fn invoke(
            &self,
            _ctx: &CallContext,
            member: &MemberRef,
            _args: &mut [Value],
        ) -> Result<Value, RemoteException> {
            Err(RemoteException::member_not_found(member))
        }
    }

    fn meta() -> Arc<ProxyMeta> {
        Arc::new(ProxyMeta {
            kind: ProxyKind::Object {
                interfaces: vec![InterfaceShape::new("Dummy")],
                recreate: None,
            },
            cached: BTreeMap::new(),
        })
    }

    fn make(signal: &Arc<SweepSignal>) -> impl FnOnce(i64, Arc<ProxyMeta>) -> Arc<ProxyInner> {
        let signal = Arc::clone(signal);
        move |id, meta| ProxyInner::new(id, 0, meta, ProxyHost::Session(Weak::new()), signal)
    }

    #[test]
    fn get_or_wrap_is_fresh_once() {
        let table = LentTable::new();
        let object: Arc<dyn RemoteObject> = Arc::new(Dummy);
        let first = table.get_or_wrap(&Lent::Object(Arc::clone(&object)));
        let second = table.get_or_wrap(&Lent::Object(object));
        assert_eq!(first, Wrap { id: 1, fresh: true });
        assert_eq!(second, Wrap { id: 1, fresh: false });

        let other = table.get_or_wrap(&Lent::Object(Arc::new(Dummy)));
        assert_eq!(other, Wrap { id: 2, fresh: true });
    }

    fn report(id: i64, received: u64) -> Collected {
        Collected { id, received }
    }

    #[test]
    fn collect_is_idempotent_and_ids_are_not_reused() {
        let table = LentTable::new();
        let object: Arc<dyn RemoteObject> = Arc::new(Dummy);
        let wrap = table.get_or_wrap(&Lent::Object(Arc::clone(&object)));
        assert_eq!(table.collect(&[report(wrap.id, 1)]), vec![wrap.id]);
        assert!(table.collect(&[report(wrap.id, 1)]).is_empty());
        assert!(table.get(wrap.id).is_none());

        let again = table.get_or_wrap(&Lent::Object(object));
        assert!(again.fresh);
        assert_ne!(again.id, wrap.id);
    }

    #[test]
    fn collect_waits_for_descriptors_in_flight() {
        let table = LentTable::new();
        let object: Arc<dyn RemoteObject> = Arc::new(Dummy);
        let lent = Lent::Object(object);
        let wrap = table.get_or_wrap(&lent);
        assert_eq!(table.get_or_wrap(&lent), Wrap { id: wrap.id, fresh: false });

        // The peer has only seen the first descriptor.
        assert!(table.collect(&[report(wrap.id, 1)]).is_empty());
        assert!(table.get(wrap.id).is_some());
        assert_eq!(table.collect(&[report(wrap.id, 2)]), vec![wrap.id]);
    }

    #[test]
    fn unsend_releases_objects_never_described() {
        let table = LentTable::new();
        let object: Arc<dyn RemoteObject> = Arc::new(Dummy);
        let lent = Lent::Object(object);
        let first = table.get_or_wrap(&lent);
        table.unsend(&[first.id]);
        assert!(table.get(first.id).is_none());

        let second = table.get_or_wrap(&lent);
        assert!(second.fresh);
        table.get_or_wrap(&lent);
        table.unsend(&[second.id]);
        assert!(table.get(second.id).is_some());
        assert_eq!(table.collect(&[report(second.id, 1)]), vec![second.id]);
    }

    #[test]
    fn delegates_share_the_id_space() {
        let table = LentTable::new();
        let delegate = Arc::new(LocalDelegate::new(DelegateShape::new("Tick"), |_| {
            Ok(Value::Null)
        }));
        let object = table.get_or_wrap(&Lent::Object(Arc::new(Dummy)));
        let wrapped = table.get_or_wrap(&Lent::Delegate(delegate));
        assert_eq!(wrapped.id, object.id + 1);
        assert!(matches!(table.get(wrapped.id), Some(Lent::Delegate(_))));
    }

    #[test]
    fn concurrent_wrap_yields_one_id() {
        let table = Arc::new(LentTable::new());
        let object: Arc<dyn RemoteObject> = Arc::new(Dummy);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let object = Arc::clone(&object);
                thread::spawn(move || table.get_or_wrap(&Lent::Object(object)))
            })
            .collect();
        let wraps: Vec<Wrap> = handles
            .into_iter()
            .map(|h| h.join().expect("wrapper thread should finish"))
            .collect();
        assert!(wraps.iter().all(|w| w.id == 1));
        assert_eq!(wraps.iter().filter(|w| w.fresh).count(), 1);
    }

    #[test]
    fn proxy_table_returns_same_live_proxy() {
        let signal = Arc::new(SweepSignal::default());
        let table = ProxyTable::new();
        let a = table.get_or_insert(5, meta(), make(&signal));
        let b = table.get_or_insert(5, meta(), make(&signal));
        assert!(Arc::ptr_eq(&a, &b));
        let c = table.revive(5, make(&signal)).expect("reference resolves");
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn sweep_collects_dropped_proxies() {
        let signal = Arc::new(SweepSignal::default());
        let table = ProxyTable::new();
        let kept = table.get_or_insert(1, meta(), make(&signal));
        let dropped = table.get_or_insert(2, meta(), make(&signal));
        drop(dropped);

        assert_eq!(table.live_count(), 1);
        let dead = table.sweep();
        assert_eq!(dead, vec![report(2, 1)]);
        // Reported entries stay until the lender confirms.
        assert_eq!(table.sweep(), dead);
        assert_eq!(table.remove_released(&dead), 1);
        assert!(table.sweep().is_empty());
        assert_eq!(table.len(), 1);
        assert!(table.revive(2, make(&signal)).is_none());
        drop(kept);
    }

    #[test]
    fn reference_before_sweep_revives_from_meta() {
        let signal = Arc::new(SweepSignal::default());
        let table = ProxyTable::new();
        drop(table.get_or_insert(3, meta(), make(&signal)));
        let revived = table.revive(3, make(&signal)).expect("meta kept until release");
        assert_eq!(revived.raw_id(), 3);
        assert!(table.sweep().is_empty());
    }

    #[test]
    fn reference_after_report_revives_and_survives_release() {
        let signal = Arc::new(SweepSignal::default());
        let table = ProxyTable::new();
        drop(table.get_or_insert(4, meta(), make(&signal)));
        let dead = table.sweep();
        assert_eq!(dead, vec![report(4, 1)]);

        let revived = table.revive(4, make(&signal)).expect("entry kept while reported");
        assert_eq!(table.remove_released(&dead), 0);
        drop(revived);
        assert_eq!(table.sweep(), vec![report(4, 2)]);
    }

    #[test]
    fn sweep_snapshot_does_not_block_readers() {
        let signal = Arc::new(SweepSignal::default());
        let table = ProxyTable::new();
        let live = table.get_or_insert(1, meta(), make(&signal));
        let snapshot = table.snapshot();
        drop(table.get_or_insert(2, meta(), make(&signal)));
        let dead = table.sweep();
        assert_eq!(dead, vec![report(2, 1)]);
        assert_eq!(table.remove_released(&dead), 1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.len(), 1);
        drop(live);
    }

    #[test]
    fn invalidate_returns_live_proxies() {
        let signal = Arc::new(SweepSignal::default());
        let table = ProxyTable::new();
        let live = table.get_or_insert(1, meta(), make(&signal));
        drop(table.get_or_insert(2, meta(), make(&signal)));
        let stale = table.invalidate(&[1, 2, 3]);
        assert_eq!(stale.len(), 1);
        assert!(Arc::ptr_eq(&stale[0], &live));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn dropping_a_proxy_nudges_the_sweeper() {
        let signal = Arc::new(SweepSignal::default());
        let table = ProxyTable::new();
        drop(table.get_or_insert(1, meta(), make(&signal)));
        assert_eq!(signal.wait(Duration::from_secs(5)), Wake::Sweep);

        signal.stop();
        assert_eq!(signal.wait(Duration::from_secs(5)), Wake::Stop);
    }

    #[test]
    fn signal_times_out_into_a_periodic_sweep() {
        let signal = SweepSignal::default();
        assert_eq!(signal.wait(Duration::from_millis(10)), Wake::Sweep);
    }
}
