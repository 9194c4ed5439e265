//! Observer topics.
//!
//! A [`Topic`] fans an event out to its observers. Topics implementing
//! [`Suspendable`] drop events while suspended; nothing is queued for later.
//! Types that own a topic without being one implement [`Notifiable`], so the
//! free functions ([`send`], [`observe`], [`unobserve`], [`suspend`],
//! [`resume`]) work on either.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub trait Notifier<E>: Send + Sync {
    fn notify(&self, event: &E);
}

/// Identity token for one observation, returned by [`Topic::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

pub trait Topic<E>: Notifier<E> {
    /// Add an observer. Observing the same handle twice returns the existing id.
    fn observe(&self, observer: Arc<dyn Notifier<E>>) -> ObserverId;

    /// Remove an observer. Returns whether it was present.
    fn unobserve(&self, id: ObserverId) -> bool;

    fn as_suspendable(&self) -> Option<&dyn Suspendable> {
        None
    }
}

pub trait Suspendable {
    fn suspend(&self);
    fn resume(&self);
}

/// Gives access to an internal topic without exposing it as a field.
pub trait Notifiable<E> {
    fn topic(&self) -> &dyn Topic<E>;
}

struct FnNotifier<F>(F);

impl<E, F> Notifier<E> for FnNotifier<F>
where
    F: Fn(&E) + Send + Sync,
{
    fn notify(&self, event: &E) {
        (self.0)(event)
    }
}

/// Wrap a closure as an observer.
pub fn func<E, F>(f: F) -> Arc<dyn Notifier<E>>
where
    E: 'static,
    F: Fn(&E) + Send + Sync + 'static,
{
    Arc::new(FnNotifier(f))
}

/// Thread-safe topic with an atomic suspend flag.
pub struct SharedTopic<E> {
    observers: RwLock<BTreeMap<ObserverId, Arc<dyn Notifier<E>>>>,
    next_id: AtomicU64,
    suspended: AtomicBool,
}

impl<E> SharedTopic<E> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<E> Default for SharedTopic<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Notifier<E> for SharedTopic<E> {
    fn notify(&self, event: &E) {
        if self.is_suspended() {
            return;
        }
        // Snapshot so observers may observe/unobserve from inside a callback.
        let observers: Vec<Arc<dyn Notifier<E>>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for observer in observers {
            observer.notify(event);
        }
    }
}

impl<E> Topic<E> for SharedTopic<E> {
    fn observe(&self, observer: Arc<dyn Notifier<E>>) -> ObserverId {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let existing = observers
            .iter()
            .find(|(_, o)| std::ptr::addr_eq(Arc::as_ptr(*o), Arc::as_ptr(&observer)))
            .map(|(id, _)| *id);
        if let Some(id) = existing {
            return id;
        }
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        observers.insert(id, observer);
        id
    }

    fn unobserve(&self, id: ObserverId) -> bool {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    fn as_suspendable(&self) -> Option<&dyn Suspendable> {
        Some(self)
    }
}

impl<E> Suspendable for SharedTopic<E> {
    fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }
}

impl<E> Notifiable<E> for SharedTopic<E> {
    fn topic(&self) -> &dyn Topic<E> {
        self
    }
}

pub fn send<E, N: Notifiable<E> + ?Sized>(target: &N, event: &E) {
    target.topic().notify(event);
}

pub fn observe<E, N: Notifiable<E> + ?Sized>(
    target: &N,
    observer: Arc<dyn Notifier<E>>,
) -> ObserverId {
    target.topic().observe(observer)
}

pub fn unobserve<E, N: Notifiable<E> + ?Sized>(target: &N, id: ObserverId) -> bool {
    target.topic().unobserve(id)
}

/// Suspend the target's topic. No-op when the topic is not suspendable.
pub fn suspend<E, N: Notifiable<E> + ?Sized>(target: &N) {
    if let Some(s) = target.topic().as_suspendable() {
        s.suspend();
    }
}

pub fn resume<E, N: Notifiable<E> + ?Sized>(target: &N) {
    if let Some(s) = target.topic().as_suspendable() {
        s.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn Notifier<u32>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let observer = func(move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, observer)
    }

    /// Owns a topic without being one.
    struct Owner {
        events: SharedTopic<u32>,
    }

    impl Notifiable<u32> for Owner {
        fn topic(&self) -> &dyn Topic<u32> {
            &self.events
        }
    }

    #[test]
    fn test_notify_reaches_all_observers() {
        let topic = SharedTopic::new();
        let (a, oa) = counter();
        let (b, ob) = counter();
        topic.observe(oa);
        topic.observe(ob);

        topic.notify(&1);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observe_same_handle_is_deduplicated() {
        let topic = SharedTopic::new();
        let (count, observer) = counter();
        let first = topic.observe(observer.clone());
        let second = topic.observe(observer);
        assert_eq!(first, second);
        assert_eq!(topic.observer_count(), 1);

        topic.notify(&7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unobserve_stops_delivery() {
        let topic = SharedTopic::new();
        let (count, observer) = counter();
        let id = topic.observe(observer);
        assert!(topic.unobserve(id));
        assert!(!topic.unobserve(id));

        topic.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_suspend_drops_events_without_replay() {
        let topic = SharedTopic::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        topic.observe(func(move |e: &u32| s.lock().unwrap().push(*e)));

        topic.suspend();
        topic.suspend();
        assert!(topic.is_suspended());
        topic.notify(&1);
        topic.notify(&2);

        topic.resume();
        topic.notify(&3);

        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_resume_delivers_to_current_observer_set() {
        let topic = SharedTopic::new();
        let (early, oe) = counter();
        let id = topic.observe(oe);

        topic.suspend();
        topic.unobserve(id);
        let (late, ol) = counter();
        topic.observe(ol);
        topic.resume();

        topic.notify(&1);
        assert_eq!(early.load(Ordering::SeqCst), 0);
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_free_functions_through_notifiable() {
        let owner = Owner {
            events: SharedTopic::new(),
        };
        let (count, observer) = counter();
        let id = observe(&owner, observer);

        send(&owner, &1);
        suspend(&owner);
        send(&owner, &2);
        resume(&owner);
        send(&owner, &3);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(unobserve(&owner, id));
        send(&owner, &4);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_may_unobserve_itself_during_notify() {
        let topic = Arc::new(SharedTopic::<u32>::new());
        let slot: Arc<Mutex<Option<ObserverId>>> = Arc::new(Mutex::new(None));
        let (t, s) = (topic.clone(), slot.clone());
        let id = topic.observe(func(move |_: &u32| {
            if let Some(id) = *s.lock().unwrap() {
                t.unobserve(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);

        topic.notify(&1);
        assert_eq!(topic.observer_count(), 0);
    }

    #[test]
    fn test_concurrent_observe_unobserve_and_notify() {
        let topic = Arc::new(SharedTopic::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        topic.observe(func(move |e: &u32| s.lock().unwrap().push(*e)));

        let threads: Vec<_> = (0..4u32)
            .map(|t| {
                let topic = topic.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let (_, churn) = counter();
                        let id = topic.observe(churn);
                        topic.notify(&(t * 1000 + i));
                        assert!(topic.unobserve(id));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 400);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
        assert_eq!(topic.observer_count(), 1);
    }
}
