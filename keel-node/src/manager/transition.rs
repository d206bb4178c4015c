// Keyed state table with optimistic, lock-released transitions.
//
// Some transitions (starting or stopping a service) may block for a long time and
// must not run under the table lock. `optimistic_transition` marks the key busy,
// releases the lock for the blocking action, then re-acquires it and lets the caller
// revalidate against whatever the table looks like now. Other transitions on the
// same key wait until the key is idle again; other keys are unaffected.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;

/// Result of the locked preparation step
pub(crate) enum Prepared<O, S> {
    /// Finished under the lock, nothing to run
    Commit(O),
    /// Run the blocking action with this input
    Blocking(S),
}

pub(crate) enum Removal<T> {
    Removed(T),
    Refused,
    Missing,
}

struct Slot<T> {
    value: T,
    busy: bool,
}

pub(crate) struct TransitionMap<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    idle: Condvar,
}

impl<T> TransitionMap<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
        }
    }

    fn lock_idle(&self, key: &str) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
        let mut slots = self.slots.lock();
        while slots.get(key).map(|slot| slot.busy).unwrap_or(false) {
            self.idle.wait(&mut slots);
        }
        slots
    }

    /// Insert unless the key exists
    pub(crate) fn insert(&self, key: &str, value: T) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(key) {
            return false;
        }
        slots.insert(key.to_string(), Slot { value, busy: false });
        true
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Read a value without waiting for a transition in flight
    pub(crate) fn read<R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slots.lock().get(key).map(|slot| f(&slot.value))
    }

    /// Remove a value once idle, if `allow` agrees
    pub(crate) fn remove_if(&self, key: &str, allow: impl FnOnce(&T) -> bool) -> Removal<T> {
        let mut slots = self.lock_idle(key);
        let allowed = match slots.get(key) {
            Some(slot) => allow(&slot.value),
            None => return Removal::Missing,
        };
        if !allowed {
            return Removal::Refused;
        }
        match slots.remove(key) {
            Some(slot) => Removal::Removed(slot.value),
            None => Removal::Missing,
        }
    }

    /// Run `prepare` under the lock; on `Blocking`, run `action` with the lock
    /// released and the key marked busy, then `revalidate` under the lock.
    ///
    /// `revalidate` gets `None` when the key vanished while unlocked.
    pub(crate) fn optimistic_transition<O, S, R>(
        &self,
        key: &str,
        prepare: impl FnOnce(Option<&mut T>) -> Prepared<O, S>,
        action: impl FnOnce(S) -> R,
        revalidate: impl FnOnce(Option<&mut T>, R) -> O,
    ) -> O {
        let mut slots = self.lock_idle(key);
        let staged = match prepare(slots.get_mut(key).map(|slot| &mut slot.value)) {
            Prepared::Commit(outcome) => return outcome,
            Prepared::Blocking(staged) => staged,
        };

        if let Some(slot) = slots.get_mut(key) {
            slot.busy = true;
        }
        let completed = MutexGuard::unlocked(&mut slots, || action(staged));

        let outcome = revalidate(
            slots.get_mut(key).map(|slot| {
                slot.busy = false;
                &mut slot.value
            }),
            completed,
        );
        drop(slots);
        self.idle.notify_all();
        outcome
    }
}

impl<T> Default for TransitionMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_transition_runs_action_once_under_contention() {
        let map = Arc::new(TransitionMap::new());
        assert!(map.insert("svc", 0usize));
        assert!(!map.insert("svc", 1usize));

        let actions = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                let actions = actions.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    map.optimistic_transition(
                        "svc",
                        |count: Option<&mut usize>| match count {
                            Some(count) if *count > 0 => {
                                *count += 1;
                                Prepared::Commit(true)
                            }
                            Some(_) => Prepared::Blocking(()),
                            None => Prepared::Commit(false),
                        },
                        |_| {
                            actions.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            true
                        },
                        |count: Option<&mut usize>, started: bool| match count {
                            Some(count) if started => {
                                *count += 1;
                                true
                            }
                            _ => false,
                        },
                    )
                })
            })
            .collect();

        for worker in workers {
            assert!(worker.join().unwrap());
        }
        assert_eq!(actions.load(Ordering::SeqCst), 1);
        assert_eq!(map.read("svc", |count| *count), Some(8));
    }

    #[test]
    fn test_revalidate_sees_removal_and_remove_if_refuses() {
        let map = TransitionMap::new();
        map.insert("svc", 1usize);
        assert!(matches!(map.remove_if("svc", |count| *count == 0), Removal::Refused));

        map.optimistic_transition(
            "svc",
            |count: Option<&mut usize>| {
                if let Some(count) = count {
                    *count = 0;
                }
                Prepared::<(), ()>::Commit(())
            },
            |_| (),
            |_: Option<&mut usize>, _| (),
        );
        assert!(matches!(map.remove_if("svc", |count| *count == 0), Removal::Removed(0)));
        assert!(matches!(map.remove_if("svc", |_| true), Removal::Missing));

        let outcome = map.optimistic_transition(
            "svc",
            |_: Option<&mut usize>| Prepared::<&str, ()>::Blocking(()),
            |_| (),
            |count: Option<&mut usize>, _| if count.is_none() { "vanished" } else { "present" },
        );
        assert_eq!(outcome, "vanished");
        assert!(!map.contains("svc"));
    }
}
