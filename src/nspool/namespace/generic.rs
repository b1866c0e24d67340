/*
 * Copyright (C) 2025 The Nspool Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::{error, warn};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::nspool::api::types::{NamespaceType, NsInfo, Reference};
use crate::nspool::util::error::{new_error, BoxError, ErrorList};
use crate::nspool::util::workers::WorkerPool;

use super::set::{CreateFn, NamespaceSet, PreReleaseFn};
use super::Manager;

/// What happens to a namespace file on `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// The file goes straight back to its set (UTS: nothing to scrub).
    Recycle,
    /// The namespace is torn down in the background and the set refilled
    /// with a fresh one (MNT: the bundle must be dismantled).
    Destroy,
}

pub type SetBuilder =
    Box<dyn Fn(&Reference, usize) -> Result<NamespaceSet, BoxError> + Send + Sync>;

struct SetEntry {
    reference: Reference,
    set: NamespaceSet,
}

struct InUseEntry {
    reference: Reference,
    file: File,
}

struct Inner {
    sets: HashMap<String, SetEntry>,
    in_use: HashMap<RawFd, InUseEntry>,
    /// Set by `cleanup`; late refill commits must tear their file down
    /// instead of repopulating a drained set.
    closed: bool,
}

struct Shared {
    t: NamespaceType,
    mode: ReleaseMode,
    make_set: SetBuilder,
    workers: Arc<WorkerPool>,
    inner: Mutex<Inner>,
}

/// Pool manager for one namespace type: a `NamespaceSet` per reference plus
/// used-fd bookkeeping. One mutex guards both maps; anything that forks a
/// helper child runs off-lock and commits its result afterwards. `get`
/// never waits: an empty set fails fast and a background job restores the
/// capacity.
pub struct GenericNsManager {
    shared: Arc<Shared>,
}

impl GenericNsManager {
    pub fn new(
        t: NamespaceType,
        mode: ReleaseMode,
        capacity: usize,
        refs: &[Reference],
        make_set: SetBuilder,
        workers: Arc<WorkerPool>,
    ) -> Result<Self, BoxError> {
        let mut sets = HashMap::new();
        for reference in refs {
            let set = (make_set)(reference, capacity)?;
            sets.insert(
                reference.digest(),
                SetEntry {
                    reference: reference.clone(),
                    set,
                },
            );
        }
        Ok(GenericNsManager {
            shared: Arc::new(Shared {
                t,
                mode,
                make_set,
                workers,
                inner: Mutex::new(Inner {
                    sets,
                    in_use: HashMap::new(),
                    closed: false,
                }),
            }),
        })
    }

    /// Acquires a namespace fd for `reference` and schedules a refill if the
    /// set dropped below its target.
    pub fn acquire(&self, reference: &Reference) -> Result<RawFd, BoxError> {
        let digest = reference.digest();
        let mut inner = self.lock();
        let entry = inner.sets.get_mut(&digest).ok_or_else(|| {
            new_error(format!(
                "{} namespace of {} is not managed",
                self.shared.t, reference
            ))
        })?;
        let file = entry.set.acquire().ok_or_else(|| {
            new_error(format!(
                "{} namespace of {} is used up",
                self.shared.t, reference
            ))
        })?;
        let below_target = entry.set.idle_len() < entry.set.default_capacity();
        let fd = file.as_raw_fd();
        inner.in_use.insert(
            fd,
            InUseEntry {
                reference: reference.clone(),
                file,
            },
        );
        drop(inner);
        if below_target {
            self.schedule_refill(digest);
        }
        Ok(fd)
    }

    /// The reference a handed-out fd belongs to.
    pub fn reference_of(&self, fd: RawFd) -> Option<Reference> {
        let inner = self.lock();
        inner.in_use.get(&fd).map(|e| e.reference.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().expect("namespace manager poisoned")
    }

    fn schedule_refill(&self, digest: String) {
        let shared = Arc::clone(&self.shared);
        self.shared.workers.submit(move || refill(&shared, &digest));
    }
}

impl Manager for GenericNsManager {
    fn get(
        &self,
        reference: &Reference,
        _extra_refs: &[Reference],
    ) -> Result<(RawFd, NsInfo), BoxError> {
        Ok((self.acquire(reference)?, NsInfo::None))
    }

    fn put(&self, fd: RawFd) -> Result<(), BoxError> {
        let mut inner = self.lock();
        let entry = inner
            .in_use
            .remove(&fd)
            .ok_or_else(|| new_error(format!("namespace {} does not exist", fd)))?;
        let digest = entry.reference.digest();
        let set_entry = match inner.sets.get_mut(&digest) {
            Some(set_entry) => set_entry,
            None => unreachable!("in-use fd {} has no backing set", fd),
        };
        match self.shared.mode {
            ReleaseMode::Recycle => {
                set_entry.set.add(entry.file);
                Ok(())
            }
            ReleaseMode::Destroy => {
                let pre_release = set_entry.set.pre_release_fn();
                drop(inner);
                let shared = Arc::clone(&self.shared);
                let reference = entry.reference;
                let file = entry.file;
                self.shared.workers.submit(move || {
                    if let Err(e) = pre_release(&file) {
                        error!(
                            "failed to release the {} namespace of fd {}: {}",
                            shared.t,
                            file.as_raw_fd(),
                            e
                        );
                    }
                    drop(file);
                    refill(&shared, &reference.digest());
                });
                Ok(())
            }
        }
    }

    fn update(&self, reference: &Reference, capacity: usize) -> Result<(), BoxError> {
        enum Plan {
            Build,
            Grow(usize, CreateFn),
            Shrink(Vec<File>, PreReleaseFn),
            Noop,
        }

        let digest = reference.digest();
        let plan = {
            let mut inner = self.lock();
            match inner.sets.get_mut(&digest) {
                None => Plan::Build,
                Some(entry) => {
                    entry.set.set_default_capacity(capacity);
                    let idle = entry.set.idle_len();
                    if idle < capacity {
                        Plan::Grow(capacity - idle, entry.set.create_fn())
                    } else if idle > capacity {
                        let mut excess = Vec::with_capacity(idle - capacity);
                        while entry.set.idle_len() > capacity {
                            match entry.set.acquire() {
                                Some(file) => excess.push(file),
                                None => break,
                            }
                        }
                        Plan::Shrink(excess, entry.set.pre_release_fn())
                    } else {
                        Plan::Noop
                    }
                }
            }
        };

        match plan {
            Plan::Build => {
                let set = (self.shared.make_set)(reference, capacity)?;
                let mut inner = self.lock();
                if inner.sets.contains_key(&digest) {
                    // lost the race with a concurrent update; discard ours
                    drop(inner);
                    let mut set = set;
                    return set.cleanup();
                }
                inner.sets.insert(
                    digest,
                    SetEntry {
                        reference: reference.clone(),
                        set,
                    },
                );
                Ok(())
            }
            Plan::Grow(count, create) => {
                for _ in 0..count {
                    let file = create()?;
                    if !commit_file(&self.shared, &digest, file) {
                        // the set vanished or was resized concurrently
                        return Ok(());
                    }
                }
                Ok(())
            }
            Plan::Shrink(files, pre_release) => {
                let mut errors = ErrorList::new();
                for file in files {
                    if let Err(e) = pre_release(&file) {
                        errors.push(e);
                    }
                    drop(file);
                }
                errors.into_result()
            }
            Plan::Noop => Ok(()),
        }
    }

    fn cleanup(&self) -> Result<(), BoxError> {
        let mut errors = ErrorList::new();
        let mut inner = self.lock();
        inner.closed = true;
        let in_use: Vec<(RawFd, InUseEntry)> = inner.in_use.drain().collect();
        for (fd, entry) in in_use {
            warn!(
                "{} namespace fd {} of {} is still in use",
                self.shared.t, fd, entry.reference
            );
            if self.shared.mode == ReleaseMode::Destroy {
                let digest = entry.reference.digest();
                if let Some(set_entry) = inner.sets.get(&digest) {
                    let pre_release = set_entry.set.pre_release_fn();
                    if let Err(e) = pre_release(&entry.file) {
                        errors.push(e);
                    }
                }
            }
            drop(entry.file);
        }
        for entry in inner.sets.values_mut() {
            if let Err(e) = entry.set.cleanup() {
                errors.push(e);
            }
        }
        errors.into_result()
    }
}

fn refill(shared: &Arc<Shared>, digest: &str) {
    let create = {
        let inner = shared.inner.lock().expect("namespace manager poisoned");
        if inner.closed {
            return;
        }
        match inner.sets.get(digest) {
            Some(entry) if entry.set.idle_len() < entry.set.default_capacity() => {
                Some(entry.set.create_fn())
            }
            _ => None,
        }
    };
    let Some(create) = create else {
        return;
    };
    match create() {
        Ok(file) => {
            commit_file(shared, digest, file);
        }
        Err(e) => {
            error!(
                "failed to create a new {} namespace for refill: {}",
                shared.t, e
            );
        }
    }
}

/// Adds a freshly created namespace file to its set, or tears it down again
/// when the set is gone or already back at capacity. Returns whether the
/// file was kept.
fn commit_file(shared: &Arc<Shared>, digest: &str, file: File) -> bool {
    let mut file = Some(file);
    let surplus_release = {
        let mut inner = shared.inner.lock().expect("namespace manager poisoned");
        let closed = inner.closed;
        match inner.sets.get_mut(digest) {
            Some(entry) if closed => Some(entry.set.pre_release_fn()),
            Some(entry) if entry.set.idle_len() < entry.set.default_capacity() => {
                entry.set.add(file.take().expect("file already committed"));
                None
            }
            Some(entry) => Some(entry.set.pre_release_fn()),
            None => None,
        }
    };
    let Some(file) = file else {
        return true;
    };
    if let Some(pre_release) = surplus_release {
        if let Err(e) = pre_release(&file) {
            warn!("failed to release surplus {} namespace: {}", shared.t, e);
        }
    }
    drop(file);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspool::namespace::set::no_pre_release;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_manager(mode: ReleaseMode, capacity: usize, refs: &[Reference]) -> GenericNsManager {
        let created = Arc::new(AtomicUsize::new(0));
        test_manager_counting(mode, capacity, refs, created)
    }

    fn test_manager_counting(
        mode: ReleaseMode,
        capacity: usize,
        refs: &[Reference],
        created: Arc<AtomicUsize>,
    ) -> GenericNsManager {
        let make_set: SetBuilder = Box::new(move |_, capacity| {
            let created = Arc::clone(&created);
            NamespaceSet::new(
                capacity,
                Arc::new(move || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Ok(tempfile::tempfile().map_err(|e| Box::new(e) as BoxError)?)
                }),
                no_pre_release(),
            )
        });
        GenericNsManager::new(
            NamespaceType::Uts,
            mode,
            capacity,
            refs,
            make_set,
            Arc::new(WorkerPool::new(2)),
        )
        .unwrap()
    }

    fn settle(manager: &GenericNsManager) {
        // refills are asynchronous; poll until the workers have committed
        for _ in 0..200 {
            std::thread::sleep(std::time::Duration::from_millis(5));
            let inner = manager.lock();
            let settled = inner
                .sets
                .values()
                .all(|e| e.set.idle_len() + count_in_use(&inner, &e.reference) >= e.set.default_capacity());
            if settled {
                return;
            }
        }
    }

    fn count_in_use(inner: &Inner, reference: &Reference) -> usize {
        inner
            .in_use
            .values()
            .filter(|e| e.reference == *reference)
            .count()
    }

    /// A builder whose create closure only succeeds `budget` times, so
    /// background refills cannot silently replenish the pool mid-test.
    fn budgeted_manager(mode: ReleaseMode, capacity: usize, budget: usize, refs: &[Reference]) -> GenericNsManager {
        let remaining = Arc::new(AtomicUsize::new(budget));
        let make_set: SetBuilder = Box::new(move |_, capacity| {
            let remaining = Arc::clone(&remaining);
            NamespaceSet::new(
                capacity,
                Arc::new(move || {
                    if remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                        .is_err()
                    {
                        return Err(crate::nspool::util::error::new_error("budget exhausted"));
                    }
                    Ok(tempfile::tempfile().map_err(|e| Box::new(e) as BoxError)?)
                }),
                no_pre_release(),
            )
        });
        GenericNsManager::new(
            NamespaceType::Uts,
            mode,
            capacity,
            refs,
            make_set,
            Arc::new(WorkerPool::new(2)),
        )
        .unwrap()
    }

    #[test]
    fn get_fails_fast_when_used_up_and_recovers_after_put() {
        let reference = Reference::new("r1");
        let manager = budgeted_manager(ReleaseMode::Recycle, 3, 3, &[reference.clone()]);
        let mut fds = Vec::new();
        for _ in 0..3 {
            let (fd, info) = manager.get(&reference, &[]).unwrap();
            assert_eq!(info, NsInfo::None);
            fds.push(fd);
        }
        let err = manager.get(&reference, &[]).unwrap_err();
        assert!(err.to_string().contains("used up"), "{}", err);

        // recycling makes three more gets possible
        for fd in fds.drain(..) {
            manager.put(fd).unwrap();
        }
        for _ in 0..3 {
            fds.push(manager.get(&reference, &[]).unwrap().0);
        }
        for fd in fds {
            manager.put(fd).unwrap();
        }
    }

    #[test]
    fn get_for_unknown_reference_fails() {
        let manager = test_manager(ReleaseMode::Recycle, 1, &[Reference::new("known")]);
        let err = manager.get(&Reference::new("unknown"), &[]).unwrap_err();
        assert!(err.to_string().contains("not managed"));
    }

    #[test]
    fn put_recycles_the_same_file_for_recycle_mode() {
        let reference = Reference::new("r1");
        let manager = test_manager(ReleaseMode::Recycle, 1, &[reference.clone()]);
        let (fd, _) = manager.get(&reference, &[]).unwrap();
        manager.put(fd).unwrap();
        settle(&manager);
        // the recycled file must be acquirable again
        let seen: Vec<RawFd> = (0..2)
            .filter_map(|_| manager.get(&reference, &[]).ok().map(|(fd, _)| fd))
            .collect();
        assert!(seen.contains(&fd));
        for fd in seen {
            manager.put(fd).unwrap();
        }
    }

    #[test]
    fn put_unknown_fd_is_a_client_error() {
        let manager = test_manager(ReleaseMode::Recycle, 1, &[Reference::new("r1")]);
        let err = manager.put(9999).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn destroy_mode_replaces_the_file_in_the_background() {
        let reference = Reference::new("r1");
        let created = Arc::new(AtomicUsize::new(0));
        let manager =
            test_manager_counting(ReleaseMode::Destroy, 1, &[reference.clone()], Arc::clone(&created));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        let (fd, _) = manager.get(&reference, &[]).unwrap();
        manager.put(fd).unwrap();
        settle(&manager);
        assert!(created.load(Ordering::SeqCst) >= 2, "refill must create a fresh namespace");
        let (fd2, _) = manager.get(&reference, &[]).unwrap();
        manager.put(fd2).unwrap();
    }

    #[test]
    fn update_creates_missing_sets_and_resizes_existing_ones() {
        let reference = Reference::new("late");
        let manager = test_manager(ReleaseMode::Recycle, 2, &[]);
        assert!(manager.get(&reference, &[]).is_err());

        manager.update(&reference, 2).unwrap();
        let (fd, _) = manager.get(&reference, &[]).unwrap();
        manager.put(fd).unwrap();

        manager.update(&reference, 5).unwrap();
        {
            let inner = manager.lock();
            assert_eq!(inner.sets[&reference.digest()].set.idle_len(), 5);
        }
        manager.update(&reference, 1).unwrap();
        {
            let inner = manager.lock();
            assert_eq!(inner.sets[&reference.digest()].set.idle_len(), 1);
            assert_eq!(inner.sets[&reference.digest()].set.default_capacity(), 1);
        }
    }

    #[test]
    fn concurrent_gets_never_hand_out_the_same_fd() {
        let reference = Reference::new("r1");
        let manager = Arc::new(test_manager(ReleaseMode::Recycle, 4, &[reference.clone()]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let reference = reference.clone();
            handles.push(std::thread::spawn(move || {
                manager.get(&reference, &[]).ok().map(|(fd, _)| fd)
            }));
        }
        let fds: Vec<RawFd> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let mut unique = fds.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), fds.len(), "duplicate fd handed out: {:?}", fds);
        for fd in fds {
            manager.put(fd).unwrap();
        }
    }

    #[test]
    fn cleanup_closes_everything_and_warns_on_in_use() {
        let reference = Reference::new("r1");
        let manager = test_manager(ReleaseMode::Recycle, 2, &[reference.clone()]);
        let (_fd, _) = manager.get(&reference, &[]).unwrap();
        manager.cleanup().unwrap();
        let inner = manager.lock();
        assert!(inner.in_use.is_empty());
        assert!(inner.sets.values().all(|e| e.set.idle_len() == 0));
    }
}
