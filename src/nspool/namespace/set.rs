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

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::nspool::util::error::{with_context, BoxError, ErrorList};

pub type CreateFn = Arc<dyn Fn() -> Result<File, BoxError> + Send + Sync>;
pub type PreReleaseFn = Arc<dyn Fn(&File) -> Result<(), BoxError> + Send + Sync>;

/// A no-op pre-release, for namespace types that carry no external state.
pub fn no_pre_release() -> PreReleaseFn {
    Arc::new(|_| Ok(()))
}

/// Bounded pool of idle namespace files for one reference. The set owns
/// every file in `idle`; acquiring transfers ownership out. Not internally
/// synchronized; the owning manager serializes mutation.
pub struct NamespaceSet {
    default_capacity: usize,
    idle: HashMap<RawFd, File>,
    create_fn: CreateFn,
    pre_release_fn: PreReleaseFn,
}

impl NamespaceSet {
    /// Prewarms to `capacity`. Any creation failure aborts init; files
    /// created so far are torn down again.
    pub fn new(
        capacity: usize,
        create_fn: CreateFn,
        pre_release_fn: PreReleaseFn,
    ) -> Result<Self, BoxError> {
        let mut set = NamespaceSet {
            default_capacity: capacity,
            idle: HashMap::with_capacity(capacity),
            create_fn,
            pre_release_fn,
        };
        for _ in 0..capacity {
            if let Err(e) = set.create_one() {
                let _ = set.cleanup();
                return Err(with_context(e, "failed to prewarm namespace set"));
            }
        }
        Ok(set)
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    pub fn set_default_capacity(&mut self, capacity: usize) {
        self.default_capacity = capacity;
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Clones of the closures, so callers can run them without holding the
    /// manager lock and commit the result afterwards.
    pub fn create_fn(&self) -> CreateFn {
        Arc::clone(&self.create_fn)
    }

    pub fn pre_release_fn(&self) -> PreReleaseFn {
        Arc::clone(&self.pre_release_fn)
    }

    /// Takes one idle namespace, or `None` when the pool is empty.
    pub fn acquire(&mut self) -> Option<File> {
        let fd = *self.idle.keys().next()?;
        self.idle.remove(&fd)
    }

    /// Returns an unused file to the pool.
    pub fn add(&mut self, file: File) {
        self.idle.insert(file.as_raw_fd(), file);
    }

    pub fn create_one(&mut self) -> Result<(), BoxError> {
        let file = (self.create_fn)()?;
        self.add(file);
        Ok(())
    }

    /// Grows or shrinks the idle pool to `capacity` and makes that the new
    /// default. Shrinking tears down acquired files via the pre-release
    /// closure before closing them.
    pub fn update(&mut self, capacity: usize) -> Result<(), BoxError> {
        self.default_capacity = capacity;
        while self.idle.len() < capacity {
            self.create_one()?;
        }
        while self.idle.len() > capacity {
            let file = match self.acquire() {
                Some(file) => file,
                None => break,
            };
            (self.pre_release_fn)(&file)?;
            drop(file);
        }
        Ok(())
    }

    /// Tears down every idle namespace. Best-effort: all errors are
    /// accumulated, every file is closed regardless.
    pub fn cleanup(&mut self) -> Result<(), BoxError> {
        let mut errors = ErrorList::new();
        for (_, file) in self.idle.drain() {
            if let Err(e) = (self.pre_release_fn)(&file) {
                errors.push(e);
            }
            drop(file);
        }
        errors.into_result()
    }
}
