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

use std::sync::Arc;

use crate::nspool::api::types::{NamespaceType, Reference};
use crate::nspool::util::error::BoxError;
use crate::nspool::util::workers::WorkerPool;

use super::generic::{GenericNsManager, ReleaseMode, SetBuilder};
use super::helper::NsExecHelper;
use super::set::{no_pre_release, NamespaceSet};
use super::{open_ns_file, NsFunctionArgs};

/// UTS namespaces carry only hostname and domainname, so a freshly unshared
/// namespace is already in its final state: no restoration on create, no
/// teardown on release, and released files are recycled into the pool.
pub fn new_manager(
    capacity: usize,
    refs: &[Reference],
    workers: Arc<WorkerPool>,
) -> Result<GenericNsManager, BoxError> {
    let make_set: SetBuilder = Box::new(move |_, capacity| {
        NamespaceSet::new(capacity, Arc::new(create_uts_namespace), no_pre_release())
    });
    GenericNsManager::new(
        NamespaceType::Uts,
        ReleaseMode::Recycle,
        capacity,
        refs,
        make_set,
        workers,
    )
}

fn create_uts_namespace() -> Result<std::fs::File, BoxError> {
    let mut helper = NsExecHelper::new_create(None, NamespaceType::Uts, &NsFunctionArgs::new())?;
    helper.run()?;
    let file = open_ns_file(NamespaceType::Uts, helper.child_pid())?;
    helper.release()?;
    Ok(file)
}
