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

pub mod restore;
pub mod sysv;

use log::debug;
use prost::Message;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::nspool::api::types::{NamespaceType, NsInfo, Reference};
use crate::nspool::checkpoint::Supplier;
use crate::nspool::criu::image::{find_image_with_prefix, ImageFile};
use crate::nspool::criu::types::IpcVarEntry;
use crate::nspool::util::error::{new_error, with_context, BoxError};
use crate::nspool::util::workers::WorkerPool;

use super::generic::{GenericNsManager, ReleaseMode, SetBuilder};
use super::helper::NsExecHelper;
use super::set::{no_pre_release, CreateFn, NamespaceSet};
use super::{open_ns_file, Manager, NsFunctionArgs, NsFunctionKey};

use restore::{MSG_FILE_PREFIX, SEM_FILE_PREFIX, SHM_FILE_PREFIX, VAR_FILE_PREFIX};

/// Manager for IPC namespaces. References whose checkpoint carries no SysV
/// objects and whose sysctl variables equal the kernel defaults are
/// *normal*: a bare unshared namespace serves them. Everything else is
/// *special* and gets its checkpoint replayed into each pooled namespace.
pub struct IpcManager {
    core: GenericNsManager,
    /// digest → content is normal (no restoration was needed)
    content_normal: Arc<Mutex<HashMap<String, bool>>>,
}

impl IpcManager {
    pub fn new(
        capacity: usize,
        refs: &[Reference],
        supplier: Arc<dyn Supplier>,
        workers: Arc<WorkerPool>,
    ) -> Result<Self, BoxError> {
        let default_vars = collect_default_vars()
            .map_err(|e| with_context(e, "failed to collect variables from a new ipc namespace"))?;
        let content_normal = Arc::new(Mutex::new(HashMap::new()));

        let make_set = {
            let supplier = Arc::clone(&supplier);
            let content_normal = Arc::clone(&content_normal);
            let builder: SetBuilder = Box::new(move |reference, capacity| {
                let checkpoint = supplier.get(reference).map_err(|e| {
                    with_context(e, format!("failed to get checkpoint path for {}", reference))
                })?;
                let normal = in_default_namespace(&checkpoint, &default_vars)?;
                debug!(
                    "ipc content of {} classified as {}",
                    reference,
                    if normal { "normal" } else { "special" }
                );
                content_normal
                    .lock()
                    .expect("ipc classification map poisoned")
                    .insert(reference.digest(), normal);
                let create: CreateFn = if normal {
                    Arc::new(create_plain_namespace)
                } else {
                    Arc::new(move || create_restored_namespace(&checkpoint))
                };
                NamespaceSet::new(capacity, create, no_pre_release())
            });
            builder
        };

        let core = GenericNsManager::new(
            NamespaceType::Ipc,
            ReleaseMode::Recycle,
            capacity,
            refs,
            make_set,
            workers,
        )?;
        Ok(IpcManager {
            core,
            content_normal,
        })
    }

    /// Picks the reference whose pool should serve this request.
    fn resolve<'a>(
        &self,
        reference: &'a Reference,
        extra_refs: &'a [Reference],
    ) -> Result<&'a Reference, BoxError> {
        let classified = self
            .content_normal
            .lock()
            .expect("ipc classification map poisoned");
        resolve_target(&classified, reference, extra_refs)
    }
}

/// The unique *special* reference among the candidates wins if there is
/// exactly one, otherwise the primary reference is used. Two special
/// references cannot share one namespace.
fn resolve_target<'a>(
    classified: &HashMap<String, bool>,
    reference: &'a Reference,
    extra_refs: &'a [Reference],
) -> Result<&'a Reference, BoxError> {
    if extra_refs.is_empty() {
        return Ok(reference);
    }
    let mut specials = std::iter::once(reference)
        .chain(extra_refs.iter())
        .filter(|r| classified.get(&r.digest()) == Some(&false));
    match (specials.next(), specials.next()) {
        (Some(special), None) => Ok(special),
        (Some(a), Some(b)) => Err(new_error(format!(
            "conflicting special ipc references {} and {}",
            a, b
        ))),
        (None, _) => Ok(reference),
    }
}

impl Manager for IpcManager {
    fn get(
        &self,
        reference: &Reference,
        extra_refs: &[Reference],
    ) -> Result<(RawFd, NsInfo), BoxError> {
        let target = self.resolve(reference, extra_refs)?;
        Ok((self.core.acquire(target)?, NsInfo::None))
    }

    fn put(&self, fd: RawFd) -> Result<(), BoxError> {
        self.core.put(fd)
    }

    fn update(&self, reference: &Reference, capacity: usize) -> Result<(), BoxError> {
        self.core.update(reference, capacity)
    }

    fn cleanup(&self) -> Result<(), BoxError> {
        self.core.cleanup()
    }
}

/// Opens a throw-away fresh IPC namespace in a helper child and returns the
/// `IpcVarEntry` the `collect` function captured there.
fn collect_default_vars() -> Result<IpcVarEntry, BoxError> {
    let mut helper = NsExecHelper::new_create(
        Some(NsFunctionKey::Collect),
        NamespaceType::Ipc,
        &NsFunctionArgs::new(),
    )?;
    helper.run()?;
    let entry = IpcVarEntry::decode(helper.payload())
        .map_err(|e| with_context(e, "failed to decode collected ipc vars"))?;
    helper.release()?;
    Ok(entry)
}

/// A reference is normal when its checkpoint has no shm/sem/msg images and
/// its var image equals the default entry, message for message.
fn in_default_namespace(checkpoint: &Path, default_vars: &IpcVarEntry) -> Result<bool, BoxError> {
    for prefix in [SHM_FILE_PREFIX, SEM_FILE_PREFIX, MSG_FILE_PREFIX] {
        if find_image_with_prefix(checkpoint, prefix)?.is_some() {
            return Ok(false);
        }
    }
    let vars_path = find_image_with_prefix(checkpoint, VAR_FILE_PREFIX)?.ok_or_else(|| {
        new_error(format!(
            "file with prefix {} does not exist in {}",
            VAR_FILE_PREFIX,
            checkpoint.display()
        ))
    })?;
    let mut img = ImageFile::open(&vars_path)?;
    let entry: IpcVarEntry = img
        .read_entry()?
        .ok_or_else(|| new_error(format!("{} has no var entry", vars_path.display())))?;
    Ok(entry == *default_vars)
}

fn create_plain_namespace() -> Result<File, BoxError> {
    let mut helper = NsExecHelper::new_create(None, NamespaceType::Ipc, &NsFunctionArgs::new())?;
    helper.run()?;
    let file = open_ns_file(NamespaceType::Ipc, helper.child_pid())?;
    helper.release()?;
    Ok(file)
}

fn create_restored_namespace(checkpoint: &PathBuf) -> Result<File, BoxError> {
    let mut args = NsFunctionArgs::new();
    args.insert(
        "checkpoint".to_string(),
        checkpoint.to_string_lossy().into_owned(),
    );
    let mut helper = NsExecHelper::new_create(
        Some(NsFunctionKey::Create),
        NamespaceType::Ipc,
        &args,
    )?;
    helper.run()?;
    let file = open_ns_file(NamespaceType::Ipc, helper.child_pid())?;
    helper.release()?;
    Ok(file)
}
