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

pub mod populate;

use log::warn;
use nix::mount::MntFlags;
use std::collections::HashMap;
use std::fs::{self, File};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::nspool::api::types::{NamespaceType, NsInfo, Reference};
use crate::nspool::checkpoint::Supplier;
use crate::nspool::mount::{make_overlays_readonly, mount_all, unmount_all};
use crate::nspool::rootfs::Provider;
use crate::nspool::util::error::{new_error, with_context, BoxError, ErrorList};
use crate::nspool::util::workers::WorkerPool;

use super::generic::{GenericNsManager, ReleaseMode, SetBuilder};
use super::helper::NsExecHelper;
use super::set::{CreateFn, NamespaceSet, PreReleaseFn};
use super::{open_ns_file, Manager, NsFunctionArgs, NsFunctionKey};

const BUNDLE_PREFIX: &str = ".cer.bundle.";

/// Manager for mount namespaces. Each reference gets one shared read-only
/// rootfs mounted in the daemon's namespace; every pooled namespace stacks
/// a private overlay (the *bundle*) on top of it and restores the
/// checkpoint's extra mounts and tmpfs contents. Released namespaces are
/// dismantled and replaced in the background.
pub struct MntManager {
    core: GenericNsManager,
    /// fd → bundle directory, for every live namespace (idle and in use)
    bundles: Arc<Mutex<HashMap<RawFd, PathBuf>>>,
    /// digests whose shared rootfs this manager mounted
    prepared: Arc<Mutex<Vec<String>>>,
    root: PathBuf,
    provider: Arc<dyn Provider>,
}

impl MntManager {
    pub fn new(
        root: &Path,
        capacity: usize,
        refs: &[Reference],
        provider: Arc<dyn Provider>,
        supplier: Arc<dyn Supplier>,
        workers: Arc<WorkerPool>,
    ) -> Result<Self, BoxError> {
        let rootfs_parent = root.join("rootfs");
        fs::create_dir_all(&rootfs_parent)
            .map_err(|e| with_context(e, "failed to create rootfs dir"))?;

        let bundles: Arc<Mutex<HashMap<RawFd, PathBuf>>> = Arc::new(Mutex::new(HashMap::new()));
        let prepared: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let make_set = {
            let provider = Arc::clone(&provider);
            let supplier = Arc::clone(&supplier);
            let bundles = Arc::clone(&bundles);
            let prepared = Arc::clone(&prepared);
            let rootfs_parent = rootfs_parent.clone();
            let builder: SetBuilder = Box::new(move |reference, capacity| {
                let digest = reference.digest();
                let mut mounts = provider
                    .prepare(reference, &format!("{}-key", digest))
                    .map_err(|e| {
                        with_context(e, format!("error preparing rootfs for {}", reference))
                    })?;
                if mounts.is_empty() {
                    return Err(new_error("empty mount stack"));
                }
                make_overlays_readonly(&mut mounts);

                let rootfs_dir = rootfs_parent.join(&digest);
                fs::create_dir_all(&rootfs_dir)
                    .map_err(|e| with_context(e, format!("error creating dir for {}", reference)))?;
                // a leftover mount from a previous run would stack
                unmount_all(&rootfs_dir, MntFlags::empty())?;
                mount_all(&mounts, &rootfs_dir)?;
                prepared
                    .lock()
                    .expect("prepared rootfs list poisoned")
                    .push(digest);

                let checkpoint = supplier.get(reference).map_err(|e| {
                    with_context(e, format!("failed to get checkpoint for {}", reference))
                })?;
                NamespaceSet::new(
                    capacity,
                    make_creator(rootfs_dir, checkpoint, Arc::clone(&bundles)),
                    make_pre_release(Arc::clone(&bundles)),
                )
            });
            builder
        };

        let core = GenericNsManager::new(
            NamespaceType::Mnt,
            ReleaseMode::Destroy,
            capacity,
            refs,
            make_set,
            workers,
        )?;
        Ok(MntManager {
            core,
            bundles,
            prepared,
            root: root.to_path_buf(),
            provider,
        })
    }
}

impl Manager for MntManager {
    fn get(
        &self,
        reference: &Reference,
        extra_refs: &[Reference],
    ) -> Result<(RawFd, NsInfo), BoxError> {
        if !extra_refs.is_empty() {
            return Err(new_error("multiple references are not supported"));
        }
        let fd = self.core.acquire(reference)?;
        let bundle = {
            let bundles = self.bundles.lock().expect("bundle map poisoned");
            match bundles.get(&fd) {
                Some(bundle) => bundle.clone(),
                None => unreachable!("mnt namespace fd {} has no bundle", fd),
            }
        };
        Ok((fd, NsInfo::Bundle(bundle)))
    }

    fn put(&self, fd: RawFd) -> Result<(), BoxError> {
        self.core.put(fd)
    }

    fn update(&self, reference: &Reference, capacity: usize) -> Result<(), BoxError> {
        self.core.update(reference, capacity)
    }

    fn cleanup(&self) -> Result<(), BoxError> {
        let mut errors = ErrorList::new();
        if let Err(e) = self.core.cleanup() {
            errors.push(e);
        }
        let digests: Vec<String> = {
            let mut prepared = self.prepared.lock().expect("prepared rootfs list poisoned");
            prepared.drain(..).collect()
        };
        for digest in digests {
            let rootfs_dir = self.root.join("rootfs").join(&digest);
            if let Err(e) = unmount_all(&rootfs_dir, MntFlags::empty()) {
                errors.push(with_context(
                    e,
                    format!("failed to unmount rootfs {}", rootfs_dir.display()),
                ));
            }
            if let Err(e) = self.provider.remove(&format!("{}-key", digest)) {
                errors.push(with_context(
                    e,
                    format!("failed to remove rootfs {}", digest),
                ));
            }
        }
        errors.into_result()
    }
}

/// Creates the bundle skeleton: a fresh temp directory with `upper`, `work`
/// and `rootfs` subdirectories for the overlay.
fn create_bundle() -> Result<PathBuf, BoxError> {
    let bundle = tempfile::Builder::new()
        .prefix(BUNDLE_PREFIX)
        .tempdir()
        .map_err(|e| with_context(e, "failed to create bundle"))?
        .keep();
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o711);
    for sub in ["upper", "work", "rootfs"] {
        builder
            .create(bundle.join(sub))
            .map_err(|e| with_context(e, format!("failed to create bundle {} dir", sub)))?;
    }
    Ok(bundle)
}

fn make_creator(
    rootfs_dir: PathBuf,
    checkpoint: PathBuf,
    bundles: Arc<Mutex<HashMap<RawFd, PathBuf>>>,
) -> CreateFn {
    Arc::new(move || {
        let bundle = create_bundle()?;
        let mut args = NsFunctionArgs::new();
        args.insert("src".into(), rootfs_dir.to_string_lossy().into_owned());
        args.insert("bundle".into(), bundle.to_string_lossy().into_owned());
        args.insert(
            "checkpoint".into(),
            checkpoint.to_string_lossy().into_owned(),
        );

        let populate = || -> Result<File, BoxError> {
            let mut helper =
                NsExecHelper::new_create(Some(NsFunctionKey::Create), NamespaceType::Mnt, &args)?;
            helper.run()?;
            let file = open_ns_file(NamespaceType::Mnt, helper.child_pid())?;
            helper.release()?;
            Ok(file)
        };
        match populate() {
            Ok(file) => {
                bundles
                    .lock()
                    .expect("bundle map poisoned")
                    .insert(file.as_raw_fd(), bundle);
                Ok(file)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_dir_all(&bundle) {
                    warn!("failed to remove bundle {}: {}", bundle.display(), rm);
                }
                Err(with_context(e, "failed to execute the namespace helper"))
            }
        }
    })
}

/// Dismantles the bundle behind a namespace file by entering the namespace
/// and unwinding its mounts, then forgets the fd→bundle mapping.
fn make_pre_release(bundles: Arc<Mutex<HashMap<RawFd, PathBuf>>>) -> PreReleaseFn {
    Arc::new(move |file| {
        let fd = file.as_raw_fd();
        let bundle = {
            let map = bundles.lock().expect("bundle map poisoned");
            map.get(&fd)
                .cloned()
                .ok_or_else(|| new_error(format!("bundle path of fd {} does not exist", fd)))?
        };
        let mut args = NsFunctionArgs::new();
        args.insert("bundle".into(), bundle.to_string_lossy().into_owned());
        let ns_path = format!("/proc/{}/fd/{}", std::process::id(), fd);
        let mut helper = NsExecHelper::new_enter(
            Some(NsFunctionKey::Release),
            NamespaceType::Mnt,
            ns_path,
            &args,
        )
        .map_err(|e| {
            with_context(
                e,
                format!(
                    "failed to create namespace helper for {} with bundle {}",
                    fd,
                    bundle.display()
                ),
            )
        })?;
        helper.run().map_err(|e| {
            with_context(
                e,
                format!("failed to release bundle {} of fd {}", bundle.display(), fd),
            )
        })?;
        helper.release()?;
        bundles.lock().expect("bundle map poisoned").remove(&fd);
        Ok(())
    })
}
