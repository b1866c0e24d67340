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

use std::fs;
use std::path::{Path, PathBuf};

use crate::nspool::api::types::Reference;
use crate::nspool::util::error::{new_error, with_context, BoxError};

/// Hands out the on-disk checkpoint directory for a reference. The
/// namespace managers replay CRIU images out of that directory and never
/// write to it.
pub trait Supplier: Send + Sync {
    fn get(&self, reference: &Reference) -> Result<PathBuf, BoxError>;
}

/// Materializes checkpoint image files into a target directory. Remote
/// backends (CCFS, containerd content stores) implement this; the supplier
/// drives it once per reference.
pub trait Provider: Send + Sync {
    fn prepare(&self, reference: &Reference, target: &Path) -> Result<(), BoxError>;
    fn remove(&self, target: &Path) -> Result<(), BoxError>;
}

/// Directory-backed provider: checkpoint files for a reference live under
/// `<store>/<name>/` and are hard-linked (or copied) into the target.
pub struct LocalProvider {
    store: PathBuf,
}

impl LocalProvider {
    pub fn new(store: impl Into<PathBuf>) -> Self {
        LocalProvider {
            store: store.into(),
        }
    }
}

impl Provider for LocalProvider {
    fn prepare(&self, reference: &Reference, target: &Path) -> Result<(), BoxError> {
        let source = self.store.join(&reference.name);
        if !source.is_dir() {
            return Err(new_error(format!(
                "checkpoint source {} does not exist",
                source.display()
            )));
        }
        let entries = fs::read_dir(&source)
            .map_err(|e| with_context(e, format!("failed to read {}", source.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| with_context(e, "failed to enumerate checkpoint"))?;
            if !entry.path().is_file() {
                continue;
            }
            let destination = target.join(entry.file_name());
            if destination.exists() {
                continue;
            }
            if fs::hard_link(entry.path(), &destination).is_err() {
                fs::copy(entry.path(), &destination).map_err(|e| {
                    with_context(
                        e,
                        format!("failed to copy {} into place", entry.path().display()),
                    )
                })?;
            }
        }
        Ok(())
    }

    fn remove(&self, target: &Path) -> Result<(), BoxError> {
        if target.exists() {
            fs::remove_dir_all(target)
                .map_err(|e| with_context(e, format!("failed to remove {}", target.display())))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_links_every_image_file() {
        let store = tempfile::tempdir().unwrap();
        let checkpoint_dir = store.path().join("cp");
        fs::create_dir_all(&checkpoint_dir).unwrap();
        fs::write(checkpoint_dir.join("ipcns-var-1.img"), b"vars").unwrap();
        fs::write(checkpoint_dir.join("mountpoints-3.img"), b"mounts").unwrap();

        let target = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(store.path());
        provider
            .prepare(&Reference::new("cp"), target.path())
            .unwrap();
        assert!(target.path().join("ipcns-var-1.img").exists());
        assert!(target.path().join("mountpoints-3.img").exists());

        // idempotent on second prepare
        provider
            .prepare(&Reference::new("cp"), target.path())
            .unwrap();
    }

    #[test]
    fn unknown_reference_fails() {
        let store = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(store.path());
        let target = tempfile::tempdir().unwrap();
        assert!(provider
            .prepare(&Reference::new("ghost"), target.path())
            .is_err());
    }
}
