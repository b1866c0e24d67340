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
use std::path::PathBuf;

use crate::nspool::api::types::Reference;
use crate::nspool::mount::Mount;
use crate::nspool::util::error::{new_error, with_context, BoxError};

/// Supplies the mount stack that materializes a reference's root
/// filesystem. Image-store backends (containerd snapshots and the like)
/// implement this; the namespace manager only consumes the mounts.
pub trait Provider: Send + Sync {
    /// Prepares the rootfs of `reference` under an idempotency `key` and
    /// returns the mounts that produce it, bottom first.
    fn prepare(&self, reference: &Reference, key: &str) -> Result<Vec<Mount>, BoxError>;

    /// Releases whatever `prepare` set up under `key`.
    fn remove(&self, key: &str) -> Result<(), BoxError>;
}

/// Directory-backed provider: each reference name maps to a directory under
/// the store. A `layers/` subdirectory yields an overlay stack (layers
/// sorted, highest last); anything else is served as a single read-only
/// bind mount.
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
    fn prepare(&self, reference: &Reference, _key: &str) -> Result<Vec<Mount>, BoxError> {
        let dir = self.store.join(&reference.name);
        if !dir.is_dir() {
            return Err(new_error(format!(
                "rootfs source {} does not exist",
                dir.display()
            )));
        }
        let layers_dir = dir.join("layers");
        if layers_dir.is_dir() {
            let mut layers: Vec<PathBuf> = fs::read_dir(&layers_dir)
                .map_err(|e| {
                    with_context(e, format!("failed to read layers in {}", dir.display()))
                })?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            if layers.is_empty() {
                return Err(new_error(format!(
                    "no layers under {}",
                    layers_dir.display()
                )));
            }
            layers.sort();
            // overlay lowers list the top layer first
            let lowers: Vec<String> = layers
                .iter()
                .rev()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            let upper = dir.join("upper");
            let work = dir.join("work");
            fs::create_dir_all(&upper)
                .map_err(|e| with_context(e, "failed to create upper dir"))?;
            fs::create_dir_all(&work).map_err(|e| with_context(e, "failed to create work dir"))?;
            return Ok(vec![Mount::overlay(
                &lowers,
                &upper.to_string_lossy(),
                &work.to_string_lossy(),
            )]);
        }
        Ok(vec![Mount::bind(dir.to_string_lossy().into_owned())])
    }

    fn remove(&self, _key: &str) -> Result<(), BoxError> {
        // nothing is materialized outside the store
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_directory_becomes_a_bind_mount() {
        let store = tempfile::tempdir().unwrap();
        fs::create_dir_all(store.path().join("app")).unwrap();
        let provider = LocalProvider::new(store.path());
        let mounts = provider.prepare(&Reference::new("app"), "k").unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fstype, "bind");
    }

    #[test]
    fn layer_stack_becomes_an_overlay_with_top_layer_first() {
        let store = tempfile::tempdir().unwrap();
        for layer in ["0", "1", "2"] {
            fs::create_dir_all(store.path().join("app/layers").join(layer)).unwrap();
        }
        let provider = LocalProvider::new(store.path());
        let mounts = provider.prepare(&Reference::new("app"), "k").unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].is_overlay());
        let lowers = mounts[0].lowers();
        assert!(lowers[0].ends_with("/2"));
        assert!(lowers[2].ends_with("/0"));
        assert!(mounts[0].upper().is_some());
    }

    #[test]
    fn missing_reference_fails() {
        let store = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(store.path());
        assert!(provider.prepare(&Reference::new("ghost"), "k").is_err());
    }
}
