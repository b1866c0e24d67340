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

use std::collections::HashSet;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::nspool::api::checkpoint::{
    GetCheckpointRequest, GetCheckpointResponse, PutCheckpointRequest, PutCheckpointResponse,
    METHOD_GET_CHECKPOINT, METHOD_PUT_CHECKPOINT,
};
use crate::nspool::api::types::Reference;
use crate::nspool::checkpoint::{Provider, Supplier};
use crate::nspool::logger::{log_error, log_info};
use crate::nspool::services::frame;
use crate::nspool::util::error::{new_error, with_context, BoxError, ErrorList};

use super::Service;

const COMPONENT: &str = "checkpoint-service";

/// Prepares and caches checkpoint directories keyed by reference digest,
/// and serves them over the socket. Doubles as the in-process `Supplier`
/// the namespace managers consume.
pub struct CheckpointService {
    root: PathBuf,
    provider: Arc<dyn Provider>,
    targets: Mutex<HashSet<PathBuf>>,
}

impl CheckpointService {
    pub fn new(root: &Path, provider: Arc<dyn Provider>) -> Result<Self, BoxError> {
        let root = root.join("checkpoint");
        fs::create_dir_all(&root)
            .map_err(|e| with_context(e, "failed to create checkpoint dir"))?;
        log_info(COMPONENT, "service initialized", &[]);
        Ok(CheckpointService {
            root,
            provider,
            targets: Mutex::new(HashSet::new()),
        })
    }

    fn handle_get(&self, conn: &mut UnixStream) -> Result<(), BoxError> {
        let request: GetCheckpointRequest = frame::receive_json(conn)?;
        let mut response = GetCheckpointResponse::default();
        match self.get(&request.reference) {
            Ok(path) => response.path = path.to_string_lossy().into_owned(),
            Err(e) => {
                log_error(
                    COMPONENT,
                    "failed to prepare checkpoint",
                    &[
                        ("reference", &request.reference.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                response.error = Some(e.to_string());
            }
        }
        frame::send_json(conn, &response)
    }

    fn handle_put(&self, conn: &mut UnixStream) -> Result<(), BoxError> {
        let _request: PutCheckpointRequest = frame::receive_json(conn)?;
        // prepared directories stay cached until shutdown
        frame::send_json(conn, &PutCheckpointResponse::default())
    }
}

impl Supplier for CheckpointService {
    fn get(&self, reference: &Reference) -> Result<PathBuf, BoxError> {
        if reference.name.is_empty() {
            return Err(new_error("empty reference"));
        }
        let target = self.root.join(reference.digest());
        let mut targets = self.targets.lock().expect("checkpoint targets poisoned");
        if targets.contains(&target) {
            return Ok(target);
        }
        fs::create_dir_all(&target)
            .map_err(|e| with_context(e, format!("failed to create dir {}", target.display())))?;
        self.provider.prepare(reference, &target)?;
        targets.insert(target.clone());
        Ok(target)
    }
}

impl Service for CheckpointService {
    fn handle(&self, conn: &mut UnixStream) -> Result<(), BoxError> {
        let method = frame::receive_method(conn)?;
        match method.as_str() {
            METHOD_GET_CHECKPOINT => self.handle_get(conn),
            METHOD_PUT_CHECKPOINT => self.handle_put(conn),
            other => Err(new_error(format!("no handler matches method {}", other))),
        }
    }

    fn stop(&self) -> Result<(), BoxError> {
        let mut errors = ErrorList::new();
        let targets: Vec<PathBuf> = {
            let mut guard = self.targets.lock().expect("checkpoint targets poisoned");
            guard.drain().collect()
        };
        for target in targets {
            if let Err(e) = self.provider.remove(&target) {
                errors.push(with_context(
                    e,
                    format!("failed to remove {}", target.display()),
                ));
            }
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspool::checkpoint::LocalProvider;

    #[test]
    fn get_prepares_once_and_caches_the_target() {
        let store = tempfile::tempdir().unwrap();
        fs::create_dir_all(store.path().join("cp")).unwrap();
        fs::write(store.path().join("cp/ipcns-var-1.img"), b"x").unwrap();

        let root = tempfile::tempdir().unwrap();
        let service = CheckpointService::new(
            root.path(),
            Arc::new(LocalProvider::new(store.path())),
        )
        .unwrap();

        let reference = Reference::new("cp");
        let first = service.get(&reference).unwrap();
        assert!(first.join("ipcns-var-1.img").exists());
        let second = service.get(&reference).unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with(reference.digest()));

        service.stop().unwrap();
        assert!(!first.exists());
    }

    #[test]
    fn empty_reference_is_rejected() {
        let store = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let service = CheckpointService::new(
            root.path(),
            Arc::new(LocalProvider::new(store.path())),
        )
        .unwrap();
        assert!(service.get(&Reference::new("")).is_err());
    }
}
