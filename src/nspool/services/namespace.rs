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

use serde_json::Value;
use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;

use crate::nspool::api::namespace::{
    GetNamespaceRequest, GetNamespaceResponse, PutNamespaceRequest, PutNamespaceResponse,
    UpdateNamespaceRequest, UpdateNamespaceResponse, METHOD_GET_NAMESPACE, METHOD_PUT_NAMESPACE,
    METHOD_UPDATE_NAMESPACE,
};
use crate::nspool::api::types::NamespaceType;
use crate::nspool::checkpoint::Supplier;
use crate::nspool::config::ServiceConfig;
use crate::nspool::logger::{log_error, log_info, log_warn};
use crate::nspool::namespace::ipc::IpcManager;
use crate::nspool::namespace::mnt::MntManager;
use crate::nspool::namespace::{uts, Manager};
use crate::nspool::rootfs;
use crate::nspool::services::frame;
use crate::nspool::util::error::{with_context, BoxError, ErrorList};
use crate::nspool::util::workers::WorkerPool;

use super::{Router, Service};

const COMPONENT: &str = "namespace-service";

type Managers = Arc<HashMap<NamespaceType, Arc<dyn Manager>>>;

/// Registry of pooled-namespace managers plus the request dispatch for the
/// namespace service.
pub struct NamespaceService {
    managers: Managers,
    router: Router,
}

impl NamespaceService {
    pub fn new(
        root: &Path,
        config: &ServiceConfig,
        supplier: Arc<dyn Supplier>,
        rootfs_provider: Arc<dyn rootfs::Provider>,
        workers: Arc<WorkerPool>,
    ) -> Result<Self, BoxError> {
        let refs = config.references();

        let uts_manager = uts::new_manager(
            config.capacity_for(NamespaceType::Uts),
            &refs,
            Arc::clone(&workers),
        )
        .map_err(|e| with_context(e, "failed to create uts namespace manager"))?;
        let ipc_manager = IpcManager::new(
            config.capacity_for(NamespaceType::Ipc),
            &refs,
            Arc::clone(&supplier),
            Arc::clone(&workers),
        )
        .map_err(|e| with_context(e, "failed to create ipc namespace manager"))?;
        let mnt_manager = MntManager::new(
            root,
            config.capacity_for(NamespaceType::Mnt),
            &refs,
            rootfs_provider,
            supplier,
            workers,
        )
        .map_err(|e| with_context(e, "failed to create mount namespace manager"))?;

        let mut map: HashMap<NamespaceType, Arc<dyn Manager>> = HashMap::new();
        map.insert(NamespaceType::Uts, Arc::new(uts_manager));
        map.insert(NamespaceType::Ipc, Arc::new(ipc_manager));
        map.insert(NamespaceType::Mnt, Arc::new(mnt_manager));
        let managers: Managers = Arc::new(map);

        let mut router = Router::new();
        let get_managers = Arc::clone(&managers);
        router.add_handler(
            METHOD_GET_NAMESPACE,
            Box::new(move |conn| handle_get(&get_managers, conn)),
        );
        let put_managers = Arc::clone(&managers);
        router.add_handler(
            METHOD_PUT_NAMESPACE,
            Box::new(move |conn| handle_put(&put_managers, conn)),
        );
        let update_managers = Arc::clone(&managers);
        router.add_handler(
            METHOD_UPDATE_NAMESPACE,
            Box::new(move |conn| handle_update(&update_managers, conn)),
        );

        log_info(COMPONENT, "service initialized", &[]);
        Ok(NamespaceService { managers, router })
    }
}

impl Service for NamespaceService {
    fn handle(&self, conn: &mut UnixStream) -> Result<(), BoxError> {
        self.router.handle(conn)
    }

    fn stop(&self) -> Result<(), BoxError> {
        // bundle teardown is the heaviest; mount namespaces go last
        let mut errors = ErrorList::new();
        for t in [NamespaceType::Uts, NamespaceType::Ipc, NamespaceType::Mnt] {
            let Some(manager) = self.managers.get(&t) else {
                continue;
            };
            log_info(COMPONENT, "cleaning up manager", &[("namespace", t.as_str())]);
            if let Err(e) = manager.cleanup() {
                log_error(
                    COMPONENT,
                    "manager cleanup failed",
                    &[("namespace", t.as_str()), ("error", &e.to_string())],
                );
                errors.push(e);
            }
        }
        errors.into_result()
    }
}

fn handle_get(managers: &Managers, conn: &mut UnixStream) -> Result<(), BoxError> {
    let request: GetNamespaceRequest = frame::receive_json(conn)?;
    let response = match managers.get(&request.ns_type) {
        None => GetNamespaceResponse {
            pid: 0,
            fd: -1,
            info: Some(Value::String("no such namespace".to_string())),
        },
        Some(manager) => match manager.get(&request.reference, &request.extra_refs) {
            Ok((fd, info)) => GetNamespaceResponse {
                pid: std::process::id() as i32,
                fd,
                info: info.to_value(),
            },
            Err(e) => {
                log_warn(
                    COMPONENT,
                    "get namespace failed",
                    &[
                        ("namespace", request.ns_type.as_str()),
                        ("reference", &request.reference.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                GetNamespaceResponse {
                    pid: 0,
                    fd: -1,
                    info: Some(Value::String(e.to_string())),
                }
            }
        },
    };
    frame::send_json(conn, &response)
}

fn handle_put(managers: &Managers, conn: &mut UnixStream) -> Result<(), BoxError> {
    let request: PutNamespaceRequest = frame::receive_json(conn)?;
    let mut response = PutNamespaceResponse::default();
    match managers.get(&request.ns_type) {
        None => response.error = Some("no such namespace".to_string()),
        Some(manager) => {
            if let Err(e) = manager.put(request.id) {
                log_warn(
                    COMPONENT,
                    "put namespace failed",
                    &[
                        ("namespace", request.ns_type.as_str()),
                        ("fd", &request.id.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                response.error = Some(e.to_string());
            }
        }
    }
    frame::send_json(conn, &response)
}

/// `Update` fans out to every manager: each creates a set for the reference
/// if it does not have one yet, else resizes the idle pool.
fn handle_update(managers: &Managers, conn: &mut UnixStream) -> Result<(), BoxError> {
    let request: UpdateNamespaceRequest = frame::receive_json(conn)?;
    let mut errors = ErrorList::new();
    for (t, manager) in managers.iter() {
        if let Err(e) = manager.update(&request.reference, request.capacity) {
            log_warn(
                COMPONENT,
                "update namespace failed",
                &[
                    ("namespace", t.as_str()),
                    ("reference", &request.reference.to_string()),
                    ("error", &e.to_string()),
                ],
            );
            errors.push(e);
        }
    }
    let response = UpdateNamespaceResponse {
        error: errors.into_result().err().map(|e| e.to_string()),
    };
    frame::send_json(conn, &response)
}
