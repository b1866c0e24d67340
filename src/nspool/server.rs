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
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::nspool::config::SOCKET_NAME;
use crate::nspool::logger::{log_debug, log_error, log_info};
use crate::nspool::services::{frame, Service, ServiceType};
use crate::nspool::util::error::{with_context, BoxError};

const COMPONENT: &str = "server";

/// Counts live connection handlers so shutdown can drain them.
struct ConnTracker {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ConnTracker {
    fn new() -> Self {
        ConnTracker {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn enter(&self) {
        *self.count.lock().expect("connection tracker poisoned") += 1;
    }

    fn exit(&self) {
        let mut count = self.count.lock().expect("connection tracker poisoned");
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().expect("connection tracker poisoned");
        while *count > 0 {
            count = self.idle.wait(count).expect("connection tracker poisoned");
        }
    }
}

/// The daemon's unix-socket front. Requests carry a service-type prefix;
/// each connection gets its own handler thread and may issue any number of
/// requests before hanging up.
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    services: Arc<HashMap<ServiceType, Arc<dyn Service>>>,
    stop_order: Vec<ServiceType>,
    shutdown: Arc<AtomicBool>,
    tracker: Arc<ConnTracker>,
    accept_handle: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(
        root: &Path,
        services: HashMap<ServiceType, Arc<dyn Service>>,
        stop_order: Vec<ServiceType>,
    ) -> Result<Self, BoxError> {
        fs::create_dir_all(root)
            .map_err(|e| with_context(e, "failed to create daemon root"))?;
        let socket_path = root.join(SOCKET_NAME);
        if socket_path.exists() {
            fs::remove_file(&socket_path)
                .map_err(|e| with_context(e, "failed to remove stale socket"))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| with_context(e, format!("failed to bind {}", socket_path.display())))?;
        Ok(Server {
            socket_path,
            listener: Some(listener),
            services: Arc::new(services),
            stop_order,
            shutdown: Arc::new(AtomicBool::new(false)),
            tracker: Arc::new(ConnTracker::new()),
            accept_handle: None,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn start(&mut self) {
        let listener = self.listener.take().expect("server already started");
        let services = Arc::clone(&self.services);
        let shutdown = Arc::clone(&self.shutdown);
        let tracker = Arc::clone(&self.tracker);
        let handle = thread::Builder::new()
            .name("nspool-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let services = Arc::clone(&services);
                            let shutdown = Arc::clone(&shutdown);
                            let tracker = Arc::clone(&tracker);
                            tracker.enter();
                            let conn_tracker = Arc::clone(&tracker);
                            let spawned = thread::Builder::new()
                                .name("nspool-conn".to_string())
                                .spawn(move || {
                                    serve_connection(stream, &services, &shutdown);
                                    conn_tracker.exit();
                                });
                            if let Err(e) = spawned {
                                log_error(
                                    COMPONENT,
                                    "failed to spawn connection handler",
                                    &[("error", &e.to_string())],
                                );
                                tracker.exit();
                            }
                        }
                        Err(e) => {
                            log_error(COMPONENT, "accept failed", &[("error", &e.to_string())]);
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn accept thread");
        self.accept_handle = Some(handle);
        log_info(
            COMPONENT,
            "server started",
            &[("socket", &self.socket_path.to_string_lossy())],
        );
    }

    /// Stops accepting, drains in-flight handlers, then stops the services
    /// in the configured order.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // wake the accept loop so it observes the flag
        let _ = UnixStream::connect(&self.socket_path);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        self.tracker.wait_idle();
        for service_type in &self.stop_order {
            let Some(service) = self.services.get(service_type) else {
                continue;
            };
            if let Err(e) = service.stop() {
                log_error(
                    COMPONENT,
                    "service stop failed",
                    &[
                        ("service", &service_type.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
            }
        }
        let _ = fs::remove_file(&self.socket_path);
        log_info(COMPONENT, "server stopped", &[]);
    }
}

fn serve_connection(
    mut stream: UnixStream,
    services: &HashMap<ServiceType, Arc<dyn Service>>,
    shutdown: &AtomicBool,
) {
    loop {
        let service_type = match frame::receive_service_type(&mut stream) {
            Ok(service_type) => service_type,
            Err(e) => {
                if e.kind() != ErrorKind::UnexpectedEof {
                    log_error(
                        COMPONENT,
                        "cannot read service type",
                        &[("error", &e.to_string())],
                    );
                }
                return;
            }
        };
        let Some(service) = services.get(&service_type) else {
            log_error(
                COMPONENT,
                "no such service",
                &[("service", &service_type.to_string())],
            );
            return;
        };
        if let Err(e) = service.handle(&mut stream) {
            log_error(
                COMPONENT,
                "request handler failed",
                &[("error", &e.to_string())],
            );
            return;
        }
        log_debug(COMPONENT, "request served", &[("service", &service_type.to_string())]);
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
    }
}
