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

use nix::sys::signal::{SigSet, Signal};
use nix::unistd::Uid;
use std::collections::HashMap;
use std::sync::Arc;

use crate::nspool::checkpoint;
use crate::nspool::config::{Config, ServiceConfig};
use crate::nspool::logger::{self, log_info};
use crate::nspool::rootfs;
use crate::nspool::server::Server;
use crate::nspool::services::checkpoint::CheckpointService;
use crate::nspool::services::namespace::NamespaceService;
use crate::nspool::services::{Service, ServiceType, CHECKPOINT_SERVICE, NAMESPACE_SERVICE};
use crate::nspool::util::error::{new_error, with_context, BoxError};
use crate::nspool::util::workers::WorkerPool;

use super::{parse_log_format, parse_log_level, StartArgs};

const COMPONENT: &str = "main";

pub fn run(args: &StartArgs) -> Result<(), BoxError> {
    logger::set_log_format(parse_log_format(&args.log_format));
    logger::init(parse_log_level(&args.log_level));

    if !Uid::effective().is_root() {
        return Err(new_error("must be run as root"));
    }

    let root = args.root.clone().unwrap_or_else(|| Config::Root.get_path());
    let config = ServiceConfig::load(&root)?;
    log_info(
        COMPONENT,
        "starting daemon",
        &[
            ("root", &root.to_string_lossy()),
            ("refs", &config.refs.len().to_string()),
        ],
    );

    let workers = Arc::new(WorkerPool::new(config.workers));

    let checkpoint_service = Arc::new(CheckpointService::new(
        &root,
        Arc::new(checkpoint::LocalProvider::new(
            Config::CheckpointStore.get_path(),
        )),
    )?);
    let namespace_service = Arc::new(NamespaceService::new(
        &root,
        &config,
        Arc::clone(&checkpoint_service) as Arc<dyn checkpoint::Supplier>,
        Arc::new(rootfs::LocalProvider::new(Config::RootfsStore.get_path())),
        workers,
    )?);

    let mut services: HashMap<ServiceType, Arc<dyn Service>> = HashMap::new();
    services.insert(NAMESPACE_SERVICE, namespace_service);
    services.insert(CHECKPOINT_SERVICE, checkpoint_service);

    let mut server = Server::new(
        &root,
        services,
        // namespace managers replay out of prepared checkpoints, so the
        // checkpoint service must outlive them
        vec![NAMESPACE_SERVICE, CHECKPOINT_SERVICE],
    )?;
    server.start();

    let signal = wait_for_signal()?;
    log_info(
        COMPONENT,
        "received signal, shutting down",
        &[("signal", signal.as_str())],
    );
    server.shutdown();
    Ok(())
}

fn wait_for_signal() -> Result<Signal, BoxError> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()
        .map_err(|e| with_context(e, "failed to block signals"))?;
    set.wait().map_err(|e| with_context(e, "sigwait failed"))
}
