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

//! Runs the unix-socket server with the checkpoint service in-process and
//! drives it through the client, without requiring privileges.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use nspool::nspool::api::types::Reference;
use nspool::nspool::checkpoint::LocalProvider;
use nspool::nspool::client::Client;
use nspool::nspool::server::Server;
use nspool::nspool::services::checkpoint::CheckpointService;
use nspool::nspool::services::{Service, ServiceType, CHECKPOINT_SERVICE};

#[test]
fn checkpoint_requests_round_trip_over_the_socket() {
    let store = tempfile::tempdir().expect("store tempdir");
    let images = store.path().join("checkpoint/app");
    fs::create_dir_all(&images).expect("image dir");
    fs::write(images.join("ipcns-var-1.img"), b"vars").expect("var image");
    fs::write(images.join("mountpoints-7.img"), b"mounts").expect("mountpoints image");

    let root = tempfile::tempdir().expect("root tempdir");
    let service = Arc::new(
        CheckpointService::new(root.path(), Arc::new(LocalProvider::new(store.path())))
            .expect("checkpoint service"),
    );
    let mut services: HashMap<ServiceType, Arc<dyn Service>> = HashMap::new();
    services.insert(CHECKPOINT_SERVICE, service);
    let mut server =
        Server::new(root.path(), services, vec![CHECKPOINT_SERVICE]).expect("server");
    server.start();

    let mut client = Client::connect(root.path()).expect("client connect");
    let reference = Reference::new("checkpoint/app");
    let prepared = client
        .get_checkpoint(reference.clone())
        .expect("get checkpoint");
    assert!(prepared.join("ipcns-var-1.img").exists());
    assert!(prepared.join("mountpoints-7.img").exists());
    assert!(prepared.ends_with(reference.digest()));

    // the prepared directory is cached, same connection or not
    let again = client.get_checkpoint(reference).expect("second get");
    assert_eq!(prepared, again);

    let err = client
        .get_checkpoint(Reference::new("no/such/checkpoint"))
        .expect_err("unknown reference must fail");
    assert!(err.to_string().contains("does not exist"));

    drop(client);
    server.shutdown();
    assert!(
        !root.path().join("daemon.socket").exists(),
        "socket must be removed on shutdown"
    );
    assert!(!prepared.exists(), "prepared checkpoints are removed on stop");
}
