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
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::nspool::api::checkpoint::{
    GetCheckpointRequest, GetCheckpointResponse, METHOD_GET_CHECKPOINT,
};
use crate::nspool::api::namespace::{
    GetNamespaceRequest, GetNamespaceResponse, PutNamespaceRequest, PutNamespaceResponse,
    UpdateNamespaceRequest, UpdateNamespaceResponse, METHOD_GET_NAMESPACE, METHOD_PUT_NAMESPACE,
    METHOD_UPDATE_NAMESPACE,
};
use crate::nspool::api::types::{NamespaceType, Reference};
use crate::nspool::config::{Config, SOCKET_NAME};
use crate::nspool::services::{frame, CHECKPOINT_SERVICE, NAMESPACE_SERVICE};
use crate::nspool::util::error::{new_error, with_context, BoxError};

/// A namespace handed out by the daemon: open
/// `/proc/<pid>/fd/<fd>` and pass it to `setns(2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceGrant {
    pub pid: i32,
    pub fd: i32,
    pub info: Option<Value>,
}

impl NamespaceGrant {
    pub fn ns_path(&self) -> String {
        format!("/proc/{}/fd/{}", self.pid, self.fd)
    }
}

/// Client side of the daemon socket protocol.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub fn connect(root: &Path) -> Result<Self, BoxError> {
        let socket_path = root.join(SOCKET_NAME);
        let stream = UnixStream::connect(&socket_path).map_err(|e| {
            with_context(e, format!("failed to connect to {}", socket_path.display()))
        })?;
        Ok(Client { stream })
    }

    /// Connects to the default daemon root (honoring `NSPOOL_ROOT`).
    pub fn default_socket() -> Result<Self, BoxError> {
        Self::connect(&Config::Root.get_path())
    }

    pub fn get_namespace(
        &mut self,
        ns_type: NamespaceType,
        reference: Reference,
        extra_refs: Vec<Reference>,
    ) -> Result<NamespaceGrant, BoxError> {
        frame::send_service_type(&mut self.stream, NAMESPACE_SERVICE)?;
        frame::send_method(&mut self.stream, METHOD_GET_NAMESPACE)?;
        frame::send_json(
            &mut self.stream,
            &GetNamespaceRequest {
                ns_type,
                reference,
                extra_refs,
            },
        )?;
        let response: GetNamespaceResponse = frame::receive_json(&mut self.stream)?;
        if response.fd < 0 {
            let message = response
                .info
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or("namespace request failed");
            return Err(new_error(message.to_string()));
        }
        Ok(NamespaceGrant {
            pid: response.pid,
            fd: response.fd,
            info: response.info,
        })
    }

    pub fn put_namespace(&mut self, ns_type: NamespaceType, fd: i32) -> Result<(), BoxError> {
        frame::send_service_type(&mut self.stream, NAMESPACE_SERVICE)?;
        frame::send_method(&mut self.stream, METHOD_PUT_NAMESPACE)?;
        frame::send_json(&mut self.stream, &PutNamespaceRequest { ns_type, id: fd })?;
        let response: PutNamespaceResponse = frame::receive_json(&mut self.stream)?;
        match response.error {
            Some(message) => Err(new_error(message)),
            None => Ok(()),
        }
    }

    pub fn update_namespace(
        &mut self,
        reference: Reference,
        capacity: usize,
    ) -> Result<(), BoxError> {
        frame::send_service_type(&mut self.stream, NAMESPACE_SERVICE)?;
        frame::send_method(&mut self.stream, METHOD_UPDATE_NAMESPACE)?;
        frame::send_json(
            &mut self.stream,
            &UpdateNamespaceRequest {
                reference,
                capacity,
            },
        )?;
        let response: UpdateNamespaceResponse = frame::receive_json(&mut self.stream)?;
        match response.error {
            Some(message) => Err(new_error(message)),
            None => Ok(()),
        }
    }

    pub fn get_checkpoint(&mut self, reference: Reference) -> Result<PathBuf, BoxError> {
        frame::send_service_type(&mut self.stream, CHECKPOINT_SERVICE)?;
        frame::send_method(&mut self.stream, METHOD_GET_CHECKPOINT)?;
        frame::send_json(&mut self.stream, &GetCheckpointRequest { reference })?;
        let response: GetCheckpointResponse = frame::receive_json(&mut self.stream)?;
        if let Some(message) = response.error {
            return Err(new_error(message));
        }
        Ok(PathBuf::from(response.path))
    }
}
