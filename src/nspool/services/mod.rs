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

pub mod checkpoint;
pub mod frame;
pub mod namespace;

use std::collections::HashMap;
use std::os::unix::net::UnixStream;

use crate::nspool::util::error::{new_error, BoxError};

pub type ServiceType = u16;

pub const MAIN_SERVICE: ServiceType = 10;
pub const NAMESPACE_SERVICE: ServiceType = 11;
pub const CHECKPOINT_SERVICE: ServiceType = 12;

/// One multiplexed service behind the daemon socket.
pub trait Service: Send + Sync {
    /// Handles a single request already routed to this service.
    fn handle(&self, conn: &mut UnixStream) -> Result<(), BoxError>;

    /// Releases the service's resources during shutdown.
    fn stop(&self) -> Result<(), BoxError>;
}

pub type Handler = Box<dyn Fn(&mut UnixStream) -> Result<(), BoxError> + Send + Sync>;

/// Method-name dispatch within one service.
pub struct Router {
    handlers: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Router {
            handlers: HashMap::new(),
        }
    }

    pub fn add_handler(&mut self, method: impl Into<String>, handler: Handler) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn handle(&self, conn: &mut UnixStream) -> Result<(), BoxError> {
        let method = frame::receive_method(conn)?;
        let handler = self
            .handlers
            .get(&method)
            .ok_or_else(|| new_error(format!("no handler matches method {}", method)))?;
        handler(conn)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
