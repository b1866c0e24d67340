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

use log::{debug, warn};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use crate::nspool::api::types::NamespaceType;
use crate::nspool::util::error::{new_error, with_context, BoxError};

use super::{
    NsFunctionArgs, NsFunctionKey, ERROR_PREFIX, NSEXEC_NS_PATH_ENV, NSEXEC_NS_TYPE_ENV,
    NSEXEC_OP_CREATE, NSEXEC_OP_ENTER, NSEXEC_OP_ENV, RETURN_PREFIX,
};

/// Arguments a helper child accepts on its command line. The set is closed:
/// the registered namespace functions only consume these keys.
const ALLOWED_ARGS: [&str; 3] = ["src", "bundle", "checkpoint"];

/// One `nsexec` helper invocation. `unshare` permanently changes the calling
/// task, so namespace creation is delegated to a short-lived re-exec of the
/// daemon binary; keeping the child alive until the parent has opened
/// `/proc/<pid>/ns/<type>` turns the namespace into an anonymous inode owned
/// by a daemon-side fd.
pub struct NsExecHelper {
    child: Child,
    payload: Vec<u8>,
    released: bool,
}

impl NsExecHelper {
    /// Spawns a helper that unshares a fresh namespace of type `t` and runs
    /// the function registered under `key` (no function when `key` is
    /// `None`).
    pub fn new_create(
        key: Option<NsFunctionKey>,
        t: NamespaceType,
        args: &NsFunctionArgs,
    ) -> Result<Self, BoxError> {
        Self::spawn(key, t, args, NSEXEC_OP_CREATE, None)
    }

    /// Spawns a helper that joins the namespace behind `ns_path`
    /// (`/proc/<pid>/fd/<fd>`, kept open by the caller across the spawn) and
    /// runs the function registered under `key`.
    pub fn new_enter(
        key: Option<NsFunctionKey>,
        t: NamespaceType,
        ns_path: String,
        args: &NsFunctionArgs,
    ) -> Result<Self, BoxError> {
        Self::spawn(key, t, args, NSEXEC_OP_ENTER, Some(ns_path))
    }

    fn spawn(
        key: Option<NsFunctionKey>,
        t: NamespaceType,
        args: &NsFunctionArgs,
        op: &str,
        ns_path: Option<String>,
    ) -> Result<Self, BoxError> {
        let mut command = Command::new("/proc/self/exe");
        command.arg("nsexec");
        for (name, value) in args {
            if !ALLOWED_ARGS.contains(&name.as_str()) {
                return Err(new_error(format!("unsupported helper argument {}", name)));
            }
            command.arg(format!("--{}", name)).arg(value);
        }
        command
            .arg(key.map(|k| k.as_str()).unwrap_or(""))
            .arg(t.as_str());
        command.env_clear();
        command.env(NSEXEC_OP_ENV, op);
        command.env(NSEXEC_NS_TYPE_ENV, t.as_str());
        if let Some(path) = ns_path {
            command.env(NSEXEC_NS_PATH_ENV, path);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        debug!(
            "spawning nsexec helper op={} type={} key={}",
            op,
            t,
            key.map(|k| k.as_str()).unwrap_or("")
        );
        let child = command
            .spawn()
            .map_err(|e| with_context(e, "failed to spawn nsexec helper"))?;
        Ok(NsExecHelper {
            child,
            payload: Vec::new(),
            released: false,
        })
    }

    /// Drives the protocol to the point where the child has run its function
    /// and printed the result. On success the child is still alive, blocked
    /// on its stdin, so the caller may open `/proc/<pid>/ns/<type>` before
    /// calling [`release`](Self::release).
    pub fn run(&mut self) -> Result<(), BoxError> {
        match self.read_result() {
            Ok(payload) => {
                self.payload = payload;
                Ok(())
            }
            Err(e) => {
                self.force_kill();
                Err(e)
            }
        }
    }

    fn read_result(&mut self) -> Result<Vec<u8>, BoxError> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| new_error("helper stdout is not piped"))?;

        let mut prefix = [0u8; 4];
        stdout
            .read_exact(&mut prefix)
            .map_err(|e| with_context(e, "failed to read result prefix from helper"))?;

        // payload framing: <decimal-length>,<payload-bytes>
        let mut length: usize = 0;
        loop {
            let mut byte = [0u8; 1];
            stdout
                .read_exact(&mut byte)
                .map_err(|e| with_context(e, "failed to read payload length from helper"))?;
            match byte[0] {
                b',' => break,
                b'0'..=b'9' => {
                    length = length
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((byte[0] - b'0') as usize))
                        .ok_or_else(|| new_error("helper payload length overflows"))?;
                }
                other => {
                    return Err(new_error(format!(
                        "malformed payload length byte {:#x} from helper",
                        other
                    )))
                }
            }
        }
        let mut payload = vec![0u8; length];
        stdout
            .read_exact(&mut payload)
            .map_err(|e| with_context(e, "failed to read payload from helper"))?;

        match &prefix {
            RETURN_PREFIX => Ok(payload),
            ERROR_PREFIX => Err(new_error(format!(
                "helper function failed: {}",
                String::from_utf8_lossy(&payload)
            ))),
            other => Err(new_error(format!(
                "malformed result prefix {:?} from helper",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Bytes the namespace function returned.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn child_pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Tells the child to exit and reaps it. Must be called exactly once
    /// after a successful [`run`](Self::run).
    pub fn release(&mut self) -> Result<(), BoxError> {
        if self.released {
            return Err(new_error("helper already released"));
        }
        self.released = true;
        let result = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| new_error("helper stdin is not piped"))
            .and_then(|stdin| {
                stdin
                    .write_all(b"OK\n")
                    .map_err(|e| with_context(e, "failed to release helper"))
            });
        if let Err(e) = result {
            self.force_kill_unchecked();
            return Err(e);
        }
        let status = self
            .child
            .wait()
            .map_err(|e| with_context(e, "failed to wait for helper"))?;
        if !status.success() {
            return Err(new_error(format!("helper exited with {}", status)));
        }
        Ok(())
    }

    fn force_kill(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.force_kill_unchecked();
    }

    fn force_kill_unchecked(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!("failed to kill nsexec helper {}: {}", self.child.id(), e);
        }
        let _ = self.child.wait();
    }
}

impl Drop for NsExecHelper {
    fn drop(&mut self) {
        self.force_kill();
    }
}
