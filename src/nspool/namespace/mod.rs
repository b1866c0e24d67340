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

pub mod generic;
pub mod helper;
pub mod ipc;
pub mod mnt;
pub mod set;
pub mod uts;

use nix::sched::CloneFlags;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::os::fd::RawFd;

use crate::nspool::api::types::{NamespaceType, NsInfo, Reference};
use crate::nspool::util::error::{new_error, BoxError};

pub const NSEXEC_OP_ENV: &str = "__OP_TYPE__";
pub const NSEXEC_NS_TYPE_ENV: &str = "__NS_TYPE__";
pub const NSEXEC_NS_PATH_ENV: &str = "__NS_PATH__";
pub const NSEXEC_OP_CREATE: &str = "CREATE";
pub const NSEXEC_OP_ENTER: &str = "ENTER";

pub const RETURN_PREFIX: &[u8; 4] = b"ret:";
pub const ERROR_PREFIX: &[u8; 4] = b"err:";

/// Named routines a helper child can run inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsFunctionKey {
    Create,
    Release,
    Reset,
    Collect,
}

impl NsFunctionKey {
    pub fn as_str(self) -> &'static str {
        match self {
            NsFunctionKey::Create => "create",
            NsFunctionKey::Release => "release",
            NsFunctionKey::Reset => "reset",
            NsFunctionKey::Collect => "collect",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(NsFunctionKey::Create),
            "release" => Some(NsFunctionKey::Release),
            "reset" => Some(NsFunctionKey::Reset),
            "collect" => Some(NsFunctionKey::Collect),
            _ => None,
        }
    }
}

impl fmt::Display for NsFunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type NsFunctionArgs = BTreeMap<String, String>;
pub type NsFunction = fn(&NsFunctionArgs) -> Result<Vec<u8>, BoxError>;

/// Explicit registry of namespace functions, built once at program start and
/// handed to the `nsexec` subcommand. An empty function key means "no
/// function": the child only unshares or joins the namespace.
pub struct NsFunctionRegistry {
    functions: HashMap<(NsFunctionKey, NamespaceType), NsFunction>,
}

impl NsFunctionRegistry {
    pub fn empty() -> Self {
        NsFunctionRegistry {
            functions: HashMap::new(),
        }
    }

    /// The registry the daemon runs with.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(NsFunctionKey::Create, NamespaceType::Ipc, ipc::restore::populate_namespace);
        registry.register(NsFunctionKey::Collect, NamespaceType::Ipc, ipc::restore::collect_vars);
        registry.register(NsFunctionKey::Create, NamespaceType::Mnt, mnt::populate::populate_bundle);
        registry.register(NsFunctionKey::Release, NamespaceType::Mnt, mnt::populate::depopulate_bundle);
        registry
    }

    pub fn register(&mut self, key: NsFunctionKey, t: NamespaceType, function: NsFunction) {
        self.functions.insert((key, t), function);
    }

    pub fn get(&self, key: NsFunctionKey, t: NamespaceType) -> Option<NsFunction> {
        self.functions.get(&(key, t)).copied()
    }
}

/// Clone/setns flag for a namespace type.
pub fn clone_flag(t: NamespaceType) -> Result<CloneFlags, BoxError> {
    match t {
        NamespaceType::Ipc => Ok(CloneFlags::CLONE_NEWIPC),
        NamespaceType::Uts => Ok(CloneFlags::CLONE_NEWUTS),
        NamespaceType::Mnt => Ok(CloneFlags::CLONE_NEWNS),
        NamespaceType::Net => Ok(CloneFlags::CLONE_NEWNET),
    }
}

/// Opens `/proc/<pid>/ns/<type>`. Holding the returned file keeps the
/// namespace alive after the process that created it exits.
pub fn open_ns_file(t: NamespaceType, pid: i32) -> Result<File, BoxError> {
    let path = format!("/proc/{}/ns/{}", pid, t.proc_ns_name());
    File::open(&path).map_err(|e| new_error(format!("failed to open {}: {}", path, e)))
}

/// Per-type namespace manager. Implementations serialize their own state;
/// helper invocations never run under the state lock.
pub trait Manager: Send + Sync {
    /// Acquires a pooled namespace for `reference`. Returns the daemon-side
    /// fd (the client opens `/proc/<daemon_pid>/fd/<fd>` itself) plus
    /// auxiliary info.
    fn get(&self, reference: &Reference, extra_refs: &[Reference])
        -> Result<(RawFd, NsInfo), BoxError>;

    /// Returns a namespace previously handed out. Unknown fds are a client
    /// error.
    fn put(&self, fd: RawFd) -> Result<(), BoxError>;

    /// Creates the set for `reference` if missing, else resizes its idle
    /// pool. In-use namespaces are never evicted.
    fn update(&self, reference: &Reference, capacity: usize) -> Result<(), BoxError>;

    /// Releases every pooled and in-use namespace. Best-effort; failures are
    /// accumulated.
    fn cleanup(&self) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_hits_registered_pairs_only() {
        let registry = NsFunctionRegistry::standard();
        assert!(registry.get(NsFunctionKey::Create, NamespaceType::Ipc).is_some());
        assert!(registry.get(NsFunctionKey::Collect, NamespaceType::Ipc).is_some());
        assert!(registry.get(NsFunctionKey::Create, NamespaceType::Mnt).is_some());
        assert!(registry.get(NsFunctionKey::Release, NamespaceType::Mnt).is_some());
        assert!(registry.get(NsFunctionKey::Create, NamespaceType::Uts).is_none());
        assert!(registry.get(NsFunctionKey::Reset, NamespaceType::Mnt).is_none());
    }

    #[test]
    fn function_keys_parse_round_trip() {
        for key in [
            NsFunctionKey::Create,
            NsFunctionKey::Release,
            NsFunctionKey::Reset,
            NsFunctionKey::Collect,
        ] {
            assert_eq!(NsFunctionKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(NsFunctionKey::parse("destroy"), None);
    }
}
