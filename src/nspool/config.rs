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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::nspool::api::types::{NamespaceType, Reference};
use crate::nspool::util::error::{with_context, BoxError};

pub const SOCKET_NAME: &str = "daemon.socket";
pub const SERVICE_CONFIG_NAME: &str = "namespace_service.json";

const DEFAULT_CAPACITY: usize = 5;
const DEFAULT_WORKERS: usize = 4;

/// Well-known daemon paths, each overridable through its environment
/// variable.
#[derive(Debug, Clone, Copy)]
pub enum Config {
    /// Daemon state directory: socket, service config, shared rootfs
    /// mounts, prepared checkpoints.
    Root,
    /// Store the local rootfs provider serves references from.
    RootfsStore,
    /// Store the local checkpoint provider serves references from.
    CheckpointStore,
}

impl Config {
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Root => "NSPOOL_ROOT",
            Config::RootfsStore => "NSPOOL_ROOTFS_STORE",
            Config::CheckpointStore => "NSPOOL_CHECKPOINT_STORE",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            Config::Root => {
                #[cfg(test)]
                {
                    "/tmp/nspool-test"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/nspool"
                }
            }
            Config::RootfsStore => {
                #[cfg(test)]
                {
                    "/tmp/nspool-test/images"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/nspool/images"
                }
            }
            Config::CheckpointStore => {
                #[cfg(test)]
                {
                    "/tmp/nspool-test/checkpoints"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/nspool/checkpoints"
                }
            }
        }
    }

    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var())
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(self.default_path()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Pool configuration: per-type capacities and the references to prewarm.
/// Loaded from `<root>/namespace_service.json` when present, merged over
/// the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_capacities")]
    pub capacity: HashMap<NamespaceType, usize>,
    #[serde(default, rename = "checkpoint_refs")]
    pub refs: Vec<RefSpec>,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            capacity: default_capacities(),
            refs: Vec::new(),
            workers: DEFAULT_WORKERS,
        }
    }
}

impl ServiceConfig {
    pub fn load(root: &Path) -> Result<Self, BoxError> {
        let path = root.join(SERVICE_CONFIG_NAME);
        if !path.exists() {
            return Ok(ServiceConfig::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| with_context(e, format!("failed to read {}", path.display())))?;
        let mut config: ServiceConfig = serde_json::from_str(&content)
            .map_err(|e| with_context(e, format!("failed to parse {}", path.display())))?;
        for t in [NamespaceType::Ipc, NamespaceType::Uts, NamespaceType::Mnt] {
            config.capacity.entry(t).or_insert(DEFAULT_CAPACITY);
        }
        Ok(config)
    }

    pub fn capacity_for(&self, t: NamespaceType) -> usize {
        self.capacity.get(&t).copied().unwrap_or(DEFAULT_CAPACITY)
    }

    pub fn references(&self) -> Vec<Reference> {
        self.refs
            .iter()
            .map(|spec| Reference::containerd(&spec.name, &spec.namespace))
            .collect()
    }
}

fn default_capacities() -> HashMap<NamespaceType, usize> {
    HashMap::from([
        (NamespaceType::Ipc, DEFAULT_CAPACITY),
        (NamespaceType::Uts, DEFAULT_CAPACITY),
        (NamespaceType::Mnt, DEFAULT_CAPACITY),
    ])
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load(dir.path()).unwrap();
        assert_eq!(config.capacity_for(NamespaceType::Uts), 5);
        assert!(config.references().is_empty());
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SERVICE_CONFIG_NAME),
            r#"{
                "capacity": {"mnt": 2},
                "checkpoint_refs": [{"name": "checkpoint/redis", "namespace": "prod"}]
            }"#,
        )
        .unwrap();
        let config = ServiceConfig::load(dir.path()).unwrap();
        assert_eq!(config.capacity_for(NamespaceType::Mnt), 2);
        assert_eq!(config.capacity_for(NamespaceType::Ipc), 5);
        let refs = config.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].label("namespace"), Some("prod"));
    }

    #[test]
    fn env_override_wins_for_paths() {
        env::set_var("NSPOOL_ROOT", "/tmp/nspool-alt");
        assert_eq!(Config::Root.get_path(), PathBuf::from("/tmp/nspool-alt"));
        env::remove_var("NSPOOL_ROOT");
        assert_eq!(
            Config::Root.get_path(),
            PathBuf::from(Config::Root.default_path())
        );
    }
}
