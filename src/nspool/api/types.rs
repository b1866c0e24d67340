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
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Content-addressed identity of a checkpoint or image. The digest of the
/// canonical JSON serialization is the stable key for every map indexed by
/// reference; label order never affects it because labels live in a sorted
/// map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Reference {
    pub fn new(name: impl Into<String>) -> Self {
        Reference {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    /// A reference naming a containerd-managed checkpoint; the containerd
    /// namespace travels as a label.
    pub fn containerd(name: impl Into<String>, namespace: &str) -> Self {
        let namespace = if namespace.is_empty() {
            "default"
        } else {
            namespace
        };
        let mut labels = BTreeMap::new();
        labels.insert("namespace".to_string(), namespace.to_string());
        Reference {
            name: name.into(),
            labels,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("reference serialization cannot fail");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        write!(f, "({}){}", labels.join(","), self.name)
    }
}

/// Kinds of kernel namespace the daemon knows about. NET is never pooled; it
/// exists so helper children can enter a network namespace for one-shot
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Ipc,
    Uts,
    Mnt,
    Net,
}

impl NamespaceType {
    pub fn as_str(self) -> &'static str {
        match self {
            NamespaceType::Ipc => "ipc",
            NamespaceType::Uts => "uts",
            NamespaceType::Mnt => "mnt",
            NamespaceType::Net => "net",
        }
    }

    /// The entry name under `/proc/<pid>/ns/`.
    pub fn proc_ns_name(self) -> &'static str {
        self.as_str()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ipc" => Some(NamespaceType::Ipc),
            "uts" => Some(NamespaceType::Uts),
            "mnt" => Some(NamespaceType::Mnt),
            "net" => Some(NamespaceType::Net),
            _ => None,
        }
    }
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Auxiliary information attached to a namespace handed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsInfo {
    None,
    Bundle(PathBuf),
}

impl NsInfo {
    pub fn to_value(&self) -> Option<Value> {
        match self {
            NsInfo::None => None,
            NsInfo::Bundle(path) => Some(json!({ "bundle": path.to_string_lossy() })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_insensitive_to_label_insertion_order() {
        let mut a = Reference::new("checkpoint/redis");
        a.labels.insert("namespace".into(), "default".into());
        a.labels.insert("tier".into(), "warm".into());

        let mut b = Reference::new("checkpoint/redis");
        b.labels.insert("tier".into(), "warm".into());
        b.labels.insert("namespace".into(), "default".into());

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn digest_is_stable_across_clones() {
        let reference = Reference::containerd("checkpoint/nginx", "serverless");
        assert_eq!(reference.digest(), reference.clone().digest());
    }

    #[test]
    fn different_names_produce_different_digests() {
        assert_ne!(
            Reference::new("a").digest(),
            Reference::new("b").digest()
        );
    }

    #[test]
    fn containerd_reference_defaults_namespace() {
        let reference = Reference::containerd("img", "");
        assert_eq!(reference.label("namespace"), Some("default"));
    }

    #[test]
    fn namespace_type_round_trips_through_serde() {
        let t: NamespaceType = serde_json::from_str("\"mnt\"").unwrap();
        assert_eq!(t, NamespaceType::Mnt);
        assert_eq!(serde_json::to_string(&NamespaceType::Ipc).unwrap(), "\"ipc\"");
    }

    #[test]
    fn bundle_info_serializes_path() {
        let info = NsInfo::Bundle(PathBuf::from("/tmp/.cer.bundle.x"));
        let value = info.to_value().unwrap();
        assert_eq!(
            value.get("bundle").and_then(|v| v.as_str()),
            Some("/tmp/.cer.bundle.x")
        );
        assert!(NsInfo::None.to_value().is_none());
    }
}
