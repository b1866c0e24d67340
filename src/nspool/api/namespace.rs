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
use serde_json::Value;

use super::types::{NamespaceType, Reference};

pub const METHOD_GET_NAMESPACE: &str = "Get";
pub const METHOD_PUT_NAMESPACE: &str = "Put";
pub const METHOD_UPDATE_NAMESPACE: &str = "Update";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNamespaceRequest {
    #[serde(rename = "namespace_type")]
    pub ns_type: NamespaceType,
    #[serde(rename = "ref")]
    pub reference: Reference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_refs: Vec<Reference>,
}

/// `fd` is -1 on failure, in which case `info` carries the error string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNamespaceResponse {
    pub pid: i32,
    #[serde(rename = "namespace_fd")]
    pub fd: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutNamespaceRequest {
    #[serde(rename = "namespace_type")]
    pub ns_type: NamespaceType,
    #[serde(rename = "namespace_id")]
    pub id: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutNamespaceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNamespaceRequest {
    #[serde(rename = "ref")]
    pub reference: Reference,
    pub capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateNamespaceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_fields_use_wire_names() {
        let request = GetNamespaceRequest {
            ns_type: NamespaceType::Mnt,
            reference: Reference::new("checkpoint/app"),
            extra_refs: Vec::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("namespace_type").is_some());
        assert!(value.get("ref").is_some());
        assert!(value.get("extra_refs").is_none());
    }

    #[test]
    fn failure_response_carries_error_string() {
        let response = GetNamespaceResponse {
            pid: 0,
            fd: -1,
            info: Some(Value::String("MNT namespace of (x)y is used up".into())),
        };
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: GetNamespaceResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.fd, -1);
        assert!(decoded.info.unwrap().as_str().unwrap().contains("used up"));
    }
}
