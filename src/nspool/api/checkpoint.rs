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

use super::types::Reference;

pub const METHOD_GET_CHECKPOINT: &str = "Get";
pub const METHOD_PUT_CHECKPOINT: &str = "Put";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCheckpointRequest {
    #[serde(rename = "ref")]
    pub reference: Reference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCheckpointResponse {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutCheckpointRequest {
    #[serde(rename = "ref")]
    pub reference: Reference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutCheckpointResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
