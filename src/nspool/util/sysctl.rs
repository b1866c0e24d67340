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

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::nspool::util::error::{with_context, BoxError};

const SYS_PATH: &str = "/proc/sys";

/// Reads the value of `/proc/sys/<item>`, trimmed.
pub fn sysctl_read(item: &str) -> Result<String, BoxError> {
    let path = Path::new(SYS_PATH).join(item);
    let content = fs::read_to_string(&path)
        .map_err(|e| with_context(e, format!("failed to read {}", path.display())))?;
    Ok(content.trim().to_string())
}

/// Writes `value` to `/proc/sys/<item>`.
pub fn sysctl_write(item: &str, value: &str) -> Result<(), BoxError> {
    let path = Path::new(SYS_PATH).join(item);
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| with_context(e, format!("failed to open {}", path.display())))?;
    writeln!(file, "{}", value)
        .map_err(|e| with_context(e, format!("failed to write {}", path.display())))?;
    Ok(())
}

/// Reads an unsigned sysctl; kernels report unavailable tunables as
/// negative values, which map to `None`.
pub fn sysctl_read_u64(item: &str) -> Result<Option<u64>, BoxError> {
    let value = sysctl_read(item)?;
    if value.is_empty() || value.starts_with('-') {
        return Ok(None);
    }
    let parsed = value
        .parse::<u64>()
        .map_err(|e| with_context(e, format!("unexpected value in {}: {}", item, value)))?;
    Ok(Some(parsed))
}

pub fn sysctl_read_u32(item: &str) -> Result<Option<u32>, BoxError> {
    Ok(sysctl_read_u64(item)?.map(|v| v as u32))
}
