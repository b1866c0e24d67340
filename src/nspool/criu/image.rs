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

use prost::Message;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::nspool::util::error::{new_error, with_context, BoxError};

/// Sequential reader over a CRIU image: a stream of entries, each a 4-byte
/// little-endian size followed by a protobuf message. Some entries are
/// trailed by raw payload bytes (shm contents, sem values, message text);
/// those are pulled straight off the underlying file between entry reads.
pub struct ImageFile {
    file: File,
    path: PathBuf,
}

impl ImageFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BoxError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| with_context(e, format!("failed to open image {}", path.display())))?;
        Ok(ImageFile { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the next entry, or `None` at a clean end of stream. A partial
    /// size prefix or a short message body is an error.
    pub fn read_entry<M: Message + Default>(&mut self) -> Result<Option<M>, BoxError> {
        let mut prefix = [0u8; 4];
        let mut filled = 0usize;
        while filled < prefix.len() {
            let n = self
                .file
                .read(&mut prefix[filled..])
                .map_err(|e| with_context(e, format!("failed to read {}", self.path.display())))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(new_error(format!(
                    "truncated size prefix in {}",
                    self.path.display()
                )));
            }
            filled += n;
        }
        let size = u32::from_le_bytes(prefix) as usize;
        let mut body = vec![0u8; size];
        self.file.read_exact(&mut body).map_err(|e| {
            with_context(
                e,
                format!("truncated entry body in {}", self.path.display()),
            )
        })?;
        let message = M::decode(body.as_slice()).map_err(|e| {
            with_context(e, format!("failed to decode entry in {}", self.path.display()))
        })?;
        Ok(Some(message))
    }

    /// Reads exactly `len` trailing payload bytes following the last entry.
    pub fn read_payload(&mut self, len: usize) -> Result<Vec<u8>, BoxError> {
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer).map_err(|e| {
            with_context(
                e,
                format!("truncated inline payload in {}", self.path.display()),
            )
        })?;
        Ok(buffer)
    }

}

/// Appends one size-prefixed entry to `writer`. The daemon only reads
/// images; this is for fixture construction and tooling.
pub fn append_entry<M: Message>(writer: &mut impl Write, message: &M) -> io::Result<()> {
    let body = message.encode_to_vec();
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)
}

/// Rounds `n` up to the next multiple of `multiple`.
pub fn round_up(n: u64, multiple: u64) -> u64 {
    n.div_ceil(multiple) * multiple
}

/// Finds the single file in `dir` whose name starts with `prefix`.
pub fn find_image_with_prefix(dir: &Path, prefix: &str) -> Result<Option<PathBuf>, BoxError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| with_context(e, format!("failed to read dir {}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| with_context(e, "failed to enumerate checkpoint dir"))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspool::criu::types::{IpcDescEntry, IpcSemEntry, IpcVarEntry};
    use std::io::Seek;

    fn sample_var_entry() -> IpcVarEntry {
        IpcVarEntry {
            sem_ctls: vec![32000, 1024000000, 500, 32000],
            msg_ctlmax: 8192,
            msg_ctlmnb: 16384,
            msg_ctlmni: 32000,
            auto_msgmni: Some(0),
            shm_ctlmax: 18446744073692774399,
            shm_ctlall: 18446744073692774399,
            shm_ctlmni: 4096,
            shm_rmid_forced: Some(0),
            mq_queues_max: Some(256),
            mq_msg_max: Some(10),
            mq_msgsize_max: Some(8192),
            mq_msg_default: Some(10),
            mq_msgsize_default: Some(8192),
            msg_next_id: None,
            sem_next_id: None,
            shm_next_id: None,
        }
    }

    #[test]
    fn entries_round_trip_with_trailing_payload() {
        let mut file = tempfile::tempfile().unwrap();
        let entry = IpcSemEntry {
            desc: IpcDescEntry {
                key: 42,
                uid: 0,
                gid: 0,
                cuid: 0,
                cgid: 0,
                mode: 0o600,
                id: 7,
            },
            nsems: 2,
        };
        append_entry(&mut file, &entry).unwrap();
        // two u16 values padded to an 8-byte boundary
        file.write_all(&[1, 0, 2, 0, 0, 0, 0, 0]).unwrap();
        file.rewind().unwrap();

        let mut image = ImageFile {
            file,
            path: PathBuf::from("ipcns-sem-test.img"),
        };
        let decoded: IpcSemEntry = image.read_entry().unwrap().unwrap();
        assert_eq!(decoded, entry);
        let payload = image.read_payload(8).unwrap();
        assert_eq!(payload, [1, 0, 2, 0, 0, 0, 0, 0]);
        let next: Option<IpcSemEntry> = image.read_entry().unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn truncated_prefix_is_an_error() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[5, 0]).unwrap();
        file.rewind().unwrap();
        let mut image = ImageFile {
            file,
            path: PathBuf::from("broken.img"),
        };
        let result: Result<Option<IpcVarEntry>, _> = image.read_entry();
        assert!(result.is_err());
    }

    #[test]
    fn var_entry_equality_matches_field_equality() {
        let a = sample_var_entry();
        let mut b = sample_var_entry();
        assert_eq!(a, b);
        b.shm_ctlmni = 8192;
        assert_ne!(a, b);
    }

    #[test]
    fn round_up_laws() {
        for (n, m) in [(0u64, 4u64), (1, 4), (4, 4), (5, 4), (8190, 8), (2, 8)] {
            let r = round_up(n, m);
            assert!(r >= n);
            assert_eq!(r % m, 0);
            assert!(r - n < m);
        }
    }
}
