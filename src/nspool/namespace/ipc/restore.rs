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

//! Child-side IPC namespace functions. `populate_namespace` runs in a
//! freshly unshared IPC namespace and replays a checkpoint's
//! `ipcns-{var,shm,sem,msg}-*` images; `collect_vars` captures the sysctl
//! state of a pristine namespace for the normal/special classification.

use prost::Message;
use std::env;
use std::fs;

use crate::nspool::criu::image::{round_up, ImageFile};
use crate::nspool::criu::types::{
    IpcMsg, IpcMsgEntry, IpcSemEntry, IpcShmEntry, IpcVarEntry, PagemapEntry, PagemapHead,
};
use crate::nspool::namespace::NsFunctionArgs;
use crate::nspool::util::error::{new_error, with_context, BoxError};
use crate::nspool::util::sysctl::{sysctl_read, sysctl_read_u32, sysctl_read_u64, sysctl_write};

use super::sysv::{MessageQueue, SemaphoreSet, SharedMemory};

pub const VAR_FILE_PREFIX: &str = "ipcns-var-";
pub const SHM_FILE_PREFIX: &str = "ipcns-shm-";
pub const SEM_FILE_PREFIX: &str = "ipcns-sem-";
pub const MSG_FILE_PREFIX: &str = "ipcns-msg-";

pub const PAGE_SIZE: u64 = 1 << 12;
pub const MAX_MSG_SIZE: usize = 8192;

const KERNEL_SEM: &str = "kernel/sem";
const KERNEL_MSG_MAX: &str = "kernel/msgmax";
const KERNEL_MSG_MNB: &str = "kernel/msgmnb";
const KERNEL_MSG_MNI: &str = "kernel/msgmni";
const KERNEL_AUTO_MSG_MNI: &str = "kernel/auto_msgmni";
const KERNEL_SHM_MAX: &str = "kernel/shmmax";
const KERNEL_SHM_ALL: &str = "kernel/shmall";
const KERNEL_SHM_MNI: &str = "kernel/shmmni";
const KERNEL_SHM_RMID_FORCED: &str = "kernel/shm_rmid_forced";
const KERNEL_MSG_NEXT_ID: &str = "kernel/msg_next_id";
const KERNEL_SEM_NEXT_ID: &str = "kernel/sem_next_id";
const KERNEL_SHM_NEXT_ID: &str = "kernel/shm_next_id";
const FS_MQUEUE_QUEUES_MAX: &str = "fs/mqueue/queues_max";
const FS_MQUEUE_MSG_MAX: &str = "fs/mqueue/msg_max";
const FS_MQUEUE_MSGSIZE_MAX: &str = "fs/mqueue/msgsize_max";
const FS_MQUEUE_MSG_DEFAULT: &str = "fs/mqueue/msg_default";
const FS_MQUEUE_MSGSIZE_DEFAULT: &str = "fs/mqueue/msgsize_default";

/// Replays every IPC image in the checkpoint directory. Vars go first: the
/// `*_next_id` tunables they carry must be in place before any object is
/// created.
pub fn populate_namespace(args: &NsFunctionArgs) -> Result<Vec<u8>, BoxError> {
    let checkpoint = args
        .get("checkpoint")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| new_error("checkpoint must be provided"))?;
    env::set_current_dir(checkpoint)
        .map_err(|e| with_context(e, format!("failed to chdir to {}", checkpoint)))?;

    let mut names: Vec<String> = fs::read_dir(".")
        .map_err(|e| with_context(e, format!("failed to read dir {}", checkpoint)))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    for name in names.iter().filter(|n| n.starts_with(VAR_FILE_PREFIX)) {
        restore_vars(name).map_err(|e| {
            with_context(e, format!("failed to restore vars using {}", name))
        })?;
    }
    for name in &names {
        if name.starts_with(SHM_FILE_PREFIX) {
            restore_shm(name)
                .map_err(|e| with_context(e, format!("failed to restore shm using {}", name)))?;
        } else if name.starts_with(SEM_FILE_PREFIX) {
            restore_sem(name)
                .map_err(|e| with_context(e, format!("failed to restore sem using {}", name)))?;
        } else if name.starts_with(MSG_FILE_PREFIX) {
            restore_msg(name)
                .map_err(|e| with_context(e, format!("failed to restore msg using {}", name)))?;
        }
    }
    Ok(Vec::new())
}

/// Reads every recognised tunable of the current IPC namespace and returns
/// the encoded `IpcVarEntry`.
pub fn collect_vars(_args: &NsFunctionArgs) -> Result<Vec<u8>, BoxError> {
    let entry = gather_vars()?;
    Ok(entry.encode_to_vec())
}

pub fn gather_vars() -> Result<IpcVarEntry, BoxError> {
    let sem = sysctl_read(KERNEL_SEM)?;
    let sem_ctls = sem
        .split('\t')
        .map(|part| {
            part.parse::<u32>()
                .map_err(|e| with_context(e, format!("unexpected kernel/sem value {}", part)))
        })
        .collect::<Result<Vec<u32>, BoxError>>()?;

    Ok(IpcVarEntry {
        sem_ctls,
        msg_ctlmax: required_u32(KERNEL_MSG_MAX)?,
        msg_ctlmnb: required_u32(KERNEL_MSG_MNB)?,
        msg_ctlmni: required_u32(KERNEL_MSG_MNI)?,
        auto_msgmni: optional_u32(KERNEL_AUTO_MSG_MNI)?,
        shm_ctlmax: required_u64(KERNEL_SHM_MAX)?,
        shm_ctlall: required_u64(KERNEL_SHM_ALL)?,
        shm_ctlmni: required_u32(KERNEL_SHM_MNI)?,
        shm_rmid_forced: optional_u32(KERNEL_SHM_RMID_FORCED)?,
        mq_queues_max: optional_u32(FS_MQUEUE_QUEUES_MAX)?,
        mq_msg_max: optional_u32(FS_MQUEUE_MSG_MAX)?,
        mq_msgsize_max: optional_u32(FS_MQUEUE_MSGSIZE_MAX)?,
        mq_msg_default: optional_u32(FS_MQUEUE_MSG_DEFAULT)?,
        mq_msgsize_default: optional_u32(FS_MQUEUE_MSGSIZE_DEFAULT)?,
        msg_next_id: optional_u32(KERNEL_MSG_NEXT_ID)?,
        sem_next_id: optional_u32(KERNEL_SEM_NEXT_ID)?,
        shm_next_id: optional_u32(KERNEL_SHM_NEXT_ID)?,
    })
}

/// Writes every field of `entry` back through sysctl. Optional fields the
/// running kernel does not expose are skipped.
pub fn scatter_vars(entry: &IpcVarEntry) -> Result<(), BoxError> {
    if !entry.sem_ctls.is_empty() {
        let joined: Vec<String> = entry.sem_ctls.iter().map(u32::to_string).collect();
        sysctl_write(KERNEL_SEM, &joined.join("\t"))?;
    }
    sysctl_write(KERNEL_MSG_MAX, &entry.msg_ctlmax.to_string())?;
    sysctl_write(KERNEL_MSG_MNB, &entry.msg_ctlmnb.to_string())?;
    sysctl_write(KERNEL_MSG_MNI, &entry.msg_ctlmni.to_string())?;
    write_optional(KERNEL_AUTO_MSG_MNI, entry.auto_msgmni.map(u64::from))?;
    sysctl_write(KERNEL_SHM_MAX, &entry.shm_ctlmax.to_string())?;
    sysctl_write(KERNEL_SHM_ALL, &entry.shm_ctlall.to_string())?;
    sysctl_write(KERNEL_SHM_MNI, &entry.shm_ctlmni.to_string())?;
    write_optional(KERNEL_SHM_RMID_FORCED, entry.shm_rmid_forced.map(u64::from))?;
    write_optional(FS_MQUEUE_QUEUES_MAX, entry.mq_queues_max.map(u64::from))?;
    write_optional(FS_MQUEUE_MSG_MAX, entry.mq_msg_max.map(u64::from))?;
    write_optional(FS_MQUEUE_MSGSIZE_MAX, entry.mq_msgsize_max.map(u64::from))?;
    write_optional(FS_MQUEUE_MSG_DEFAULT, entry.mq_msg_default.map(u64::from))?;
    write_optional(
        FS_MQUEUE_MSGSIZE_DEFAULT,
        entry.mq_msgsize_default.map(u64::from),
    )?;
    write_optional(KERNEL_MSG_NEXT_ID, entry.msg_next_id.map(u64::from))?;
    write_optional(KERNEL_SEM_NEXT_ID, entry.sem_next_id.map(u64::from))?;
    write_optional(KERNEL_SHM_NEXT_ID, entry.shm_next_id.map(u64::from))?;
    Ok(())
}

fn required_u32(item: &str) -> Result<u32, BoxError> {
    sysctl_read_u32(item)?.ok_or_else(|| new_error(format!("sysctl {} has no value", item)))
}

fn required_u64(item: &str) -> Result<u64, BoxError> {
    sysctl_read_u64(item)?.ok_or_else(|| new_error(format!("sysctl {} has no value", item)))
}

fn optional_u32(item: &str) -> Result<Option<u32>, BoxError> {
    match sysctl_read_u32(item) {
        Ok(value) => Ok(value),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_optional(item: &str, value: Option<u64>) -> Result<(), BoxError> {
    let Some(value) = value else {
        return Ok(());
    };
    match sysctl_write(item, &value.to_string()) {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_not_found(error: &BoxError) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error.as_ref());
    while let Some(current) = source {
        if let Some(io_error) = current.downcast_ref::<std::io::Error>() {
            return io_error.kind() == std::io::ErrorKind::NotFound;
        }
        source = current.source();
    }
    false
}

fn restore_vars(file: &str) -> Result<(), BoxError> {
    let mut img = ImageFile::open(file)?;
    let entry: IpcVarEntry = img
        .read_entry()?
        .ok_or_else(|| new_error(format!("{} has no var entry", file)))?;
    scatter_vars(&entry)
}

fn restore_shm(file: &str) -> Result<(), BoxError> {
    let mut img = ImageFile::open(file)?;
    while let Some(entry) = img.read_entry::<IpcShmEntry>()? {
        sysctl_write(KERNEL_SHM_NEXT_ID, &entry.desc.id.to_string())
            .map_err(|e| with_context(e, "failed to set shm next id"))?;
        let mut shm = SharedMemory::create(entry.desc.key as i32, entry.size, entry.desc.mode)
            .map_err(|e| {
                with_context(
                    e,
                    format!(
                        "failed to create shm with key {} size {} mode {:o}",
                        entry.desc.key, entry.size, entry.desc.mode
                    ),
                )
            })?;
        if shm.id() != entry.desc.id as i32 {
            return Err(new_error(format!(
                "shm id mismatch ({} instead of {})",
                shm.id(),
                entry.desc.id
            )));
        }
        shm.set_stat(entry.desc.uid, entry.desc.gid)?;
        shm.attach()?;
        if entry.in_pagemaps.unwrap_or(false) {
            restore_from_pagemaps(entry.desc.id, &mut shm)
                .map_err(|e| with_context(e, "failed to restore shm pages"))?;
        } else {
            // contents follow inline, padded to a 4-byte boundary
            let padded = img.read_payload(round_up(entry.size, 4) as usize)?;
            shm.write_at(0, &padded[..entry.size as usize])?;
        }
    }
    Ok(())
}

fn restore_from_pagemaps(shmid: u32, shm: &mut SharedMemory) -> Result<(), BoxError> {
    let mut pagemap = ImageFile::open(format!("pagemap-shmem-{}.img", shmid))?;
    let head: PagemapHead = pagemap
        .read_entry()?
        .ok_or_else(|| new_error("pagemap image has no head entry"))?;
    let mut pages = std::fs::File::open(format!("pages-{}.img", head.pages_id))
        .map_err(|e| with_context(e, format!("failed to open pages-{}.img", head.pages_id)))?;
    use std::io::Read;
    while let Some(entry) = pagemap.read_entry::<PagemapEntry>()? {
        let len = entry.nr_pages as u64 * PAGE_SIZE;
        let mut data = vec![0u8; len as usize];
        pages
            .read_exact(&mut data)
            .map_err(|e| with_context(e, "truncated pages image"))?;
        shm.write_at(entry.vaddr, &data)
            .map_err(|e| with_context(e, format!("failed to fill pages at {:#x}", entry.vaddr)))?;
    }
    Ok(())
}

fn restore_sem(file: &str) -> Result<(), BoxError> {
    let mut img = ImageFile::open(file)?;
    while let Some(entry) = img.read_entry::<IpcSemEntry>()? {
        sysctl_write(KERNEL_SEM_NEXT_ID, &entry.desc.id.to_string())
            .map_err(|e| with_context(e, "failed to write sem next id"))?;
        let set = SemaphoreSet::create(
            entry.desc.key as i32,
            entry.nsems as i32,
            entry.desc.mode,
        )
        .map_err(|e| with_context(e, "failed to create a new semaphore set"))?;
        if set.id() != entry.desc.id as i32 {
            return Err(new_error(format!(
                "failed to restore sem id ({} instead of {})",
                set.id(),
                entry.desc.id
            )));
        }
        set.set_stat(entry.desc.uid, entry.desc.gid)?;

        // one little-endian u16 per semaphore, padded to an 8-byte boundary
        let padded = img.read_payload(round_up(2 * entry.nsems as u64, 8) as usize)?;
        let values: Vec<u16> = padded[..2 * entry.nsems as usize]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        set.set_all(&values)
            .map_err(|e| with_context(e, "failed to restore semaphore values"))?;
    }
    Ok(())
}

fn restore_msg(file: &str) -> Result<(), BoxError> {
    let mut img = ImageFile::open(file)?;
    while let Some(entry) = img.read_entry::<IpcMsgEntry>()? {
        sysctl_write(KERNEL_MSG_NEXT_ID, &entry.desc.id.to_string())
            .map_err(|e| with_context(e, "failed to write message next id"))?;
        let queue = MessageQueue::create(entry.desc.key as i32, entry.desc.mode)
            .map_err(|e| with_context(e, "failed to create a new message queue"))?;
        if queue.id() != entry.desc.id as i32 {
            return Err(new_error(format!(
                "failed to restore message id ({} instead of {})",
                queue.id(),
                entry.desc.id
            )));
        }
        queue.set_stat(entry.desc.uid, entry.desc.gid)?;
        for _ in 0..entry.qnum {
            let msg: IpcMsg = img
                .read_entry()?
                .ok_or_else(|| new_error("message image ended before qnum messages"))?;
            if msg.msize as usize > MAX_MSG_SIZE {
                return Err(new_error(format!(
                    "unsupported message size: {}",
                    msg.msize
                )));
            }
            let padded = img.read_payload(round_up(msg.msize as u64, 8) as usize)?;
            queue
                .send(msg.mtype as i64, &padded[..msg.msize as usize])
                .map_err(|e| with_context(e, "failed to send message to message queue"))?;
        }
    }
    Ok(())
}
