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

//! Thin owners around the SysV IPC syscalls the restore path needs. These
//! run inside a helper child that has already unshared its IPC namespace,
//! so every object created here lands in the namespace under restoration.

use std::io;
use std::ptr;

use crate::nspool::util::error::{new_error, with_context, BoxError};

fn last_os_error(context: &str) -> BoxError {
    with_context(io::Error::last_os_error(), context.to_string())
}

/// A shared-memory segment created with `IPC_CREAT | IPC_EXCL`, attached on
/// demand and detached on drop.
pub struct SharedMemory {
    id: i32,
    size: u64,
    addr: *mut libc::c_void,
}

impl SharedMemory {
    pub fn create(key: i32, size: u64, mode: u32) -> Result<Self, BoxError> {
        let id = unsafe {
            libc::shmget(
                key,
                size as libc::size_t,
                libc::IPC_CREAT | libc::IPC_EXCL | (mode as libc::c_int & 0o777),
            )
        };
        if id < 0 {
            return Err(last_os_error("shmget failed"));
        }
        Ok(SharedMemory {
            id,
            size,
            addr: ptr::null_mut(),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Restores owner uid/gid via `IPC_SET`, leaving mode and the rest of
    /// the stat as created.
    pub fn set_stat(&self, uid: u32, gid: u32) -> Result<(), BoxError> {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(self.id, libc::IPC_STAT, &mut ds) } < 0 {
            return Err(last_os_error("shmctl(IPC_STAT) failed"));
        }
        ds.shm_perm.uid = uid;
        ds.shm_perm.gid = gid;
        if unsafe { libc::shmctl(self.id, libc::IPC_SET, &mut ds) } < 0 {
            return Err(last_os_error("shmctl(IPC_SET) failed"));
        }
        Ok(())
    }

    pub fn attach(&mut self) -> Result<(), BoxError> {
        if !self.addr.is_null() {
            return Ok(());
        }
        let addr = unsafe { libc::shmat(self.id, ptr::null(), 0) };
        if addr == usize::MAX as *mut libc::c_void {
            return Err(last_os_error("shmat failed"));
        }
        self.addr = addr;
        Ok(())
    }

    /// Copies `data` into the attached segment at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), BoxError> {
        if self.addr.is_null() {
            return Err(new_error("shared memory segment is not attached"));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| new_error("shared memory write overflows"))?;
        if end > self.size {
            return Err(new_error(format!(
                "shared memory write of {} bytes at {:#x} exceeds segment size {}",
                data.len(),
                offset,
                self.size
            )));
        }
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.addr as *mut u8).add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            unsafe { libc::shmdt(self.addr) };
            self.addr = ptr::null_mut();
        }
    }
}

pub struct SemaphoreSet {
    id: i32,
}

impl SemaphoreSet {
    pub fn create(key: i32, nsems: i32, mode: u32) -> Result<Self, BoxError> {
        let id = unsafe {
            libc::semget(
                key,
                nsems,
                libc::IPC_CREAT | libc::IPC_EXCL | (mode as libc::c_int & 0o777),
            )
        };
        if id < 0 {
            return Err(last_os_error("semget failed"));
        }
        Ok(SemaphoreSet { id })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn set_stat(&self, uid: u32, gid: u32) -> Result<(), BoxError> {
        let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, &mut ds) } < 0 {
            return Err(last_os_error("semctl(IPC_STAT) failed"));
        }
        ds.sem_perm.uid = uid;
        ds.sem_perm.gid = gid;
        if unsafe { libc::semctl(self.id, 0, libc::IPC_SET, &mut ds) } < 0 {
            return Err(last_os_error("semctl(IPC_SET) failed"));
        }
        Ok(())
    }

    /// `SETALL` with one value per semaphore in the set.
    pub fn set_all(&self, values: &[u16]) -> Result<(), BoxError> {
        if unsafe { libc::semctl(self.id, 0, libc::SETALL, values.as_ptr()) } < 0 {
            return Err(last_os_error("semctl(SETALL) failed"));
        }
        Ok(())
    }
}

pub struct MessageQueue {
    id: i32,
}

impl MessageQueue {
    pub fn create(key: i32, mode: u32) -> Result<Self, BoxError> {
        let id = unsafe {
            libc::msgget(
                key,
                libc::IPC_CREAT | libc::IPC_EXCL | (mode as libc::c_int & 0o777),
            )
        };
        if id < 0 {
            return Err(last_os_error("msgget failed"));
        }
        Ok(MessageQueue { id })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn set_stat(&self, uid: u32, gid: u32) -> Result<(), BoxError> {
        let mut ds: libc::msqid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) } < 0 {
            return Err(last_os_error("msgctl(IPC_STAT) failed"));
        }
        ds.msg_perm.uid = uid;
        ds.msg_perm.gid = gid;
        if unsafe { libc::msgctl(self.id, libc::IPC_SET, &mut ds) } < 0 {
            return Err(last_os_error("msgctl(IPC_SET) failed"));
        }
        Ok(())
    }

    /// `msgsnd` without blocking; the queue was sized by its creation-time
    /// tunables, so a full queue is a restore error, not a wait.
    pub fn send(&self, mtype: i64, text: &[u8]) -> Result<(), BoxError> {
        #[repr(C)]
        struct MsgBuf {
            mtype: libc::c_long,
            mtext: [u8; super::restore::MAX_MSG_SIZE],
        }
        if text.len() > super::restore::MAX_MSG_SIZE {
            return Err(new_error(format!(
                "unsupported message size: {}",
                text.len()
            )));
        }
        let mut buf = MsgBuf {
            mtype: mtype as libc::c_long,
            mtext: [0u8; super::restore::MAX_MSG_SIZE],
        };
        buf.mtext[..text.len()].copy_from_slice(text);
        let rc = unsafe {
            libc::msgsnd(
                self.id,
                &buf as *const MsgBuf as *const libc::c_void,
                text.len(),
                libc::IPC_NOWAIT,
            )
        };
        if rc < 0 {
            return Err(last_os_error("msgsnd failed"));
        }
        Ok(())
    }
}
