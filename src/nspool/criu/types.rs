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

//! Hand-derived prost mirrors of the CRIU proto2 entry messages this daemon
//! replays. Tag numbers and required/optional shapes follow CRIU's
//! `ipc-var.proto`, `ipc-desc.proto`, `ipc-shm.proto`, `ipc-sem.proto`,
//! `ipc-msg.proto`, `pagemap.proto` and `mnt.proto`; only the fields the
//! restore paths touch are kept.

/// Sysctl tunables of an IPC namespace.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpcVarEntry {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub sem_ctls: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, required, tag = "2")]
    pub msg_ctlmax: u32,
    #[prost(uint32, required, tag = "3")]
    pub msg_ctlmnb: u32,
    #[prost(uint32, required, tag = "4")]
    pub msg_ctlmni: u32,
    #[prost(uint32, optional, tag = "5")]
    pub auto_msgmni: ::core::option::Option<u32>,
    #[prost(uint64, required, tag = "6")]
    pub shm_ctlmax: u64,
    #[prost(uint64, required, tag = "7")]
    pub shm_ctlall: u64,
    #[prost(uint32, required, tag = "8")]
    pub shm_ctlmni: u32,
    #[prost(uint32, optional, tag = "9")]
    pub shm_rmid_forced: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub mq_queues_max: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "11")]
    pub mq_msg_max: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "12")]
    pub mq_msgsize_max: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "13")]
    pub mq_msg_default: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "14")]
    pub mq_msgsize_default: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "15")]
    pub msg_next_id: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "16")]
    pub sem_next_id: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "17")]
    pub shm_next_id: ::core::option::Option<u32>,
}

/// Common descriptor shared by every SysV IPC object.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpcDescEntry {
    #[prost(uint32, required, tag = "1")]
    pub key: u32,
    #[prost(uint32, required, tag = "2")]
    pub uid: u32,
    #[prost(uint32, required, tag = "3")]
    pub gid: u32,
    #[prost(uint32, required, tag = "4")]
    pub cuid: u32,
    #[prost(uint32, required, tag = "5")]
    pub cgid: u32,
    #[prost(uint32, required, tag = "6")]
    pub mode: u32,
    #[prost(uint32, required, tag = "7")]
    pub id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpcShmEntry {
    #[prost(message, required, tag = "1")]
    pub desc: IpcDescEntry,
    #[prost(uint64, required, tag = "2")]
    pub size: u64,
    #[prost(bool, optional, tag = "3")]
    pub in_pagemaps: ::core::option::Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpcSemEntry {
    #[prost(message, required, tag = "1")]
    pub desc: IpcDescEntry,
    #[prost(uint32, required, tag = "2")]
    pub nsems: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpcMsgEntry {
    #[prost(message, required, tag = "1")]
    pub desc: IpcDescEntry,
    #[prost(uint32, required, tag = "2")]
    pub qbytes: u32,
    #[prost(uint32, required, tag = "3")]
    pub qnum: u32,
}

/// Header of one queued message; the rounded-up text follows it inline.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpcMsg {
    #[prost(uint64, required, tag = "1")]
    pub mtype: u64,
    #[prost(uint32, required, tag = "2")]
    pub msize: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PagemapHead {
    #[prost(uint32, required, tag = "1")]
    pub pages_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PagemapEntry {
    #[prost(uint64, required, tag = "1")]
    pub vaddr: u64,
    #[prost(uint32, required, tag = "2")]
    pub nr_pages: u32,
    #[prost(uint32, optional, tag = "3")]
    pub flags: ::core::option::Option<u32>,
}

/// One mount of the checkpointed mount namespace. `ext_key` names a host
/// path for external bind mounts; entries without one describe in-namespace
/// mounts whose tmpfs contents may be archived separately per device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MntEntry {
    #[prost(uint32, required, tag = "1")]
    pub fstype: u32,
    #[prost(uint32, required, tag = "2")]
    pub mnt_id: u32,
    #[prost(uint32, required, tag = "3")]
    pub root_dev: u32,
    #[prost(uint32, required, tag = "4")]
    pub parent_mnt_id: u32,
    #[prost(uint32, required, tag = "5")]
    pub flags: u32,
    #[prost(string, required, tag = "6")]
    pub root: ::prost::alloc::string::String,
    #[prost(string, required, tag = "7")]
    pub mountpoint: ::prost::alloc::string::String,
    #[prost(string, required, tag = "8")]
    pub source: ::prost::alloc::string::String,
    #[prost(string, required, tag = "9")]
    pub options: ::prost::alloc::string::String,
    #[prost(bool, optional, tag = "10")]
    pub with_plugin: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "11")]
    pub ext_mount: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "12")]
    pub sb_flags: ::core::option::Option<u32>,
    #[prost(string, optional, tag = "13")]
    pub ext_key: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, optional, tag = "14")]
    pub internal_sharing: ::core::option::Option<bool>,
}

