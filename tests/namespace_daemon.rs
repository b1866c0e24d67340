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

//! End-to-end run of the daemon binary: fixtures on disk, `Update` to build
//! the pools, then `Get`/`Put` for each namespace type over the socket.
//! Requires root (namespace creation, overlay and bind mounts).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::stat;
use nix::unistd::{Pid, Uid};

use nspool::nspool::api::types::{NamespaceType, Reference};
use nspool::nspool::client::Client;
use nspool::nspool::criu::append_entry;
use nspool::nspool::criu::types::{
    IpcDescEntry, IpcMsg, IpcMsgEntry, IpcSemEntry, IpcShmEntry, IpcVarEntry, MntEntry,
};

const REF_NAME: &str = "checkpoint/app";

fn desc(key: u32, mode: u32, id: u32) -> IpcDescEntry {
    IpcDescEntry {
        key,
        uid: 0,
        gid: 0,
        cuid: 0,
        cgid: 0,
        mode,
        id,
    }
}

fn write_ipc_fixture(checkpoint: &Path) {
    let vars = IpcVarEntry {
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
    };
    let mut var_file = File::create(checkpoint.join("ipcns-var-1.img")).unwrap();
    append_entry(&mut var_file, &vars).unwrap();

    // two semaphores, values 3 and 1, padded to an 8-byte boundary
    let mut sem_file = File::create(checkpoint.join("ipcns-sem-1.img")).unwrap();
    append_entry(
        &mut sem_file,
        &IpcSemEntry {
            desc: desc(42, 0o600, 5),
            nsems: 2,
        },
    )
    .unwrap();
    sem_file.write_all(&[3, 0, 1, 0, 0, 0, 0, 0]).unwrap();

    // one page-aligned segment restored from the inline stream
    let mut shm_file = File::create(checkpoint.join("ipcns-shm-1.img")).unwrap();
    append_entry(
        &mut shm_file,
        &IpcShmEntry {
            desc: desc(7, 0o600, 3),
            size: 8192,
            in_pagemaps: Some(false),
        },
    )
    .unwrap();
    shm_file.write_all(&[0xAB; 8192]).unwrap();

    // one queue with a single queued message
    let mut msg_file = File::create(checkpoint.join("ipcns-msg-1.img")).unwrap();
    append_entry(
        &mut msg_file,
        &IpcMsgEntry {
            desc: desc(9, 0o600, 2),
            qbytes: 16384,
            qnum: 1,
        },
    )
    .unwrap();
    append_entry(
        &mut msg_file,
        &IpcMsg {
            mtype: 1,
            msize: 5,
        },
    )
    .unwrap();
    msg_file.write_all(b"hello\0\0\0").unwrap();
}

fn mnt_entry(mountpoint: &str, ext_key: Option<&str>, root_dev: u32, flags: u32) -> MntEntry {
    MntEntry {
        fstype: 0,
        mnt_id: 1,
        root_dev,
        parent_mnt_id: 0,
        flags,
        root: "/".into(),
        mountpoint: mountpoint.into(),
        source: "none".into(),
        options: String::new(),
        with_plugin: None,
        ext_mount: None,
        sb_flags: None,
        ext_key: ext_key.map(str::to_string),
        internal_sharing: None,
    }
}

fn write_mnt_fixture(checkpoint: &Path, host_data: &Path) {
    let mut mp_file = File::create(checkpoint.join("mountpoints-1.img")).unwrap();
    let readonly = libc::MS_RDONLY as u32;
    for entry in [
        mnt_entry("/", None, 64, 0),
        mnt_entry("/run", None, 77, 0),
        mnt_entry("/data", Some(&host_data.to_string_lossy()), 64, readonly),
    ] {
        append_entry(&mut mp_file, &entry).unwrap();
    }

    // archive for device 64, extracted at "/" (its shortest mountpoint)
    let gz = flate2::write::GzEncoder::new(
        File::create(checkpoint.join("tmpfs-dev-64.tar.gz.img")).unwrap(),
        flate2::Compression::default(),
    );
    let mut builder = tar::Builder::new(gz);
    let payload = b"prebuilt";
    let mut header = tar::Header::new_gnu();
    header.set_path("warm/hello.txt").unwrap();
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, payload.as_slice()).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}

struct Daemon {
    child: Child,
    root: PathBuf,
}

impl Daemon {
    fn spawn(root: &Path, rootfs_store: &Path, checkpoint_store: &Path) -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_nspoold"))
            .args(["start", "--root"])
            .arg(root)
            .args(["--log-level", "debug"])
            .env("NSPOOL_ROOTFS_STORE", rootfs_store)
            .env("NSPOOL_CHECKPOINT_STORE", checkpoint_store)
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn nspoold");
        let daemon = Daemon {
            child,
            root: root.to_path_buf(),
        };
        let socket = root.join("daemon.socket");
        let deadline = Instant::now() + Duration::from_secs(10);
        while !socket.exists() {
            assert!(Instant::now() < deadline, "daemon did not come up");
            std::thread::sleep(Duration::from_millis(50));
        }
        daemon
    }

    fn stop(mut self) {
        let _ = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
        let status = self.child.wait().expect("wait for daemon");
        assert!(status.success(), "daemon exited with {}", status);
        assert!(
            !self.root.join("daemon.socket").exists(),
            "socket must be removed on shutdown"
        );
    }
}

fn ns_inode(path: &str) -> u64 {
    stat(path).unwrap_or_else(|e| panic!("stat {}: {}", path, e)).st_ino
}

/// Forks, joins the granted mount namespace and checks the restored rootfs.
/// Exit code of the child encodes the first failed step.
fn verify_mount_namespace(ns_path: &str, bundle: &Path) {
    let rootfs = bundle.join("rootfs");
    match unsafe { nix::unistd::fork() }.expect("fork") {
        nix::unistd::ForkResult::Child => {
            let code = (|| -> i32 {
                let Ok(file) = File::open(ns_path) else {
                    return 2;
                };
                if nix::sched::setns(&file, nix::sched::CloneFlags::CLONE_NEWNS).is_err() {
                    return 2;
                }
                // lower layer visible through the overlay
                if !rootfs.join("base.txt").exists() {
                    return 3;
                }
                // tmpfs archive for the root device extracted at /
                match fs::read_to_string(rootfs.join("warm/hello.txt")) {
                    Ok(content) if content == "prebuilt" => {}
                    _ => return 3,
                }
                // fixed mounts present
                if !rootfs.join("proc/self").exists() {
                    return 6;
                }
                // external bind is readonly: writing must fail with EROFS
                match File::create(rootfs.join("data/attempt")) {
                    Ok(_) => 4,
                    Err(e) if e.raw_os_error() == Some(libc::EROFS) => 0,
                    Err(_) => 5,
                }
            })();
            unsafe { libc::_exit(code) };
        }
        nix::unistd::ForkResult::Parent { child } => {
            let status = nix::sys::wait::waitpid(child, None).expect("waitpid");
            assert_eq!(
                status,
                nix::sys::wait::WaitStatus::Exited(child, 0),
                "mount namespace verification failed"
            );
        }
    }
}

#[test]
fn daemon_serves_pooled_namespaces_end_to_end() {
    if !Uid::effective().is_root() {
        eprintln!("skipping daemon_serves_pooled_namespaces_end_to_end: requires root");
        return;
    }

    let root = tempfile::tempdir().expect("root tempdir");
    let rootfs_store = tempfile::tempdir().expect("rootfs store tempdir");
    let checkpoint_store = tempfile::tempdir().expect("checkpoint store tempdir");
    let host_data = tempfile::tempdir().expect("host data tempdir");

    // rootfs source: a marker file plus the bind target directory
    let source = rootfs_store.path().join(REF_NAME);
    fs::create_dir_all(source.join("data")).unwrap();
    fs::write(source.join("base.txt"), b"layer").unwrap();

    let checkpoint = checkpoint_store.path().join(REF_NAME);
    fs::create_dir_all(&checkpoint).unwrap();
    write_ipc_fixture(&checkpoint);
    write_mnt_fixture(&checkpoint, host_data.path());

    let daemon = Daemon::spawn(root.path(), rootfs_store.path(), checkpoint_store.path());
    let mut client = Client::connect(root.path()).expect("client connect");
    let reference = Reference::containerd(REF_NAME, "default");

    client
        .update_namespace(reference.clone(), 2)
        .expect("update must build sets in every manager");

    // UTS: pooled, recycled on put
    let first = client
        .get_namespace(NamespaceType::Uts, reference.clone(), Vec::new())
        .expect("first uts get");
    let second = client
        .get_namespace(NamespaceType::Uts, reference.clone(), Vec::new())
        .expect("second uts get");
    assert_ne!(first.fd, second.fd, "one namespace handed to two callers");
    assert_ne!(
        ns_inode(&first.ns_path()),
        ns_inode("/proc/self/ns/uts"),
        "granted uts namespace must differ from the host's"
    );
    client.put_namespace(NamespaceType::Uts, first.fd).unwrap();
    client.put_namespace(NamespaceType::Uts, second.fd).unwrap();
    let again = client
        .get_namespace(NamespaceType::Uts, reference.clone(), Vec::new())
        .expect("uts get after put");
    client.put_namespace(NamespaceType::Uts, again.fd).unwrap();

    // putting an fd nobody handed out is a client error
    let err = client
        .put_namespace(NamespaceType::Uts, 123456)
        .expect_err("bogus fd");
    assert!(err.to_string().contains("does not exist"));

    // IPC: restored from the checkpoint images
    let ipc = client
        .get_namespace(NamespaceType::Ipc, reference.clone(), Vec::new())
        .expect("ipc get");
    assert_ne!(
        ns_inode(&ipc.ns_path()),
        ns_inode("/proc/self/ns/ipc"),
        "granted ipc namespace must differ from the host's"
    );
    client.put_namespace(NamespaceType::Ipc, ipc.fd).unwrap();

    // MNT: bundle-backed, destroyed and replaced on put
    let mnt = client
        .get_namespace(NamespaceType::Mnt, reference.clone(), Vec::new())
        .expect("mnt get");
    let bundle = mnt
        .info
        .as_ref()
        .and_then(|v| v.get("bundle"))
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .expect("mnt grant carries its bundle");
    assert!(bundle.exists());
    verify_mount_namespace(&mnt.ns_path(), &bundle);

    client.put_namespace(NamespaceType::Mnt, mnt.fd).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while bundle.exists() {
        assert!(
            Instant::now() < deadline,
            "bundle {} was not torn down",
            bundle.display()
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    let replacement = client
        .get_namespace(NamespaceType::Mnt, reference.clone(), Vec::new())
        .expect("mnt get after put");
    let new_bundle = replacement
        .info
        .as_ref()
        .and_then(|v| v.get("bundle"))
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap();
    assert_ne!(bundle, new_bundle, "released bundle must not be reused");
    client
        .put_namespace(NamespaceType::Mnt, replacement.fd)
        .unwrap();

    drop(client);
    daemon.stop();
}
