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

//! Child-side MNT namespace functions. `populate_bundle` runs in a freshly
//! unshared mount namespace: it isolates the mount tree, builds the bundle
//! overlay and fills the rootfs with the fixed mounts plus whatever the
//! checkpoint recorded. `depopulate_bundle` enters an existing namespace
//! and takes all of it down again.

use flate2::read::GzDecoder;
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags, MsFlags};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::nspool::criu::image::{find_image_with_prefix, ImageFile};
use crate::nspool::criu::types::MntEntry;
use crate::nspool::mount::Mount;
use crate::nspool::namespace::NsFunctionArgs;
use crate::nspool::util::error::{new_error, with_context, BoxError, ErrorList};

const MOUNTPOINTS_PREFIX: &str = "mountpoints-";
const TAR_GZ_PREFIX: &str = "tmpfs-dev-";
const TAR_GZ_SUFFIX: &str = ".tar.gz.img";

pub const READONLY_PATHS: [&str; 5] = [
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

pub const MASKED_PATHS: [&str; 10] = [
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

/// The fixed mount table every restored rootfs gets, in mount order.
pub fn base_mounts() -> Vec<(Mount, &'static str)> {
    fn m(source: &str, fstype: &str, options: &[&str]) -> Mount {
        Mount {
            source: source.to_string(),
            fstype: fstype.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }
    vec![
        (m("proc", "proc", &[]), "/proc"),
        (
            m(
                "udev",
                "devtmpfs",
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ),
            "/dev",
        ),
        (
            m(
                "devpts",
                "devpts",
                &[
                    "nosuid",
                    "noexec",
                    "newinstance",
                    "ptmxmode=0666",
                    "mode=0620",
                    "gid=5",
                ],
            ),
            "/dev/pts",
        ),
        (
            m(
                "shm",
                "tmpfs",
                &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            ),
            "/dev/shm",
        ),
        (m("mqueue", "mqueue", &["nosuid", "noexec", "nodev"]), "/dev/mqueue"),
        (
            m("sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
            "/sys",
        ),
        (m("tmpfs", "tmpfs", &["size=65536k", "mode=755"]), "/run"),
    ]
}

pub fn populate_bundle(args: &NsFunctionArgs) -> Result<Vec<u8>, BoxError> {
    let src = required_arg(args, "src")?;
    let bundle = required_arg(args, "bundle")?;
    let checkpoint = required_arg(args, "checkpoint")?;

    // isolate the mount tree before touching anything
    nix::mount::mount(
        Some("none"),
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| with_context(e, "failed to make / private"))?;

    let bundle = Path::new(bundle);
    let rootfs = bundle.join("rootfs");
    let lowers = vec![src.to_string()];
    Mount::overlay(
        &lowers,
        &bundle.join("upper").to_string_lossy(),
        &bundle.join("work").to_string_lossy(),
    )
    .mount(&rootfs)
    .map_err(|e| {
        with_context(
            e,
            format!("mount rootfs {} with overlay failed", rootfs.display()),
        )
    })?;
    fs::set_permissions(&rootfs, fs::Permissions::from_mode(0o755))
        .map_err(|e| with_context(e, "failed to chmod rootfs"))?;

    populate_rootfs(&rootfs, Path::new(checkpoint))?;
    Ok(Vec::new())
}

pub fn depopulate_bundle(args: &NsFunctionArgs) -> Result<Vec<u8>, BoxError> {
    let bundle = PathBuf::from(required_arg(args, "bundle")?);
    let rootfs = bundle.join("rootfs");
    depopulate_rootfs(&rootfs)?;
    match umount2(&rootfs, MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::ENOENT) | Err(Errno::EINVAL) => {}
        Err(e) => return Err(with_context(e, "failed to unmount rootfs")),
    }
    fs::remove_dir_all(&bundle).map_err(|e| with_context(e, "failed to remove bundle"))?;
    Ok(Vec::new())
}

fn required_arg<'a>(args: &'a NsFunctionArgs, name: &str) -> Result<&'a str, BoxError> {
    args.get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| new_error(format!("{} must be provided", name)))
}

fn populate_rootfs(rootfs: &Path, checkpoint: &Path) -> Result<(), BoxError> {
    for (mount, target) in base_mounts() {
        mount
            .mount(&join_rooted(rootfs, target))
            .map_err(|e| with_context(e, format!("failed to mount {}", target)))?;
    }

    for path in READONLY_PATHS {
        let joined = join_rooted(rootfs, path);
        match nix::mount::mount(
            Some(&joined),
            &joined,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        ) {
            Ok(()) => {}
            Err(Errno::ENOENT) => continue,
            Err(e) => {
                return Err(with_context(
                    e,
                    format!("failed to bind {}", joined.display()),
                ))
            }
        }
        nix::mount::mount(
            Some(&joined),
            &joined,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| {
            with_context(e, format!("failed to make {} readonly", joined.display()))
        })?;
    }

    for path in MASKED_PATHS {
        let joined = join_rooted(rootfs, path);
        match nix::mount::mount(
            Some("/dev/null"),
            &joined,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(Errno::ENOTDIR) => {
                nix::mount::mount(
                    Some("tmpfs"),
                    &joined,
                    Some("tmpfs"),
                    MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|e| {
                    with_context(e, format!("failed to mask {}", joined.display()))
                })?;
            }
            Err(e) => {
                return Err(with_context(
                    e,
                    format!("failed to mask {}", joined.display()),
                ))
            }
        }
    }

    restore_extra_mountpoints(rootfs, checkpoint)
        .map_err(|e| with_context(e, "failed to restore extra mount points"))?;
    restore_files(rootfs, checkpoint).map_err(|e| with_context(e, "failed to restore files"))?;
    Ok(())
}

/// Bind mounts recorded in the checkpoint that the fixed table does not
/// already cover. Only external binds are supported; a plain mount that
/// nothing covers cannot be reconstructed here.
fn restore_extra_mountpoints(rootfs: &Path, checkpoint: &Path) -> Result<(), BoxError> {
    let mut covered: HashSet<&str> = HashSet::from(["/"]);
    let table = base_mounts();
    covered.extend(table.iter().map(|(_, target)| *target));
    covered.extend(READONLY_PATHS);
    covered.extend(MASKED_PATHS);

    let path = find_image_with_prefix(checkpoint, MOUNTPOINTS_PREFIX)?
        .ok_or_else(|| new_error("failed to find the mountpoints image"))?;
    let mut img = ImageFile::open(&path)?;
    while let Some(entry) = img.read_entry::<MntEntry>()? {
        if covered.contains(entry.mountpoint.as_str()) {
            continue;
        }
        if entry.ext_key().is_empty() {
            return Err(new_error(format!(
                "encountered a non-bind mount at {}",
                entry.mountpoint
            )));
        }
        let target = join_rooted(rootfs, &entry.mountpoint);
        let readonly = entry.flags & MsFlags::MS_RDONLY.bits() as u32 != 0;
        nix::mount::mount(
            Some(entry.ext_key()),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            with_context(
                e,
                format!(
                    "failed to bind mount {} to {}",
                    entry.ext_key(),
                    entry.mountpoint
                ),
            )
        })?;
        if readonly {
            nix::mount::mount(
                Some(entry.ext_key()),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| {
                with_context(
                    e,
                    format!("failed to remount {} readonly", entry.mountpoint),
                )
            })?;
        }
    }
    Ok(())
}

/// Unpacks the per-device tmpfs archives at the shortest recorded
/// mountpoint of each device group.
fn restore_files(rootfs: &Path, checkpoint: &Path) -> Result<(), BoxError> {
    let path = find_image_with_prefix(checkpoint, MOUNTPOINTS_PREFIX)?
        .ok_or_else(|| new_error("failed to find the mountpoints image"))?;
    let mut img = ImageFile::open(&path)?;
    let groups = read_restore_candidates(rootfs, &mut img)?;

    let entries = fs::read_dir(checkpoint)
        .map_err(|e| with_context(e, format!("failed to read dir {}", checkpoint.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| with_context(e, "failed to enumerate checkpoint dir"))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(dev_str) = name
            .strip_prefix(TAR_GZ_PREFIX)
            .and_then(|rest| rest.strip_suffix(TAR_GZ_SUFFIX))
        else {
            continue;
        };
        let dev_id: u32 = dev_str
            .parse()
            .map_err(|e| with_context(e, format!("bad device id in {}", name)))?;
        restore_device_files(rootfs, &groups, dev_id, &entry.path())
            .map_err(|e| with_context(e, format!("failed to restore with dev id {}", dev_id)))?;
    }
    Ok(())
}

fn restore_device_files(
    rootfs: &Path,
    groups: &HashMap<u32, Vec<MntEntry>>,
    dev_id: u32,
    archive: &Path,
) -> Result<(), BoxError> {
    let Some(list) = groups.get(&dev_id) else {
        return Ok(());
    };
    let shortest = list
        .iter()
        .min_by_key(|entry| entry.mountpoint.split('/').count())
        .ok_or_else(|| new_error("empty mountpoint group"))?;
    let target = join_rooted(rootfs, &shortest.mountpoint);
    let file = fs::File::open(archive)
        .map_err(|e| with_context(e, format!("failed to open {}", archive.display())))?;
    let mut unpacker = tar::Archive::new(GzDecoder::new(file));
    unpacker.set_preserve_permissions(true);
    unpacker.unpack(&target).map_err(|e| {
        with_context(
            e,
            format!(
                "failed to extract {} to {}",
                archive.display(),
                target.display()
            ),
        )
    })?;
    Ok(())
}

/// Groups restorable mount entries by device: external binds are out (their
/// content lives on the host), as is anything under a readonly or masked
/// path or anything that is not a directory in this rootfs.
fn read_restore_candidates(
    rootfs: &Path,
    img: &mut ImageFile,
) -> Result<HashMap<u32, Vec<MntEntry>>, BoxError> {
    let mut skipped: HashSet<&str> = HashSet::from(["/sys"]);
    skipped.extend(READONLY_PATHS);
    skipped.extend(MASKED_PATHS);

    let mut groups: HashMap<u32, Vec<MntEntry>> = HashMap::new();
    while let Some(entry) = img.read_entry::<MntEntry>()? {
        if !entry.ext_key().is_empty() {
            continue;
        }
        if skipped.contains(clean_path(&entry.mountpoint).as_str()) {
            continue;
        }
        let mountpoint = join_rooted(rootfs, &entry.mountpoint);
        match fs::metadata(&mountpoint) {
            Ok(meta) if meta.is_dir() => {}
            _ => continue,
        }
        groups.entry(entry.root_dev).or_default().push(entry);
    }
    Ok(groups)
}

fn depopulate_rootfs(rootfs: &Path) -> Result<(), BoxError> {
    let mut paths: Vec<String> = Vec::new();
    paths.extend(MASKED_PATHS.iter().map(|p| p.to_string()));
    paths.extend(READONLY_PATHS.iter().map(|p| p.to_string()));
    for (_, target) in base_mounts().into_iter().rev() {
        paths.push(target.to_string());
    }

    let mut errors = ErrorList::new();
    for path in paths {
        let joined = join_rooted(rootfs, &path);
        match umount2(&joined, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EINVAL) => {}
            Err(e) => errors.push(with_context(
                e,
                format!("failed to unmount {}", joined.display()),
            )),
        }
    }
    errors.into_result()
}

/// Joins an absolute in-namespace path under `rootfs`.
fn join_rooted(rootfs: &Path, path: &str) -> PathBuf {
    let relative = path.trim_start_matches('/');
    rootfs.join(relative)
}

fn clean_path(path: &str) -> String {
    let mut cleaned = PathBuf::from("/");
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::RootDir => {}
            other => cleaned.push(other),
        }
    }
    cleaned.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspool::criu::image::append_entry;

    fn entry(mountpoint: &str, ext_key: Option<&str>, root_dev: u32, flags: u32) -> MntEntry {
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

    #[test]
    fn base_mount_table_matches_the_restored_layout() {
        let targets: Vec<&str> = base_mounts().iter().map(|(_, t)| *t).collect();
        assert_eq!(
            targets,
            vec!["/proc", "/dev", "/dev/pts", "/dev/shm", "/dev/mqueue", "/sys", "/run"]
        );
        let (dev, _) = &base_mounts()[1];
        assert_eq!(dev.fstype, "devtmpfs");
        assert!(dev.options.contains(&"strictatime".to_string()));
    }

    #[test]
    fn restore_candidates_group_by_device_and_skip_protected_paths() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path();
        fs::create_dir_all(rootfs.join("data")).unwrap();
        fs::create_dir_all(rootfs.join("data/sub")).unwrap();
        fs::write(rootfs.join("file"), b"x").unwrap();

        let mut file = fs::File::create(dir.path().join("mountpoints-7.img")).unwrap();
        for e in [
            entry("/data", None, 9, 0),
            entry("/data/sub", None, 9, 0),
            entry("/proc/sys", None, 9, 0),     // readonly path
            entry("/missing", None, 9, 0),      // not present in rootfs
            entry("/file", None, 9, 0),         // not a directory
            entry("/host", Some("/host/data"), 9, 0), // external bind
            entry("/other", None, 12, 0),
        ] {
            append_entry(&mut file, &e).unwrap();
        }
        drop(file);

        let mut img = ImageFile::open(dir.path().join("mountpoints-7.img")).unwrap();
        let groups = read_restore_candidates(rootfs, &mut img).unwrap();
        assert_eq!(groups.len(), 1, "only dev 9 has restorable dirs: {:?}", groups.keys());
        let nine: Vec<&str> = groups[&9].iter().map(|e| e.mountpoint.as_str()).collect();
        assert_eq!(nine, vec!["/data", "/data/sub"]);
    }

    #[test]
    fn shortest_mountpoint_wins_within_a_device_group() {
        let list = vec![
            entry("/data/deeper/nested", None, 9, 0),
            entry("/data", None, 9, 0),
            entry("/data/deeper", None, 9, 0),
        ];
        let shortest = list
            .iter()
            .min_by_key(|e| e.mountpoint.split('/').count())
            .unwrap();
        assert_eq!(shortest.mountpoint, "/data");
    }

    #[test]
    fn tar_archives_unpack_into_the_group_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("data")).unwrap();

        // archive with a single file hello.txt
        let archive_path = dir.path().join("tmpfs-dev-9.tar.gz.img");
        let gz = flate2::write::GzEncoder::new(
            fs::File::create(&archive_path).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(gz);
        let payload = b"warm start";
        let mut header = tar::Header::new_gnu();
        header.set_path("hello.txt").unwrap();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, payload.as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let mut groups = HashMap::new();
        groups.insert(9u32, vec![entry("/data", None, 9, 0)]);
        restore_device_files(&rootfs, &groups, 9, &archive_path).unwrap();
        assert_eq!(
            fs::read_to_string(rootfs.join("data/hello.txt")).unwrap(),
            "warm start"
        );
        // a device with no candidates is a no-op
        restore_device_files(&rootfs, &groups, 12, &archive_path).unwrap();
    }

    #[test]
    fn clean_path_collapses_components() {
        assert_eq!(clean_path("/proc/sys/"), "/proc/sys");
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/"), "/");
    }
}
