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

use log::debug;
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags, MsFlags};
use std::fs;
use std::path::Path;

use crate::nspool::util::error::{with_context, BoxError};

const LOWER_PREFIX: &str = "lowerdir=";
const UPPER_PREFIX: &str = "upperdir=";
const WORK_PREFIX: &str = "workdir=";

/// One mount in provider or bundle form: a source, a filesystem type and the
/// raw option strings. Flag-like options become `MS_*` bits, the rest are
/// passed through as mount data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub fstype: String,
    pub options: Vec<String>,
}

impl Mount {
    pub fn bind(source: impl Into<String>) -> Self {
        Mount {
            source: source.into(),
            fstype: "bind".to_string(),
            options: vec!["rbind".to_string()],
        }
    }

    pub fn overlay(lowers: &[String], upper: &str, work: &str) -> Self {
        Mount {
            source: "overlay".to_string(),
            fstype: "overlay".to_string(),
            options: vec![
                format!("{}{}", LOWER_PREFIX, lowers.join(":")),
                format!("{}{}", UPPER_PREFIX, upper),
                format!("{}{}", WORK_PREFIX, work),
            ],
        }
    }

    pub fn is_overlay(&self) -> bool {
        self.fstype == "overlay"
    }

    pub fn flags(&self) -> MsFlags {
        let mut flags = get_mount_flags(&self.options);
        if self.fstype == "bind" {
            flags |= MsFlags::MS_BIND;
        }
        flags
    }

    pub fn data(&self) -> Option<String> {
        get_mount_data(&self.options)
    }

    /// Mounts at `target`, creating the directory first.
    pub fn mount(&self, target: &Path) -> Result<(), BoxError> {
        fs::create_dir_all(target)
            .map_err(|e| with_context(e, format!("failed to create {}", target.display())))?;
        let fstype = if self.fstype == "bind" {
            None
        } else {
            Some(self.fstype.as_str())
        };
        debug!(
            "mounting src={} type={} target={} options={:?}",
            self.source,
            self.fstype,
            target.display(),
            self.options
        );
        nix::mount::mount(
            Some(self.source.as_str()),
            target,
            fstype,
            self.flags(),
            self.data().as_deref(),
        )
        .map_err(|e| {
            with_context(
                e,
                format!(
                    "mount(src:{},dest:{},type:{}) failed",
                    self.source,
                    target.display(),
                    self.fstype
                ),
            )
        })
    }

    pub fn upper(&self) -> Option<&str> {
        self.option_value(UPPER_PREFIX)
    }

    pub fn work(&self) -> Option<&str> {
        self.option_value(WORK_PREFIX)
    }

    pub fn lowers(&self) -> Vec<&str> {
        self.option_value(LOWER_PREFIX)
            .map(|v| v.split(':').collect())
            .unwrap_or_default()
    }

    fn option_value(&self, prefix: &str) -> Option<&str> {
        self.options
            .iter()
            .find_map(|o| o.strip_prefix(prefix))
            .filter(|v| !v.is_empty())
    }

    fn remove_option(&mut self, prefix: &str) {
        self.options.retain(|o| !o.starts_with(prefix));
    }

    fn set_option(&mut self, prefix: &str, value: &str) {
        self.remove_option(prefix);
        self.options.push(format!("{}{}", prefix, value));
    }
}

pub fn mount_all(mounts: &[Mount], target: &Path) -> Result<(), BoxError> {
    for mount in mounts {
        mount.mount(target)?;
    }
    Ok(())
}

/// Unmounts `target` repeatedly until nothing is mounted there. EINVAL (not
/// a mount point) and ENOENT terminate the loop cleanly.
pub fn unmount_all(target: &Path, flags: MntFlags) -> Result<(), BoxError> {
    loop {
        match umount2(target, flags) {
            Ok(()) => continue,
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => return Ok(()),
            Err(e) => {
                return Err(with_context(
                    e,
                    format!("failed to unmount {}", target.display()),
                ))
            }
        }
    }
}

/// Rewrites the top overlay of a provider mount stack to be read-only: the
/// would-be upper joins the head of the lower list and the upper/work
/// options are dropped. Every bundle overlay then stacks its own writable
/// layer on top of this shared stack.
pub fn make_overlays_readonly(mounts: &mut [Mount]) {
    let Some(last) = mounts.last_mut() else {
        return;
    };
    if !last.is_overlay() {
        return;
    }
    let Some(upper) = last.upper().map(str::to_owned) else {
        return;
    };
    let mut lowers: Vec<String> = vec![upper];
    lowers.extend(last.lowers().iter().map(|s| s.to_string()));
    last.remove_option(UPPER_PREFIX);
    last.remove_option(WORK_PREFIX);
    last.set_option(LOWER_PREFIX, &lowers.join(":"));
}

fn get_mount_flags(options: &[String]) -> MsFlags {
    options.iter().fold(MsFlags::empty(), |mut flags, opt| {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "mand" => flags |= MsFlags::MS_MANDLOCK,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "private" => flags |= MsFlags::MS_PRIVATE,
            "shared" => flags |= MsFlags::MS_SHARED,
            "slave" => flags |= MsFlags::MS_SLAVE,
            "unbindable" => flags |= MsFlags::MS_UNBINDABLE,
            "rec" => flags |= MsFlags::MS_REC,
            "rprivate" => flags |= MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            "rshared" => flags |= MsFlags::MS_SHARED | MsFlags::MS_REC,
            "rslave" => flags |= MsFlags::MS_SLAVE | MsFlags::MS_REC,
            "runbindable" => flags |= MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "lazytime" => flags |= MsFlags::MS_LAZYTIME,
            _ => {}
        }
        flags
    })
}

fn get_mount_data(options: &[String]) -> Option<String> {
    let keywords = [
        // devpts
        "newinstance",
        "ptmxmode",
        // tmpfs / devtmpfs
        "size",
        "mode",
        "uid",
        "gid",
        "nr_inodes",
        // overlay
        "lowerdir",
        "upperdir",
        "workdir",
        // proc
        "hidepid",
    ];
    let data: Vec<&str> = options
        .iter()
        .map(String::as_str)
        .filter(|opt| {
            let key = opt.split('=').next().unwrap_or(opt);
            keywords.contains(&key)
        })
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_and_data_options_are_split() {
        let mount = Mount {
            source: "shm".into(),
            fstype: "tmpfs".into(),
            options: vec![
                "nosuid".into(),
                "noexec".into(),
                "nodev".into(),
                "mode=1777".into(),
                "size=65536k".into(),
            ],
        };
        let flags = mount.flags();
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NOEXEC));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert_eq!(mount.data().as_deref(), Some("mode=1777,size=65536k"));
    }

    #[test]
    fn bind_type_implies_bind_flag() {
        let mount = Mount::bind("/host/data");
        assert!(mount.flags().contains(MsFlags::MS_BIND));
        assert!(mount.flags().contains(MsFlags::MS_REC));
        assert!(mount.data().is_none());
    }

    #[test]
    fn overlay_accessors_parse_options() {
        let mount = Mount::overlay(
            &["/l1".to_string(), "/l2".to_string()],
            "/bundle/upper",
            "/bundle/work",
        );
        assert!(mount.is_overlay());
        assert_eq!(mount.lowers(), vec!["/l1", "/l2"]);
        assert_eq!(mount.upper(), Some("/bundle/upper"));
        assert_eq!(mount.work(), Some("/bundle/work"));
    }

    #[test]
    fn readonly_rewrite_moves_upper_into_lowers() {
        let mut mounts = vec![Mount::overlay(
            &["/layers/0".to_string()],
            "/snap/fs/upper",
            "/snap/fs/work",
        )];
        make_overlays_readonly(&mut mounts);
        let top = &mounts[0];
        assert_eq!(top.upper(), None);
        assert_eq!(top.work(), None);
        assert_eq!(top.lowers(), vec!["/snap/fs/upper", "/layers/0"]);
    }

    #[test]
    fn readonly_rewrite_ignores_non_overlay_stacks() {
        let mut mounts = vec![Mount::bind("/plain")];
        make_overlays_readonly(&mut mounts);
        assert_eq!(mounts[0], Mount::bind("/plain"));
    }
}
