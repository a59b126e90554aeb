//! `VolumeManager` implementation spawning the LVM tools

use crate::volume::{LvInfo, VolumeManager};
use crate::{LVM_SIZE_INCREMENT, TAG_HIDDEN};

use lvhd_common::{Result, SECTOR_SIZE, StorageError, roundup};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::process::Command;
use tracing::debug;

/// Spawns lvcreate/lvremove/lvrename/lvextend/lvreduce/lvchange/lvs/vgs.
///
/// Each invocation is synchronous and treated as atomic; failures are
/// wrapped with the failing command line and exit status.
pub struct CmdVolumeManager {
    vg_name: String,
}

impl CmdVolumeManager {
    #[must_use]
    pub fn new(vg_name: impl Into<String>) -> Self {
        Self {
            vg_name: vg_name.into(),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let rendered = format!("{} {}", program, args.join(" "));
        debug!(cmd = %rendered, "running");
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(StorageError::CmdFailed {
                cmd: rendered,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn qualified(&self, lv_name: &str) -> String {
        format!("{}/{}", self.vg_name, lv_name)
    }

    /// Parse one `lvs` report line: name;size;attr;tags
    fn parse_lvs_line(line: &str) -> Option<LvInfo> {
        let mut fields = line.trim().split(';');
        let name = fields.next()?.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let size = fields
            .next()?
            .trim()
            .trim_end_matches(['B', 'b'])
            .parse()
            .ok()?;
        let attr: Vec<char> = fields.next()?.trim().chars().collect();
        let tags: Vec<String> = fields
            .next()
            .map(|t| {
                t.trim()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // lv_attr: [0] volume type, [1] permissions, [4] state, [5] open
        let read_only = attr.get(1) == Some(&'r');
        let active = attr.get(4) == Some(&'a');
        let open = attr.get(5) == Some(&'o');
        let hidden = tags.iter().any(|t| t == TAG_HIDDEN);

        Some(LvInfo {
            name,
            size,
            active,
            open,
            read_only,
            hidden,
            tags,
        })
    }
}

impl VolumeManager for CmdVolumeManager {
    fn vg_name(&self) -> &str {
        &self.vg_name
    }

    fn create(&self, lv_name: &str, size: u64) -> Result<()> {
        let size = roundup(LVM_SIZE_INCREMENT, size.max(1));
        let size_arg = format!("{size}b");
        self.run(
            "lvcreate",
            &["-n", lv_name, "-L", &size_arg, "-W", "n", &self.vg_name],
        )?;
        Ok(())
    }

    fn remove(&self, lv_name: &str) -> Result<()> {
        self.run("lvremove", &["-f", &self.qualified(lv_name)])?;
        Ok(())
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.run(
            "lvrename",
            &[self.vg_name.as_str(), old_name, new_name],
        )?;
        Ok(())
    }

    fn set_size(&self, lv_name: &str, size: u64) -> Result<()> {
        let current = self.get_info(lv_name)?.size;
        let size = roundup(LVM_SIZE_INCREMENT, size.max(1));
        let size_arg = format!("{size}b");
        let target = self.qualified(lv_name);
        if size > current {
            self.run("lvextend", &["-L", &size_arg, &target])?;
        } else if size < current {
            self.run("lvreduce", &["-f", "-L", &size_arg, &target])?;
        }
        Ok(())
    }

    fn activate(&self, lv_name: &str) -> Result<()> {
        self.run("lvchange", &["-ay", &self.qualified(lv_name)])?;
        Ok(())
    }

    fn deactivate(&self, lv_name: &str) -> Result<()> {
        self.run("lvchange", &["-an", &self.qualified(lv_name)])?;
        Ok(())
    }

    fn set_readonly(&self, lv_name: &str, read_only: bool) -> Result<()> {
        let perm = if read_only { "r" } else { "rw" };
        self.run("lvchange", &["-p", perm, &self.qualified(lv_name)])?;
        Ok(())
    }

    fn set_hidden(&self, lv_name: &str, hidden: bool) -> Result<()> {
        let flag = if hidden { "--addtag" } else { "--deltag" };
        self.run("lvchange", &[flag, TAG_HIDDEN, &self.qualified(lv_name)])?;
        Ok(())
    }

    fn add_tag(&self, lv_name: &str, tag: &str) -> Result<()> {
        self.run("lvchange", &["--addtag", tag, &self.qualified(lv_name)])?;
        Ok(())
    }

    fn refresh(&self, lv_name: &str) -> Result<()> {
        self.run("lvchange", &["--refresh", &self.qualified(lv_name)])?;
        Ok(())
    }

    fn exists(&self, lv_name: &str) -> Result<bool> {
        match self.get_info(lv_name) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_info(&self, lv_name: &str) -> Result<LvInfo> {
        let out = self.run(
            "lvs",
            &[
                "--noheadings",
                "--units",
                "b",
                "--separator",
                ";",
                "-o",
                "lv_name,lv_size,lv_attr,lv_tags",
                &self.qualified(lv_name),
            ],
        );
        match out {
            Ok(out) => out
                .lines()
                .find_map(Self::parse_lvs_line)
                .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string())),
            // lvs exits non-zero for a missing LV
            Err(StorageError::CmdFailed { .. }) => {
                Err(StorageError::LvNotFound(lv_name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn scan(&self) -> Result<HashMap<String, LvInfo>> {
        let out = self.run(
            "lvs",
            &[
                "--noheadings",
                "--units",
                "b",
                "--separator",
                ";",
                "-o",
                "lv_name,lv_size,lv_attr,lv_tags",
                &self.vg_name,
            ],
        )?;
        Ok(out
            .lines()
            .filter_map(Self::parse_lvs_line)
            .map(|info| (info.name.clone(), info))
            .collect())
    }

    fn free_space(&self) -> Result<u64> {
        let out = self.run(
            "vgs",
            &["--noheadings", "--units", "b", "-o", "vg_free", &self.vg_name],
        )?;
        out.trim()
            .trim_end_matches(['B', 'b'])
            .parse()
            .map_err(|_| StorageError::metadata(format!("unparsable vgs output: {out:?}")))
    }

    fn zero_range(&self, lv_name: &str, offset: u64, len: u64) -> Result<()> {
        debug_assert_eq!(offset % SECTOR_SIZE, 0);
        debug_assert_eq!(len % SECTOR_SIZE, 0);
        let path = self.lv_path(lv_name);
        let mut dev = OpenOptions::new().write(true).open(&path)?;
        dev.seek(SeekFrom::Start(offset))?;
        let zeros = vec![0u8; len as usize];
        dev.write_all(&zeros)?;
        dev.sync_data()?;
        Ok(())
    }
}
