//! `VhdTool` implementation spawning the external VHD CLI

use crate::{VhdTool, geometry::MAX_VHD_SIZE};

use lvhd_common::{MIB, Result, StorageError};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Invokes `vhd-util`-style subcommands, one per trait method
pub struct CmdVhdTool {
    program: String,
}

impl CmdVhdTool {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let rendered = format!("{} {}", self.program, args.join(" "));
        debug!(cmd = %rendered, "running");
        let output = Command::new(&self.program).args(args).output()?;
        if !output.status.success() {
            return Err(StorageError::CmdFailed {
                cmd: rendered,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn path_str(path: &Path) -> &str {
        path.to_str().unwrap_or_default()
    }
}

impl Default for CmdVhdTool {
    fn default() -> Self {
        Self::new("vhd-util")
    }
}

impl VhdTool for CmdVhdTool {
    fn create(&self, path: &Path, size_virt: u64, reserve_full_bat: bool) -> Result<()> {
        let size_mib = (size_virt / MIB).to_string();
        let msize_mib = (MAX_VHD_SIZE / MIB).to_string();
        let mut args: Vec<&str> = vec!["create", "-n", Self::path_str(path), "-s", &size_mib];
        if reserve_full_bat {
            args.extend(["-S", msize_mib.as_str()]);
        }
        self.run(&args)?;
        Ok(())
    }

    fn snapshot(&self, dst: &Path, src: &Path) -> Result<()> {
        self.run(&[
            "snapshot",
            "-n",
            Self::path_str(dst),
            "-p",
            Self::path_str(src),
        ])?;
        Ok(())
    }

    fn check(&self, path: &Path) -> Result<bool> {
        match self.run(&["check", "-ignore-timestamps", "-n", Self::path_str(path)]) {
            Ok(_) => Ok(true),
            // a non-zero exit means the node failed validation, not that the
            // check could not run
            Err(StorageError::CmdFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_depth(&self, path: &Path) -> Result<u32> {
        let out = self.run(&["query", "-n", Self::path_str(path), "-d"])?;
        parse_trailing_int(&out)
            .map(|n| n as u32)
            .ok_or_else(|| StorageError::metadata(format!("unparsable depth: {out:?}")))
    }

    fn get_parent(&self, path: &Path) -> Result<Option<PathBuf>> {
        let out = self.run(&["query", "-n", Self::path_str(path), "-p"])?;
        if out.contains("no parent") {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(out)))
    }

    fn get_hidden(&self, path: &Path) -> Result<bool> {
        let out = self.run(&["query", "-n", Self::path_str(path), "-f"])?;
        Ok(parse_trailing_int(&out).unwrap_or(0) != 0)
    }

    fn set_hidden(&self, path: &Path, hidden: bool) -> Result<()> {
        let value = if hidden { "1" } else { "0" };
        self.run(&[
            "set",
            "-n",
            Self::path_str(path),
            "-f",
            "hidden",
            "-v",
            value,
        ])?;
        Ok(())
    }

    fn get_size_virt(&self, path: &Path) -> Result<u64> {
        let out = self.run(&["query", "-n", Self::path_str(path), "-v"])?;
        parse_trailing_int(&out)
            .map(|mib| mib * MIB)
            .ok_or_else(|| StorageError::metadata(format!("unparsable virt size: {out:?}")))
    }

    fn set_size_virt(&self, path: &Path, size: u64) -> Result<()> {
        let size_mib = (size / MIB).to_string();
        self.run(&["resize", "-n", Self::path_str(path), "-s", &size_mib, "-f"])?;
        Ok(())
    }

    fn get_size_phys(&self, path: &Path) -> Result<u64> {
        let out = self.run(&["query", "-n", Self::path_str(path), "-s"])?;
        parse_trailing_int(&out)
            .ok_or_else(|| StorageError::metadata(format!("unparsable phys size: {out:?}")))
    }

    fn set_size_phys(&self, path: &Path, size: u64) -> Result<()> {
        let size_str = size.to_string();
        self.run(&["modify", "-n", Self::path_str(path), "-s", &size_str])?;
        Ok(())
    }
}

/// Tool output is usually `label: value`; take the last whitespace-separated
/// integer on the last line
fn parse_trailing_int(out: &str) -> Option<u64> {
    out.lines()
        .last()?
        .split_whitespace()
        .last()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trailing_int() {
        assert_eq!(parse_trailing_int("chain depth: 3"), Some(3));
        assert_eq!(parse_trailing_int("1024"), Some(1024));
        assert_eq!(parse_trailing_int("hidden: 1"), Some(1));
        assert_eq!(parse_trailing_int("has no parent"), None);
    }
}
