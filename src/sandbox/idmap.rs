//! User-namespace & id-map helper (SPEC_FULL.md §4.3).
//!
//! The fork+pipe-barrier choreography is expressed as an explicit `Helper`
//! value with `release()`/`wait()` methods rather than a scoped-resource
//! ("context manager") idiom — SPEC_FULL.md §9's note on this exact pattern.

use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use anyhow::{bail, Context, Result};
use nix::unistd::{ForkResult, Pid};
use tracing::warn;

/// A forked helper process blocked on a pipe barrier until `release()` is
/// called, reaped by `wait()`.
pub struct Helper {
    pid: Pid,
    write_fd: RawFd,
}

impl Helper {
    /// Fork a child that immediately blocks reading one byte from a pipe,
    /// then runs `body`. The parent gets back a `Helper` holding the write
    /// end of that pipe.
    pub fn spawn(body: impl FnOnce() -> Result<()>) -> Result<Helper> {
        let (read_fd, write_fd) = nix::unistd::pipe().context("failed to create barrier pipe")?;

        match unsafe { nix::unistd::fork() }.context("fork failed")? {
            ForkResult::Parent { child } => {
                drop(read_fd);
                Ok(Helper {
                    pid: child,
                    write_fd: write_fd.into_raw_fd(),
                })
            }
            ForkResult::Child => {
                drop(write_fd);
                let mut buf = [0u8; 1];
                let _ = nix::unistd::read(read_fd.as_raw_fd(), &mut buf);
                drop(read_fd);

                let exit_code = match body() {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("shoebox: helper failed: {e:#}");
                        1
                    }
                };
                std::process::exit(exit_code);
            }
        }
    }

    /// Unblock the helper by closing the write end of the barrier pipe.
    pub fn release(self) -> HelperHandle {
        unsafe { nix::libc::close(self.write_fd) };
        HelperHandle { pid: self.pid }
    }
}

/// A released helper, waiting to be reaped.
pub struct HelperHandle {
    pid: Pid,
}

impl HelperHandle {
    /// Reap the helper and report whether it exited successfully.
    pub fn wait(self) -> Result<bool> {
        use nix::sys::wait::WaitStatus;
        match nix::sys::wait::waitpid(self.pid, None)? {
            WaitStatus::Exited(_, code) => Ok(code == 0),
            _ => Ok(false),
        }
    }
}

/// One `(inside, outside, count)` sub-id range, `inside` numbered from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

/// Parse `/etc/subuid` or `/etc/subgid` for `login`'s ranges: lines
/// `login:first-id:count`, first five ranges kept (kernel limit), `inside`
/// starting at 0 and incrementing per range.
pub fn load_id_ranges(path: &str, login: &str) -> Result<Vec<IdRange>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;

    let mut ranges = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 3 {
            warn!(path, line, "skipping malformed subid line");
            continue;
        }
        if parts[0] != login {
            continue;
        }
        let (Ok(first), Ok(count)) = (parts[1].parse::<u32>(), parts[2].parse::<u32>()) else {
            warn!(path, line, "skipping subid line with non-numeric fields");
            continue;
        };
        ranges.push(IdRange {
            inside: 0,
            outside: first,
            count,
        });
        if ranges.len() >= 5 {
            break;
        }
    }

    if ranges.is_empty() {
        bail!("no subordinate id range found for {login} in {path}");
    }

    let mut next_inside = 0u32;
    for range in &mut ranges {
        range.inside = next_inside;
        next_inside += range.count;
    }
    Ok(ranges)
}

/// Warn if `outer_id` is not covered by any of `ranges` — a common
/// misconfiguration where a user's own uid/gid isn't itself sub-id mapped.
pub fn warn_if_uncovered(ranges: &[IdRange], outer_id: u32, kind: &str) {
    let covered = ranges
        .iter()
        .any(|r| outer_id >= r.outside && outer_id < r.outside + r.count);
    if !covered {
        warn!(outer_id, kind, "outer id is not covered by its own sub-id ranges");
    }
}

/// Apply the id map to `pid` via `newuidmap`/`newgidmap`, always including an
/// entry mapping the outer uid/gid to 0 inside in addition to the
/// subordinate ranges.
pub fn apply_id_map(tool: &str, pid: Pid, outer_id: u32, ranges: &[IdRange]) -> Result<bool> {
    let mut args = vec![pid.as_raw().to_string(), "0".to_string(), outer_id.to_string(), "1".to_string()];
    for range in ranges {
        args.push(range.inside.to_string());
        args.push(range.outside.to_string());
        args.push(range.count.to_string());
    }
    let status = std::process::Command::new(tool).args(&args).status();
    Ok(matches!(status, Ok(s) if s.success()))
}

/// Fallback single-entry map: caller's outer uid/gid becomes 0 inside.
/// `/proc/<pid>/setgroups` must be set to `deny` before writing `gid_map`
/// without `CAP_SETGID` in the target namespace.
pub fn single_id_map(pid: Pid, uid: u32, gid: u32) -> Result<()> {
    std::fs::write(format!("/proc/{pid}/setgroups"), "deny")
        .context("failed to write setgroups")?;
    std::fs::write(format!("/proc/{pid}/uid_map"), format!("0 {uid} 1\n"))
        .context("failed to write uid_map")?;
    std::fs::write(format!("/proc/{pid}/gid_map"), format!("0 {gid} 1\n"))
        .context("failed to write gid_map")?;
    Ok(())
}

/// Full id-map setup for `pid`: try the full subordinate-range mapping via
/// `newuidmap`/`newgidmap`, falling back to the single-entry 0:0 map on any
/// failure — including missing `/etc/subuid`/`/etc/subgid`, which also force
/// a fallback even when explicit target ids were not requested (Testable
/// Scenario S5).
pub fn setup_uid_map(pid: Pid) -> Result<()> {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let login = std::env::var("USER").unwrap_or_default();

    let full_map_ok = (|| -> Result<bool> {
        let uid_ranges = load_id_ranges("/etc/subuid", &login)?;
        let gid_ranges = load_id_ranges("/etc/subgid", &login)?;
        warn_if_uncovered(&uid_ranges, uid, "uid");
        warn_if_uncovered(&gid_ranges, gid, "gid");

        let uid_ok = apply_id_map("newuidmap", pid, uid, &uid_ranges)?;
        let gid_ok = apply_id_map("newgidmap", pid, gid, &gid_ranges)?;
        Ok(uid_ok && gid_ok)
    })()
    .unwrap_or(false);

    if full_map_ok {
        return Ok(());
    }

    warn!("newuidmap/newgidmap unavailable or failed, falling back to single-id map");
    single_id_map(pid, uid, gid)
}

/// Write single-entry uid_map/gid_map directly for explicitly supplied
/// target ids (no helper/newuidmap round trip needed, per §4.1 step 4).
pub fn write_explicit_target_map(pid: Pid, target_uid: u32, target_gid: u32) -> Result<()> {
    single_id_map(pid, target_uid, target_gid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile_path::TempPath {
        tempfile_path::TempPath::write(content)
    }

    mod tempfile_path {
        use std::io::Write;
        use std::path::{Path, PathBuf};

        pub struct TempPath(PathBuf);
        impl TempPath {
            pub fn write(content: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "shoebox-test-{}-{}",
                    std::process::id(),
                    content.len()
                ));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(content.as_bytes()).unwrap();
                TempPath(path)
            }
        }
        impl AsRef<Path> for TempPath {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }
        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn keeps_only_first_five_ranges_in_file_order() {
        let mut content = String::new();
        for i in 0..8 {
            content.push_str(&format!("alice:{}:65536\n", 100000 + i * 65536));
        }
        let path = write_temp(&content);
        let ranges = load_id_ranges(path.as_ref().to_str().unwrap(), "alice").unwrap();
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[0].outside, 100000);
        assert_eq!(ranges[4].outside, 100000 + 4 * 65536);
    }

    #[test]
    fn inside_ids_start_at_zero_and_increment() {
        let content = "bob:100000:10\nbob:200000:20\n";
        let path = write_temp(content);
        let ranges = load_id_ranges(path.as_ref().to_str().unwrap(), "bob").unwrap();
        assert_eq!(ranges[0].inside, 0);
        assert_eq!(ranges[1].inside, 10);
    }

    #[test]
    fn ignores_other_logins_and_malformed_lines() {
        let content = "carol:100000:65536\nmalformed-line\nbob:200000:10\n";
        let path = write_temp(content);
        let ranges = load_id_ranges(path.as_ref().to_str().unwrap(), "bob").unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].outside, 200000);
    }

    #[test]
    fn missing_file_is_an_error_triggering_fallback_upstream() {
        assert!(load_id_ranges("/nonexistent/subuid", "nobody").is_err());
    }
}
