//! Filesystem Composer (SPEC_FULL.md §4.2), built on `nix::mount`.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, warn};

/// Overlay lower/upper pair, or none for a plain directory tree.
pub enum RootFs {
    Plain,
    Overlay { lower: PathBuf, upper: PathBuf },
}

/// A volume to bind-mount into the container: host path -> container-relative path.
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// Resolve `path` (container-relative, leading `/` stripped) under `target`.
fn target_subdir(target: &Path, path: &str) -> PathBuf {
    target.join(path.trim_start_matches('/'))
}

fn bind_mount(source: &Path, target: &Path, recursive: bool, readonly: bool) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>)
        .with_context(|| format!("bind mount {} -> {} failed", source.display(), target.display()))?;
    if readonly {
        let remount_flags = flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        mount(Some(source), target, None::<&str>, remount_flags, None::<&str>)
            .with_context(|| format!("read-only remount of {} failed", target.display()))?;
    }
    Ok(())
}

/// Step 1: mount the root filesystem at `target`, either an overlay of
/// exactly a `(lower, upper)` pair or a self bind-mount so `pivot_root` has a
/// mount point to work with.
pub fn mount_root_fs(target: &Path, root_fs: &RootFs) -> Result<()> {
    match root_fs {
        RootFs::Plain => bind_mount(target, target, false, false),
        RootFs::Overlay { lower, upper } => {
            fs::create_dir_all(lower).ok();
            fs::create_dir_all(upper).ok();
            let opts = format!(
                "lowerdir={},upperdir={}",
                lower.display(),
                upper.display()
            );
            mount(
                Some("overlay"),
                target,
                Some("overlay"),
                MsFlags::empty(),
                Some(opts.as_str()),
            )
            .context("overlay mount failed")
        }
    }
}

/// Step 2: bind-mount each volume's host path onto its container path,
/// creating the mount point if missing.
pub fn mount_volumes(target: &Path, volumes: &[VolumeMount]) -> Result<()> {
    for volume in volumes {
        let real_target = target_subdir(target, &volume.container_path);
        if !real_target.exists() {
            fs::create_dir_all(&real_target)
                .with_context(|| format!("failed to create volume mount point {}", real_target.display()))?;
        }
        bind_mount(&volume.host_path, &real_target, true, false)?;
    }
    Ok(())
}

fn ensure_placeholder(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::write(path, "placeholder for shoebox device bind mount\n")
            .with_context(|| format!("failed to create placeholder {}", path.display()))?;
    }
    Ok(())
}

/// Step 3a: `/dev/pts`, `/dev/ptmx`, `/dev/shm`, and the standard device
/// placeholders.
pub fn mount_devices(target: &Path, running_as_root: bool) -> Result<()> {
    if !running_as_root {
        warn!("cannot mount devpts when not mapping to root, expect TTY malfunction");
        return Ok(());
    }

    let devpts = target_subdir(target, "/dev/pts");
    let ptmx = target_subdir(target, "/dev/ptmx");
    fs::create_dir_all(&devpts).ok();

    let preferred = mount(
        Some("devpts"),
        &devpts,
        Some("devpts"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        Some("newinstance,gid=5,mode=0620,ptmxmode=0666"),
    );
    if preferred.is_err() {
        mount(
            Some("devpts"),
            &devpts,
            Some("devpts"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            Some("newinstance,mode=0620,ptmxmode=0666"),
        )
        .context("devpts mount failed")?;
    }

    if !ptmx.exists() {
        symlink("pts/ptmx", &ptmx).context("failed to symlink /dev/ptmx")?;
    } else if !ptmx.is_symlink() {
        bind_mount(&devpts.join("ptmx"), &ptmx, false, false)?;
    }

    let devshm = target_subdir(target, "/dev/shm");
    if devshm.exists() {
        mount(
            Some("tmpfs"),
            &devshm,
            Some("tmpfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            None::<&str>,
        )
        .context("devshm mount failed")?;
    }

    for dev in ["null", "zero", "tty", "random", "urandom"] {
        let host_dev = PathBuf::from("/dev").join(dev);
        let target_dev = target_subdir(target, &format!("/dev/{dev}"));
        ensure_placeholder(&target_dev)?;
        let meta = fs::symlink_metadata(&target_dev)?;
        use std::os::unix::fs::FileTypeExt;
        if !meta.file_type().is_block_device() && !meta.file_type().is_char_device() {
            bind_mount(&host_dev, &target_dev, false, false)?;
        }
    }
    Ok(())
}

/// Step 3b: `/proc`, with a read-only sub-tree for the sensitive entries.
pub fn mount_procfs(target: &Path) -> Result<()> {
    let target_proc = target_subdir(target, "/proc");
    fs::create_dir_all(&target_proc).ok();
    mount(
        Some("proc"),
        &target_proc,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        None::<&str>,
    )
    .context("procfs mount failed")?;

    for path in ["sysrq-trigger", "sys", "irq", "bus"] {
        let abs_path = target_proc.join(path);
        bind_mount(&abs_path, &abs_path, false, false)?;
        bind_mount(&abs_path, &abs_path, false, true)?;
    }
    Ok(())
}

/// Step 3c: `/sys`, tolerating failure (not owned in a user namespace).
pub fn mount_sysfs(target: &Path) -> Result<()> {
    let target_sys = target_subdir(target, "/sys");
    if bind_mount(Path::new("/sys"), &target_sys, false, false).is_err()
        || bind_mount(&target_sys, &target_sys, false, true).is_err()
    {
        debug!("failed to mount sysfs, probably not owned by us");
    }
    Ok(())
}

/// Step 3d: shadow `/etc/resolv.conf`, `/etc/hosts`, `/etc/hostname` with
/// generated content via an ephemeral tmpfs, without touching the image's
/// originals.
pub fn mount_etc_files(target: &Path, resolv_conf: &str, hosts: &str, hostname: &str) -> Result<()> {
    let tmpfs = target.join(format!(".etc-{}", std::process::id()));
    fs::create_dir_all(&tmpfs).context("failed to create etc staging dir")?;
    mount(
        Some("tmpfs"),
        &tmpfs,
        Some("tmpfs"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        Some("size=1m"),
    )
    .context("etc tmpfs mount failed")?;

    let write_and_mount = |rel_path: &str, content: &str| -> Result<()> {
        let file_name = Path::new(rel_path).file_name().unwrap();
        let staged = tmpfs.join(file_name);
        fs::write(&staged, content)?;
        let real_target = target_subdir(target, rel_path);
        if !real_target.exists() {
            fs::write(&real_target, "")?;
        }
        bind_mount(&staged, &real_target, false, false)
    };

    write_and_mount("/etc/resolv.conf", resolv_conf)?;
    write_and_mount("/etc/hosts", hosts)?;
    write_and_mount("/etc/hostname", &format!("{hostname}\n"))?;

    umount2(&tmpfs, MntFlags::empty()).context("failed to unmount etc staging dir")?;
    fs::remove_dir(&tmpfs).ok();
    Ok(())
}

/// Step 4: pivot into `target`, detaching the old root.
pub fn pivot_namespace_root(target: &Path) -> Result<()> {
    let old_root = target.join(format!(".oldroot-{}", std::process::id()));
    fs::create_dir_all(&old_root).context("failed to create pivot staging dir")?;

    nix::unistd::pivot_root(target, &old_root).context("pivot_root failed")?;
    nix::unistd::chdir("/").context("chdir to new root failed")?;

    let pivoted_old_root = Path::new("/").join(old_root.file_name().unwrap());
    umount2(&pivoted_old_root, MntFlags::MNT_DETACH)
        .context("failed to lazily unmount old root")?;
    fs::remove_dir(&pivoted_old_root).ok();
    Ok(())
}

/// Generate `/etc/hosts` per §4.2: fixed loopback prelude, an optional
/// self-address line, then one line per linked container.
pub fn generate_hosts(
    self_ip: Option<std::net::Ipv4Addr>,
    hostname: Option<&str>,
    links: &[(std::net::Ipv4Addr, Vec<String>)],
) -> String {
    let mut out = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n");
    if let (Some(ip), Some(name)) = (self_ip, hostname) {
        out.push_str(&format!("{ip}\t{name}\n"));
    }
    for (ip, aliases) in links {
        if aliases.is_empty() {
            continue;
        }
        out.push_str(&format!("{ip}\t{}\n", aliases.join(" ")));
    }
    out
}

/// Generate `/etc/resolv.conf`: copy the host's, rewriting any
/// `nameserver 127.*` line to the private-net gateway when one exists.
pub fn generate_resolv_conf(host_resolv_conf: &str, gateway: Option<std::net::Ipv4Addr>) -> String {
    host_resolv_conf
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("nameserver 127.") {
                match gateway {
                    Some(gw) => format!("nameserver {gw}"),
                    None => line.to_string(),
                }
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// Full filesystem-composer pass, steps 1-4, invoked from the namespace
/// orchestrator after the user/mount namespace has been unshared.
pub struct FilesystemPlan<'a> {
    pub target: &'a Path,
    pub root_fs: RootFs,
    pub volumes: Vec<VolumeMount>,
    pub special_fs: bool,
    pub running_as_root: bool,
    pub resolv_conf: String,
    pub hosts: String,
    pub hostname: String,
}

impl<'a> FilesystemPlan<'a> {
    pub fn check_root_dir(&self) -> Result<()> {
        if !self.target.exists() {
            match &self.root_fs {
                RootFs::Overlay { .. } => {
                    fs::create_dir_all(self.target).context("failed to create container root")?;
                }
                RootFs::Plain => bail!("{} does not exist", self.target.display()),
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Result<()> {
        mount_root_fs(self.target, &self.root_fs)?;
        if !self.volumes.is_empty() {
            mount_volumes(self.target, &self.volumes)?;
        }

        if self.special_fs {
            mount_devices(self.target, self.running_as_root)?;
            mount_procfs(self.target)?;
            mount_sysfs(self.target)?;
            mount_etc_files(self.target, &self.resolv_conf, &self.hosts, &self.hostname)?;
        }

        pivot_namespace_root(self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn generated_hosts_has_loopback_prelude() {
        let hosts = generate_hosts(None, None, &[]);
        assert!(hosts.starts_with("127.0.0.1"));
    }

    #[test]
    fn generated_hosts_includes_self_and_links() {
        let hosts = generate_hosts(
            Some(Ipv4Addr::new(10, 0, 3, 5)),
            Some("web"),
            &[(Ipv4Addr::new(10, 0, 3, 6), vec!["db".to_string(), "mysql".to_string()])],
        );
        assert!(hosts.contains("10.0.3.5\tweb"));
        assert!(hosts.contains("10.0.3.6\tdb mysql"));
    }

    #[test]
    fn resolv_conf_rewrites_loopback_nameserver_to_gateway() {
        let input = "nameserver 127.0.0.53\noptions edns0\n";
        let out = generate_resolv_conf(input, Some(Ipv4Addr::new(10, 0, 3, 1)));
        assert!(out.contains("nameserver 10.0.3.1"));
        assert!(!out.contains("127.0.0.53"));
        assert!(out.contains("options edns0"));
    }

    #[test]
    fn resolv_conf_leaves_loopback_nameserver_when_no_gateway() {
        let input = "nameserver 127.0.0.53\n";
        let out = generate_resolv_conf(input, None);
        assert!(out.contains("nameserver 127.0.0.53"));
    }

    #[test]
    fn resolv_conf_passes_through_non_loopback_nameservers() {
        let input = "nameserver 8.8.8.8\n";
        let out = generate_resolv_conf(input, Some(Ipv4Addr::new(10, 0, 3, 1)));
        assert!(out.contains("nameserver 8.8.8.8"));
    }
}
