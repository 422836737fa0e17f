//! Build-Step Executor (SPEC_FULL.md §4.7).

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::unistd::{Gid, Uid};
use tracing::info;

use crate::dockerfile::imagespec::ExecContext;
use crate::sandbox::mount::{FilesystemPlan, RootFs};
use crate::sandbox::namespace::{self, NamespaceBundle};

/// Outcome of attempting to execute one build step — `Skipped` stands in for
/// a build step a particular build can't perform (e.g. a remote-URL `ADD`
/// with no network) without using an exception as control flow.
pub enum Executed {
    Ran,
    Skipped(String),
}

/// Look up `(uid, gid)` for `user` in an `/etc/passwd`-shaped file, matching
/// `get_passwd_id`.
pub fn lookup_passwd_id(passwd_path: &Path, user: &str) -> Result<(u32, u32)> {
    let content = std::fs::read_to_string(passwd_path)
        .with_context(|| format!("failed to read {}", passwd_path.display()))?;
    for line in content.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 4 && fields[0] == user {
            let uid = fields[2].parse().context("malformed uid field")?;
            let gid = fields[3].parse().context("malformed gid field")?;
            return Ok((uid, gid));
        }
    }
    bail!("{user} not found in {}", passwd_path.display())
}

/// Look up the supplementary group ids `user` belongs to in an
/// `/etc/group`-shaped file, matching `get_groups`.
pub fn lookup_groups(group_path: &Path, user: &str) -> Result<Vec<u32>> {
    let content = std::fs::read_to_string(group_path)
        .with_context(|| format!("failed to read {}", group_path.display()))?;
    let mut groups = std::collections::BTreeSet::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() > 3 {
            if fields[3].split(',').any(|member| member == user) {
                if let Ok(gid) = fields[2].parse() {
                    groups.insert(gid);
                }
            }
        }
    }
    Ok(groups.into_iter().collect())
}

/// Drop from root to `context.user`, chdir, and `execvpe` the command,
/// matching `exec_in_namespace`. Never returns on success.
fn exec_in_namespace(context: &ExecContext, command: &[String]) -> Result<()> {
    let (uid, gid) = lookup_passwd_id(Path::new("/etc/passwd"), &context.user)?;
    let groups = lookup_groups(Path::new("/etc/group"), &context.user)?;

    let gids: Vec<Gid> = groups.into_iter().map(Gid::from_raw).collect();
    nix::unistd::setgroups(&gids).context("setgroups failed")?;
    nix::unistd::setgid(Gid::from_raw(gid)).context("setgid failed")?;
    nix::unistd::setuid(Uid::from_raw(uid)).context("setuid failed")?;

    nix::unistd::chdir(context.workdir.as_str()).context("chdir to workdir failed")?;

    let c_command: Vec<CString> = command
        .iter()
        .map(|s| CString::new(s.as_str()).unwrap())
        .collect();
    let c_env: Vec<CString> = context
        .environ
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap())
        .collect();

    nix::unistd::execvpe(&c_command[0], &c_command, &c_env).context("execvpe failed")?;
    unreachable!("execvpe does not return on success");
}

/// RUN: fork, enter the container namespace, drop to the build user, run the
/// command. Non-zero exit or a signal is fatal to the build.
pub fn run_command(
    bundle: NamespaceBundle,
    context: &ExecContext,
    command: &[String],
) -> Result<()> {
    info!(?command, "RUN");
    let command = command.to_vec();
    let context = context.clone();
    namespace::run(bundle, move || exec_in_namespace(&context, &command))
}

/// COPY/ADD: stream-pipe host files through a parent-side tar writer into a
/// child-side extractor running inside the container namespace, matching
/// `copy_inside`.
pub fn copy_files(
    target: &Path,
    root_fs: RootFs,
    src_dir: &Path,
    members: &[PathBuf],
    dest_dir: &str,
) -> Result<()> {
    let (read_fd, write_fd) = nix::unistd::pipe().context("failed to create tar pipe")?;

    match unsafe { nix::unistd::fork() }.context("fork failed")? {
        nix::unistd::ForkResult::Parent { child } => {
            drop(read_fd);
            let mut writer = std::fs::File::from(write_fd);
            let mut builder = tar::Builder::new(&mut writer);
            for member in members {
                let full_path = src_dir.join(member);
                if full_path.is_dir() {
                    builder
                        .append_dir_all(member, &full_path)
                        .with_context(|| format!("failed to tar {}", full_path.display()))?;
                } else {
                    let mut file = std::fs::File::open(&full_path)
                        .with_context(|| format!("failed to open {}", full_path.display()))?;
                    builder
                        .append_file(member, &mut file)
                        .with_context(|| format!("failed to tar {}", full_path.display()))?;
                }
            }
            builder.finish().context("failed to finish tar stream")?;
            drop(builder);
            writer.flush().ok();
            drop(writer);

            match nix::sys::wait::waitpid(child, None)? {
                nix::sys::wait::WaitStatus::Exited(_, 0) => Ok(()),
                other => bail!("copy extractor failed: {other:?}"),
            }
        }
        nix::unistd::ForkResult::Child => {
            drop(write_fd);
            let extract = || -> Result<()> {
                let plan = FilesystemPlan {
                    target,
                    root_fs,
                    volumes: Vec::new(),
                    special_fs: false,
                    running_as_root: true,
                    resolv_conf: String::new(),
                    hosts: String::new(),
                    hostname: String::new(),
                };
                plan.check_root_dir()?;
                plan.build()?;

                let reader = std::fs::File::from(read_fd);
                let mut archive = tar::Archive::new(reader);
                let dest = Path::new(dest_dir);
                std::fs::create_dir_all(dest).ok();
                for entry in archive.entries()? {
                    entry?.unpack_in(dest)?;
                }
                Ok(())
            };
            let code = match extract() {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("shoebox: copy extraction failed: {e:#}");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar", ".tgz", ".tar.gz", ".tbz", ".tar.bz2", ".txz", ".tar.xz",
];

fn is_archive(name: &str) -> bool {
    ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

enum Compression {
    None,
    Gzip,
    External(&'static str),
}

fn compression_for(name: &str) -> Compression {
    if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
        Compression::Gzip
    } else if name.ends_with(".tbz") || name.ends_with(".tar.bz2") {
        Compression::External("bzip2")
    } else if name.ends_with(".txz") || name.ends_with(".tar.xz") {
        Compression::External("xz")
    } else {
        Compression::None
    }
}

/// Unpack a tar archive's contents into `dest_dir`, decompressing by
/// extension first: gzip via `flate2`, bzip2/xz by piping through the system
/// decompressor. The decompressed tar stream is piped into a child-side
/// extractor running inside the container namespace, the same pipe-and-fork
/// shape `copy_files` uses for plain sources.
fn extract_archive(
    target: &Path,
    root_fs: RootFs,
    archive_path: &Path,
    dest_dir: &str,
) -> Result<()> {
    let (read_fd, write_fd) = nix::unistd::pipe().context("failed to create archive pipe")?;
    let file_name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();
    let archive_path = archive_path.to_path_buf();

    match unsafe { nix::unistd::fork() }.context("fork failed")? {
        nix::unistd::ForkResult::Parent { child } => {
            drop(read_fd);
            let mut writer = std::fs::File::from(write_fd);
            let feed = (|| -> Result<()> {
                match compression_for(&file_name) {
                    Compression::None => {
                        let mut f = std::fs::File::open(&archive_path)
                            .with_context(|| format!("failed to open {}", archive_path.display()))?;
                        std::io::copy(&mut f, &mut writer)?;
                    }
                    Compression::Gzip => {
                        let f = std::fs::File::open(&archive_path)
                            .with_context(|| format!("failed to open {}", archive_path.display()))?;
                        let mut decoder = flate2::read::GzDecoder::new(f);
                        std::io::copy(&mut decoder, &mut writer)?;
                    }
                    Compression::External(cmd) => {
                        let mut child = std::process::Command::new(cmd)
                            .arg("-dc")
                            .arg(&archive_path)
                            .stdout(std::process::Stdio::piped())
                            .spawn()
                            .with_context(|| format!("failed to spawn {cmd}"))?;
                        let mut stdout = child.stdout.take().expect("piped stdout");
                        std::io::copy(&mut stdout, &mut writer)?;
                        let status = child.wait().context("failed to wait for decompressor")?;
                        if !status.success() {
                            bail!("{cmd} exited with {status}");
                        }
                    }
                }
                Ok(())
            })();
            drop(writer);
            feed?;

            match nix::sys::wait::waitpid(child, None)? {
                nix::sys::wait::WaitStatus::Exited(_, 0) => Ok(()),
                other => bail!("archive extractor failed: {other:?}"),
            }
        }
        nix::unistd::ForkResult::Child => {
            drop(write_fd);
            let extract = || -> Result<()> {
                let plan = FilesystemPlan {
                    target,
                    root_fs,
                    volumes: Vec::new(),
                    special_fs: false,
                    running_as_root: true,
                    resolv_conf: String::new(),
                    hosts: String::new(),
                    hostname: String::new(),
                };
                plan.check_root_dir()?;
                plan.build()?;

                let reader = std::fs::File::from(read_fd);
                let mut archive = tar::Archive::new(reader);
                let dest = Path::new(dest_dir);
                std::fs::create_dir_all(dest).ok();
                for entry in archive.entries()? {
                    entry?.unpack_in(dest)?;
                }
                Ok(())
            };
            let code = match extract() {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("shoebox: archive extraction failed: {e:#}");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

/// ADD: classify each source — URL (download), archive (extract), or plain
/// file (copy) — per §4.7. Returns `Skipped` for sources the build can't
/// currently service (network fetch failure) instead of using an exception
/// as flow control.
pub fn add_files(
    target: &Path,
    root_fs: RootFs,
    src_dir: &Path,
    sources: &[String],
    dest_dir: &str,
) -> Result<Executed> {
    let mut plain_members = Vec::new();
    for source in sources {
        if is_url(source) {
            let response = match reqwest::blocking::get(source) {
                Ok(r) => r,
                Err(e) => return Ok(Executed::Skipped(format!("failed to fetch {source}: {e}"))),
            };
            let bytes = response.bytes().context("failed to read URL body")?;
            let file_name = source.rsplit('/').next().unwrap_or("downloaded");
            let staged = src_dir.join(file_name);
            std::fs::write(&staged, &bytes).context("failed to stage downloaded file")?;
            if is_archive(file_name) {
                extract_archive(target, root_fs_clone(&root_fs), &staged, dest_dir)?;
            } else {
                plain_members.push(PathBuf::from(file_name));
            }
        } else if is_archive(source) {
            extract_archive(target, root_fs_clone(&root_fs), &src_dir.join(source), dest_dir)?;
        } else {
            plain_members.push(PathBuf::from(source));
        }
    }

    if !plain_members.is_empty() {
        copy_files(target, root_fs, src_dir, &plain_members, dest_dir)?;
    }
    Ok(Executed::Ran)
}

fn root_fs_clone(root_fs: &RootFs) -> RootFs {
    match root_fs {
        RootFs::Plain => RootFs::Plain,
        RootFs::Overlay { lower, upper } => RootFs::Overlay {
            lower: lower.clone(),
            upper: upper.clone(),
        },
    }
}

/// Throwaway-namespace recursive removal of a layer directory, matching
/// `rm_layer`: enters a namespace rooted at the layer and `rm -rf /` inside
/// it, so deletion happens with the layer's own (possibly root-mapped)
/// ownership rather than the caller's.
pub fn rm_layer(layer_dir: &Path) -> Result<()> {
    let bundle = NamespaceBundle {
        target: layer_dir.to_path_buf(),
        root_fs: RootFs::Plain,
        volumes: Vec::new(),
        special_fs: false,
        target_uid: Some(0),
        target_gid: Some(0),
        hostname: None,
        self_ip: None,
        links: Vec::new(),
        private_network: None,
    };
    namespace::run(bundle, || {
        remove_tree_contents(Path::new("/"))
    })
}

fn remove_tree_contents(root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path).ok();
        } else {
            std::fs::remove_file(&path).ok();
        }
    }
    Ok(())
}

/// Rebuild an environment map suitable for `execvpe`, matching the ordering
/// callers expect after `ENV` accumulation (insertion order is irrelevant —
/// `execvpe` doesn't care — but this keeps a stable, testable shape).
pub fn environ_vec(environ: &BTreeMap<String, String>) -> Vec<String> {
    environ.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("shoebox-exec-test-{}-{name}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn lookup_passwd_id_finds_matching_user() {
        let path = write_temp("passwd", "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000:app:/home/app:/bin/sh\n");
        let (uid, gid) = lookup_passwd_id(&path, "app").unwrap();
        assert_eq!((uid, gid), (1000, 1000));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn lookup_passwd_id_missing_user_errors() {
        let path = write_temp("passwd2", "root:x:0:0:root:/root:/bin/sh\n");
        assert!(lookup_passwd_id(&path, "nobody").is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn lookup_groups_collects_membership() {
        let path = write_temp("group", "docker:x:999:app,other\nstaff:x:50:app\nwheel:x:10:\n");
        let groups = lookup_groups(&path, "app").unwrap();
        assert_eq!(groups, vec![50, 999]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn is_archive_matches_known_extensions() {
        assert!(is_archive("layer.tar.gz"));
        assert!(is_archive("layer.tbz"));
        assert!(!is_archive("file.txt"));
    }

    #[test]
    fn is_url_matches_http_and_https() {
        assert!(is_url("https://example.com/f"));
        assert!(is_url("http://example.com/f"));
        assert!(!is_url("/local/path"));
    }
}
