//! Namespace Orchestrator (SPEC_FULL.md §4.1), built on `nix::sched`.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, ForkResult, Gid, Pid};
use tracing::{debug, error, info, warn};

use crate::error::ShoeboxError;
use crate::sandbox::capabilities::drop_default_caps;
use crate::sandbox::idmap::{self, Helper};
use crate::sandbox::mount::{FilesystemPlan, RootFs, VolumeMount};
use crate::sandbox::network::PrivateNetwork;

/// Everything the orchestrator needs to build one container's namespace
/// bundle, gathered ahead of the fork so the child never has to ask the
/// parent for anything after `unshare`.
pub struct NamespaceBundle {
    pub target: PathBuf,
    pub root_fs: RootFs,
    pub volumes: Vec<VolumeMount>,
    pub special_fs: bool,
    pub target_uid: Option<u32>,
    pub target_gid: Option<u32>,
    pub hostname: Option<String>,
    pub self_ip: Option<Ipv4Addr>,
    pub links: Vec<(Ipv4Addr, Vec<String>)>,
    pub private_network: Option<PrivateNetwork>,
}

fn namespace_flags(has_private_net: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID;
    if has_private_net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    flags
}

/// §4.1 step 4: spawn the id-map helper ahead of `unshare` when no explicit
/// target ids were supplied (no helper round trip needed otherwise).
fn spawn_idmap_helper(target_uid: Option<u32>, target_gid: Option<u32>) -> Option<Helper> {
    if target_uid.is_some() || target_gid.is_some() {
        return None;
    }
    let pid = Pid::this();
    Helper::spawn(move || idmap::setup_uid_map(pid)).ok()
}

/// Run `payload` inside a freshly built namespace per the §4.1 algorithm.
/// Forks once for the outer isolation boundary; `payload` runs in the child
/// after namespace and filesystem setup complete.
pub fn run(bundle: NamespaceBundle, payload: impl FnOnce() -> Result<()>) -> Result<()> {
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => wait_and_propagate(child),
        ForkResult::Child => {
            let code = match build_and_exec(bundle, payload) {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "namespace setup or payload failed");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn wait_and_propagate(child: Pid) -> Result<()> {
    match nix::sys::wait::waitpid(child, None)? {
        WaitStatus::Exited(_, 0) => Ok(()),
        WaitStatus::Exited(_, code) => Err(ShoeboxError::ChildExited(code).into()),
        WaitStatus::Signaled(_, sig, _) => Err(ShoeboxError::ChildSignaled(sig as i32).into()),
        other => Err(anyhow::anyhow!("unexpected wait status: {other:?}")),
    }
}

fn build_and_exec(bundle: NamespaceBundle, payload: impl FnOnce() -> Result<()>) -> Result<()> {
    let resolv_conf_before_unshare = std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default();

    let plan = FilesystemPlan {
        target: &bundle.target,
        root_fs: match &bundle.root_fs {
            RootFs::Plain => RootFs::Plain,
            RootFs::Overlay { lower, upper } => RootFs::Overlay {
                lower: lower.clone(),
                upper: upper.clone(),
            },
        },
        volumes: Vec::new(),
        special_fs: bundle.special_fs,
        running_as_root: bundle.target_uid.unwrap_or(0) == 0,
        resolv_conf: String::new(),
        hosts: crate::sandbox::mount::generate_hosts(
            bundle.self_ip,
            bundle.hostname.as_deref(),
            &bundle.links,
        ),
        hostname: bundle.hostname.clone().unwrap_or_default(),
    };
    plan.check_root_dir()?;

    create_userns_and_mountns(bundle.target_uid, bundle.target_gid, bundle.private_network.as_ref())?;

    if let Some(net) = &bundle.private_network {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build network-setup runtime")?;
        runtime.block_on(net.set_ip_address())?;
    }

    if let Some(hostname) = &bundle.hostname {
        nix::unistd::sethostname(hostname).context("sethostname failed")?;
    }

    let gateway = bundle
        .private_network
        .as_ref()
        .and_then(|n| n.gateway.as_ref().map(|g| g.gateway));
    let resolv_conf = crate::sandbox::mount::generate_resolv_conf(&resolv_conf_before_unshare, gateway);

    let plan = FilesystemPlan {
        target: &bundle.target,
        root_fs: match &bundle.root_fs {
            RootFs::Plain => RootFs::Plain,
            RootFs::Overlay { lower, upper } => RootFs::Overlay {
                lower: lower.clone(),
                upper: upper.clone(),
            },
        },
        volumes: bundle.volumes,
        special_fs: plan.special_fs,
        running_as_root: plan.running_as_root,
        resolv_conf,
        hosts: plan.hosts,
        hostname: plan.hostname,
    };
    plan.build()
        .map_err(|e| anyhow::anyhow!(ShoeboxError::Unsupported(e.to_string())))?;

    drop_default_caps()?;
    nix::unistd::setgroups(&[Gid::from_raw(nix::unistd::getgid().as_raw())])
        .context("setgroups failed")?;

    payload()
}

/// §4.1 step 4: user/mount/ipc/uts/pid(/net) unshare with the id-map
/// choreography from §4.3, and the network helper choreography from §4.4
/// when private networking is requested.
fn create_userns_and_mountns(
    target_uid: Option<u32>,
    target_gid: Option<u32>,
    private_net: Option<&PrivateNetwork>,
) -> Result<()> {
    let idmap_helper = spawn_idmap_helper(target_uid, target_gid);
    let flags = namespace_flags(private_net.is_some());

    let my_pid = Pid::this();
    let net_helper = match private_net {
        Some(net) => Some(Helper::spawn({
            let bridge = net.bridge.clone();
            let dev_type = net.dev_type.clone();
            move || {
                let net = PrivateNetwork {
                    bridge,
                    dev_type,
                    ip_address: None,
                    gateway: None,
                };
                net.init_net_interface(my_pid)
            }
        })?),
        None => None,
    };

    unshare(flags).context("unshare failed")?;

    if let Some(helper) = idmap_helper {
        let handle = helper.release();
        if !handle.wait()? {
            warn!("id-map helper failed, falling back to single-id map");
            idmap::single_id_map(
                Pid::this(),
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            )?;
        }
    } else if let (Some(uid), Some(gid)) = (target_uid, target_gid) {
        idmap::write_explicit_target_map(Pid::this(), uid, gid)?;
    }

    if let Some(handle) = net_helper {
        let handle = handle.release();
        handle.wait()?;
    }

    Ok(())
}

/// Fork once more so that `/proc/self` inside the namespace refers to the
/// in-namespace init process (PID 1), per the tie-break in SPEC_FULL.md
/// §4.1. Used by the build-step executor before mounting `/proc`.
pub fn refork_for_pid_namespace(body: impl FnOnce() -> Result<()>) -> Result<()> {
    match unsafe { fork() }.context("refork for pid namespace failed")? {
        ForkResult::Parent { child } => wait_and_propagate(child),
        ForkResult::Child => {
            let code = match body() {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "pid-1 body failed");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

/// Enter an already-running container's namespaces via `/proc/<pid>/ns/*`
/// for interactive exec/attach.
pub fn nsenter(target_pid: Pid) -> Result<()> {
    use nix::sched::setns;
    use std::fs::File;

    for ns in ["user", "mnt", "uts", "ipc", "net", "pid"] {
        let path = format!("/proc/{target_pid}/ns/{ns}");
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => {
                debug!(ns, "namespace file unavailable, skipping");
                continue;
            }
        };
        setns(file, CloneFlags::empty())
            .with_context(|| format!("setns({ns}) failed"))?;
    }
    info!(pid = target_pid.as_raw(), "entered namespaces");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_flags_excludes_net_without_private_network() {
        let flags = namespace_flags(false);
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn namespace_flags_includes_net_with_private_network() {
        let flags = namespace_flags(true);
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
    }
}
