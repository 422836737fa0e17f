//! Capability dropping (SPEC_FULL.md §4.5), built on the `caps` crate.

use anyhow::{Context, Result};
use caps::{CapSet, Capability};
use tracing::debug;

/// Capabilities kept after drop. Order is insignificant; kept as a fixed list
/// rather than a computed one so the whitelist is visible at a glance.
pub const DEFAULT_CAPS: &[Capability] = &[
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_KILL,
    Capability::CAP_SETUID,
    Capability::CAP_SETGID,
    Capability::CAP_SETPCAP,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_NET_RAW,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_MKNOD,
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_SETFCAP,
];

/// Highest capability number the running kernel knows about, read from
/// `/proc/sys/kernel/cap_last_cap`, falling back to `CAP_BLOCK_SUSPEND` (36)
/// if unreadable.
fn cap_last_cap() -> u8 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(36)
}

/// Drop every bounding-set capability outside `keep`, then clear and rebuild
/// the effective/permitted/inheritable sets to exactly `keep`.
pub fn drop_caps(keep: &[Capability]) -> Result<()> {
    let keep_set: std::collections::HashSet<Capability> = keep.iter().copied().collect();
    let last = cap_last_cap();

    for cap in caps::all() {
        if (cap as u8) > last {
            continue;
        }
        if !keep_set.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap)
                .with_context(|| format!("failed to drop {cap:?} from bounding set"))?;
        }
    }

    let mut target = caps::CapsHashSet::new();
    target.extend(keep.iter().copied());

    caps::set(None, CapSet::Inheritable, &target).context("failed to set inheritable caps")?;
    caps::set(None, CapSet::Effective, &target).context("failed to set effective caps")?;
    caps::set(None, CapSet::Permitted, &target).context("failed to set permitted caps")?;

    debug!(kept = keep.len(), "capabilities dropped");
    Ok(())
}

/// Drop to the default whitelist.
pub fn drop_default_caps() -> Result<()> {
    drop_caps(DEFAULT_CAPS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_caps_excludes_sys_admin_and_net_admin() {
        assert!(!DEFAULT_CAPS.contains(&Capability::CAP_SYS_ADMIN));
        assert!(!DEFAULT_CAPS.contains(&Capability::CAP_NET_ADMIN));
    }

    #[test]
    fn default_caps_retains_chroot_and_setuid_setgid() {
        assert!(DEFAULT_CAPS.contains(&Capability::CAP_SYS_CHROOT));
        assert!(DEFAULT_CAPS.contains(&Capability::CAP_SETUID));
        assert!(DEFAULT_CAPS.contains(&Capability::CAP_SETGID));
    }
}
