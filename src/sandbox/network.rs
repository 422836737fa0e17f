//! Private networking (SPEC_FULL.md §4.4, §14): veth-into-bridge setup and
//! address assignment via `rtnetlink` + `netlink-packet-route` rather than
//! shelling out to `ip`.

use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use futures_util::stream::TryStreamExt;
use ipnetwork::Ipv4Network;
use nix::unistd::Pid;
use tracing::{debug, info};

/// Bridge config resolved for a session: either `Auto` (detect from
/// `/etc/lxc/lxc-usernet`), `None` (no private networking), or `Named` (use
/// this bridge directly). Mirrors `config::BridgeConfig`.
#[derive(Debug, Clone)]
pub enum Bridge {
    None,
    Named { name: String, dev_type: String },
}

/// Parse `/etc/lxc/lxc-usernet` for the calling user's allowed bridge: lines
/// are `user dev_type bridge count`, first match for `username` wins.
pub fn detect_bridge(username: &str) -> Result<Option<(String, String)>> {
    let content = match std::fs::read_to_string("/etc/lxc/lxc-usernet") {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("failed to read /etc/lxc/lxc-usernet"),
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            continue;
        }
        if fields[0] != username {
            continue;
        }
        return Ok(Some((fields[2].to_string(), fields[1].to_string())));
    }
    Ok(None)
}

pub struct GatewaySettings {
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
}

/// A container's private network: a bridge, an optional static address, and
/// the gateway/prefix discovered from the bridge's own address.
pub struct PrivateNetwork {
    pub bridge: String,
    pub dev_type: String,
    pub ip_address: Option<Ipv4Addr>,
    pub gateway: Option<GatewaySettings>,
}

impl PrivateNetwork {
    /// Resolve `bridge` (already detected if `Auto`) and look up the
    /// gateway/prefix for it. Requires a running tokio runtime; callers use
    /// the dedicated network-setup runtime per SPEC_FULL.md §14.
    pub async fn new(bridge: String, dev_type: String, ip_address: Option<Ipv4Addr>) -> Result<Self> {
        let gateway = Self::gateway_settings(&bridge).await?;
        Ok(PrivateNetwork {
            bridge,
            dev_type,
            ip_address,
            gateway,
        })
    }

    async fn gateway_settings(bridge: &str) -> Result<Option<GatewaySettings>> {
        let (connection, handle, _) = rtnetlink::new_connection().context("failed to open netlink socket")?;
        tokio::spawn(connection);

        let mut links = handle.link().get().match_name(bridge.to_string()).execute();
        let link = links
            .try_next()
            .await
            .context("failed to query bridge link")?
            .with_context(|| format!("no such bridge: {bridge}"))?;
        let bridge_index = link.header.index;

        let mut addrs = handle.address().get().set_link_index_filter(bridge_index).execute();
        while let Some(addr) = addrs.try_next().await.context("failed to query bridge address")? {
            use netlink_packet_route::address::AddressAttribute;
            for attr in &addr.attributes {
                if let AddressAttribute::Address(std::net::IpAddr::V4(a)) = attr {
                    return Ok(Some(GatewaySettings {
                        gateway: *a,
                        prefix_len: addr.header.prefix_len,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Invoke the `lxc-user-nic` suid helper to plug a veth pair into
    /// `self.bridge` and move one end into `pid`'s network namespace.
    pub fn init_net_interface(&self, pid: Pid) -> Result<()> {
        let output = std::process::Command::new("lxc-user-nic")
            .arg(pid.as_raw().to_string())
            .arg(&self.dev_type)
            .arg(&self.bridge)
            .output()
            .context("failed to run lxc-user-nic")?;
        if !output.status.success() {
            bail!(
                "lxc-user-nic failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Bring `lo` and `eth0` up inside the target namespace and assign the
    /// static address/default route, matching `set_ip_address`. Must run
    /// inside the container's network namespace (after `setns`).
    pub async fn set_ip_address(&self) -> Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection().context("failed to open netlink socket")?;
        tokio::spawn(connection);

        set_link_up(&handle, "lo").await?;
        set_link_up(&handle, "eth0").await?;

        if let Some(ip) = self.ip_address {
            let prefix_len = self.gateway.as_ref().map(|g| g.prefix_len).unwrap_or(24);
            let eth0_index = link_index(&handle, "eth0").await?;
            handle
                .address()
                .add(eth0_index, std::net::IpAddr::V4(ip), prefix_len)
                .execute()
                .await
                .context("failed to assign address to eth0")?;
            info!(%ip, prefix_len, "assigned container address");

            if let Some(gateway) = &self.gateway {
                handle
                    .route()
                    .add()
                    .v4()
                    .gateway(gateway.gateway)
                    .execute()
                    .await
                    .context("failed to add default route")?;
                debug!(gateway = %gateway.gateway, "default route installed");
            }
        }
        Ok(())
    }
}

async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let link = links
        .try_next()
        .await
        .context("failed to query link")?
        .with_context(|| format!("no such link: {name}"))?;
    Ok(link.header.index)
}

async fn set_link_up(handle: &rtnetlink::Handle, name: &str) -> Result<()> {
    let index = link_index(handle, name).await?;
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .with_context(|| format!("failed to bring up {name}"))
}

/// Parse a `prefix/len` string into a network, used for validating an
/// explicitly supplied `--ip` flag against the bridge's subnet.
pub fn parse_cidr(s: &str) -> Result<Ipv4Network> {
    Ipv4Network::from_str(s).with_context(|| format!("invalid CIDR: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_bridge_skips_comments_and_matches_user() {
        let dir = std::env::temp_dir().join(format!("shoebox-lxc-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lxc-usernet");
        std::fs::write(
            &path,
            "# comment\n\nbob veth lxcbr1 10\nalice veth lxcbr0 10\n",
        )
        .unwrap();

        // detect_bridge() reads a fixed path, so exercise the line-parsing
        // logic directly against the same format instead.
        let content = std::fs::read_to_string(&path).unwrap();
        let mut found = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() == 4 && fields[0] == "alice" {
                found = Some((fields[2].to_string(), fields[1].to_string()));
                break;
            }
        }
        assert_eq!(found, Some(("lxcbr0".to_string(), "veth".to_string())));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn parse_cidr_rejects_garbage() {
        assert!(parse_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn parse_cidr_accepts_standard_prefix() {
        let net = parse_cidr("10.0.3.0/24").unwrap();
        assert_eq!(net.prefix(), 24);
    }
}
