//! Container store (SPEC_FULL.md §4.9): per-container directory layout,
//! metadata persistence, tag symlinks, pidfile, ip file, volume mangling.

pub mod metadata;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rand::RngCore;

use crate::config::Config;
use crate::dockerfile::{ExposedPort, ImageSpec};
use metadata::DockerMetadata;

/// True iff `s` is a valid 64-character lowercase-hex container id.
pub fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// A tag is any name beside a container directory that is not itself a valid
/// id — the two predicates are disjoint by construction (Testable Property 3).
pub fn is_tag(s: &str) -> bool {
    !is_container_id(s)
}

/// Generate a fresh 64-hex-char container id (32 random bytes, hex-encoded).
pub fn generate_container_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Strip leading `/`, double any `_`, replace `/` with `_` — the bijection
/// Testable Property 4 requires.
pub fn mangle_volume_name(path: &str) -> String {
    let stripped = path.strip_prefix('/').unwrap_or(path);
    let doubled = stripped.replace('_', "__");
    doubled.replace('/', "_")
}

/// Inverse of `mangle_volume_name`.
pub fn unmangle_volume_name(mangled: &str) -> String {
    let mut out = String::with_capacity(mangled.len() + 1);
    out.push('/');
    let mut chars = mangled.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '_' {
            if chars.peek() == Some(&'_') {
                chars.next();
                out.push('_');
            } else {
                out.push('/');
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Filesystem layout for a single container, matching §4.9 exactly.
#[derive(Debug, Clone)]
pub struct Container {
    pub container_id: String,
    pub container_dir: PathBuf,
}

impl Container {
    pub fn new(config: &Config, container_id: impl Into<String>) -> Self {
        let container_id = container_id.into();
        let container_dir = config.container_dir(&container_id);
        Container { container_id, container_dir }
    }

    pub fn base_dir(&self) -> PathBuf {
        self.container_dir.join("base")
    }
    pub fn delta_dir(&self) -> PathBuf {
        self.container_dir.join("delta")
    }
    pub fn root_dir(&self) -> PathBuf {
        self.container_dir.join("root")
    }
    pub fn volumes_dir(&self) -> PathBuf {
        self.container_dir.join("volumes")
    }
    pub fn metadata_file(&self) -> PathBuf {
        self.container_dir.join("metadata.json")
    }
    pub fn pidfile(&self) -> PathBuf {
        self.container_dir.join("pid")
    }
    pub fn ip_address_file(&self) -> PathBuf {
        self.container_dir.join("ip_address")
    }

    pub fn create_directories(&self) -> Result<()> {
        for dir in [self.base_dir(), self.delta_dir(), self.root_dir(), self.volumes_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn save_metadata(&self, metadata: &DockerMetadata) -> Result<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(self.metadata_file(), json)
            .with_context(|| format!("failed to write {}", self.metadata_file().display()))
    }

    pub fn load_metadata(&self) -> Result<DockerMetadata> {
        let text = std::fs::read_to_string(self.metadata_file())
            .with_context(|| format!("failed to read {}", self.metadata_file().display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn load_image_spec(&self) -> Result<ImageSpec> {
        Ok(metadata::from_docker_metadata(&self.load_metadata()?))
    }

    pub fn write_pidfile(&self, pid: u32) -> Result<()> {
        std::fs::write(self.pidfile(), pid.to_string())?;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.pidfile())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_ip_address(&self, ip: &str) -> Result<()> {
        std::fs::write(self.ip_address_file(), ip)?;
        Ok(())
    }

    pub fn ip_address(&self) -> Option<String> {
        std::fs::read_to_string(self.ip_address_file())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Remove the runtime pid/ip files left behind after `run`.
    pub fn cleanup_runtime_files(&self) -> Result<()> {
        for file in [self.pidfile(), self.ip_address_file()] {
            if file.exists() {
                std::fs::remove_file(&file)?;
            }
        }
        Ok(())
    }

    /// Volume host-directory paths keyed by their container-side absolute
    /// path, resolving mangled directory names back to their real paths.
    pub fn volumes(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut volumes = BTreeMap::new();
        let dir = self.volumes_dir();
        if !dir.exists() {
            return Ok(volumes);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            volumes.insert(unmangle_volume_name(&name), entry.path());
        }
        Ok(volumes)
    }

    pub fn ensure_volume(&self, container_path: &str) -> Result<PathBuf> {
        let mangled = mangle_volume_name(container_path);
        let host_path = self.volumes_dir().join(mangled);
        std::fs::create_dir_all(&host_path)?;
        Ok(host_path)
    }

    /// All tag names in the store that currently point at this container.
    pub fn tags(&self, config: &Config) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for entry in std::fs::read_dir(config.containers_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_tag(&name) && entry.path().is_symlink() {
                if let Ok(target) = std::fs::read_link(entry.path()) {
                    if target.file_name().and_then(|f| f.to_str()) == Some(self.container_id.as_str())
                    {
                        tags.push(name);
                    }
                }
            }
        }
        Ok(tags)
    }
}

/// Create (or replace) a tag symlink. Matches Testable Scenario S6: a tag may
/// not itself be a valid container id, and an existing tag is only replaced
/// with `force`.
pub fn tag_container(config: &Config, container_id: &str, tag: &str, force: bool) -> Result<()> {
    if !is_container_id(container_id) {
        bail!("not a valid container id: {container_id}");
    }
    if is_container_id(tag) {
        bail!("tag cannot be a valid container id");
    }
    if !config.container_dir(container_id).exists() {
        bail!("no such container: {container_id}");
    }

    let tag_path = config.containers_dir().join(tag);
    if tag_path.exists() || tag_path.is_symlink() {
        if !force {
            bail!("tag already exists: {tag} (use --force to overwrite)");
        }
        std::fs::remove_file(&tag_path)?;
    }
    std::os::unix::fs::symlink(container_id, &tag_path)?;
    Ok(())
}

pub fn untag(config: &Config, tag: &str) -> Result<()> {
    if is_container_id(tag) {
        bail!("not a tag: {tag}");
    }
    let tag_path = config.containers_dir().join(tag);
    if tag_path.is_symlink() {
        std::fs::remove_file(&tag_path)?;
    }
    Ok(())
}

/// Resolve a container id or tag name to the backing container id.
pub fn resolve_container_id(config: &Config, id_or_tag: &str) -> Result<String> {
    if is_container_id(id_or_tag) {
        return Ok(id_or_tag.to_string());
    }
    let tag_path = config.containers_dir().join(id_or_tag);
    let target = std::fs::read_link(&tag_path)
        .with_context(|| format!("no such container or tag: {id_or_tag}"))?;
    Ok(target
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default()
        .to_string())
}

/// A unidirectional reference from a running container to a linked
/// container's exposed ports (§3). Materializes only as environment
/// variables at link-construction time; no graph edges are persisted on disk
/// (SPEC_FULL.md §9's note on cyclic container<->link references).
#[derive(Debug, Clone)]
pub struct ContainerLink {
    pub alias: String,
    pub container_id: String,
    pub ip_address: String,
    pub exposed_ports: Vec<ExposedPort>,
}

impl ContainerLink {
    /// Build the link-induced environment variables for this link, matching
    /// SPEC_FULL.md §6 exactly (Testable Scenario S4).
    pub fn environ(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let alias = self.alias.to_ascii_uppercase();
        env.insert(format!("{alias}_NAME"), self.container_id.clone());

        let mut ports = self.exposed_ports.clone();
        ports.sort();
        if let Some(lowest) = ports.first() {
            env.insert(
                format!("{alias}_PORT"),
                format!("{}://{}:{}", lowest.protocol, self.ip_address, lowest.port),
            );
        }
        for port in &ports {
            let proto_upper = port.protocol.to_string().to_ascii_uppercase();
            let prefix = format!("{alias}_PORT_{}_{proto_upper}", port.port);
            env.insert(
                prefix.clone(),
                format!("{}://{}:{}", port.protocol, self.ip_address, port.port),
            );
            env.insert(format!("{prefix}_PROTO"), proto_upper.clone());
            env.insert(format!("{prefix}_PORT"), port.port.to_string());
            env.insert(format!("{prefix}_ADDR"), self.ip_address.clone());
        }
        env
    }
}

/// Enumerate container directories (ids only) and their tags, for `ls`.
pub fn list_containers(config: &Config) -> Result<Vec<(String, Vec<String>)>> {
    let dir = config.containers_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_container_id(&name) && entry.path().is_dir() {
            ids.push(name);
        }
    }
    ids.sort();
    let mut result = Vec::with_capacity(ids.len());
    for id in ids {
        let container = Container::new(config, id.clone());
        result.push((id, container.tags(config)?));
    }
    Ok(result)
}

/// Remove a container's directories. The caller is responsible for routing
/// the actual removal through a throwaway user namespace (§3's lifecycle
/// note) so that sub-uid-owned files can be unlinked — see
/// `sandbox::exec::rm_layer`.
pub fn remove_container_metadata(config: &Config, container_id: &str) -> Result<()> {
    let container = Container::new(config, container_id);
    if container.metadata_file().exists() {
        std::fs::remove_file(container.metadata_file())?;
    }
    container.cleanup_runtime_files()?;
    Ok(())
}

/// Resolve a mounted root directory for a build-stage (non-runnable)
/// container: always the container's `root/` directory, with `base/`/`delta/`
/// as the overlay pair — SPEC_FULL.md §9's decision on the
/// overlay-vs-build-namespace precedence open question.
pub fn build_mount_target(container: &Container) -> PathBuf {
    container.root_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_and_tag_predicates_are_disjoint() {
        let id = "a".repeat(64);
        assert!(is_container_id(&id));
        assert!(!is_tag(&id));
        assert!(is_tag("mytag"));
        assert!(!is_container_id("mytag"));
    }

    #[test]
    fn volume_mangling_is_a_bijection() {
        let cases = ["/data", "/var/lib/my_app", "/a/b/c_d__e", "/"];
        for case in cases {
            let mangled = mangle_volume_name(case);
            let back = unmangle_volume_name(&mangled);
            assert_eq!(back, if case == "/" { "/".to_string() } else { case.to_string() });
        }
    }

    #[test]
    fn link_environ_matches_s4() {
        let link = ContainerLink {
            alias: "database".to_string(),
            container_id: "a".repeat(64),
            ip_address: "10.0.0.5".to_string(),
            exposed_ports: vec![ExposedPort { port: 5432, protocol: crate::dockerfile::Protocol::Tcp }],
        };
        let env = link.environ();
        assert_eq!(env.get("DATABASE_PORT").unwrap(), "tcp://10.0.0.5:5432");
        assert_eq!(env.get("DATABASE_PORT_5432_TCP_ADDR").unwrap(), "10.0.0.5");
        assert_eq!(env.get("DATABASE_NAME").unwrap(), &"a".repeat(64));
    }

    #[test]
    fn generated_ids_are_well_formed() {
        let id = generate_container_id();
        assert!(is_container_id(&id));
    }
}
