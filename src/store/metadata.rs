//! Docker v1 config JSON schema (SPEC_FULL.md §6) and its conversion to/from
//! the in-memory `ImageSpec` (§3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dockerfile::{ExposedPort, ImageSpec, OnBuildTrigger};

/// The `container_config`/`config` inner object of the Docker v1 schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerConfig {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub volumes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub on_build: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub port_specs: Option<Vec<String>>,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub memory_swap: i64,
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
    #[serde(default)]
    pub stdin_once: bool,
    #[serde(default)]
    pub network_disabled: bool,
    #[serde(default)]
    pub security_opt: Option<Vec<String>>,
    #[serde(default)]
    pub domainname: String,
}

/// The full wire shape stored at `{root}/containers/{id}/metadata.json` and at
/// `{root}/images/{id}.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerMetadata {
    pub id: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub container_config: DockerConfig,
    #[serde(default)]
    pub config: DockerConfig,
    #[serde(default)]
    pub size: u64,
}

fn port_key(port: ExposedPort) -> String {
    format!("{}/{}", port.port, port.protocol)
}

impl From<&ImageSpec> for DockerConfig {
    fn from(spec: &ImageSpec) -> Self {
        DockerConfig {
            env: spec
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            hostname: spec.hostname.clone(),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.command.clone(),
            working_dir: spec.workdir.clone(),
            user: spec.user.clone(),
            // BTreeMap iteration over ExposedPort is already port/protocol
            // ordered, so the emitted key order is deterministic per
            // SPEC_FULL.md §9's decision on EXPOSE ordering.
            exposed_ports: spec
                .exposed_ports
                .iter()
                .map(|p| (port_key(*p), serde_json::json!({})))
                .collect(),
            volumes: spec
                .volumes
                .iter()
                .map(|v| (v.clone(), serde_json::json!({})))
                .collect(),
            on_build: spec.onbuild.iter().map(|t| t.0.clone()).collect(),
            image: spec.base_image_id.clone(),
            ..Default::default()
        }
    }
}

impl DockerConfig {
    fn into_image_spec_fields(self, spec: &mut ImageSpec) {
        spec.env = self
            .env
            .into_iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();
        spec.hostname = self.hostname;
        spec.entrypoint = self.entrypoint;
        spec.command = self.cmd;
        spec.workdir = self.working_dir;
        spec.user = self.user;
        spec.exposed_ports = self
            .exposed_ports
            .keys()
            .filter_map(|k| {
                let (port, proto) = k.split_once('/')?;
                Some(ExposedPort {
                    port: port.parse().ok()?,
                    protocol: proto.parse().ok()?,
                })
            })
            .collect();
        spec.volumes = self.volumes.into_keys().collect();
        spec.onbuild = self.on_build.into_iter().map(OnBuildTrigger).collect();
        spec.base_image_id = self.image;
    }
}

/// Build the persisted metadata document for a freshly built container.
pub fn to_docker_metadata(spec: &ImageSpec, container_id: &str, created: &str) -> DockerMetadata {
    let config = DockerConfig::from(spec);
    DockerMetadata {
        id: container_id.to_string(),
        parent: spec.base_image_id.clone(),
        container: Some(container_id.to_string()),
        created: created.to_string(),
        os: "linux".to_string(),
        architecture: "amd64".to_string(),
        docker_version: env!("CARGO_PKG_VERSION").to_string(),
        container_config: config.clone(),
        config,
        size: 0,
    }
}

/// Inverse of `to_docker_metadata`: recover an `ImageSpec` (minus run_commands,
/// which are not persisted — only their effects are) from a stored or
/// downloaded metadata document. `run_commands` is always empty on the
/// returned spec; callers inheriting via FROM clear it explicitly anyway per
/// SPEC_FULL.md §3's invariant.
pub fn from_docker_metadata(metadata: &DockerMetadata) -> ImageSpec {
    let mut spec = ImageSpec::default();
    metadata.config.clone().into_image_spec_fields(&mut spec);
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn roundtrip_preserves_sorted_ports() {
        let mut spec = ImageSpec::default();
        spec.exposed_ports = BTreeSet::from([
            ExposedPort { port: 8080, protocol: crate::dockerfile::Protocol::Tcp },
            ExposedPort { port: 22, protocol: crate::dockerfile::Protocol::Tcp },
        ]);
        let metadata = to_docker_metadata(&spec, &"a".repeat(64), "2026-01-01T00:00:00Z");
        let keys: Vec<&String> = metadata.config.exposed_ports.keys().collect();
        assert_eq!(keys, vec!["22/tcp", "8080/tcp"]);

        let recovered = from_docker_metadata(&metadata);
        assert_eq!(recovered.exposed_ports, spec.exposed_ports);
    }
}
