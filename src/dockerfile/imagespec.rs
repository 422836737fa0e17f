use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A single exposed port, always normalized to lowercase protocol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// A deferred build step captured by the Dockerfile evaluator (§4.6) and later
/// carried out by the build-step executor (§4.7). The evaluator only
/// accumulates these; it never runs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStep {
    Run(Vec<String>),
    Copy { sources: Vec<String>, dest: String },
    Add { sources: Vec<String>, dest: String },
}

/// A single ONBUILD trigger, captured verbatim and re-evaluated against the
/// inheriting image's spec when that image's FROM directive resolves here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnBuildTrigger(pub String);

/// The evaluated contents of a Dockerfile, or an image's inherited config.
///
/// Exposed ports are stored as a `BTreeSet` rather than a `HashSet` so that
/// serialization order is a type-level guarantee (SPEC_FULL.md §9's decision
/// on EXPOSE ordering) rather than a sort performed only at the moment of
/// writing `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Set once a FROM directive resolves against a registry; None before
    /// that, or while building from scratch.
    pub base_image_id: Option<String>,
    pub base_image_ref: Option<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub user: String,
    pub workdir: String,
    pub exposed_ports: BTreeSet<ExposedPort>,
    pub volumes: BTreeSet<String>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub run_commands: Vec<BuildStep>,
    pub onbuild: Vec<OnBuildTrigger>,
    pub hostname: Option<String>,
    pub maintainer: Option<String>,
}

impl Default for ImageSpec {
    /// The image spec a Dockerfile starts evaluation from: root user, `/`
    /// workdir, and the standard `PATH` default from SPEC_FULL.md §6.
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        );
        ImageSpec {
            base_image_id: None,
            base_image_ref: None,
            env,
            user: "root".to_string(),
            workdir: "/".to_string(),
            exposed_ports: BTreeSet::new(),
            volumes: BTreeSet::new(),
            entrypoint: None,
            command: None,
            run_commands: Vec::new(),
            onbuild: Vec::new(),
            hostname: None,
            maintainer: None,
        }
    }
}

/// The execution context a build step or `run` command is evaluated in:
/// resolved user, working directory, and environment — distinct from
/// `ImageSpec` because a `run` invocation may override user/workdir without
/// mutating the persisted image config (SPEC_FULL.md §9's "reflection-like
/// `._replace`" note: this is the explicit copy-with value the note asks for).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecContext {
    pub user: String,
    pub workdir: String,
    pub environ: BTreeMap<String, String>,
}

impl ExecContext {
    pub fn from_spec(spec: &ImageSpec) -> Self {
        ExecContext {
            user: spec.user.clone(),
            workdir: spec.workdir.clone(),
            environ: spec.env.clone(),
        }
    }

    pub fn with_user(mut self, user: String) -> Self {
        self.user = user;
        self
    }

    pub fn with_workdir(mut self, workdir: String) -> Self {
        self.workdir = workdir;
        self
    }
}
