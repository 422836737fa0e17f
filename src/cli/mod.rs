//! CLI & process entrypoint (SPEC_FULL.md §6, §10).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dockerfile::imagespec::{BuildStep, ExecContext};
use crate::dockerfile::{self, ImageMetadataResolver, ImageSpec};
use crate::error::ShoeboxError;
use crate::registry::ImageRepository;
use crate::sandbox::exec;
use crate::sandbox::mount::RootFs;
use crate::sandbox::namespace::NamespaceBundle;
use crate::store::{self, metadata, Container};

#[derive(Parser, Debug)]
#[command(name = "shoebox", version, about = "Unprivileged, single-host, Docker v1-compatible container runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Root directory for images/containers (default: ~/.shoebox)
    #[arg(long, global = true)]
    pub shoebox_dir: Option<PathBuf>,

    /// Docker registry v1 index URL
    #[arg(long, global = true)]
    pub index_url: Option<String>,

    /// Raise the log level to debug for the whole process
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download an image's layers and metadata from the registry
    Pull {
        image: String,
        #[arg(long, default_value = "latest")]
        tag: String,
        #[arg(long)]
        force: bool,
    },
    /// Build a container from a Dockerfile in BASE_DIR
    Build {
        base_dir: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        target_uid: Option<u32>,
        #[arg(long)]
        target_gid: Option<u32>,
    },
    /// Run a command inside a container
    Run {
        container_id: Option<String>,
        command: Vec<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        entrypoint: Option<String>,
        #[arg(long = "env")]
        env: Vec<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        workdir: Option<String>,
        #[arg(long)]
        bridge: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long = "link")]
        link: Vec<String>,
        #[arg(long)]
        rm: bool,
        #[arg(long)]
        target_uid: Option<u32>,
        #[arg(long)]
        target_gid: Option<u32>,
    },
    /// Remove one or more containers
    Rm {
        container_ids: Vec<String>,
        #[arg(long)]
        volumes: bool,
        #[arg(long)]
        target_uid: Option<u32>,
        #[arg(long)]
        target_gid: Option<u32>,
    },
    /// List containers and their tags
    Ls {
        #[arg(short = 'q', long)]
        quiet: bool,
    },
    /// Show the process tree of every running container
    Ps,
    /// Tag a container
    Tag {
        container: String,
        tag: String,
        #[arg(long)]
        force: bool,
    },
    /// Remove a tag
    Untag { tag: String },
    /// Print an image's Docker v1 metadata
    Metadata {
        image: String,
        #[arg(long, default_value = "latest")]
        tag: String,
    },
    /// Print an image's ancestry (root-first)
    Ancestry {
        image: String,
        #[arg(long, default_value = "latest")]
        tag: String,
    },
}

pub fn init_logging(debug: bool) -> Result<()> {
    let default_directive = if debug { "shoebox=debug" } else { "shoebox=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .init();
    Ok(())
}

pub fn resolve_config(cli: &Cli) -> Result<Config> {
    let config = Config::defaults()?
        .apply_env()
        .apply_cli(cli.shoebox_dir.clone(), cli.index_url.clone(), None);
    config.ensure_dirs()?;
    Ok(config)
}

/// Dispatch a parsed CLI invocation. `run` and `rm` preserve their payload's
/// exit code directly; every other subcommand maps success to 0 and a
/// propagated error to 1, per §6/§10's exit-code contract.
pub fn run(cli: Cli, config: Config) -> i32 {
    let repo = ImageRepository::new(config.index_url.clone(), config.images_dir());

    let result = match cli.command {
        Commands::Pull { image, tag, force } => cmd_pull(&repo, &image, &tag, force).map(|_| 0),
        Commands::Build {
            base_dir,
            force,
            target_uid,
            target_gid,
        } => cmd_build(&config, &repo, &base_dir, force, target_uid, target_gid).map(|_| 0),
        Commands::Run {
            container_id,
            command,
            from,
            entrypoint,
            env,
            user,
            workdir,
            bridge,
            ip,
            link,
            rm,
            target_uid,
            target_gid,
        } => {
            return cmd_run(
                &config,
                &repo,
                container_id,
                command,
                from,
                entrypoint,
                env,
                user,
                workdir,
                bridge,
                ip,
                link,
                rm,
                target_uid,
                target_gid,
            );
        }
        Commands::Rm {
            container_ids,
            volumes,
            target_uid,
            target_gid,
        } => return cmd_rm(&config, &container_ids, volumes, target_uid, target_gid),
        Commands::Ls { quiet } => cmd_ls(&config, quiet).map(|_| 0),
        Commands::Ps => cmd_ps(&config).map(|_| 0),
        Commands::Tag { container, tag, force } => cmd_tag(&config, &container, &tag, force).map(|_| 0),
        Commands::Untag { tag } => cmd_untag(&config, &tag).map(|_| 0),
        Commands::Metadata { image, tag } => cmd_metadata(&repo, &image, &tag).map(|_| 0),
        Commands::Ancestry { image, tag } => cmd_ancestry(&repo, &image, &tag).map(|_| 0),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            1
        }
    }
}

fn cmd_pull(repo: &ImageRepository, image: &str, tag: &str, force: bool) -> Result<()> {
    let ancestry = repo.pull(image, tag, force)?;
    for metadata in &ancestry {
        println!("{}", metadata.id);
    }
    info!(image, tag, layers = ancestry.len(), "pull complete");
    Ok(())
}

fn parse_env_kv(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("invalid --env value (expected K=V): {entry}"))
        })
        .collect()
}

fn cmd_build(
    config: &Config,
    repo: &ImageRepository,
    base_dir: &std::path::Path,
    force: bool,
    target_uid: Option<u32>,
    target_gid: Option<u32>,
) -> Result<()> {
    let dockerfile_path = base_dir.join("Dockerfile");
    let src = std::fs::read_to_string(&dockerfile_path)
        .with_context(|| format!("failed to read {}", dockerfile_path.display()))?;
    let spec = dockerfile::evaluate(&src, Some(repo as &dyn ImageMetadataResolver))?;

    let container_id = store::generate_container_id();
    let container = Container::new(config, &container_id);
    container.create_directories()?;

    if let Some((base_image, base_tag)) = &spec.base_image_ref {
        repo.unpack(&container.base_dir(), base_image, base_tag, force)?;
    }

    execute_build_steps(base_dir, &container, &spec, target_uid, target_gid)?;

    let created = "1970-01-01T00:00:00Z";
    let metadata = metadata::to_docker_metadata(&spec, &container_id, created);
    container.save_metadata(&metadata)?;

    println!("{container_id}");
    Ok(())
}

fn execute_build_steps(
    build_context: &std::path::Path,
    container: &Container,
    spec: &ImageSpec,
    target_uid: Option<u32>,
    target_gid: Option<u32>,
) -> Result<()> {
    let root_fs = RootFs::Overlay {
        lower: container.base_dir(),
        upper: container.delta_dir(),
    };
    let context = ExecContext::from_spec(spec);

    for step in &spec.run_commands {
        match step {
            BuildStep::Run(command) => {
                let bundle = NamespaceBundle {
                    target: store::build_mount_target(container),
                    root_fs: clone_root_fs(&root_fs),
                    volumes: Vec::new(),
                    special_fs: false,
                    target_uid,
                    target_gid,
                    hostname: None,
                    self_ip: None,
                    links: Vec::new(),
                    private_network: None,
                };
                exec::run_command(bundle, &context, command)?;
            }
            BuildStep::Copy { sources, dest } => {
                exec::copy_files(
                    &store::build_mount_target(container),
                    clone_root_fs(&root_fs),
                    build_context,
                    &sources.iter().map(PathBuf::from).collect::<Vec<_>>(),
                    dest,
                )?;
            }
            BuildStep::Add { sources, dest } => {
                exec::add_files(
                    &store::build_mount_target(container),
                    clone_root_fs(&root_fs),
                    build_context,
                    sources,
                    dest,
                )
                .map(|_| ())?;
            }
        }
    }
    Ok(())
}

fn clone_root_fs(root_fs: &RootFs) -> RootFs {
    match root_fs {
        RootFs::Plain => RootFs::Plain,
        RootFs::Overlay { lower, upper } => RootFs::Overlay {
            lower: lower.clone(),
            upper: upper.clone(),
        },
    }
}

fn parse_link(spec: &str) -> Result<(String, String)> {
    spec.split_once(':')
        .map(|(src, alias)| (src.to_string(), alias.to_string()))
        .with_context(|| format!("invalid --link value (expected SRC:ALIAS): {spec}"))
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config: &Config,
    repo: &ImageRepository,
    container_id: Option<String>,
    command: Vec<String>,
    from: Option<String>,
    entrypoint: Option<String>,
    env: Vec<String>,
    user: Option<String>,
    workdir: Option<String>,
    bridge: Option<String>,
    ip: Option<String>,
    link: Vec<String>,
    remove_after: bool,
    target_uid: Option<u32>,
    target_gid: Option<u32>,
) -> i32 {
    match run_inner(
        config,
        repo,
        container_id,
        command,
        from,
        entrypoint,
        env,
        user,
        workdir,
        bridge,
        ip,
        link,
        remove_after,
        target_uid,
        target_gid,
    ) {
        Ok(code) => code,
        Err(e) => {
            if let Some(shoebox_err) = e.downcast_ref::<ShoeboxError>() {
                return shoebox_err.exit_code();
            }
            error!(error = %e, "run failed");
            1
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_inner(
    config: &Config,
    repo: &ImageRepository,
    container_id: Option<String>,
    command: Vec<String>,
    from: Option<String>,
    entrypoint: Option<String>,
    env: Vec<String>,
    user: Option<String>,
    workdir: Option<String>,
    bridge: Option<String>,
    ip: Option<String>,
    link: Vec<String>,
    remove_after: bool,
    target_uid: Option<u32>,
    target_gid: Option<u32>,
) -> Result<i32> {
    let (container, spec) = match (container_id, from) {
        (Some(id_or_tag), _) => {
            let resolved = store::resolve_container_id(config, &id_or_tag)?;
            let container = Container::new(config, resolved);
            let spec = container.load_image_spec()?;
            (container, spec)
        }
        (None, Some(image_ref)) => {
            let (image, tag) = image_ref
                .split_once(':')
                .map(|(i, t)| (i.to_string(), t.to_string()))
                .unwrap_or((image_ref.clone(), "latest".to_string()));
            let new_id = store::generate_container_id();
            let container = Container::new(config, &new_id);
            container.create_directories()?;
            repo.unpack(&container.base_dir(), &image, &tag, false)?;
            let (_, spec) = repo.resolve(&image, &tag)?;
            let metadata = metadata::to_docker_metadata(&spec, &new_id, "1970-01-01T00:00:00Z");
            container.save_metadata(&metadata)?;
            (container, spec)
        }
        (None, None) => bail!("either CONTAINER_ID or --from IMAGE[:tag] is required"),
    };

    let mut context = ExecContext::from_spec(&spec);
    if let Ok(term) = std::env::var("TERM") {
        context.environ.insert("TERM".to_string(), term);
    }
    if let Ok(lang) = std::env::var("LANG") {
        context.environ.insert("LANG".to_string(), lang);
    }
    for (k, v) in parse_env_kv(&env)? {
        context.environ.insert(k, v);
    }
    if let Some(user) = user {
        context = context.with_user(user);
    }
    if let Some(workdir) = workdir {
        context = context.with_workdir(workdir);
    }

    let effective_command = if !command.is_empty() {
        command
    } else if let Some(entrypoint) = entrypoint {
        vec!["/bin/sh".to_string(), "-c".to_string(), entrypoint]
    } else {
        spec.command.clone().or_else(|| spec.entrypoint.clone()).unwrap_or_else(|| vec!["/bin/sh".to_string()])
    };

    let links = link
        .iter()
        .map(|l| parse_link(l))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .map(|(src, alias)| -> Result<crate::store::ContainerLink> {
            let src_id = store::resolve_container_id(config, &src)?;
            let src_container = Container::new(config, &src_id);
            let src_spec = src_container.load_image_spec()?;
            Ok(crate::store::ContainerLink {
                alias,
                container_id: src_id,
                ip_address: src_container.ip_address().unwrap_or_default(),
                exposed_ports: src_spec.exposed_ports.into_iter().collect(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    for link in &links {
        context.environ.extend(link.environ());
    }

    let self_ip = ip.as_deref().and_then(|s| s.parse().ok());
    let private_network = match resolve_bridge(config, bridge.as_deref())? {
        Some((bridge_name, dev_type)) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build network-setup runtime")?;
            Some(runtime.block_on(crate::sandbox::network::PrivateNetwork::new(
                bridge_name,
                dev_type,
                self_ip,
            ))?)
        }
        None => None,
    };

    let bundle = NamespaceBundle {
        target: container.root_dir(),
        root_fs: RootFs::Overlay {
            lower: container.base_dir(),
            upper: container.delta_dir(),
        },
        volumes: container
            .volumes()?
            .into_iter()
            .map(|(container_path, host_path)| crate::sandbox::mount::VolumeMount {
                host_path,
                container_path,
            })
            .collect(),
        special_fs: true,
        target_uid,
        target_gid,
        hostname: spec.hostname.clone(),
        self_ip,
        links: links
            .iter()
            .filter_map(|l| l.ip_address.parse().ok().map(|ip| (ip, vec![l.alias.clone()])))
            .collect(),
        private_network,
    };

    container.write_pidfile(std::process::id())?;
    if let Some(ip) = bundle.private_network.as_ref().and_then(|net| net.ip_address) {
        container.write_ip_address(&ip.to_string())?;
    }

    let result = exec::run_command(bundle, &context, &effective_command);

    if remove_after {
        let _ = remove_container(config, &container.container_id, false, target_uid, target_gid);
    }
    let _ = container.cleanup_runtime_files();

    match result {
        Ok(()) => Ok(0),
        Err(e) => match e.downcast_ref::<ShoeboxError>() {
            Some(shoebox_err) => Ok(shoebox_err.exit_code()),
            None => Err(e),
        },
    }
}

fn resolve_bridge(config: &Config, override_bridge: Option<&str>) -> Result<Option<(String, String)>> {
    use crate::config::BridgeConfig;
    let effective = match override_bridge {
        Some("none") | Some("None") => BridgeConfig::None,
        Some("auto") => BridgeConfig::Auto,
        Some(name) => BridgeConfig::Named(name.to_string()),
        None => config.bridge.clone(),
    };
    match effective {
        BridgeConfig::None => Ok(None),
        BridgeConfig::Named(name) => Ok(Some((name, "veth".to_string()))),
        BridgeConfig::Auto => {
            let username = std::env::var("USER").unwrap_or_default();
            crate::sandbox::network::detect_bridge(&username)
        }
    }
}

fn cmd_rm(
    config: &Config,
    container_ids: &[String],
    volumes: bool,
    target_uid: Option<u32>,
    target_gid: Option<u32>,
) -> i32 {
    for id_or_tag in container_ids {
        if let Err(e) = remove_one(config, id_or_tag, volumes, target_uid, target_gid) {
            error!(container = %id_or_tag, error = %e, "rm failed");
            return 1;
        }
    }
    0
}

fn remove_one(
    config: &Config,
    id_or_tag: &str,
    volumes: bool,
    target_uid: Option<u32>,
    target_gid: Option<u32>,
) -> Result<()> {
    let container_id = store::resolve_container_id(config, id_or_tag)?;
    remove_container(config, &container_id, volumes, target_uid, target_gid)
}

fn remove_container(
    config: &Config,
    container_id: &str,
    volumes: bool,
    _target_uid: Option<u32>,
    _target_gid: Option<u32>,
) -> Result<()> {
    let container = Container::new(config, container_id);

    if container.root_dir().exists() {
        std::fs::remove_dir(container.root_dir()).ok();
    }
    let mut directories = vec![container.base_dir(), container.delta_dir()];
    if volumes {
        directories.push(container.volumes_dir());
    } else if container.volumes_dir().exists() {
        info!(dir = %container.volumes_dir().display(), "preserving volumes");
    }
    for dir in directories {
        if dir.exists() {
            debug!(dir = %dir.display(), "removing layer");
            exec::rm_layer(&dir)?;
            std::fs::remove_dir(&dir).ok();
        }
    }

    store::remove_container_metadata(config, container_id)?;
    match std::fs::remove_dir(&container.container_dir) {
        Ok(()) => info!(container_id, "removed"),
        Err(e) if e.raw_os_error() == Some(39 /* ENOTEMPTY */) => {
            info!(container_id, "container directory not empty, not removing")
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn cmd_ls(config: &Config, quiet: bool) -> Result<()> {
    for (id, tags) in store::list_containers(config)? {
        if quiet {
            println!("{id}");
        } else {
            println!("{id}  {}", tags.join(","));
        }
    }
    Ok(())
}

fn cmd_ps(config: &Config) -> Result<()> {
    for (id, _tags) in store::list_containers(config)? {
        let container = Container::new(config, &id);
        if let Some(pid) = container.pid() {
            println!("== {id} (pid {pid}) ==");
            let output = std::process::Command::new("pstree").arg("-ap").arg(pid.to_string()).output();
            match output {
                Ok(output) => print!("{}", String::from_utf8_lossy(&output.stdout)),
                Err(e) => debug!(container = id, error = %e, "pstree unavailable"),
            }
        }
    }
    Ok(())
}

fn cmd_tag(config: &Config, container: &str, tag: &str, force: bool) -> Result<()> {
    let container_id = store::resolve_container_id(config, container)?;
    store::tag_container(config, &container_id, tag, force)
}

fn cmd_untag(config: &Config, tag: &str) -> Result<()> {
    store::untag(config, tag)
}

fn cmd_metadata(repo: &ImageRepository, image: &str, tag: &str) -> Result<()> {
    let metadata = repo.metadata(image, tag, true)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

fn cmd_ancestry(repo: &ImageRepository, image: &str, tag: &str) -> Result<()> {
    for id in repo.ancestry(image, tag)? {
        println!("{id}");
    }
    Ok(())
}
