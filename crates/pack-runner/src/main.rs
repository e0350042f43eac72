use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pack_core::checksum::{parse_checksum_file, sha256_file};
use pack_core::{
    ChecksumSet, DeviceProfile, InstallRequest, InstallSource, Pack, PackIndex,
    ReleaseVerification,
};
use pack_runner_host::host::{ChainSecretStore, MemorySecretStore, SecretStore};
use pack_runner_host::{RunnerConfig, RunnerHost, StopReason, boot};

#[derive(Debug, Parser)]
#[command(name = "pack-runner", about = "Install verified packs and run them in the sandboxed engine")]
struct Cli {
    /// Optional path to a TOML config file.
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Print the resolved config and exit.
    #[arg(long = "config-explain")]
    config_explain: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Verify and install a downloaded pack archive.
    Install(InstallArgs),
    /// Resolve the release asset name for a device from a packs.index.json.
    Resolve(ResolveArgs),
    /// List installed packs.
    List,
    /// Start one instance of a pack and wait for it to stop.
    Run(RunArgs),
    /// Remove an installed pack.
    Uninstall {
        #[arg(value_name = "PACK_ID")]
        pack_id: String,
    },
    /// Print the SHA-256 of a file in checksums.sha256 format.
    Checksum {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
struct InstallArgs {
    /// Archive named `pack-<variant>-<target>-<version>.zip`.
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// Install from a workflow build artifact.
    #[arg(long, conflicts_with = "prod", required_unless_present = "prod")]
    dev: bool,

    /// Install from a tagged release (requires --index and --checksums).
    #[arg(long)]
    prod: bool,

    #[arg(long, default_value = "main", help_heading = "Dev source")]
    branch: String,

    #[arg(long, value_name = "URL", help_heading = "Dev source")]
    artifact_url: Option<String>,

    #[arg(long, help_heading = "Prod source")]
    tag: Option<String>,

    #[arg(long, value_name = "URL", help_heading = "Prod source")]
    release_url: Option<String>,

    /// Release packs.index.json.
    #[arg(long, value_name = "PATH", help_heading = "Prod source")]
    index: Option<PathBuf>,

    /// Release checksums.sha256.
    #[arg(long, value_name = "PATH", help_heading = "Prod source")]
    checksums: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long, value_name = "PATH")]
    index: PathBuf,

    /// Platform key in the index, e.g. `android`.
    #[arg(long)]
    platform: String,

    /// Device ABIs, most preferred first (repeatable).
    #[arg(long = "abi")]
    abis: Vec<String>,

    #[arg(long)]
    version: String,

    /// Defaults to the index's default_variant.
    #[arg(long)]
    variant: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(value_name = "PACK_ID")]
    pack_id: String,

    /// Secret value for this run, `NAME=VALUE` (repeatable). Takes precedence
    /// over the configured backend.
    #[arg(long = "secret", value_name = "NAME=VALUE")]
    secrets: Vec<String>,
}

#[tokio::main]
async fn main() {
    boot::init_tracing();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "runner failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = RunnerConfig::load(cli.config.as_deref())?;
    if cli.config_explain {
        println!("{}", config.explain());
        return Ok(());
    }
    let Some(command) = cli.command else {
        bail!("no command given; see --help");
    };

    match command {
        Command::Install(args) => install(config, args),
        Command::Resolve(args) => resolve(args),
        Command::List => list(config),
        Command::Run(args) => run_pack(config, args).await,
        Command::Uninstall { pack_id } => {
            let host = RunnerHost::builder(config).build()?;
            match host.delete_pack(&pack_id).await? {
                Some(pack) => println!("removed {} {}", pack.id, pack.version),
                None => println!("{pack_id} is not installed"),
            }
            Ok(())
        }
        Command::Checksum { file } => {
            let digest = sha256_file(&file)
                .with_context(|| format!("failed to hash {}", file.display()))?;
            let name = file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("{} has no file name", file.display()))?;
            println!("{digest}  {name}");
            Ok(())
        }
    }
}

fn install(config: RunnerConfig, args: InstallArgs) -> Result<()> {
    let file_name = args
        .archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no file name", args.archive.display()))?
        .to_string();
    let bytes = std::fs::read(&args.archive)
        .with_context(|| format!("failed to read {}", args.archive.display()))?;

    let (source, verification) = if args.prod {
        let tag = args.tag.context("--prod requires --tag")?;
        let release_url = args.release_url.context("--prod requires --release-url")?;
        let verification = ReleaseVerification {
            index: args.index.as_deref().map(read_index).transpose()?,
            checksums: args.checksums.as_deref().map(read_checksums).transpose()?,
        };
        (
            InstallSource::Prod {
                tag,
                release_url,
                fetched_at: Utc::now(),
            },
            verification,
        )
    } else {
        let artifact_url = args
            .artifact_url
            .unwrap_or_else(|| format!("file://{}", args.archive.display()));
        (
            InstallSource::Dev {
                branch: args.branch,
                artifact_url,
                fetched_at: Utc::now(),
            },
            ReleaseVerification::default(),
        )
    };

    let host = RunnerHost::builder(config).build()?;
    let pack = host.install(InstallRequest {
        file_name,
        bytes,
        source,
        verification,
    })?;
    print_pack(&pack);
    Ok(())
}

fn resolve(args: ResolveArgs) -> Result<()> {
    let index = read_index(&args.index)?;
    let profile = DeviceProfile::new(args.platform.clone(), args.abis);
    let resolved = index.resolve(
        args.variant.as_deref(),
        &args.platform,
        &profile,
        &args.version,
    )?;
    println!(
        "{}",
        serde_json::json!({
            "variant": resolved.variant,
            "target": resolved.target,
            "asset": resolved.asset,
        })
    );
    Ok(())
}

fn list(config: RunnerConfig) -> Result<()> {
    let host = RunnerHost::builder(config).build()?;
    let packs = host.packs()?;
    if packs.is_empty() {
        println!("no packs installed");
    }
    for pack in &packs {
        print_pack(pack);
    }
    Ok(())
}

async fn run_pack(config: RunnerConfig, args: RunArgs) -> Result<()> {
    let configured = config
        .secrets
        .build_store_for(config.environment)
        .context("failed to build secret store")?;
    let overrides = MemorySecretStore::new();
    for pair in &args.secrets {
        let (name, value) = pair
            .split_once('=')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| anyhow!("--secret expects NAME=VALUE, got `{pair}`"))?;
        overrides.insert(name, value);
    }
    let overrides: Arc<dyn SecretStore> = Arc::new(overrides);
    let secrets: Arc<dyn SecretStore> = Arc::new(ChainSecretStore::new(vec![overrides, configured]));

    let host = RunnerHost::builder(config).secrets(secrets).build()?;
    let instances = host.instances();
    let instance = instances.create(&args.pack_id)?;
    instances.start(&instance.id)?;
    tracing::info!(instance_id = %instance.id, pack_id = %args.pack_id, "instance running");

    let finished = tokio::select! {
        stopped = instances.wait_stopped(&instance.id) => stopped?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("interrupt received; stopping instance");
            instances.stop(&instance.id, StopReason::Requested).await?
        }
    };
    let reason = finished
        .stop_reason
        .map(|reason| reason.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("{} stopped ({reason})", finished.id);
    if let Some(error) = finished.last_error {
        bail!("{} failed: {error}", args.pack_id);
    }
    Ok(())
}

fn read_index(path: &Path) -> Result<PackIndex> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(PackIndex::from_json_str(&raw)?)
}

fn read_checksums(path: &Path) -> Result<ChecksumSet> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_checksum_file(&raw))
}

fn print_pack(pack: &Pack) {
    println!(
        "{}\t{}\t{}\t{}\t{}",
        pack.id,
        pack.version,
        pack.pack_type,
        pack.install_mode,
        pack.install_path.display()
    );
}
