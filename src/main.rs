use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tarmount::archive::{TarIndex, build_index};
use tarmount::config::Config;
use tarmount::dump::{collect_entries, write_json};
use tarmount::daemon;
use tarmount::fuse::{self, IndexFs, MountOptions};
use tarmount::github::RepoRef;
use tarmount::index::{Index, OpContext};
use tarmount::remote::{open_remote_index, write_bundle};
use tarmount::store::{DB_FILE, IndexStore};
use tarmount::{IndexSource, metrics};
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Mount tar archives and repository trees as lazy read-only filesystems
#[derive(Parser, Debug)]
#[command(name = "tarmount", version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ./tarmount.{toml,yaml,json} if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build, inspect and publish tar indexes
    #[command(subcommand)]
    Index(IndexCommand),

    /// Mount an archive or repository
    #[command(subcommand)]
    Mount(MountCommand),

    /// Unmount a filesystem mounted by another tarmount process
    Unmount {
        mountpoint: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum IndexCommand {
    /// Index a tar archive into a new store directory
    Generate {
        /// Store directory to create
        dst: PathBuf,
        /// Uncompressed tar archive
        src: PathBuf,
    },

    /// Print every entry of an index as JSON, breadth-first
    Dump {
        /// Treat SOURCE as a local store directory; TAR is then required
        #[arg(long, requires = "tar")]
        local: bool,
        /// Remote base URL, or store directory with --local
        source: String,
        /// Tar archive indexed by a local store
        tar: Option<PathBuf>,
    },

    /// Pack a store directory as `<base>.index` for remote serving
    Bundle {
        /// Store directory built by `index generate`
        store: PathBuf,
        /// Output file, conventionally `<base>.index`
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum MountCommand {
    /// Mount a local tar using an index built by `index generate`
    Local {
        index: PathBuf,
        tar: PathBuf,
        mountpoint: PathBuf,
        #[command(flatten)]
        flags: MountFlags,
    },

    /// Mount a remote bundle published as `<base>.index` + `<base>.tar`
    Remote {
        base_url: String,
        mountpoint: PathBuf,
        #[command(flatten)]
        flags: MountFlags,
    },

    /// Mount a GitHub repository tree
    Github {
        /// Repository as owner/name
        repo: RepoRef,
        mountpoint: PathBuf,
        /// Branch, tag or commit
        #[arg(long, default_value = "main")]
        revision: String,
        /// API token
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[command(flatten)]
        flags: MountFlags,
    },
}

#[derive(Args, Debug)]
struct MountFlags {
    /// Owner uid for entries without recorded ownership
    #[arg(long)]
    uid: Option<u32>,

    /// Owner gid for entries without recorded ownership
    #[arg(long)]
    gid: Option<u32>,

    /// Let other users access the mount
    #[arg(long, conflicts_with = "allow_root")]
    allow_other: bool,

    /// Let root access the mount as well as the mounting user
    #[arg(long)]
    allow_root: bool,

    /// Detach from the terminal before mounting
    #[arg(long)]
    daemon: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "tarmount=debug,info" } else { "tarmount=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Index(command) => run_index(command, &config),
        Command::Mount(command) => run_mount(command, config),
        Command::Unmount { mountpoint } => fuse::unmount(&mountpoint),
    }
}

fn run_index(command: IndexCommand, config: &Config) -> anyhow::Result<()> {
    let runtime = Runtime::new().context("Failed to start runtime")?;

    match command {
        IndexCommand::Generate { dst, src } => runtime.block_on(generate(&dst, &src)),
        IndexCommand::Dump { local, source, tar } => {
            let ctx = OpContext::background();
            let index: Arc<dyn Index> = match (local, tar) {
                (true, Some(tar)) => Arc::new(runtime.block_on(TarIndex::open_local(&source, &tar))?),
                (false, None) => Arc::new(runtime.block_on(open_remote_index(
                    &ctx,
                    &source,
                    &config.remote,
                ))?),
                _ => anyhow::bail!("A tar path is only accepted together with --local"),
            };

            let entries = runtime.block_on(collect_entries(&ctx, index.as_ref()))?;
            write_json(std::io::stdout().lock(), &entries).context("Failed to write dump")?;
            Ok(())
        }
        IndexCommand::Bundle { store, out } => bundle(&store, &out),
    }
}

async fn generate(dst: &Path, src: &Path) -> anyhow::Result<()> {
    if dst.join(DB_FILE).exists() {
        anyhow::bail!("Index already exists at {}", dst.display());
    }
    let created = !dst.exists();

    let file = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    let store = IndexStore::create(dst).await?;
    let result = build_index(&store, BufReader::new(file)).await;
    store.close().await;

    match result {
        Ok(stats) => {
            tracing::info!(
                dst = %dst.display(),
                entries = stats.entries,
                skipped = stats.skipped,
                implied_dirs = stats.implied_dirs,
                "Index generated"
            );
            Ok(())
        }
        Err(e) => {
            let cleanup = if created {
                std::fs::remove_dir_all(dst)
            } else {
                std::fs::remove_file(dst.join(DB_FILE))
            };
            if let Err(cleanup_err) = cleanup {
                tracing::warn!(error = %cleanup_err, "Failed to remove incomplete index");
            }
            Err(e).with_context(|| format!("Failed to index {}", src.display()))
        }
    }
}

fn bundle(store: &Path, out: &Path) -> anyhow::Result<()> {
    if !store.join(DB_FILE).exists() {
        anyhow::bail!("No index found in {}", store.display());
    }

    let file = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let mut writer = write_bundle(store, BufWriter::new(file))?;
    writer.flush()?;

    tracing::info!(store = %store.display(), out = %out.display(), "Index bundle written");
    Ok(())
}

/// Open the index and mount it; errors here are startup failures
fn start_mount(
    source: &IndexSource,
    config: &Config,
    mountpoint: &Path,
) -> anyhow::Result<fuser::BackgroundSession> {
    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("tarmount")
            .enable_all()
            .build()
            .context("Failed to start runtime")?,
    );

    let index = runtime
        .block_on(source.open(&OpContext::background(), config))
        .with_context(|| format!("Failed to open {}", source))?;

    fuse::prepare_mountpoint(mountpoint)?;
    let fs = IndexFs::with_runtime(index, runtime, &config.mount);
    fuse::mount(fs, mountpoint, &MountOptions::from(&config.mount))
}

fn run_mount(command: MountCommand, mut config: Config) -> anyhow::Result<()> {
    let (source, mountpoint, flags) = match command {
        MountCommand::Local { index, tar, mountpoint, flags } => {
            (IndexSource::Local { index, tar }, mountpoint, flags)
        }
        MountCommand::Remote { base_url, mountpoint, flags } => {
            (IndexSource::Remote { base_url }, mountpoint, flags)
        }
        MountCommand::Github { repo, mountpoint, revision, token, flags } => {
            if token.is_some() {
                config.github.token = token;
            }
            (IndexSource::GitHub { repo: repo.with_revision(revision) }, mountpoint, flags)
        }
    };

    if let Some(uid) = flags.uid {
        config.mount.default_uid = uid;
    }
    if let Some(gid) = flags.gid {
        config.mount.default_gid = gid;
    }
    config.mount.allow_other |= flags.allow_other;
    config.mount.allow_root |= flags.allow_root;

    // Fork before any runtime threads exist
    let readiness = if flags.daemon { Some(daemon::daemonize()?) } else { None };

    let session = match start_mount(&source, &config, &mountpoint) {
        Ok(session) => session,
        Err(e) => {
            if let Some(readiness) = readiness {
                readiness.fail(&e);
            }
            return Err(e);
        }
    };
    if let Some(readiness) = readiness {
        readiness.ready();
    }

    fuse::wait(session)?;

    if let Some(metrics) = metrics::global() {
        match metrics.render() {
            Ok(text) => tracing::debug!(metrics = %text, "Final metrics"),
            Err(e) => tracing::warn!(error = %e, "Failed to render metrics"),
        }
    }

    Ok(())
}
