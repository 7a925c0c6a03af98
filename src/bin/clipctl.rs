use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use clip::archive::HEADER_LEN;
use clip::index::{S_IFDIR, S_IFLNK, S_IFMT};
use clip::source::{LayerSource, OciLayoutSource, RegistryLayerSource};
use clip::{ArchiveMetadata, ClipConfig, ImageView, IndexProgress, Node, ProgressStage};
use clip_oci::auth::EnvCredentials;
use clip_oci::{OciClient, RegistryClient};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Index OCI images for lazy access and read files out of the index.
#[derive(Parser)]
#[command(name = "clipctl", version, about)]
struct Cli {
    /// YAML config file
    #[arg(long, global = true, env = "CLIP_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index an image from a registry
    Index {
        /// Image reference, e.g. docker.io/library/alpine:3.19
        image: String,
        #[arg(short, long)]
        output: PathBuf,
        /// Platform as os/arch[/variant]
        #[arg(long)]
        platform: Option<String>,
    },
    /// Index an image from an OCI image-layout directory
    IndexLayout {
        dir: PathBuf,
        /// Tag (org.opencontainers.image.ref.name) or manifest digest
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show an index artifact's header, source and layers
    Inspect {
        file: PathBuf,
        /// Print the storage section as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a directory inside an indexed image
    Ls {
        file: PathBuf,
        #[arg(default_value = "/")]
        dir: String,
    },
    /// Print a file from an indexed image
    Cat { file: PathBuf, path: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match ClipConfig::resolve(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    if cli.log_file.is_some() {
        config.log_file = cli.log_file.clone();
    }
    let _guard = init_logging(config.log_file.as_deref());

    if let Err(e) = run(cli.command, config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(log_file: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = log_file.and_then(|p| Some((p.parent()?.to_path_buf(), p.file_name()?.to_owned())));
    match file {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
            None
        }
    }
}

async fn run(command: Command, mut config: ClipConfig) -> CliResult<()> {
    match command {
        Command::Index {
            image,
            output,
            platform,
        } => {
            if platform.is_some() {
                config.platform = platform;
            }
            let client = OciClient::new(Arc::new(EnvCredentials))?.with_platform(config.platform()?);
            let source =
                RegistryLayerSource::resolve(&client, &image, config.fetch_timeout()?).await?;
            index_to_file(Arc::new(source), &config, &output).await
        }
        Command::IndexLayout {
            dir,
            reference,
            output,
        } => {
            let source = OciLayoutSource::open(&dir, reference.as_deref(), &config.platform()?)?;
            index_to_file(Arc::new(source), &config, &output).await
        }
        Command::Inspect { file, json } => inspect(&file, json),
        Command::Ls { file, dir } => {
            let meta = ArchiveMetadata::load(&file)?;
            let node = meta.index.resolve(&dir)?;
            let nodes = if node.is_dir() {
                meta.index.list_children(&node.path)
            } else {
                vec![node]
            };
            let mut out = io::stdout().lock();
            for node in nodes {
                writeln!(out, "{}", format_node(node))?;
            }
            Ok(())
        }
        Command::Cat { file, path } => {
            let meta = ArchiveMetadata::load(&file)?;
            let registry = Arc::new(RegistryClient::with_credentials(Arc::new(EnvCredentials))?);
            let source = clip::open_source(&meta.storage, Some(registry), config.fetch_timeout()?)?;
            let cache = Arc::new(config.cache_manager()?);
            let view = ImageView::new(meta, source, cache, config.resolver_options()?);
            let bytes = view.read_all(&path).await?;
            io::stdout().lock().write_all(&bytes)?;
            Ok(())
        }
    }
}

async fn index_to_file(
    source: Arc<dyn LayerSource>,
    config: &ClipConfig,
    output: &Path,
) -> CliResult<()> {
    let total = source.layer_digests()?.len() as u64;
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} layers {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<IndexProgress>();
    let progress = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event.stage {
                    ProgressStage::Starting => {
                        let short = clip_oci::registry::digest_hex(&event.digest);
                        bar.set_message(short.chars().take(12).collect::<String>());
                    }
                    ProgressStage::Completed => bar.inc(1),
                }
            }
        })
    };

    let mut options = config.index_options();
    options.progress = Some(tx);
    let result = clip::index_image(source, options).await;
    let _ = progress.await;
    let meta = match result {
        Ok(meta) => {
            bar.finish_with_message("done");
            meta
        }
        Err(e) => {
            bar.abandon_with_message("failed");
            return Err(e.into());
        }
    };

    meta.write_to(output)?;
    println!(
        "indexed {} paths from {} layers into {}",
        meta.index.len(),
        meta.storage.layers.len(),
        output.display()
    );
    Ok(())
}

fn inspect(file: &Path, json: bool) -> CliResult<()> {
    let raw = std::fs::read(file)?;
    let meta = ArchiveMetadata::from_bytes(&raw)?;
    let storage = &meta.storage;
    let mut out = io::stdout().lock();

    if json {
        serde_json::to_writer_pretty(&mut out, storage)?;
        writeln!(out)?;
        return Ok(());
    }

    writeln!(out, "file:       {} ({} bytes, header {})", file.display(), raw.len(), HEADER_LEN)?;
    writeln!(out, "storage:    {}", storage.kind.tag())?;
    if !storage.registry.is_empty() {
        writeln!(out, "registry:   {}", storage.registry)?;
    }
    writeln!(out, "repository: {}", storage.repository)?;
    writeln!(out, "reference:  {}", storage.reference)?;
    if let Some(image) = &storage.image {
        writeln!(out, "platform:   {}/{}", image.os, image.architecture)?;
    }
    writeln!(out, "paths:      {}", meta.index.len())?;
    writeln!(out, "layers:")?;
    for digest in &storage.layers {
        let table = storage.layer(digest)?;
        writeln!(
            out,
            "  {}  {} -> {} bytes, {} checkpoints",
            digest,
            table.compressed_size,
            table.uncompressed_size,
            table.checkpoints.len()
        )?;
    }
    Ok(())
}

fn format_node(node: &Node) -> String {
    let kind = match node.attr.mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    };
    let perms: String = [0o400, 0o200, 0o100, 0o40, 0o20, 0o10, 0o4, 0o2, 0o1]
        .iter()
        .zip("rwxrwxrwx".chars())
        .map(|(bit, c)| if node.attr.mode & bit != 0 { c } else { '-' })
        .collect();
    let mut line = format!(
        "{}{} {:>5} {:>5} {:>10} {}",
        kind, perms, node.attr.uid, node.attr.gid, node.attr.size, node.path
    );
    if let clip::NodeKind::Symlink { target } = &node.kind {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}
