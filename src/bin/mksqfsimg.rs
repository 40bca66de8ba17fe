//! `mksqfsimg`: builds a SquashFS-family image from either a host
//! directory tree or a declarative manifest, driving the library's
//! [`sqfsimg::BlockProcessor`] end to end.
//!
//! This binary is the minimum CLI surface from spec §6. It owns option
//! parsing, manifest/directory scanning, and output-file lifecycle; all
//! of the parallel block processing is delegated to the library.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use byte_unit::Byte;
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};

use sqfsimg::compressor::{BlockCompressor, Compressor};
use sqfsimg::dedup::DedupPolicy;
use sqfsimg::error::SqfsBuildError;
use sqfsimg::file::FileOptions;
use sqfsimg::processor::{BlockProcessor, BlockProcessorConfig};
use sqfsimg::scanner::{self, OwnerOverride, ScanOptions};
use sqfsimg::tree::{NodeKind, Tree};

// -musl malloc is slow, use jemalloc
#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Reserved region at the front of the output file, sized to match the
/// real SquashFS superblock so a downstream writer can seek back and
/// fill it in; the core never interprets these bytes.
const HEADER_RESERVED_BYTES: u64 = 96;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliCompressor {
    Gzip,
    Lzma,
    Lzo,
    Xz,
    Lz4,
    Zstd,
}

impl From<CliCompressor> for Compressor {
    fn from(value: CliCompressor) -> Self {
        match value {
            CliCompressor::Gzip => Compressor::Gzip,
            CliCompressor::Lzma => Compressor::Lzma,
            CliCompressor::Lzo => Compressor::Lzo,
            CliCompressor::Xz => Compressor::Xz,
            CliCompressor::Lz4 => Compressor::Lz4,
            CliCompressor::Zstd => Compressor::Zstd,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum, Default)]
enum CliDedupPolicy {
    #[default]
    CompareBytes,
    TrustChecksum,
}

impl From<CliDedupPolicy> for DedupPolicy {
    fn from(value: CliDedupPolicy) -> Self {
        match value {
            CliDedupPolicy::CompareBytes => DedupPolicy::CompareBytes,
            CliDedupPolicy::TrustChecksum => DedupPolicy::TrustChecksum,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Build a SquashFS-family image from a directory or manifest")]
struct Cli {
    /// Declarative file-list manifest (see the manifest grammar).
    #[arg(short = 'F', long = "manifest", value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// Host directory to scan directly.
    #[arg(short = 'D', long = "source-dir", value_name = "DIR")]
    source_dir: Option<PathBuf>,

    /// Output image path.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: PathBuf,

    /// Overwrite the output file if it already exists.
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Compression back-end.
    #[arg(short = 'c', long = "compressor", value_enum, default_value_t = CliCompressor::Xz)]
    compressor: CliCompressor,

    /// Data block size, e.g. "128K".
    #[arg(short = 'b', long = "block-size", default_value = "128K")]
    block_size: String,

    /// Number of worker threads; 0 runs fully inline on the caller thread.
    #[arg(short = 'j', long = "workers", default_value_t = 4)]
    num_workers: usize,

    /// Maximum number of in-flight blocks before producers block.
    #[arg(short = 'Q', long = "max-backlog", default_value_t = 16)]
    max_backlog: usize,

    /// SELinux context file (accepted, attached to tree nodes only).
    #[arg(long = "selinux", value_name = "FILE")]
    selinux: Option<PathBuf>,

    /// Extended attribute file (accepted, attached to tree nodes only).
    #[arg(long = "xattr-file", value_name = "FILE")]
    xattr_file: Option<PathBuf>,

    /// Sort-file: "<priority> <path>" lines controlling file packing order.
    #[arg(long = "sort", value_name = "FILE")]
    sort: Option<PathBuf>,

    /// Force every file's uid to this value.
    #[arg(long = "force-uid")]
    force_uid: Option<u32>,

    /// Force every file's gid to this value.
    #[arg(long = "force-gid")]
    force_gid: Option<u32>,

    /// Never pack trailing bytes into shared fragment blocks.
    #[arg(long = "no-tail-packing")]
    no_tail_packing: bool,

    /// Byte-compare-on-hit policy for the block/fragment dedup indices.
    #[arg(long = "dedup-policy", value_enum, default_value_t = CliDedupPolicy::CompareBytes)]
    dedup_policy: CliDedupPolicy,

    /// Suppress progress output.
    #[arg(long = "quiet")]
    quiet: bool,
}

fn init_logging(quiet: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_tree(cli: &Cli) -> Result<Tree, SqfsBuildError> {
    let mut tree = Tree::new(0o755, 0, 0, 0);
    let owner = OwnerOverride {
        force_uid: cli.force_uid,
        force_gid: cli.force_gid,
    };
    let opts = ScanOptions {
        owner,
        keep_mtime: true,
        fixed_mtime: 0,
    };

    if let Some(manifest_path) = &cli.manifest {
        let contents = fs::read_to_string(manifest_path).map_err(|e| SqfsBuildError::io(manifest_path, e))?;
        let entries = sqfsimg::manifest::parse_manifest(manifest_path, &contents)?;
        scanner::apply_manifest(&mut tree, &entries, &opts)?;
    } else if let Some(source_dir) = &cli.source_dir {
        scanner::scan_directory(&mut tree, Tree::ROOT, source_dir, &opts, false, false, None)?;
    } else {
        return Err(SqfsBuildError::Limit(
            "one of -F <manifest> or -D <source dir> is required".into(),
        ));
    }

    Ok(tree)
}

fn parse_block_size(s: &str) -> Result<u32, SqfsBuildError> {
    Byte::from_str(s)
        .map_err(|e| SqfsBuildError::Limit(format!("invalid block size '{s}': {e}")))
        .map(|b| b.get_bytes() as u32)
}

fn run(cli: Cli) -> Result<(), SqfsBuildError> {
    if let Some(sort_path) = &cli.sort {
        // Accepted and parsed for completeness; actual re-ordering happens
        // on the file path list built below.
        let contents = fs::read_to_string(sort_path).map_err(|e| SqfsBuildError::io(sort_path, e))?;
        let _ = scanner::parse_sort_file(&contents);
    }
    if cli.selinux.is_some() || cli.xattr_file.is_some() {
        info!("--selinux/--xattr-file accepted but not written to any on-disk table (out of core scope)");
    }

    let block_size = parse_block_size(&cli.block_size)?;
    let tree = build_tree(&cli)?;

    let mut file_ids = tree.regular_files();
    if let Some(sort_path) = &cli.sort {
        let contents = fs::read_to_string(sort_path).map_err(|e| SqfsBuildError::io(sort_path, e))?;
        let priorities = scanner::parse_sort_file(&contents);
        let mut paths: Vec<_> = file_ids.iter().map(|&id| tree.path_of(id)).collect();
        scanner::apply_sort_order(&mut paths, &priorities);
        file_ids.sort_by_key(|&id| {
            paths
                .iter()
                .position(|p| *p == tree.path_of(id))
                .unwrap_or(usize::MAX)
        });
    }

    if cli.output.exists() && !cli.force {
        return Err(SqfsBuildError::Limit(format!(
            "output file {:?} already exists (use -f to overwrite)",
            cli.output
        )));
    }

    let mut out_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.output)
        .map_err(|e| SqfsBuildError::io(&cli.output, e))?;
    out_file
        .write_all(&vec![0u8; HEADER_RESERVED_BYTES as usize])
        .map_err(SqfsBuildError::StdIo)?;
    out_file.seek(SeekFrom::Start(HEADER_RESERVED_BYTES)).map_err(SqfsBuildError::StdIo)?;

    let mut config = BlockProcessorConfig::new(block_size, cli.num_workers);
    config.max_backlog = cli.max_backlog.max(1);
    config.compressor = BlockCompressor::new(cli.compressor.into(), None);
    config.dedup_policy = cli.dedup_policy.into();
    config.fragments_enabled = !cli.no_tail_packing;

    let mut processor = BlockProcessor::new(out_file, HEADER_RESERVED_BYTES, config);

    let progress = if cli.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(file_ids.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} files {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    };

    for node_id in file_ids {
        let path = tree.path_of(node_id);
        let NodeKind::RegularFile { source, options } = tree.node(node_id).kind.clone() else {
            continue;
        };
        let result = stream_file(&mut processor, &source, options);
        if let Err(err) = result {
            let _ = fs::remove_file(&cli.output);
            return Err(err);
        }
        progress.set_message(format!("{}", style(path.display()).dim()));
        progress.inc(1);
    }
    progress.finish_and_clear();

    let (report, _out) = match processor.finish() {
        Ok(ok) => ok,
        Err(err) => {
            let _ = fs::remove_file(&cli.output);
            return Err(err);
        }
    };

    if !cli.quiet {
        info!(
            "wrote {} bytes, {} blocks ({} deduped), {} fragment blocks ({} fragment dedup hits)",
            report.bytes_used,
            report.stats.blocks_written,
            report.stats.blocks_deduped,
            report.stats.fragment_blocks_written,
            report.fragment_dedup_hits,
        );
    }

    Ok(())
}

fn stream_file(
    processor: &mut BlockProcessor<File>,
    host_path: &std::path::Path,
    options: FileOptions,
) -> Result<(), SqfsBuildError> {
    use std::io::Read;
    let mut file = File::open(host_path).map_err(|e| SqfsBuildError::io(host_path, e))?;
    let id = processor.new_file(options);
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| SqfsBuildError::io(host_path, e))?;
        if n == 0 {
            break;
        }
        processor.append_to_file(id, &buf[..n])?;
    }
    processor.finish_file(id)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
