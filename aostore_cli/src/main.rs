use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use xxhash_rust::xxh3::Xxh3;

use aostore_codecs::BundledCodecs;
use aostore_core::aocs::AocsHeaderScan;
use aostore_core::format::EXECUTOR_KIND_NONE;
use aostore_core::wal::RelFileNode;
use aostore_core::{CompressionKind, FormatVersion, StorageAttributes, StorageRead, StorageWrite};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "aoseg",
    about = "Inspect, verify, dump and pack append-only storage segment files",
    version
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every block header without decompressing content
    Inspect {
        file: PathBuf,
        #[command(flatten)]
        storage: StorageOpts,
    },
    /// Read and decompress every block, checking checksums and lengths
    Verify {
        file: PathBuf,
        #[command(flatten)]
        storage: StorageOpts,
    },
    /// Write the decoded content of every block
    Cat {
        file: PathBuf,
        /// Destination file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageOpts,
    },
    /// Append a file to a segment file as a sequence of content chunks
    Pack {
        input: PathBuf,
        /// Segment file to write; existing content is replaced
        output: PathBuf,
        /// Bytes per content chunk; chunks larger than a block become
        /// large content
        #[arg(long, default_value_t = 16 * 1024)]
        chunk_size: usize,
        #[command(flatten)]
        storage: StorageOpts,
    },
}

/// Settings describing how the segment file was (or will be) written.
#[derive(Args)]
struct StorageOpts {
    /// Logical EOF; defaults to the physical file length
    #[arg(long)]
    eof: Option<u64>,
    /// Blocks carry checksums
    #[arg(long)]
    checksum: Option<bool>,
    /// Compression: zstd | zlib | lz4
    #[arg(long)]
    compress: Option<String>,
    /// Compression level (default depends on --compress)
    #[arg(long)]
    level: Option<i32>,
    /// Block size in bytes, a multiple of 8192
    #[arg(long)]
    block_size: Option<usize>,
    /// 1 = 4-byte content alignment, 2 = 8-byte
    #[arg(long, default_value_t = 2)]
    format_version: u16,
    /// JSON file with storage attributes; flags override it
    #[arg(long)]
    attrs: Option<PathBuf>,
}

impl StorageOpts {
    fn attributes(&self) -> anyhow::Result<StorageAttributes> {
        let mut attrs = match &self.attrs {
            Some(path) => {
                let file = File::open(path).with_context(|| format!("opening attributes file {:?}", path))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("parsing attributes file {:?}", path))?
            }
            None => StorageAttributes::default(),
        };
        if let Some(checksum) = self.checksum {
            attrs.checksum = checksum;
        }
        if let Some(name) = &self.compress {
            let kind = CompressionKind::from_str(name)?;
            attrs.compress = Some(kind);
            attrs.compress_level = kind.default_level();
        }
        if let Some(level) = self.level {
            attrs.compress_level = level;
        }
        if let Some(block_size) = self.block_size {
            attrs.block_size = block_size;
        }
        attrs.validate().context("invalid storage attributes")?;
        Ok(attrs)
    }

    fn version(&self) -> anyhow::Result<FormatVersion> {
        FormatVersion::from_u16(self.format_version)
            .with_context(|| format!("unknown format version {}", self.format_version))
    }

    fn eof(&self, file: &Path) -> anyhow::Result<u64> {
        match self.eof {
            Some(eof) => Ok(eof),
            None => Ok(std::fs::metadata(file)
                .with_context(|| format!("reading metadata of {:?}", file))?
                .len()),
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_read(file: &Path, storage: &StorageOpts) -> anyhow::Result<StorageRead> {
    let attrs = storage.attributes()?;
    let mut read = StorageRead::new(attrs, "aoseg", "segment file", Some(&BundledCodecs))?;
    read.open_file(file, storage.version()?, storage.eof(file)?)
        .with_context(|| format!("opening segment file {:?}", file))?;
    Ok(read)
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_inspect(file: PathBuf, storage: StorageOpts) -> anyhow::Result<()> {
    let eof = storage.eof(&file)?;
    let mut scan = AocsHeaderScan::open_file(storage.attributes()?, "aoseg", &file, storage.version()?, eof, None)
        .with_context(|| format!("opening segment file {:?}", file))?;

    println!("=== segment file {:?} (logical EOF {}) ===", file, eof);
    println!();
    println!(
        "  {:>12}  {:<20}  {:>6}  {:>8}  {:>9}  {:>10}  {:>8}  {:>12}  {:>4}",
        "offset", "kind", "header", "overall", "data", "compressed", "rows", "first row", "exec"
    );
    println!("  {}", "-".repeat(106));
    let (mut blocks, mut rows, mut data) = (0u64, 0u64, 0u64);
    while let Some(block) = scan.next_header()? {
        let info = block.info;
        println!(
            "  {:>12}  {:<20}  {:>6}  {:>8}  {:>9}  {:>10}  {:>8}  {:>12}  {:>4}",
            block.header_offset,
            info.kind.name(),
            info.header_len,
            info.overall_block_len,
            info.uncompressed_len,
            info.compressed_len,
            info.row_count,
            info.first_row_num.map_or_else(|| format!("({})", block.first_row_num), |n| n.to_string()),
            info.executor_block_kind
        );
        blocks += 1;
        rows += info.row_count as u64;
        data += info.uncompressed_len as u64;
    }
    scan.finish();
    println!();
    println!("  blocks      : {}", blocks);
    println!("  rows        : {}", rows);
    println!("  data        : {}", human_bytes(data));
    println!("  on disk     : {}", human_bytes(eof));
    Ok(())
}

fn run_verify(file: PathBuf, storage: StorageOpts) -> anyhow::Result<()> {
    let mut read = open_read(&file, &storage)?;
    let t0 = Instant::now();
    let mut hasher = Xxh3::new();
    let (mut blocks, mut rows, mut bytes) = (0u64, 0u64, 0u64);
    while read.read_next_block()? {
        let (offset, row_count) = match read.current() {
            Some(b) => (b.header_offset, b.row_count()),
            None => break,
        };
        let content = read
            .content()
            .with_context(|| format!("block at offset {} of {:?}", offset, file))?;
        hasher.update(content);
        bytes += content.len() as u64;
        blocks += 1;
        rows += row_count as u64;
    }
    let stats = read.stats();
    read.finish_session();
    let elapsed = t0.elapsed();

    println!("  blocks      : {}", blocks);
    println!("  rows        : {}", rows);
    println!("  decompressed: {} blocks", stats.blocks_decompressed);
    println!("  content     : {}", human_bytes(bytes));
    println!("  reads       : {} ({})", stats.physical_reads, human_bytes(stats.bytes_read));
    println!("  xxh3-64     : {:016x}", hasher.digest());
    println!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    info!(file = %file.display(), blocks, "segment file verified");
    Ok(())
}

fn run_cat(file: PathBuf, output: Option<PathBuf>, storage: StorageOpts) -> anyhow::Result<()> {
    let mut read = open_read(&file, &storage)?;
    let mut dst: Box<dyn Write> = match &output {
        Some(path) => Box::new(File::create(path).with_context(|| format!("creating output file {:?}", path))?),
        None => Box::new(io::stdout().lock()),
    };
    let mut total = 0u64;
    while read.read_next_block()? {
        let content = read.content()?;
        dst.write_all(content)?;
        total += content.len() as u64;
    }
    dst.flush()?;
    read.finish_session();
    eprintln!("  wrote {}", human_bytes(total));
    Ok(())
}

fn run_pack(input: PathBuf, output: PathBuf, chunk_size: usize, storage: StorageOpts) -> anyhow::Result<()> {
    if chunk_size == 0 {
        anyhow::bail!("--chunk-size must be positive");
    }
    let attrs = storage.attributes()?;
    let version = storage.version()?;
    if version != FormatVersion::LATEST {
        anyhow::bail!("only format version {} can be written", FormatVersion::LATEST.as_u16());
    }
    let node = RelFileNode::default();
    let mut write = StorageWrite::new(attrs.clone(), "aoseg", "pack", Some(&BundledCodecs))?;
    write.create_file(&output, node, 0)?;
    write
        .open_file(&output, version, 0, 0, node, 0)
        .with_context(|| format!("opening output file {:?}", output))?;

    let file = File::open(&input).with_context(|| format!("opening input file {:?}", input))?;
    let mut src = BufReader::new(file);
    let mut buf = vec![0u8; chunk_size];
    let t0 = Instant::now();
    let mut total = 0u64;
    loop {
        let n = read_full(&mut src, &mut buf)?;
        if n == 0 {
            break;
        }
        write.content(&buf[..n], EXECUTOR_KIND_NONE, 1)?;
        total += n as u64;
        if n < buf.len() {
            break;
        }
    }
    let (eof, eof_uncompressed) = write.flush_and_close_file()?;
    let stats = write.stats();
    write.finish_session();
    let elapsed = t0.elapsed();

    eprintln!("  input       : {}", human_bytes(total));
    eprintln!("  blocks      : {} ({} compressed, {} large)", stats.blocks, stats.compressed_blocks, stats.large_contents);
    eprintln!("  eof         : {}", eof);
    eprintln!("  eof (uncomp): {}", eof_uncompressed);
    eprintln!("  writes      : {}", stats.physical_writes);
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

/// Fill `buf` unless the input ends first.
fn read_full(src: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Inspect { file, storage } => run_inspect(file, storage),
        Commands::Verify { file, storage } => run_verify(file, storage),
        Commands::Cat { file, output, storage } => run_cat(file, output, storage),
        Commands::Pack {
            input,
            output,
            chunk_size,
            storage,
        } => run_pack(input, output, chunk_size, storage),
    }
}
