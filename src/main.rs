use clap::{Parser, Subcommand};
use partar::archive::{archive_create, archive_extract, check_archive_paths, ArchiveOptions};
use partar::entry::collect_entries;
use partar::{index_path, scan, write_index, Comm};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "partar", version, about = "Distributed parallel pax archiver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive one or more paths into a pax tar with an offset index
    Create {
        /// Archive file to write; the index lands next to it as <output>.idx
        #[arg(short, long)]
        output: PathBuf,
        /// Base directory member names are made relative to
        #[arg(short = 'C', long, default_value = ".")]
        cwd: PathBuf,
        /// Number of peer ranks
        #[arg(short, long, default_value = "1")]
        ranks: usize,
        /// Chunk size in KiB (unit of parallel scheduling)
        #[arg(long, default_value = "4096")]
        chunk_size: u64,
        /// Read/write block size in KiB
        #[arg(long, default_value = "1024")]
        block_size: u64,
        /// Capture attributes from disk at encode time
        #[arg(short, long)]
        preserve: bool,
        /// Seconds between progress lines; 0 disables them
        #[arg(long, default_value = "10")]
        progress: u64,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Extract an archive, using its .idx sidecar when present
    Extract {
        input: PathBuf,
        /// Directory to extract into
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(short, long, default_value = "1")]
        ranks: usize,
        /// Restore ownership and extended attributes
        #[arg(short, long)]
        preserve: bool,
        #[arg(long, default_value = "10")]
        progress: u64,
    },
    /// Rebuild the .idx sidecar by scanning the archive's headers
    Index {
        input: PathBuf,
    },
    /// List archive contents from a header scan
    List {
        input: PathBuf,
    },
}

fn progress_interval(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    match Cli::parse().command {

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { output, cwd, ranks, chunk_size, block_size, preserve, progress, input } => {
            check_archive_paths(&input, &output)?;
            let opts = ArchiveOptions {
                chunk_size: chunk_size * 1024,
                block_size: block_size * 1024,
                preserve,
                dest_path: Some(output.clone()),
                ranks,
                progress_interval: progress_interval(progress),
            };
            let cwd = cwd.canonicalize()?;
            let entries = collect_entries(&canonicalized(&input)?)?;
            let summary = archive_create(entries, &output, &cwd, &opts)?;
            println!(
                "Created: {}  ({} entries, {} B on disk)",
                output.display(), summary.items, summary.bytes
            );
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, ranks, preserve, progress } => {
            std::fs::create_dir_all(&output_dir)?;
            let opts = ArchiveOptions {
                preserve,
                ranks,
                progress_interval: progress_interval(progress),
                ..ArchiveOptions::default()
            };
            let dest = output_dir.canonicalize()?;
            let summary = archive_extract(&input, &dest, &opts)?;
            println!(
                "Extracted {} items to {} ({} B)",
                summary.items, dest.display(), summary.bytes
            );
        }

        // ── Index ────────────────────────────────────────────────────────────
        Commands::Index { input } => {
            let offsets = scan::scan_entry_offsets(&input, None)?;
            Comm::launch(1, |comm| write_index(&comm, &input, &offsets))
                .pop()
                .transpose()?;
            println!(
                "Indexed {} entries → {}",
                offsets.len(), index_path(&input).display()
            );
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let file = std::fs::File::open(&input)?;
            let mut decoder = tar::Archive::new(std::io::BufReader::new(file));
            println!("Archive: {}", input.display());
            println!("{:<48} {:>12}  {:<8}", "Name", "Size", "Type");
            for item in decoder.entries()? {
                let item = item?;
                let kind = match item.header().entry_type() {
                    t if t.is_dir() => "dir",
                    t if t.is_symlink() => "link",
                    t if t.is_file() => "file",
                    _ => "other",
                };
                println!(
                    "{:<48} {:>12}  {:<8}",
                    item.path()?.display(), item.size(), kind
                );
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn canonicalized(paths: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    paths.iter().map(|p| p.canonicalize()).collect()
}
