//! Command-line front-end for the h5ar archiver, backed by the bundled
//! memory storage with file persistence.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use h5ar::storage::MemoryStorage;
use h5ar::{
    ArchiveEntry, ArchiveInfo, ArchiveReader, ArchiveWriter, Archiver, ArchivingStrategy,
    ContinueStrategy, ErrorStrategy,
};

#[derive(Parser)]
#[command(name = "h5ar", about = "Archive directory trees into a single container file")]
struct Cli {
    /// Print every processed path and enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML file with an archiving strategy profile.
    #[arg(long, global = true, value_name = "FILE")]
    options: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Archive filesystem paths into the container.
    Archive {
        container: PathBuf,
        fs_paths: Vec<PathBuf>,
        /// Store file contents without deflate compression.
        #[arg(long)]
        no_compress: bool,
        /// Chunk size for file datasets in bytes.
        #[arg(long, value_name = "N")]
        chunk_size: Option<usize>,
        /// Capture uid/gid/permissions into the archive.
        #[arg(long)]
        store_ownership: bool,
    },
    /// List archive entries.
    List {
        container: PathBuf,
        path: Option<String>,
        /// List only the immediate children of the start path.
        #[arg(long)]
        no_recursive: bool,
    },
    /// Extract entries onto the filesystem.
    Extract {
        container: PathBuf,
        dest: PathBuf,
        /// Archive path to extract (default: the whole archive).
        #[arg(long, default_value = "/")]
        path: String,
        /// Restore permissions and modification times.
        #[arg(long)]
        restore_attributes: bool,
        /// Extract only the immediate children of the start path.
        #[arg(long)]
        no_recursive: bool,
    },
    /// Compare archive entries against a filesystem tree.
    Verify {
        container: PathBuf,
        fs_root: PathBuf,
        /// Compare ownership numerically instead of by name.
        #[arg(long)]
        numeric_ids: bool,
        /// Also compare uid/gid/permissions/mtime.
        #[arg(long)]
        check_attributes: bool,
        /// Check only the top-level entries.
        #[arg(long)]
        no_recursive: bool,
    },
    /// Delete entries from the container.
    Delete {
        container: PathBuf,
        paths: Vec<String>,
    },
    /// Re-read file contents and check stored checksums.
    Test {
        container: PathBuf,
        /// Check only the top-level entries.
        #[arg(long)]
        no_recursive: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "h5ar=debug" } else { "h5ar=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("h5ar: {err}");
            ExitCode::from(2)
        }
    }
}

/// Runs the selected command; `Ok(false)` means partial success.
fn run(cli: Cli) -> h5ar::Result<bool> {
    let mut strategy = match &cli.options {
        Some(file) => ArchivingStrategy::from_toml_file(file)?,
        None => ArchivingStrategy::default(),
    };
    let verbose = cli.verbose;
    let errors: Arc<ContinueStrategy> = Arc::new(ContinueStrategy::default());

    let complete = match cli.command {
        Command::Archive { container, fs_paths, no_compress, chunk_size, store_ownership } => {
            if no_compress {
                strategy.compress = false;
            }
            if let Some(chunk) = chunk_size {
                strategy.chunk_size = chunk;
            }
            strategy.store_owner_and_permissions |= store_ownership;

            let archiver = open(&container, strategy, errors.clone(), false)?;
            for fs_path in fs_paths {
                let mut visit = |path: &str| {
                    if verbose {
                        println!("a {path}");
                    }
                };
                archiver.archive(&fs_path, true, Some(&mut visit))?;
            }
            archiver.close()?;
            true
        }
        Command::List { container, path, no_recursive } => {
            let archiver = open(&container, strategy, errors.clone(), true)?;
            let entries =
                archiver.list(path.as_deref().unwrap_or("/"), !no_recursive)?;
            for entry in &entries {
                println!("{}", entry.describe());
            }
            true
        }
        Command::Extract { container, dest, path, restore_attributes, no_recursive } => {
            strategy.restore_attributes |= restore_attributes;
            let archiver = open(&container, strategy, errors.clone(), true)?;
            let entries = archiver.extract(&path, &dest, !no_recursive)?;
            report_failures(&entries, verbose)
        }
        Command::Verify { container, fs_root, numeric_ids, check_attributes, no_recursive } => {
            strategy.numeric_ids |= numeric_ids;
            strategy.check_attributes |= check_attributes;
            let archiver = open(&container, strategy, errors.clone(), true)?;
            let entries = archiver.verify("/", &fs_root, !no_recursive)?;
            report_failures(&entries, verbose)
        }
        Command::Delete { container, paths } => {
            let archiver = open(&container, strategy, errors.clone(), false)?;
            let mut visit = |path: &str| {
                if verbose {
                    println!("d {path}");
                }
            };
            archiver.delete(&paths, Some(&mut visit))?;
            archiver.close()?;
            true
        }
        Command::Test { container, no_recursive } => {
            let archiver = open(&container, strategy, errors.clone(), true)?;
            let entries = archiver.test(!no_recursive)?;
            report_failures(&entries, verbose)
        }
    };

    Ok(complete && errors.failure_count() == 0)
}

fn open(
    container: &PathBuf,
    strategy: ArchivingStrategy,
    errors: Arc<ContinueStrategy>,
    read_only: bool,
) -> h5ar::Result<Archiver> {
    let storage = Arc::new(MemoryStorage::open_path(container)?);
    Ok(Archiver::with_options(storage, strategy, errors, read_only))
}

/// Prints failed entries; returns whether everything was ok.
fn report_failures(entries: &[ArchiveEntry], verbose: bool) -> bool {
    let mut ok = true;
    for entry in entries {
        if !entry.is_ok() {
            ok = false;
            match entry.failure() {
                Some(reason) => eprintln!("FAILED {}: {reason}", entry.path),
                None => eprintln!("FAILED {}", entry.path),
            }
        } else if verbose {
            println!("ok {}", entry.path);
        }
    }
    ok
}
