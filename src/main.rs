use clap::{ArgAction, ArgGroup, CommandFactory, Parser};
use clap::error::ErrorKind;
use fatar::archive::{Archive, ArchiveError, ArchiveOptions, CommitMode, Verbosity};
use fatar::table::{EntryName, TableEntry};
use log::LevelFilter;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "fatar", version, about = "Single-file archives with a 256-slot allocation table")]
#[command(group(
    ArgGroup::new("operation")
        .required(true)
        .multiple(false)
        .args(["create", "extract", "list", "delete", "update", "append", "pack", "check"]),
))]
struct Cli {
    /// Create a new archive, adding FILES if given
    #[arg(short = 'c', long)]
    create: bool,
    /// Extract every file into --directory
    #[arg(short = 'x', long)]
    extract: bool,
    /// List the allocation table
    #[arg(short = 't', long)]
    list: bool,
    /// Delete entries; each FILE names an entry by its final path component
    #[arg(short = 'd', long)]
    delete: bool,
    /// Overwrite entries in place from same-named FILES
    #[arg(short = 'u', long)]
    update: bool,
    /// Append FILES to an existing archive
    #[arg(short = 'r', long)]
    append: bool,
    /// Compact the archive, reclaiming deleted blocks
    #[arg(short = 'p', long)]
    pack: bool,
    /// Check the table against the stored data
    #[arg(short = 'k', long)]
    check: bool,

    /// Archive to operate on
    #[arg(short = 'f', long = "file", value_name = "ARCHIVE", required = true)]
    archive: PathBuf,
    /// More output; repeat for step-by-step tracing
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Output directory for --extract
    #[arg(short = 'C', long, default_value = ".")]
    directory: PathBuf,
    /// Edit the archive directly instead of committing a staged copy
    #[arg(long)]
    in_place: bool,
    /// List empty slots too
    #[arg(long, requires = "list")]
    all: bool,
    /// List as JSON
    #[arg(long, requires = "list")]
    json: bool,

    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    if (cli.delete || cli.update) && cli.files.is_empty() {
        Cli::command()
            .error(ErrorKind::MissingRequiredArgument, "--delete and --update need at least one FILE")
            .exit();
    }

    match run(&cli) {
        Ok(true)  => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("fatar: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the operation ran but some files failed.
fn run(cli: &Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let opts = ArchiveOptions {
        verbosity:  Verbosity(cli.verbose),
        commit:     if cli.in_place { CommitMode::InPlace } else { CommitMode::Staged },
        output_dir: cli.directory.clone(),
    };
    let ar = Archive::new(&cli.archive, opts);

    // ── Create / append ──────────────────────────────────────────────────────
    if cli.create || cli.append {
        let report = if cli.create { ar.create(&cli.files)? } else { ar.append(&cli.files)? };
        for (path, e) in &report.failed {
            eprintln!("fatar: {}: {e}", path.display());
        }
        if cli.append || !cli.files.is_empty() {
            println!("{} file(s) added to {}", report.added.len(), cli.archive.display());
        }
        return Ok(report.is_complete());
    }

    // ── Extract ──────────────────────────────────────────────────────────────
    if cli.extract {
        let report = ar.extract()?;
        for (name, e) in &report.failed {
            eprintln!("fatar: {name}: {e}");
        }
        return Ok(report.is_complete());
    }

    // ── List ─────────────────────────────────────────────────────────────────
    if cli.list {
        let table = ar.list()?;
        let rows: Vec<ListedSlot> = table
            .slots()
            .iter()
            .enumerate()
            .filter(|(_, s)| cli.all || !s.is_empty())
            .map(|(slot, s)| ListedSlot { slot, occupied: !s.is_empty(), entry: s.entry() })
            .collect();
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            print_table(&rows);
        }
        return Ok(true);
    }

    // ── Delete / update ──────────────────────────────────────────────────────
    if cli.delete || cli.update {
        let mut ok = true;
        for file in &cli.files {
            let result = if cli.delete {
                EntryName::from_path(file)
                    .map_err(ArchiveError::from)
                    .and_then(|name| ar.delete(name.as_str()))
            } else {
                ar.update(file)
            };
            match result {
                Ok(entry) if cli.delete => println!("deleted {}", entry.name),
                Ok(entry)               => println!("updated {} ({} bytes)", entry.name, entry.byte_size),
                Err(e) => {
                    eprintln!("fatar: {e}");
                    ok = false;
                }
            }
        }
        return Ok(ok);
    }

    // ── Pack ─────────────────────────────────────────────────────────────────
    if cli.pack {
        let report = ar.pack()?;
        println!(
            "packed {}: {} entries moved, {} bytes reclaimed",
            cli.archive.display(), report.relocated, report.reclaimed_bytes
        );
        return Ok(true);
    }

    // ── Check ────────────────────────────────────────────────────────────────
    let report = ar.check()?;
    for scanned in report.entries.iter().filter(|s| !s.health.is_healthy()) {
        println!("  slot {:>3}  {:<11}  {:?}", scanned.slot, scanned.entry.name.as_str(), scanned.health);
    }
    for (a, b) in &report.overlaps {
        println!("  slots {a} and {b} overlap");
    }
    for name in &report.duplicates {
        println!("  {name} appears more than once");
    }
    println!("{}", report.summary());
    Ok(report.is_clean())
}

// ── helpers ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ListedSlot<'a> {
    slot:     usize,
    occupied: bool,
    #[serde(flatten)]
    entry:    Option<&'a TableEntry>,
}

fn print_table(rows: &[ListedSlot<'_>]) {
    println!("{:>4}  {:<11}  {:>11}  {:>6}  {:>10}  {:>8}",
             "Slot", "Name", "First block", "Blocks", "Size", "Occupied");
    for row in rows {
        match row.entry {
            Some(e) => println!("{:>4}  {:<11}  {:>11}  {:>6}  {:>10}  {:>8}",
                                row.slot, e.name.as_str(), e.starting_block, e.block_count,
                                e.byte_size, row.occupied),
            None    => println!("{:>4}  {:<11}  {:>11}  {:>6}  {:>10}  {:>8}",
                                row.slot, "", "", "", "", row.occupied),
        }
    }
}
