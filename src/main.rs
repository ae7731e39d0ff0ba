use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};

use sift::config::SearchConfig;
use sift::maintenance::parse_range;
use sift::maze::Maze;
use sift::problem::FrameGroup;
use sift::{Engine, Outcome, SiftError};

#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Disk-based breadth-first search over puzzle state graphs", long_about = None)]
struct Cli {
    /// Working directory for all node files (default: SIFT_DIR or ".")
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Worker threads including the driver (default: SIFT_THREADS or all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Maintain the aggregate union of closed files
    #[arg(long)]
    use_all: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sort, filter and expand open nodes; seeds a fresh search when no
    /// node files exist yet
    Search {
        /// Stop before this frame group
        max_group: Option<FrameGroup>,
    },
    /// Print every state of one frame group, open or closed
    Dump { group: FrameGroup },
    /// Print one randomly picked state of a frame group
    Sample { group: FrameGroup },
    /// Count duplicate states in two sorted node files
    Compare { file_a: PathBuf, file_b: PathBuf },
    /// Check that a node file is sorted, unique and well formed
    Verify { file: PathBuf },
    /// Deduplicate open files chunk by chunk (single read and write)
    PackOpen { range: Vec<FrameGroup> },
    /// Sort and deduplicate open files, newest group first
    SortOpen { range: Vec<FrameGroup> },
    /// Filter every open file in place against the closed sets
    FilterOpen,
    /// Sort and filter open files one group at a time
    SeqFilterOpen { range: Vec<FrameGroup> },
    /// Re-expand closed groups to rebuild missing open files
    RegenerateOpen { range: Vec<FrameGroup> },
    /// Build the aggregate union of all closed files
    CreateAll,
    /// Scan node files for goal states and trace the first hit
    FindExit { range: Vec<FrameGroup> },
    /// Render the solution recorded in a partial trace checkpoint
    WritePartialSolution,
    /// Merge per-frame files into frame-group files
    Convert { range: Vec<FrameGroup> },
    /// Split closed frame-group files back into per-frame files
    Unpack { range: Vec<FrameGroup> },
    /// Count closed records per frame inside each group
    Count { range: Vec<FrameGroup> },
}

fn main() {
    let started = Instant::now();
    let code = match run() {
        Ok(outcome) => match outcome {
            Outcome::Ok => 0,
            Outcome::Stopped => 1,
            Outcome::NotFound => 2,
        },
        Err(e) => {
            println!("\n{}", e);
            3
        }
    };
    let elapsed = started.elapsed();
    println!("Time: {}.{:03} seconds.", elapsed.as_secs(), elapsed.subsec_millis());
    std::process::exit(code);
}

fn run() -> Result<Outcome, SiftError> {
    let cli = Cli::parse();

    let mut cfg = SearchConfig::from_env();
    if let Some(dir) = cli.dir {
        cfg.dir = dir;
    }
    if let Some(threads) = cli.threads {
        cfg.threads = threads.max(1);
    }
    if cli.use_all {
        cfg.use_all = true;
    }

    let args: Vec<String> = std::env::args().collect();
    println!("[sift] command line: {}", args.join(" "));
    cfg.print_summary::<Maze>();
    let engine = Engine::new(Maze::sample(), cfg)?;

    if engine.layout().stop_file().exists() {
        println!("[sift] stop file present");
        return Ok(Outcome::Stopped);
    }

    let groups = engine.groups();
    match cli.command {
        Commands::Search { max_group } => engine.search(max_group),
        Commands::Dump { group } => engine.dump(group).map(|_| Outcome::Ok),
        Commands::Sample { group } => engine.sample(group).map(|_| Outcome::Ok),
        Commands::Compare { file_a, file_b } => {
            engine.compare(&file_a, &file_b).map(|_| Outcome::Ok)
        }
        Commands::Verify { file } => engine.verify(&file).map(|_| Outcome::Ok),
        Commands::PackOpen { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.pack_open(first, last).map(|_| Outcome::Ok)
        }
        Commands::SortOpen { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.sort_open(first, last)
        }
        Commands::FilterOpen => engine.filter_open().map(|_| Outcome::Ok),
        Commands::SeqFilterOpen { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.seq_filter_open(first, last)
        }
        Commands::RegenerateOpen { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.regenerate_open(first, last)
        }
        Commands::CreateAll => engine.create_all().map(|_| Outcome::Ok),
        Commands::FindExit { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.find_exit(first, last)
        }
        Commands::WritePartialSolution => engine.write_partial_solution().map(|_| Outcome::Ok),
        Commands::Convert { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.convert(first, last).map(|_| Outcome::Ok)
        }
        Commands::Unpack { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.unpack(first, last).map(|_| Outcome::Ok)
        }
        Commands::Count { range } => {
            let (first, last) = parse_range(&range, groups)?;
            engine.count(first, last).map(|_| Outcome::Ok)
        }
    }
}
