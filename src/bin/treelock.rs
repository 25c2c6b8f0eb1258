//! Binary entry point for the treelock stress and inspection CLI.
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use treelock::logging::init_logging;
use treelock::primitives::concurrency::LockStack;
use treelock::storage::tree::{
    Item, MemStore, NodeInfo, SortedLayout, TreeStatsSnapshot, WalkControl, WalkDirection, WalkItem,
    WalkStart,
};
use treelock::storage::TreeOptions;
use treelock::types::{Key, Level, LEAF_LEVEL};
use treelock::Tree;

#[derive(Parser, Debug)]
#[command(
    name = "treelock",
    version,
    about = "Stress and inspect the concurrent tree engine",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "TOML file with tree options")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "TREELOCK_LOG",
        default_value = "warn",
        help = "Tracing filter directive"
    )]
    log: String,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a seeded concurrent workload and verify the final tree
    Stress(StressArgs),
    /// Build a tree from a key range and print its nodes and a walk
    Dump(DumpArgs),
    /// Print the effective tree options as TOML
    Config,
}

#[derive(Args, Debug)]
struct StressArgs {
    #[arg(long, default_value_t = 4, help = "Worker threads")]
    threads: usize,

    #[arg(long, default_value_t = 10_000, help = "Operations per thread")]
    ops: u64,

    #[arg(long, default_value_t = 4096, help = "Distinct object ids per thread")]
    keys: u64,

    #[arg(long, default_value_t = 42, help = "Workload seed")]
    seed: u64,

    #[arg(long, help = "Override node capacity")]
    node_capacity: Option<usize>,

    #[arg(long, help = "Override result cache slots")]
    cache_slots: Option<usize>,
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[arg(long, default_value_t = 32, help = "Number of keys to insert")]
    keys: u64,

    #[arg(long, default_value_t = 42, help = "Insertion order seed")]
    seed: u64,

    #[arg(long, value_enum, help = "Walk direction (defaults to the configured one)")]
    direction: Option<DirectionArg>,

    #[arg(long, help = "Override node capacity")]
    node_capacity: Option<usize>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DirectionArg {
    Rightward,
    Leftward,
}

impl From<DirectionArg> for WalkDirection {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Rightward => WalkDirection::Rightward,
            DirectionArg::Leftward => WalkDirection::Leftward,
        }
    }
}

#[derive(Debug, Serialize)]
struct StressReport {
    threads: usize,
    ops_per_thread: u64,
    seed: u64,
    inserts: u64,
    deletes: u64,
    lookups: u64,
    walks: u64,
    mismatches: u64,
    items: u64,
    height: Level,
    elapsed_ms: u128,
    verified: bool,
    stats: TreeStatsSnapshot,
}

#[derive(Debug, Default)]
struct WorkerOutcome {
    inserts: u64,
    deletes: u64,
    lookups: u64,
    walks: u64,
    mismatches: u64,
    live: HashMap<Key, u64>,
}

#[derive(Debug, Serialize)]
struct DumpReport {
    height: Level,
    nodes: Vec<NodeInfo>,
    walk: Vec<WalkEntry>,
}

#[derive(Debug, Serialize)]
struct WalkEntry {
    level: Level,
    key: String,
    addr: u64,
    pos: usize,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;
    let options = match cli.config.as_deref() {
        Some(path) => TreeOptions::load(path)?,
        None => TreeOptions::default(),
    };

    match cli.command {
        Command::Stress(args) => {
            let report = stress(options, &args)?;
            emit(&cli.format, &report, || print_stress_text(&report))?;
            if !report.verified {
                std::process::exit(2);
            }
        }
        Command::Dump(args) => {
            let report = dump(options, &args)?;
            emit(&cli.format, &report, || print_dump_text(&report))?;
        }
        Command::Config => {
            print!("{}", options.to_toml_string()?);
        }
    }
    Ok(())
}

fn build_tree(options: TreeOptions, blocks: u64) -> Result<Tree, Box<dyn Error>> {
    options.validate()?;
    Ok(Tree::create(Arc::new(MemStore::new(blocks)), Arc::new(SortedLayout), options)?)
}

fn stress(mut options: TreeOptions, args: &StressArgs) -> Result<StressReport, Box<dyn Error>> {
    if let Some(capacity) = args.node_capacity {
        options = options.node_capacity(capacity);
    }
    if let Some(slots) = args.cache_slots {
        options = options.cache_slots(slots);
    }
    let threads = args.threads.max(1);
    let blocks = (threads as u64).saturating_mul(args.ops).saturating_add(1024);
    let tree = Arc::new(build_tree(options, blocks)?);
    let barrier = Arc::new(Barrier::new(threads));
    let started = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|worker| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            let (ops, keys, seed) = (args.ops, args.keys.max(1), args.seed);
            thread::spawn(move || -> treelock::Result<WorkerOutcome> {
                barrier.wait();
                run_worker(&tree, worker as u64, ops, keys, seed)
            })
        })
        .collect();

    let mut live: HashMap<Key, u64> = HashMap::new();
    let mut totals = WorkerOutcome::default();
    for handle in handles {
        let outcome = handle.join().map_err(|_| "stress worker panicked")??;
        totals.inserts += outcome.inserts;
        totals.deletes += outcome.deletes;
        totals.lookups += outcome.lookups;
        totals.walks += outcome.walks;
        totals.mismatches += outcome.mismatches;
        live.extend(outcome.live);
    }
    let elapsed_ms = started.elapsed().as_millis();

    let stack = LockStack::new();
    let mut seen: HashMap<Key, u64> = HashMap::new();
    let mut in_order = true;
    let mut last: Option<Key> = None;
    let mut collect = |item: &WalkItem<'_>| -> treelock::Result<WalkControl> {
        if item.level == LEAF_LEVEL {
            let key = item.item.key;
            in_order &= last.map(|prev| prev <= key).unwrap_or(true);
            last = Some(key);
            *seen.entry(key).or_default() += 1;
        }
        Ok(WalkControl::Continue)
    };
    tree.walk(&stack, WalkStart::Edge, WalkDirection::Rightward, &mut collect)?;
    live.retain(|_, count| *count > 0);
    let verified = totals.mismatches == 0 && in_order && seen == live && tree.check_links().is_ok();
    if !verified {
        tracing::error!(
            expected = live.len(),
            found = seen.len(),
            in_order,
            mismatches = totals.mismatches,
            "stress verification failed"
        );
    }
    tree.stats().emit_tracing();

    Ok(StressReport {
        threads,
        ops_per_thread: args.ops,
        seed: args.seed,
        inserts: totals.inserts,
        deletes: totals.deletes,
        lookups: totals.lookups,
        walks: totals.walks,
        mismatches: totals.mismatches,
        items: seen.values().sum(),
        height: tree.height(),
        elapsed_ms,
        verified,
        stats: tree.stats().snapshot(),
    })
}

/// Each worker owns the keys with its id as offset, so the final contents
/// can be predicted from per-worker bookkeeping.
fn run_worker(tree: &Tree, worker: u64, ops: u64, keys: u64, seed: u64) -> treelock::Result<WorkerOutcome> {
    let stack = LockStack::new();
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(worker));
    let mut outcome = WorkerOutcome::default();
    for _ in 0..ops {
        let key = Key::new(rng.gen_range(0..keys), worker);
        match rng.gen_range(0..100u32) {
            0..=39 => {
                tree.insert(&stack, Item::data(key, worker.to_le_bytes().to_vec()))?;
                *outcome.live.entry(key).or_default() += 1;
                outcome.inserts += 1;
            }
            40..=59 => {
                if tree.delete(&stack, &key)?.is_some() {
                    let count = outcome.live.entry(key).or_default();
                    *count = count.saturating_sub(1);
                    outcome.deletes += 1;
                }
            }
            60..=94 => {
                let found = tree.get(&stack, &key)?;
                let expected = outcome.live.get(&key).copied().unwrap_or(0) > 0;
                if found.is_some() != expected {
                    tracing::error!(key = %key, worker, expected, "lookup disagrees with the workload");
                    outcome.mismatches += 1;
                }
                outcome.lookups += 1;
            }
            _ => {
                let mut budget = 16u32;
                let mut visitor = |_: &WalkItem<'_>| -> treelock::Result<WalkControl> {
                    budget = budget.saturating_sub(1);
                    Ok(if budget == 0 { WalkControl::Stop } else { WalkControl::Continue })
                };
                tree.walk_default(&stack, WalkStart::Key(key), &mut visitor)?;
                outcome.walks += 1;
            }
        }
    }
    Ok(outcome)
}

fn dump(mut options: TreeOptions, args: &DumpArgs) -> Result<DumpReport, Box<dyn Error>> {
    if let Some(capacity) = args.node_capacity {
        options = options.node_capacity(capacity);
    }
    let direction = args.direction.map(WalkDirection::from).unwrap_or(options.walk_direction);
    let tree = build_tree(options, args.keys.saturating_mul(2).saturating_add(64))?;
    let stack = LockStack::new();
    let mut order: Vec<u64> = (0..args.keys).collect();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(args.seed));
    for object in order {
        tree.insert(&stack, Item::data(Key::new(object, 0), object.to_le_bytes().to_vec()))?;
    }

    let mut walk = Vec::new();
    let mut record = |item: &WalkItem<'_>| -> treelock::Result<WalkControl> {
        walk.push(WalkEntry {
            level: item.level,
            key: item.item.key.to_string(),
            addr: item.addr.0,
            pos: item.pos,
        });
        Ok(WalkControl::Continue)
    };
    tree.walk(&stack, WalkStart::Edge, direction, &mut record)?;
    Ok(DumpReport {
        height: tree.height(),
        nodes: tree.loaded_node_info(),
        walk,
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_stress_text(report: &StressReport) {
    println!("Stress run");
    println!("  threads         : {}", report.threads);
    println!("  ops per thread  : {}", report.ops_per_thread);
    println!("  seed            : {}", report.seed);
    println!("  inserts/deletes : {}/{}", report.inserts, report.deletes);
    println!("  lookups/walks   : {}/{}", report.lookups, report.walks);
    println!("  mismatches      : {}", report.mismatches);
    println!("  live items      : {}", report.items);
    println!("  height          : {}", report.height);
    println!("  elapsed         : {} ms", report.elapsed_ms);
    println!("  verified        : {}", report.verified);
    let stats = &report.stats;
    println!("Tree statistics");
    println!("  searches        : {}", stats.searches);
    println!("  cache hit/miss  : {}/{}", stats.cache_hits, stats.cache_misses);
    println!("  restarts        : {}", stats.restarts);
    println!("  stale nodes     : {}", stats.stale_nodes);
    println!("  deadlock yields : {}", stats.deadlock_yields);
    println!("  contention waits: {}", stats.contention_waits);
    println!("  splits/removals : {}/{}", stats.splits, stats.removals);
}

fn print_dump_text(report: &DumpReport) {
    println!("height {}", report.height);
    for node in &report.nodes {
        let dk = node
            .dk
            .map(|(left, right)| format!("[{left}, {right})"))
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "node {:>5} level {} items {:>3} dk {} left {:?} right {:?}",
            node.addr, node.level, node.items, dk, node.left, node.right
        );
    }
    println!("walk");
    for entry in &report.walk {
        let indent = "  ".repeat(usize::from(report.height.saturating_sub(entry.level)));
        println!("  {indent}{} (node {} pos {})", entry.key, entry.addr, entry.pos);
    }
}
