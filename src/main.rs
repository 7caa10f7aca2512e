//! Krait - an embedded JavaScript task executor powered by the Boa JS engine
//!
//! Command-line harness: submits JavaScript files (or inline code) to a
//! thread pool any number of times, waits for quiescence and prints the pool
//! statistics.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use colored::Colorize;
use miette::{IntoDiagnostic, Result, miette};

use krait::{PoolConfig, ThreadPool, WaitOutcome, compile_script, logging};

#[derive(Parser)]
#[command(name = "krait")]
#[command(author, version, about = "An embedded JavaScript task executor powered by Boa")]
struct Cli {
    /// JavaScript files to execute through the pool
    files: Vec<PathBuf>,

    /// Evaluate JavaScript source from the command line
    #[arg(short, long)]
    eval: Option<String>,

    /// Times each input is submitted
    #[arg(short, long, default_value_t = 1)]
    iterations: usize,

    /// Worker thread count (defaults to the number of CPUs)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Maximum live contexts per worker runtime
    #[arg(long, default_value_t = 8)]
    max_contexts: usize,

    /// Global queue capacity (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    queue_size: usize,

    /// Per-worker local queue capacity (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    local_queue_size: usize,

    /// Disable work stealing between workers
    #[arg(long)]
    no_steal: bool,

    /// Enable dynamic pool sizing
    #[arg(long)]
    dynamic: bool,

    /// Idle-worker threshold used by dynamic sizing
    #[arg(long, default_value_t = 2)]
    idle_threshold: usize,

    /// Seconds to wait for all tasks to complete
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Pre-compile each input to a task image and submit that instead
    #[arg(long)]
    bytecode: bool,
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let mut sources: Vec<(String, String)> = Vec::new();
    if let Some(code) = &cli.eval {
        sources.push(("<eval>".into(), code.clone()));
    }
    for file in &cli.files {
        let code = std::fs::read_to_string(file).into_diagnostic()?;
        sources.push((file.display().to_string(), code));
    }
    if sources.is_empty() {
        return Err(miette!("nothing to run: pass JavaScript files or --eval"));
    }

    let config = PoolConfig {
        thread_count: cli.threads.unwrap_or_else(|| num_cpus::get().max(1)),
        max_contexts: cli.max_contexts,
        global_queue_size: cli.queue_size,
        local_queue_size: cli.local_queue_size,
        enable_work_stealing: !cli.no_steal,
        idle_threshold: cli.idle_threshold,
        dynamic_sizing: cli.dynamic,
    };

    println!("Creating thread pool with {} threads", config.thread_count);
    let pool = ThreadPool::new(config).map_err(|err| miette!("{err}"))?;

    let mut submitted = 0usize;
    for (name, source) in &sources {
        let image = if cli.bytecode {
            Some(compile_script(source).map_err(|err| miette!("{name}: {err}"))?)
        } else {
            None
        };
        for _ in 0..cli.iterations {
            let result = match &image {
                Some(image) => pool.add_bytecode_task(image, |_completion| {}),
                None => pool.add_script_task(source, |_completion| {}),
            };
            match result {
                Ok(_) => submitted += 1,
                Err(err) => eprintln!("{}: {name}: {err}", "Error".red()),
            }
        }
    }

    println!("Added {submitted} tasks to the queue");
    println!("Waiting for tasks to complete...");
    match pool.wait_for_idle(Some(Duration::from_secs(cli.timeout))) {
        WaitOutcome::Idle => println!("{}", "All tasks completed.".green()),
        WaitOutcome::TimedOut => {
            println!("{}", "Timed out waiting for tasks to complete.".yellow());
        }
    }

    let stats = pool.stats();
    println!();
    println!("================= Thread Pool Statistics =================");
    println!("| {:<20} | {:<10} |", "Active threads", stats.active_threads);
    println!("| {:<20} | {:<10} |", "Idle threads", stats.idle_threads);
    println!("| {:<20} | {:<10} |", "Queued tasks", stats.queued_tasks);
    println!(
        "| {:<20} | {:<10} |",
        "Completed tasks",
        stats.completed_tasks.to_string().green()
    );
    println!(
        "| {:<20} | {:<9.2}% |",
        "Thread utilization", stats.thread_utilization
    );
    if let Some(avg) = stats.avg_execution_time {
        println!("| {:<20} | {:<10} |", "Avg execution time", format!("{avg:?}"));
    }
    println!("==========================================================");

    pool.shutdown();
    Ok(())
}
