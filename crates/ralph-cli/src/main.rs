mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, story::StorySubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ralph",
    about = "Turn a story ledger into pull requests one story at a time, then merge the stack",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .ralph/ or .git/)
    #[arg(long, global = true, env = "RALPH_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Base branch PRs target (default: config, then "main")
    #[arg(long, global = true, env = "BASE_BRANCH")]
    base: Option<String>,

    /// Story ledger path (default: config, then prd.json)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config and ledger
    Init,

    /// Run one iteration: next story to an open pull request
    Iterate {
        /// Wait for CI and squash-merge the new PR
        #[arg(long)]
        merge: bool,

        /// Seconds to wait for CI before leaving the PR open
        #[arg(long, value_name = "SECS")]
        merge_timeout: Option<u64>,
    },

    /// Iterate until the ledger is drained or an iteration fails
    Loop {
        /// Stop after this many iterations
        #[arg(long, value_name = "N")]
        max_iterations: Option<usize>,

        #[arg(long)]
        merge: bool,

        #[arg(long, value_name = "SECS")]
        merge_timeout: Option<u64>,
    },

    /// Merge every open PR against the base branch, oldest first
    MergeStack {
        /// Show the merge order without merging anything
        #[arg(long)]
        dry_run: bool,

        /// Wait for CI on each PR before merging it
        #[arg(long)]
        wait: bool,

        /// Seconds to wait for CI per PR
        #[arg(long, value_name = "SECS")]
        wait_timeout: Option<u64>,
    },

    /// Inspect and adjust the story ledger
    Story {
        #[command(subcommand)]
        subcommand: StorySubcommand,
    },

    /// Inspect and validate .ralph/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Iterate { .. } | Commands::Loop { .. } | Commands::MergeStack { .. } => {
            tracing::Level::INFO
        }
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let overrides = cmd::Overrides {
        base: cli.base,
        ledger: cli.ledger,
    };

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, &overrides),
        Commands::Iterate {
            merge,
            merge_timeout,
        } => cmd::iterate::run(&root, &overrides, merge, merge_timeout, cli.json),
        Commands::Loop {
            max_iterations,
            merge,
            merge_timeout,
        } => cmd::iterate::run_loop(
            &root,
            &overrides,
            max_iterations,
            merge,
            merge_timeout,
            cli.json,
        ),
        Commands::MergeStack {
            dry_run,
            wait,
            wait_timeout,
        } => cmd::merge_stack::run(&root, &overrides, dry_run, wait, wait_timeout, cli.json),
        Commands::Story { subcommand } => cmd::story::run(&root, &overrides, subcommand, cli.json),
        Commands::Config { subcommand } => {
            cmd::config::run(&root, &overrides, subcommand, cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
