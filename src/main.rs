use std::path::PathBuf;

use clap::{Parser, Subcommand};

use baycat::commands;
use baycat::commands::sync::SyncArgs;

#[derive(Parser)]
#[command(
    name = "baycat",
    about = "Differential one-way sync between a local directory and an object store"
)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync from SRC to DST
    ///
    /// Each side is a local path or an object-store URI like
    /// scheme://bucket/prefix; at most one side may be a store.
    Sync {
        src: String,
        dst: String,
        /// Dry run (doesn't change anything on disk or transfer files)
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
        /// Quiets down everything but errors and warnings
        #[arg(short, long)]
        quiet: bool,
        /// Print operation counters after the run
        #[arg(long)]
        print_counters: bool,
    },

    /// Manage manifest files
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Create a new manifest for the given directory
    Create {
        root_path: PathBuf,
        /// Path to save the manifest at (default is ROOT_PATH/.baycat/manifest)
        #[arg(short = 'o', long = "manifest")]
        manifest: Option<PathBuf>,
        /// Number of workers to use when computing checksums
        #[arg(short = 'c', long = "pool-size", default_value_t = 0)]
        pool_size: usize,
        /// Skip checksum computation
        #[arg(long)]
        skip_checksums: bool,
        /// Enable overwriting an existing manifest file
        #[arg(short = 'w', long)]
        overwrite: bool,
    },

    /// Refresh an existing manifest from the tree
    Update {
        root_path: PathBuf,
        /// Path of the manifest (default is ROOT_PATH/.baycat/manifest)
        #[arg(short = 'o', long = "manifest")]
        manifest: Option<PathBuf>,
        /// Number of workers to use when computing checksums (not persisted)
        #[arg(short = 'c', long = "pool-size")]
        pool_size: Option<usize>,
        /// Recompute and compare every digest
        #[arg(long)]
        force_checksums: bool,
    },

    /// Estimate object-store costs for a tree
    EstimateCost {
        root_path: PathBuf,
        /// Monthly storage price per GB
        #[arg(long, default_value_t = 0.023)]
        storage_price_gb_month: f64,
        /// Price per 1,000 PUT requests
        #[arg(long, default_value_t = 0.005)]
        put_price_1k: f64,
    },
}

fn init_logging(level: Option<&str>) {
    // An explicit BAYCAT_LOG in the environment wins over the flag.
    let env = env_logger::Env::new().filter_or("BAYCAT_LOG", level.unwrap_or("warn"));
    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let result = match cli.command {
        Commands::Sync {
            src,
            dst,
            dry_run,
            verbose,
            quiet,
            print_counters,
        } => {
            let args = SyncArgs {
                dry_run,
                verbose,
                quiet,
                print_counters,
                pool_size: 0,
            };
            commands::sync::run(&src, &dst, &args).map(|report| report.success)
        }

        Commands::Manifest { command } => match command {
            ManifestCommands::Create {
                root_path,
                manifest,
                pool_size,
                skip_checksums,
                overwrite,
            } => commands::manifest::create(
                &root_path,
                manifest.as_deref(),
                pool_size,
                skip_checksums,
                overwrite,
            )
            .map(|()| true),

            ManifestCommands::Update {
                root_path,
                manifest,
                pool_size,
                force_checksums,
            } => commands::manifest::update(
                &root_path,
                manifest.as_deref(),
                pool_size,
                force_checksums,
            )
            .map(|()| true),

            ManifestCommands::EstimateCost {
                root_path,
                storage_price_gb_month,
                put_price_1k,
            } => commands::manifest::estimate_cost(
                &root_path,
                storage_price_gb_month,
                put_price_1k,
            )
            .map(|()| true),
        },
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    }
}
