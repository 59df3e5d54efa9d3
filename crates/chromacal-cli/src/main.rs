//! CLI for chromacal — lighting-robust colour classification for tiled objects.

mod commands;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chromacal")]
#[command(about = "chromacal — calibrate pixels to tiles, then predict tile colours")]
#[command(version = chromacal_core::VERSION)]
struct Cli {
    /// Directory holding observations and assignments
    #[arg(long, global = true, default_value = "chromacal")]
    workspace: PathBuf,

    /// JSON configuration file (missing fields use defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest calibration session files and run refinement
    Ingest {
        /// Session JSON files, applied in the order given
        #[arg(required = true)]
        sessions: Vec<PathBuf>,

        /// Only store the observations; refine on a later ingest
        #[arg(long)]
        no_refine: bool,
    },

    /// Show assignment states, or one pixel in detail
    Status {
        /// Show a single pixel
        #[arg(long)]
        pixel: Option<u32>,

        /// List every active and converged pixel
        #[arg(long)]
        all: bool,
    },

    /// Accept or reject converged pixels. Ctrl+C cancels the current review.
    Review {
        /// Accept every pending pixel without prompting
        #[arg(long)]
        accept_all: bool,
    },

    /// Finalize a pixel onto a tile by hand (for unresolved pixels)
    Finalize {
        pixel: u32,
        tile: u32,
    },

    /// Per-tile colour confidences for a live image
    Predict {
        /// Image JSON: an array of [r, g, b] per pixel
        image: PathBuf,

        /// Aggregation percentile (0-100)
        #[arg(long)]
        percentile: Option<f64>,

        /// Upper bound on neighbours per density estimate
        #[arg(long)]
        k: Option<usize>,

        /// Reservoir-sample tiles down to this many pixels
        #[arg(long)]
        max_pixels: Option<usize>,

        /// Write the full reports as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Write the observation store (and optionally assignments) to a file
    Export {
        /// Target path; `.gz` compresses
        output: PathBuf,

        /// Also write the refiner state here
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match commands::load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let workspace = commands::Workspace::new(cli.workspace);

    let result = match cli.command {
        Commands::Ingest {
            sessions,
            no_refine,
        } => commands::ingest::run(&workspace, &config, &sessions, !no_refine),
        Commands::Status { pixel, all } => commands::status::run(&workspace, &config, pixel, all),
        Commands::Review { accept_all } => commands::review::run(&workspace, &config, accept_all),
        Commands::Finalize { pixel, tile } => {
            commands::review::finalize(&workspace, &config, pixel, tile)
        }
        Commands::Predict {
            image,
            percentile,
            k,
            max_pixels,
            output,
        } => {
            if let Some(p) = percentile {
                config.prediction.percentile = p;
            }
            if let Some(k) = k {
                config.prediction.k = k;
            }
            if max_pixels.is_some() {
                config.prediction.max_pixels_per_tile = max_pixels;
            }
            config.validate().and_then(|()| {
                commands::predict::run(&workspace, &config, &image, output.as_deref())
            })
        }
        Commands::Export { output, state } => {
            commands::export::run(&workspace, &config, &output, state.as_deref())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
