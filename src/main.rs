use clap::{Parser, Subcommand};
use framing::data::{
    load_pitch_records, write_effect_table, write_grid_predictions, write_prediction_rows,
    write_ranking,
};
use framing::pipeline::{self, PipelineConfig};
use framing::rank::DEFAULT_RANK_SIZE;
use framing::records::Handedness;
use framing::surface::{FittedSurface, SurfaceConfig, evaluation_grid, fit_surface};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "framing",
    version,
    about = "Estimate catcher, umpire and pitcher effects on called strikes",
    long_about = "Fits a tensor-product P-spline surface for the probability that a taken pitch is \
                 called a strike, then fits crossed random intercepts for catcher, umpire and \
                 pitcher on top of it and ranks each group."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the strike-probability surface only
    #[command(about = "Fit the strike surface (outputs: surface.toml)")]
    FitSurface {
        /// Path to the pitch table (TSV, or CSV with a .csv extension)
        pitches: PathBuf,

        /// Rows drawn for the fit (default: 50000 or every row if fewer)
        #[arg(long, value_name = "N")]
        sample_size: Option<usize>,

        /// Seed for the subsample
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Internal knots per axis
        #[arg(long, default_value = "8")]
        knots: usize,

        /// Polynomial degree of both marginal spline bases
        #[arg(long, default_value = "3")]
        degree: usize,

        /// Where to write the fitted surface
        #[arg(long, default_value = "surface.toml")]
        output: PathBuf,
    },

    /// Evaluate a saved surface on a regular grid
    #[command(about = "Evaluate a fitted surface on a grid (outputs: grid.tsv)")]
    PredictGrid {
        /// Path to a surface written by fit-surface
        #[arg(long)]
        surface: PathBuf,

        /// Grid points per axis
        #[arg(long, default_value = "50")]
        steps: usize,

        /// Pitcher handedness, L or R
        #[arg(long, default_value = "R")]
        throws: String,

        /// Batter handedness, L or R
        #[arg(long, default_value = "R")]
        stands: String,

        /// Where to write the grid predictions
        #[arg(long, default_value = "grid.tsv")]
        output: PathBuf,
    },

    /// Fit both models and write predictions, effects and rankings
    #[command(
        about = "Run the full pipeline (outputs: surface.toml, predictions.tsv, effects.tsv, rankings)"
    )]
    Run {
        /// Path to the pitch table (TSV, or CSV with a .csv extension)
        pitches: PathBuf,

        /// Rows drawn for the surface fit (default: 50000 or every row if fewer)
        #[arg(long, value_name = "N")]
        sample_size: Option<usize>,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Entities listed per ranking
        #[arg(long, default_value_t = DEFAULT_RANK_SIZE)]
        top: usize,

        /// Output directory
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::FitSurface {
            pitches,
            sample_size,
            seed,
            knots,
            degree,
            output,
        } => fit_surface_command(&pitches, sample_size, seed, knots, degree, &output),
        Commands::PredictGrid {
            surface,
            steps,
            throws,
            stands,
            output,
        } => predict_grid_command(&surface, steps, &throws, &stands, &output),
        Commands::Run {
            pitches,
            sample_size,
            seed,
            top,
            output_dir,
        } => run_command(&pitches, sample_size, seed, top, &output_dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn fit_surface_command(
    pitches: &Path,
    sample_size: Option<usize>,
    seed: u64,
    knots: usize,
    degree: usize,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = load_pitch_records(pitches)?;
    println!("Loaded {} taken pitches", records.len());

    let mut config = SurfaceConfig::default();
    config.horizontal_basis.num_knots = knots;
    config.vertical_basis.num_knots = knots;
    config.horizontal_basis.degree = degree;
    config.vertical_basis.degree = degree;
    let n = PipelineConfig {
        sample_size,
        ..PipelineConfig::default()
    }
    .resolved_sample_size(records.len());

    let surface = fit_surface(&records, n, seed, &config)?;
    println!(
        "Surface fitted on {} rows: EDF {:.2}, lambdas {:?}",
        surface.num_rows, surface.edf, surface.lambdas
    );
    surface.save(output)?;
    println!("Surface saved to: {}", output.display());
    Ok(())
}

fn parse_handedness(code: &str) -> Result<Handedness, Box<dyn std::error::Error>> {
    Handedness::from_code(code)
        .ok_or_else(|| format!("'{}' is not a handedness code (expected L or R)", code).into())
}

fn predict_grid_command(
    surface_path: &Path,
    steps: usize,
    throws: &str,
    stands: &str,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let surface = FittedSurface::load(surface_path)?;
    let grid = evaluation_grid(
        surface.horizontal_range,
        surface.vertical_range,
        steps,
        parse_handedness(throws)?,
        parse_handedness(stands)?,
    );
    let predictions = surface.predict(&grid)?;
    write_grid_predictions(output, &grid, &predictions)?;
    println!("Wrote {} grid predictions to: {}", grid.len(), output.display());
    Ok(())
}

fn run_command(
    pitches: &Path,
    sample_size: Option<usize>,
    seed: u64,
    top: usize,
    output_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = load_pitch_records(pitches)?;
    println!("Loaded {} taken pitches", records.len());

    let config = PipelineConfig {
        sample_size,
        seed,
        top_n: top,
        ..PipelineConfig::default()
    };
    let output = pipeline::run(&records, &config)?;

    fs::create_dir_all(output_dir)?;
    output.surface.save(&output_dir.join("surface.toml"))?;
    write_prediction_rows(&output_dir.join("predictions.tsv"), &output.annotated)?;
    write_effect_table(&output_dir.join("effects.tsv"), &output.effects)?;

    for variance in &output.effects.variances {
        println!(
            "{:>8}: SD {:.4} across {} entities",
            variance.kind.name(),
            variance.variance.sqrt(),
            variance.num_entities
        );
    }
    for table in &output.rankings {
        let path = output_dir.join(format!("{}_{}.tsv", table.kind, table.direction));
        write_ranking(&path, &table.entries)?;
        println!("\n{} {} {}:", table.direction, table.entries.len(), table.kind);
        for (i, entry) in table.entries.iter().enumerate() {
            println!("  {:>2}. {:<12} {:+.4}", i + 1, entry.entity_id, entry.effect);
        }
    }
    println!("\nOutputs written to: {}", output_dir.display());
    Ok(())
}
