//! Headless driver for the Goombas simulation: seeds a world, steps it for
//! a number of generations, and reports the elite genomes.

use anyhow::{Context, Result, bail};
use clap::Parser;
use goombas_core::{GoombasConfig, World};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Seed metagenome: colors, fuzziness, constant bounds, generation depth,
/// increment/multiply ranges, the five mutation rates, and the five
/// relative-weight tables.
const SEED_META: &str = "0.3 0.8 0.8 0.3 0.8 0.8 0.8 0.3 0.8 0.8 0.3 0.8 \
                         1.0 -5.0 5.0 3 5.0 2.0 \
                         0.1 0.1 0.3 0.5 0.3 \
                         1 1 1 1 1 1 1 1 1 1 1 1 1 1 1 1 1 1 1";

/// Seed coding region: count steps, turn away after bumps, suck dirt
/// underneath, steer toward neighbouring dirt, and keep moving forward.
const SEED_CODING: &str = "12 + 1 $10 | 4 * = 0 % $10 23 * 100 $1 | 5 * 100 $2 | \
                           4 * 90 $4 | 3 * 90 $3 | 1 * 100 $5 | \
                           3 * * 80 $1 $0 | 4 * * 80 $1 - 1 $0 | 1 20";

#[derive(Parser, Debug)]
#[command(
    name = "goombas",
    version,
    about = "Evolve grid-cleaning agents with genetic programming"
)]
struct Cli {
    /// World width in tiles, including the boundary ring.
    #[arg(long, default_value_t = 50)]
    width: i32,

    /// World height in tiles.
    #[arg(long, default_value_t = 50)]
    height: i32,

    /// Number of agents per generation.
    #[arg(long, default_value_t = 40)]
    population: usize,

    /// Number of generations to evolve.
    #[arg(long, default_value_t = 20)]
    generations: u64,

    /// RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Seed the population from a genome file (two lines: metagenome,
    /// then coding region) instead of the built-in seeker program.
    #[arg(long)]
    genome: Option<PathBuf>,

    /// Start from random coding regions instead of a seed program.
    #[arg(long)]
    random: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut world = bootstrap_world(&cli)?;
    info!(
        width = cli.width,
        height = cli.height,
        population = cli.population,
        generations = cli.generations,
        "starting goombas run"
    );

    while world.generation() < cli.generations {
        world.step();
    }

    report_elite(&world);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap_world(cli: &Cli) -> Result<World> {
    let config = GoombasConfig {
        width: cli.width,
        height: cli.height,
        rng_seed: cli.seed,
        ..GoombasConfig::default()
    };

    if cli.random {
        return World::random_population(config, SEED_META, cli.population)
            .context("building a random population");
    }

    let (meta, coding) = match &cli.genome {
        Some(path) => load_genome_file(path)?,
        None => (SEED_META.to_string(), SEED_CODING.to_string()),
    };
    let sequences = vec![(meta, coding); cli.population];
    World::from_sequences(config, &sequences).context("expressing the seed genome")
}

fn load_genome_file(path: &PathBuf) -> Result<(String, String)> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading genome file {}", path.display()))?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(meta) = lines.next() else {
        bail!("genome file {} is empty", path.display());
    };
    let Some(coding) = lines.next() else {
        bail!(
            "genome file {} is missing a coding region line",
            path.display()
        );
    };
    Ok((meta.to_string(), coding.to_string()))
}

fn report_elite(world: &World) {
    for (rank, record) in world.elite().iter().enumerate() {
        info!(
            rank,
            score = record.score,
            generation = record.generation,
            dirt = record.counters.dirt,
            tiles = record.counters.tiles_covered,
            "elite genome"
        );
    }
    if let Some(best) = world.elite().first() {
        println!("{}", best.meta);
        println!("{}", best.coding);
    }
}
