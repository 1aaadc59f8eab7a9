//! Core engine for the Goombas workspace.
//!
//! Goombas are simulated robotic vacuum cleaners living on a bounded tile
//! grid. Each agent's behaviour is encoded as a genome: an ordered sequence
//! of genes, each pairing an action code with an arithmetic expression tree,
//! plus a metagenome of tunable numeric parameters. The world steps every
//! agent once per tick (sense, think, choose, act) and breeds the population
//! at generation boundaries with crossover and mutation.
//!
//! The crate is deliberately single-threaded and synchronous: a tick is one
//! in-order pass over the population, and agents observe each other's grid
//! edits within the same tick. All randomness flows through the world's
//! seeded [`rand::rngs::SmallRng`], so runs are reproducible given a fixed
//! seed.

use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;

pub mod agent;
pub mod expr;
pub mod genome;
pub mod world;

pub use agent::{Action, AgentLimits, Counters, EFFECTS, Goomba, SCORE_FLOOR, Sensor};
pub use expr::{EvalContext, ExprError, FuncTree, GrowthParams, LeafKind, Op};
pub use genome::{Gene, Genome, GenomeError, META_FIELDS, Metagenome, MutationRates};
pub use world::{
    EliteRecord, GoombasConfig, TickEvents, TileGrid, TileState, World, WorldError,
};

/// Draw an index from a relative-weight table. Tables are validated at
/// genome construction, so an unsampleable table only arises from internal
/// misuse; it falls back to the first entry rather than panicking.
pub(crate) fn weighted_pick<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> usize {
    WeightedIndex::new(weights.iter().copied())
        .map(|dist| dist.sample(rng))
        .unwrap_or(0)
}
