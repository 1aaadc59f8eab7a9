//! Goombas: autonomous robotic vacuum cleaners whose behaviour is
//! genetically determined.
//!
//! One tick runs four strictly sequential phases: sense (snapshot the
//! nearby tiles and a random bit), think (execute the gene queue and
//! accumulate intent weights), choose (strongest effect action wins), and
//! perform (apply the chosen action to the world). Mental actions execute
//! immediately during the think phase; effect actions only vote.
//!
//! A tick-scoped recursion counter bounds every offset call, so the think
//! phase terminates for any genome, including self-referential or mutually
//! recursive offset chains.

use crate::expr::EvalContext;
use crate::genome::{Genome, GenomeError};
use crate::world::{TileGrid, TileState};
use rand::Rng;
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// All actions a goomba may perform.
///
/// Nop does nothing at all. Forward/Backward move one tile along or
/// against the current orientation; LeftTurn/RightTurn rotate a quarter
/// turn; Suck attempts to clean the current tile; Wait sits still. Call
/// appends a gene to the expression queue; Promote/Demote move a gene one
/// rank in the expression order; Remember/Forget push/pop the memory
/// stack; SetState overwrites the internal state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Nop,
    Forward,
    Backward,
    LeftTurn,
    RightTurn,
    Suck,
    Wait,
    Call,
    Promote,
    Demote,
    Remember,
    Forget,
    SetState,
}

/// Actions that actually affect the world, in choice-priority order.
pub const EFFECTS: [Action; 6] = [
    Action::Forward,
    Action::Backward,
    Action::LeftTurn,
    Action::RightTurn,
    Action::Suck,
    Action::Wait,
];

impl Action {
    pub const COUNT: usize = 13;

    /// Decode an action from a raw integer, wrapping modulo the domain.
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code.rem_euclid(Self::COUNT as i64) {
            0 => Action::Nop,
            1 => Action::Forward,
            2 => Action::Backward,
            3 => Action::LeftTurn,
            4 => Action::RightTurn,
            5 => Action::Suck,
            6 => Action::Wait,
            7 => Action::Call,
            8 => Action::Promote,
            9 => Action::Demote,
            10 => Action::Remember,
            11 => Action::Forget,
            _ => Action::SetState,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    fn effect_slot(self) -> Option<usize> {
        EFFECTS.iter().position(|&e| e == self)
    }
}

/// All sensors a goomba has access to.
///
/// Bump is 1 if the goomba attempted an impossible move last step. Rand is
/// a fresh random bit each step. Tile/Left/Right/Front report nearby tile
/// states. PosX/PosY and OriX/OriY are the live pose (`|OriX| + |OriY| = 1`).
/// State is the internal register; Mem the top of the memory stack, 0 when
/// empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    Bump,
    Rand,
    Tile,
    Left,
    Right,
    Front,
    PosX,
    PosY,
    OriX,
    OriY,
    State,
    Mem,
}

impl Sensor {
    pub const COUNT: usize = 12;

    /// Decode a sensor from a raw index, wrapping modulo the domain.
    #[must_use]
    pub fn from_raw(raw: i64) -> Self {
        match raw.rem_euclid(Self::COUNT as i64) {
            0 => Sensor::Bump,
            1 => Sensor::Rand,
            2 => Sensor::Tile,
            3 => Sensor::Left,
            4 => Sensor::Right,
            5 => Sensor::Front,
            6 => Sensor::PosX,
            7 => Sensor::PosY,
            8 => Sensor::OriX,
            9 => Sensor::OriY,
            10 => Sensor::State,
            _ => Sensor::Mem,
        }
    }
}

/// Sentinel score for agents that never moved during an episode.
pub const SCORE_FLOOR: f64 = f64::NEG_INFINITY;

const DIRT_VALUE: f64 = 1000.0;
const MOVE_COST: f64 = 10.0;
const BUMP_COST: f64 = 50.0;
const TURN_COST: f64 = 10.0;
const SUCK_VALUE: f64 = 20.0;
const THOUGHT_COST: f64 = 0.1;
const GENOME_SIZE_COST: f64 = 5.0;
const TILE_VALUE: f64 = 100.0;

/// Per-episode counters contributing to fitness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    /// Net dirt removed; sucking a clean tile dirty counts against it.
    pub dirt: i64,
    pub forward_moves: u64,
    pub backward_moves: u64,
    pub bumps: u64,
    pub left_turns: u64,
    pub right_turns: u64,
    pub sucks: u64,
    /// Gene and function executions this episode.
    pub thoughts: u64,
    pub genome_size: u64,
    pub tiles_covered: u64,
}

impl Counters {
    /// Weighted fitness score. Motionless agents are never viable.
    #[must_use]
    pub fn score(&self) -> f64 {
        if self.forward_moves + self.backward_moves == 0 {
            return SCORE_FLOOR;
        }
        self.dirt as f64 * DIRT_VALUE
            - self.forward_moves as f64 * MOVE_COST
            - self.backward_moves as f64 * MOVE_COST
            - self.bumps as f64 * BUMP_COST
            - self.left_turns as f64 * TURN_COST
            - self.right_turns as f64 * TURN_COST
            + self.sucks as f64 * SUCK_VALUE
            - self.thoughts as f64 * THOUGHT_COST
            - self.genome_size as f64 * GENOME_SIZE_COST
            + self.tiles_covered as f64 * TILE_VALUE
    }
}

/// Capacity bounds for an agent's mind.
///
/// Keep the execution depth low: with depth d and queue length L, a goomba
/// performs O(L * 2^d) function calls in the worst case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLimits {
    /// Recursion bound shared by all offset calls within one tick.
    pub exec_depth: usize,
    /// Number of genes seeded into the queue each think phase.
    pub init_genes: usize,
    /// Gene-queue capacity; Call silently rejects beyond it.
    pub queue_capacity: usize,
    /// Memory-stack capacity; Remember silently rejects beyond it.
    pub memory_capacity: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            exec_depth: 5,
            init_genes: 30,
            queue_capacity: 100,
            memory_capacity: 200,
        }
    }
}

/// Snapshot of the tile sensors plus the per-tick random bit.
#[derive(Debug, Clone, Copy, Default)]
struct Senses {
    tile: f64,
    front: f64,
    left: f64,
    right: f64,
    bump: f64,
    rand: f64,
}

/// Mutable mental scratch state: register, stack, queue, and gene order.
#[derive(Debug, Clone)]
struct Mind {
    state: f64,
    memory: Vec<f64>,
    queue: VecDeque<usize>,
    expr_order: Vec<usize>,
    intents: [f64; EFFECTS.len()],
    depth: usize,
}

/// An autonomous cleaning agent bound to one genome.
#[derive(Debug, Clone)]
pub struct Goomba {
    genome: Genome,
    pos: [i32; 2],
    ori: [i32; 2],
    limits: AgentLimits,
    senses: Senses,
    mind: Mind,
    counters: Counters,
    visited: HashSet<[i32; 2]>,
    intent: Action,
}

const ORIENTATIONS: [[i32; 2]; 4] = [[1, 0], [-1, 0], [0, 1], [0, -1]];

impl Goomba {
    /// Express a genome into a live agent at the given position.
    #[must_use]
    pub fn new(genome: Genome, pos: [i32; 2], limits: AgentLimits, rng: &mut SmallRng) -> Self {
        let ori = *ORIENTATIONS
            .as_slice()
            .choose(rng)
            .unwrap_or(&ORIENTATIONS[0]);
        let expr_order = (0..genome.len()).collect();
        let counters = Counters {
            genome_size: genome.len() as u64,
            ..Counters::default()
        };
        Self {
            mind: Mind {
                state: 0.0,
                memory: Vec::new(),
                queue: VecDeque::new(),
                expr_order,
                intents: [0.0; EFFECTS.len()],
                depth: 0,
            },
            genome,
            pos,
            ori,
            limits,
            senses: Senses::default(),
            counters,
            visited: HashSet::new(),
            intent: Action::Wait,
        }
    }

    /// Construct an agent straight from a genome sequence pair.
    pub fn from_sequences(
        meta_text: &str,
        coding_text: &str,
        pos: [i32; 2],
        limits: AgentLimits,
        rng: &mut SmallRng,
    ) -> Result<Self, GenomeError> {
        let genome = Genome::parse(meta_text, coding_text)?;
        Ok(Self::new(genome, pos, limits, rng))
    }

    /// Snapshot the tile sensors once per step.
    pub fn sense(&mut self, grid: &TileGrid, rng: &mut SmallRng) {
        let [x, y] = self.pos;
        let [ox, oy] = self.ori;
        self.senses.tile = grid.tile(x, y).signal();
        self.senses.front = grid.tile(x + ox, y + oy).signal();
        self.senses.left = grid.tile(x - oy, y + ox).signal();
        self.senses.right = grid.tile(x + oy, y - ox).signal();
        self.senses.rand = if rng.random_bool(0.5) { 1.0 } else { 0.0 };
    }

    /// Run the gene queue and accumulate intent weights.
    ///
    /// The queue is seeded from the head of the expression order and may
    /// grow while it is being drained (Call appends), so iteration is by
    /// index rather than by draining the deque.
    pub fn think(&mut self) {
        self.intent = Action::Wait;
        self.mind.intents = [0.0; EFFECTS.len()];
        self.mind.queue.clear();
        self.mind.depth = 0;
        let seed = self.limits.init_genes.min(self.mind.expr_order.len());
        for rank in 0..seed {
            let gene = self.mind.expr_order[rank];
            self.mind.queue.push_back(gene);
        }

        let mut ctx = ThinkCtx {
            genome: &self.genome,
            limits: self.limits,
            pos: self.pos,
            ori: self.ori,
            senses: &self.senses,
            mind: &mut self.mind,
            counters: &mut self.counters,
        };
        let mut index = 0;
        while index < ctx.mind.queue.len() {
            let gene = ctx.mind.queue[index];
            ctx.call_gene(gene);
            index += 1;
        }
    }

    /// Pick the effect action with the strongest accumulated weight.
    ///
    /// Ties favour the earliest action in [`EFFECTS`]; Wait wins unless
    /// some weight exceeds zero.
    pub fn choose_action(&mut self) {
        let mut strongest = (Action::Wait, 0.0);
        for (slot, &action) in EFFECTS.iter().enumerate() {
            if self.mind.intents[slot] > strongest.1 {
                strongest = (action, self.mind.intents[slot]);
            }
        }
        self.intent = strongest.0;
    }

    /// Apply the chosen action's world effect.
    pub fn perform_action(
        &mut self,
        grid: &mut TileGrid,
        suck_fail_prob: f64,
        rng: &mut SmallRng,
    ) {
        self.senses.bump = 0.0;
        match self.intent {
            Action::Forward => self.try_move(grid, self.ori, true),
            Action::Backward => {
                let back = [-self.ori[0], -self.ori[1]];
                self.try_move(grid, back, false);
            }
            Action::LeftTurn => {
                self.ori = [-self.ori[1], self.ori[0]];
                self.counters.left_turns += 1;
            }
            Action::RightTurn => {
                self.ori = [self.ori[1], -self.ori[0]];
                self.counters.right_turns += 1;
            }
            Action::Suck => self.suck(grid, suck_fail_prob, rng),
            _ => {}
        }
    }

    fn try_move(&mut self, grid: &TileGrid, delta: [i32; 2], forward: bool) {
        let next = [self.pos[0] + delta[0], self.pos[1] + delta[1]];
        if grid.tile(next[0], next[1]) == TileState::Boundary {
            self.counters.bumps += 1;
            self.senses.bump = 1.0;
            return;
        }
        self.pos = next;
        if forward {
            self.counters.forward_moves += 1;
        } else {
            self.counters.backward_moves += 1;
        }
        if self.visited.insert(next) {
            self.counters.tiles_covered += 1;
        }
    }

    /// Attempt to clean the current tile; a failed attempt dirties a clean
    /// tile instead. Boundary tiles are unaffected.
    fn suck(&mut self, grid: &mut TileGrid, fail_prob: f64, rng: &mut SmallRng) {
        self.counters.sucks += 1;
        let [x, y] = self.pos;
        let before = grid.tile(x, y);
        if before == TileState::Boundary {
            return;
        }
        let failed = rng.random::<f64>() < fail_prob;
        match (before, failed) {
            (TileState::Dirty, false) => {
                grid.set(x, y, TileState::Clean);
                self.counters.dirt += 1;
            }
            (TileState::Clean, true) => {
                grid.set(x, y, TileState::Dirty);
                self.counters.dirt -= 1;
            }
            _ => {}
        }
    }

    /// Fitness score for this agent's episode so far.
    #[must_use]
    pub fn score(&self) -> f64 {
        self.counters.score()
    }

    #[must_use]
    pub fn pos(&self) -> [i32; 2] {
        self.pos
    }

    #[must_use]
    pub fn ori(&self) -> [i32; 2] {
        self.ori
    }

    #[must_use]
    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Genome-derived display colors, for the rendering collaborator.
    #[must_use]
    pub fn colors(&self) -> &[[f64; 3]; 4] {
        &self.genome.meta.colors
    }

    #[must_use]
    pub fn intent(&self) -> Action {
        self.intent
    }
}

/// Evaluation context threading one agent's mind through its genome.
struct ThinkCtx<'a> {
    genome: &'a Genome,
    limits: AgentLimits,
    pos: [i32; 2],
    ori: [i32; 2],
    senses: &'a Senses,
    mind: &'a mut Mind,
    counters: &'a mut Counters,
}

impl ThinkCtx<'_> {
    /// Hypothesise an action: effect actions vote with `value`, mental
    /// actions execute immediately.
    fn dispatch(&mut self, action: Action, value: f64) {
        match action {
            Action::Nop => {}
            Action::Call => {
                if self.mind.queue.len() < self.limits.queue_capacity {
                    let target = wrap_gene_index(value, self.genome.len());
                    self.mind.queue.push_back(target);
                }
            }
            Action::Promote => {
                let target = wrap_gene_index(value, self.genome.len());
                promote(&mut self.mind.expr_order, target);
            }
            Action::Demote => {
                let target = wrap_gene_index(value, self.genome.len());
                demote(&mut self.mind.expr_order, target);
            }
            Action::Remember => {
                if self.mind.memory.len() < self.limits.memory_capacity {
                    self.mind.memory.push(value);
                }
            }
            Action::Forget => {
                self.mind.memory.pop();
            }
            Action::SetState => self.mind.state = value,
            effect => {
                if let Some(slot) = effect.effect_slot() {
                    self.mind.intents[slot] += value;
                }
            }
        }
    }
}

impl EvalContext for ThinkCtx<'_> {
    fn fuzziness(&self) -> f64 {
        self.genome.meta.fuzziness
    }

    fn sensor(&mut self, raw: i64) -> f64 {
        match Sensor::from_raw(raw) {
            Sensor::Bump => self.senses.bump,
            Sensor::Rand => self.senses.rand,
            Sensor::Tile => self.senses.tile,
            Sensor::Left => self.senses.left,
            Sensor::Right => self.senses.right,
            Sensor::Front => self.senses.front,
            Sensor::PosX => f64::from(self.pos[0]),
            Sensor::PosY => f64::from(self.pos[1]),
            Sensor::OriX => f64::from(self.ori[0]),
            Sensor::OriY => f64::from(self.ori[1]),
            Sensor::State => self.mind.state,
            Sensor::Mem => self.mind.memory.last().copied().unwrap_or(0.0),
        }
    }

    fn call_function(&mut self, gene: usize) -> f64 {
        if self.mind.depth >= self.limits.exec_depth {
            return 0.0;
        }
        self.mind.depth += 1;
        let genome = self.genome;
        let value = genome.gene(gene).function.eval(self);
        self.mind.depth -= 1;
        self.counters.thoughts += 1;
        value
    }

    fn call_gene(&mut self, gene: usize) -> f64 {
        if self.mind.depth >= self.limits.exec_depth {
            return 0.0;
        }
        self.mind.depth += 1;
        let genome = self.genome;
        let entry = genome.gene(gene);
        let value = entry.function.eval(self);
        self.dispatch(entry.action, value);
        self.mind.depth -= 1;
        self.counters.thoughts += 1;
        value
    }
}

/// Wrap an evaluated value into a valid gene index. Out-of-range values
/// wrap so that genes stay meaningful over most of their range.
fn wrap_gene_index(value: f64, genome_len: usize) -> usize {
    if genome_len == 0 {
        return 0;
    }
    (value.round() as i64).rem_euclid(genome_len as i64) as usize
}

fn promote(order: &mut [usize], target: usize) {
    if let Some(rank) = order.iter().position(|&g| g == target) {
        if rank > 0 {
            order.swap(rank, rank - 1);
        }
    }
}

fn demote(order: &mut [usize], target: usize) {
    if let Some(rank) = order.iter().position(|&g| g == target) {
        if rank + 1 < order.len() {
            order.swap(rank, rank + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::Metagenome;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0xB07)
    }

    fn agent(coding: &str) -> Goomba {
        agent_with(coding, AgentLimits::default())
    }

    fn agent_with(coding: &str, limits: AgentLimits) -> Goomba {
        let meta = Metagenome::default().encode();
        Goomba::from_sequences(&meta, coding, [2, 2], limits, &mut rng()).expect("agent parses")
    }

    #[test]
    fn positive_weight_selects_action() {
        let mut g = agent("1 5");
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Forward);
    }

    #[test]
    fn ties_prefer_first_effect_in_order() {
        // LeftTurn's gene runs first, but Forward is earlier in EFFECTS.
        let mut g = agent("3 5 | 1 5");
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Forward);
    }

    #[test]
    fn nonpositive_weights_default_to_wait() {
        let mut g = agent("1 - 0 5");
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Wait);
    }

    #[test]
    fn set_state_is_visible_within_the_same_tick() {
        let mut g = agent("12 42 | 1 $10");
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Forward);
    }

    #[test]
    fn memory_push_and_pop_drive_the_mem_sensor() {
        let mut g = agent("10 7 | 1 $11");
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Forward);

        let mut g = agent("10 7 | 11 0 | 1 $11");
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Wait);
    }

    #[test]
    fn call_grows_the_queue_up_to_capacity() {
        let limits = AgentLimits {
            queue_capacity: 8,
            ..AgentLimits::default()
        };
        let mut g = agent_with("7 1", limits);
        g.think();
        assert_eq!(g.counters().thoughts, 8);
    }

    #[test]
    fn self_recursion_saturates_at_the_depth_bound() {
        let mut g = agent("0 {0");
        g.think();
        assert_eq!(g.counters().thoughts, 5);
    }

    #[test]
    fn mutual_recursion_terminates() {
        let mut g = agent("0 {1 | 0 {0");
        g.think();
        assert_eq!(g.counters().thoughts, 10);
    }

    #[test]
    fn promote_reorders_queue_seeding() {
        let limits = AgentLimits {
            init_genes: 1,
            ..AgentLimits::default()
        };
        let mut g = agent_with("8 1 | 1 5", limits);
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Wait);

        // Gene 1 was promoted to the head, so it seeds the next tick.
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Forward);
    }

    #[test]
    fn moving_updates_position_and_coverage() {
        let mut world_rng = rng();
        let mut grid = TileGrid::open(7, 7);
        let mut g = agent("1 5");
        let start = g.pos();
        g.think();
        g.choose_action();
        let ori = g.ori();
        g.perform_action(&mut grid, 0.25, &mut world_rng);
        assert_eq!(g.pos(), [start[0] + ori[0], start[1] + ori[1]]);
        assert_eq!(g.counters().forward_moves, 1);
        assert_eq!(g.counters().tiles_covered, 1);
    }

    #[test]
    fn blocked_moves_bump_and_stay_put() {
        let mut world_rng = rng();
        // A 3x3 grid has a single interior tile; every move bumps.
        let mut grid = TileGrid::open(3, 3);
        let meta = Metagenome::default().encode();
        let mut g = Goomba::from_sequences(&meta, "1 5", [1, 1], AgentLimits::default(), &mut rng())
            .expect("agent parses");
        g.think();
        g.choose_action();
        g.perform_action(&mut grid, 0.25, &mut world_rng);
        assert_eq!(g.pos(), [1, 1]);
        assert_eq!(g.counters().bumps, 1);
        assert_eq!(g.counters().forward_moves, 0);
        assert_eq!(g.score(), SCORE_FLOOR);
    }

    #[test]
    fn suck_toggles_dirt_and_counts() {
        let mut world_rng = rng();
        let mut grid = TileGrid::open(7, 7);
        grid.set(2, 2, TileState::Dirty);
        let mut g = agent("5 1");
        g.think();
        g.choose_action();
        assert_eq!(g.intent(), Action::Suck);
        g.perform_action(&mut grid, 0.0, &mut world_rng);
        assert_eq!(grid.tile(2, 2), TileState::Clean);
        assert_eq!(g.counters().dirt, 1);

        // With certain failure the clean tile is dirtied again.
        g.think();
        g.choose_action();
        g.perform_action(&mut grid, 1.0, &mut world_rng);
        assert_eq!(grid.tile(2, 2), TileState::Dirty);
        assert_eq!(g.counters().dirt, 0);
        assert_eq!(g.counters().sucks, 2);
    }

    #[test]
    fn score_weights_match_the_contract() {
        let counters = Counters {
            dirt: 2,
            forward_moves: 3,
            backward_moves: 1,
            bumps: 1,
            left_turns: 2,
            right_turns: 0,
            sucks: 4,
            thoughts: 10,
            genome_size: 6,
            tiles_covered: 5,
        };
        let expected = 2.0 * 1000.0 - 3.0 * 10.0 - 10.0 - 50.0 - 20.0 + 4.0 * 20.0 - 1.0
            - 6.0 * 5.0
            + 5.0 * 100.0;
        assert!((counters.score() - expected).abs() < 1e-9);
    }

    #[test]
    fn motionless_agents_score_the_floor() {
        assert_eq!(Counters::default().score(), SCORE_FLOOR);
    }
}
