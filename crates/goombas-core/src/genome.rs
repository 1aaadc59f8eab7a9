//! Genomes: ordered gene sequences plus the metagenome parameter block.
//!
//! A genome's persistence boundary is textual: a metagenome string of 42
//! whitespace-delimited numeric fields and a `|`-delimited coding region
//! where each gene is an action code followed by a Polish-notation
//! function. Construction from text is all-or-nothing; a malformed
//! sequence never yields a partially built genome.
//!
//! Genomes own the genetic operators: the link pass that resolves offset
//! leaves to gene indices, per-generation structural mutation, metagenome
//! perturbation, and crossover.

use crate::agent::{Action, Sensor};
use crate::expr::{ExprError, FuncTree, GrowthParams, LeafKind};
use crate::weighted_pick;
use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of numeric fields in the metagenome encoding.
pub const META_FIELDS: usize = 42;
/// Colors carried by a metagenome (RGB each).
pub const NUM_COLORS: usize = 4;

const MIN_FUZZINESS: f64 = 1e-3;
const MIN_INCR_RANGE: f64 = 0.05;
const MIN_WEIGHT: f64 = 0.05;
const MAX_GEN_DEPTH: f64 = 10.0;
const RATE_STEP: f64 = 0.05;
const COLOR_STEP: f64 = 0.05;
const WEIGHT_STEP: f64 = 0.25;
const KIND_REDRAW_TRIES: usize = 16;

/// Errors raised while constructing a genome from text.
#[derive(Debug, Error, PartialEq)]
pub enum GenomeError {
    #[error("metagenome must contain {META_FIELDS} fields, found {0}")]
    MetaFieldCount(usize),
    #[error("metagenome field `{0}` is not a number")]
    MetaFieldInvalid(String),
    #[error("metagenome field {0} is not finite")]
    NonFiniteField(usize),
    #[error("fuzziness must be positive, got {0}")]
    NonPositiveFuzziness(f64),
    #[error("relative-weight table `{0}` has no positive mass")]
    DegenerateWeights(&'static str),
    #[error("coding region contains no genes")]
    EmptyCoding,
    #[error("gene {index} is empty")]
    EmptyGene { index: usize },
    #[error("gene {index} has invalid action code `{token}`")]
    InvalidAction { index: usize, token: String },
    #[error("gene {index}: {source}")]
    Function { index: usize, source: ExprError },
}

/// The five scalar mutation probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MutationRates {
    /// Chance each metagenome field is perturbed at turnover.
    pub mute: f64,
    /// Chance of a structural genome edit at each gene position.
    pub genome: f64,
    /// Chance a gene mutation hits the action code.
    pub gene_action: f64,
    /// Chance a gene mutation is a structural tree edit.
    pub struct_mod: f64,
    /// Chance a leaf mutation changes the reference kind.
    pub leaf_type: f64,
}

/// Fixed-layout block of tunable parameters carried by every genome.
///
/// Invariants after construction: `const_bounds[0] <= const_bounds[1]`,
/// all color components lie in `[0, 1]`, fuzziness is positive, and every
/// relative-weight table has positive mass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metagenome {
    pub colors: [[f64; 3]; NUM_COLORS],
    pub fuzziness: f64,
    pub const_bounds: [f64; 2],
    pub fun_gen_depth: f64,
    pub incr_range: f64,
    pub mult_range: f64,
    pub rates: MutationRates,
    /// Structural genome edits: insert, duplicate, delete, invert, mutate.
    pub genome_weights: [f64; 5],
    /// Constant mutations: increment, decrement, multiply, divide.
    pub const_weights: [f64; 4],
    /// Leaf kinds: pure call, impure call, sensor, constant.
    pub leaf_weights: [f64; 4],
    /// Enum mutations: increment, decrement, uniform redraw.
    pub enum_weights: [f64; 3],
    /// Tree edits: replace subtree, insert operator above, swap operands.
    pub struct_weights: [f64; 3],
}

impl Default for Metagenome {
    fn default() -> Self {
        Self {
            colors: [
                [0.3, 0.8, 0.8],
                [0.3, 0.8, 0.8],
                [0.8, 0.3, 0.8],
                [0.8, 0.3, 0.8],
            ],
            fuzziness: 1.0,
            const_bounds: [-5.0, 5.0],
            fun_gen_depth: 3.0,
            incr_range: 5.0,
            mult_range: 2.0,
            rates: MutationRates {
                mute: 0.1,
                genome: 0.1,
                gene_action: 0.3,
                struct_mod: 0.5,
                leaf_type: 0.3,
            },
            genome_weights: [1.0; 5],
            const_weights: [1.0; 4],
            leaf_weights: [1.0; 4],
            enum_weights: [1.0; 3],
            struct_weights: [1.0; 3],
        }
    }
}

impl Metagenome {
    /// Parse the fixed-order whitespace-delimited field string.
    pub fn parse(text: &str) -> Result<Self, GenomeError> {
        let mut fields = Vec::with_capacity(META_FIELDS);
        for token in text.split_whitespace() {
            let value = token
                .parse::<f64>()
                .map_err(|_| GenomeError::MetaFieldInvalid(token.to_string()))?;
            fields.push(value);
        }
        Self::from_fields(&fields)
    }

    /// Rebuild a metagenome from its flattened field vector.
    pub fn from_fields(fields: &[f64]) -> Result<Self, GenomeError> {
        if fields.len() != META_FIELDS {
            return Err(GenomeError::MetaFieldCount(fields.len()));
        }
        if let Some(index) = fields.iter().position(|v| !v.is_finite()) {
            return Err(GenomeError::NonFiniteField(index));
        }

        let mut colors = [[0.0; 3]; NUM_COLORS];
        for (ci, color) in colors.iter_mut().enumerate() {
            for (comp, slot) in color.iter_mut().enumerate() {
                *slot = fields[ci * 3 + comp].clamp(0.0, 1.0);
            }
        }
        let fuzziness = fields[12];
        if fuzziness <= 0.0 {
            return Err(GenomeError::NonPositiveFuzziness(fuzziness));
        }
        let mut const_bounds = [fields[13], fields[14]];
        if const_bounds[0] > const_bounds[1] {
            const_bounds.swap(0, 1);
        }

        let mut meta = Self {
            colors,
            fuzziness,
            const_bounds,
            fun_gen_depth: fields[15],
            incr_range: fields[16],
            mult_range: fields[17],
            rates: MutationRates {
                mute: fields[18],
                genome: fields[19],
                gene_action: fields[20],
                struct_mod: fields[21],
                leaf_type: fields[22],
            },
            genome_weights: [0.0; 5],
            const_weights: [0.0; 4],
            leaf_weights: [0.0; 4],
            enum_weights: [0.0; 3],
            struct_weights: [0.0; 3],
        };
        meta.genome_weights.copy_from_slice(&fields[23..28]);
        meta.const_weights.copy_from_slice(&fields[28..32]);
        meta.leaf_weights.copy_from_slice(&fields[32..36]);
        meta.enum_weights.copy_from_slice(&fields[36..39]);
        meta.struct_weights.copy_from_slice(&fields[39..42]);
        meta.validate_tables()?;
        Ok(meta)
    }

    fn validate_tables(&self) -> Result<(), GenomeError> {
        let tables: [(&'static str, &[f64]); 5] = [
            ("genome", &self.genome_weights),
            ("const", &self.const_weights),
            ("leaf", &self.leaf_weights),
            ("enum", &self.enum_weights),
            ("struct", &self.struct_weights),
        ];
        for (name, table) in tables {
            if table.iter().any(|&w| w < 0.0) || table.iter().sum::<f64>() <= 0.0 {
                return Err(GenomeError::DegenerateWeights(name));
            }
        }
        Ok(())
    }

    /// Flatten to the fixed field order of the textual encoding.
    #[must_use]
    pub fn fields(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(META_FIELDS);
        for color in &self.colors {
            out.extend_from_slice(color);
        }
        out.push(self.fuzziness);
        out.extend_from_slice(&self.const_bounds);
        out.push(self.fun_gen_depth);
        out.push(self.incr_range);
        out.push(self.mult_range);
        out.extend_from_slice(&[
            self.rates.mute,
            self.rates.genome,
            self.rates.gene_action,
            self.rates.struct_mod,
            self.rates.leaf_type,
        ]);
        out.extend_from_slice(&self.genome_weights);
        out.extend_from_slice(&self.const_weights);
        out.extend_from_slice(&self.leaf_weights);
        out.extend_from_slice(&self.enum_weights);
        out.extend_from_slice(&self.struct_weights);
        out
    }

    /// Serialize to the whitespace-delimited field string.
    #[must_use]
    pub fn encode(&self) -> String {
        let fields: Vec<String> = self.fields().iter().map(|v| v.to_string()).collect();
        fields.join(" ")
    }

    /// Tree-generation depth, clamped to a sane integral range.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.fun_gen_depth.round().clamp(1.0, MAX_GEN_DEPTH) as u32
    }

    /// Stochastically perturb every scalar field and weight entry.
    ///
    /// Each field is gated independently on the `mute` rate, except the two
    /// meta-mutation-rate scalars themselves: `mute` is gated on `genome`
    /// and `genome` on `mute`, so neither can silently freeze the other.
    pub fn mutate(&mut self, rng: &mut SmallRng) {
        let gate = self.rates.mute;
        let incr = self.incr_range.max(0.0);
        let mult = self.mult_range.max(1.0);

        for color in &mut self.colors {
            for component in color {
                if rng.random::<f64>() < gate {
                    *component = (*component
                        + rng.random_range(-COLOR_STEP..=COLOR_STEP))
                    .clamp(0.0, 1.0);
                }
            }
        }
        if rng.random::<f64>() < gate {
            // Clamp to the finite range so a drifted field always encodes.
            self.fuzziness = (self.fuzziness + rng.random_range(-incr..=incr))
                .clamp(MIN_FUZZINESS, f64::MAX);
        }
        for bound in &mut self.const_bounds {
            if rng.random::<f64>() < gate {
                *bound = (*bound + rng.random_range(-incr..=incr)).clamp(f64::MIN, f64::MAX);
            }
        }
        if rng.random::<f64>() < gate {
            let factor = rng.random_range(1.0..=mult);
            self.fun_gen_depth = if rng.random_bool(0.5) {
                self.fun_gen_depth * factor
            } else {
                self.fun_gen_depth / factor
            };
            self.fun_gen_depth = self.fun_gen_depth.clamp(1.0, MAX_GEN_DEPTH);
        }
        if rng.random::<f64>() < gate {
            self.incr_range = (self.incr_range + rng.random_range(-incr..=incr))
                .clamp(MIN_INCR_RANGE, f64::MAX);
        }
        if rng.random::<f64>() < gate {
            self.mult_range =
                (self.mult_range + rng.random_range(-incr..=incr)).clamp(1.0, f64::MAX);
        }

        let mute_before = self.rates.mute;
        let genome_before = self.rates.genome;
        if rng.random::<f64>() < genome_before {
            self.rates.mute = step_rate(self.rates.mute, rng);
        }
        if rng.random::<f64>() < mute_before {
            self.rates.genome = step_rate(self.rates.genome, rng);
        }
        if rng.random::<f64>() < mute_before {
            self.rates.gene_action = step_rate(self.rates.gene_action, rng);
        }
        if rng.random::<f64>() < mute_before {
            self.rates.struct_mod = step_rate(self.rates.struct_mod, rng);
        }
        if rng.random::<f64>() < mute_before {
            self.rates.leaf_type = step_rate(self.rates.leaf_type, rng);
        }

        let tables = self
            .genome_weights
            .iter_mut()
            .chain(self.const_weights.iter_mut())
            .chain(self.leaf_weights.iter_mut())
            .chain(self.enum_weights.iter_mut())
            .chain(self.struct_weights.iter_mut());
        for weight in tables {
            if rng.random::<f64>() < gate {
                *weight =
                    (*weight + rng.random_range(-WEIGHT_STEP..=WEIGHT_STEP)).max(MIN_WEIGHT);
            }
        }

        if self.const_bounds[0] > self.const_bounds[1] {
            self.const_bounds.swap(0, 1);
        }
    }
}

fn step_rate(rate: f64, rng: &mut SmallRng) -> f64 {
    (rate + rng.random_range(-RATE_STEP..=RATE_STEP)).clamp(0.0, 1.0)
}

/// One gene: an action code paired with a function tree.
#[derive(Debug, Clone)]
pub struct Gene {
    pub action: Action,
    pub function: FuncTree,
}

impl fmt::Display for Gene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.code(), self.function)
    }
}

/// Structural genome edits drawn from the genome-edit weight table.
#[derive(Debug, Clone, Copy)]
enum GenomeEdit {
    Insert,
    Duplicate,
    Delete,
    Invert,
    MuteGene,
}

impl GenomeEdit {
    fn pick(weights: &[f64; 5], rng: &mut SmallRng) -> Self {
        match weighted_pick(rng, weights) {
            0 => Self::Insert,
            1 => Self::Duplicate,
            2 => Self::Delete,
            3 => Self::Invert,
            _ => Self::MuteGene,
        }
    }
}

/// The full genetic encoding of one agent.
#[derive(Debug, Clone)]
pub struct Genome {
    pub meta: Metagenome,
    genes: Vec<Gene>,
}

impl Genome {
    /// Construct a genome from its metagenome and coding-region strings.
    pub fn parse(meta_text: &str, coding_text: &str) -> Result<Self, GenomeError> {
        let meta = Metagenome::parse(meta_text)?;
        let mut genes = Vec::new();
        for (index, chunk) in coding_text.split('|').enumerate() {
            let tokens: Vec<&str> = chunk.split_whitespace().collect();
            let Some((code, func_tokens)) = tokens.split_first() else {
                return Err(GenomeError::EmptyGene { index });
            };
            let code = code.parse::<i64>().map_err(|_| GenomeError::InvalidAction {
                index,
                token: code.to_string(),
            })?;
            let function = FuncTree::parse(func_tokens)
                .map_err(|source| GenomeError::Function { index, source })?;
            genes.push(Gene {
                action: Action::from_code(code),
                function,
            });
        }
        if genes.is_empty() {
            return Err(GenomeError::EmptyCoding);
        }
        let mut genome = Self { meta, genes };
        genome.link();
        Ok(genome)
    }

    /// Build a genome of `gene_count` random genes from a seed metagenome.
    #[must_use]
    pub fn random_coding(meta: Metagenome, gene_count: usize, rng: &mut SmallRng) -> Self {
        let count = gene_count.max(1);
        let params = GrowthParams {
            depth: meta.depth(),
            genome_len: count as i64,
            const_bounds: meta.const_bounds,
            leaf_weights: meta.leaf_weights,
            sensor_domain: Sensor::COUNT as i64,
        };
        let genes = (0..count)
            .map(|_| Gene {
                action: Action::from_code(rng.random_range(0..Action::COUNT as i64)),
                function: FuncTree::random(&params, rng),
            })
            .collect();
        let mut genome = Self { meta, genes };
        genome.link();
        genome
    }

    /// Serialize to the `(metagenome, coding region)` string pair.
    #[must_use]
    pub fn sequences(&self) -> (String, String) {
        let coding: Vec<String> = self.genes.iter().map(Gene::to_string).collect();
        (self.meta.encode(), coding.join(" | "))
    }

    /// Number of genes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    /// Always false after construction; the length floor is one gene.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    #[must_use]
    pub fn gene(&self, index: usize) -> &Gene {
        &self.genes[index]
    }

    #[must_use]
    pub fn genes(&self) -> &[Gene] {
        &self.genes
    }

    /// Resolve every offset leaf against the current gene count and order.
    pub fn link(&mut self) {
        let count = self.genes.len();
        for (index, gene) in self.genes.iter_mut().enumerate() {
            gene.function.bind_offsets(index, count);
        }
    }

    fn growth_params(&self) -> GrowthParams {
        GrowthParams {
            depth: self.meta.depth(),
            genome_len: self.genes.len() as i64,
            const_bounds: self.meta.const_bounds,
            leaf_weights: self.meta.leaf_weights,
            sensor_domain: Sensor::COUNT as i64,
        }
    }

    fn random_gene(&self, rng: &mut SmallRng) -> Gene {
        Gene {
            action: Action::from_code(rng.random_range(0..Action::COUNT as i64)),
            function: FuncTree::random(&self.growth_params(), rng),
        }
    }

    /// One generation's worth of mutation: a left-to-right structural pass
    /// over gene positions, a relink, then metagenome perturbation.
    ///
    /// A Delete never drops the last remaining gene; the length floor keeps
    /// offset modulo arithmetic defined.
    pub fn mutate(&mut self, rng: &mut SmallRng) {
        let mut i = 0;
        while i < self.genes.len() {
            if rng.random::<f64>() >= self.meta.rates.genome {
                i += 1;
                continue;
            }
            match GenomeEdit::pick(&self.meta.genome_weights, rng) {
                GenomeEdit::Insert => {
                    let fresh = self.random_gene(rng);
                    self.genes.insert(i, fresh);
                    i += 2;
                }
                GenomeEdit::Duplicate => {
                    let copy = self.genes[i].clone();
                    self.genes.insert(i, copy);
                    i += 2;
                }
                GenomeEdit::Delete => {
                    if self.genes.len() > 1 {
                        self.genes.remove(i);
                    } else {
                        i += 1;
                    }
                }
                GenomeEdit::Invert => {
                    let next = (i + 1) % self.genes.len();
                    self.genes.swap(i, next);
                    i += 1;
                }
                GenomeEdit::MuteGene => {
                    self.mutate_gene(i, rng);
                    i += 1;
                }
            }
        }
        self.link();
        self.meta.mutate(rng);
    }

    /// Mutate a single gene: its action, its tree structure, or one node's
    /// payload, in decreasing order of precedence by the configured rates.
    fn mutate_gene(&mut self, index: usize, rng: &mut SmallRng) {
        let rates = self.meta.rates;
        let enum_weights = self.meta.enum_weights;
        let struct_weights = self.meta.struct_weights;
        let leaf_weights = self.meta.leaf_weights;
        let const_weights = self.meta.const_weights;
        let incr = self.meta.incr_range.max(0.0);
        let mult = self.meta.mult_range.max(1.0);
        let bounds = self.meta.const_bounds;
        let params = self.growth_params();
        let len = self.genes.len() as i64;
        let gene = &mut self.genes[index];

        if rng.random::<f64>() < rates.gene_action {
            let code = cycle_enum(
                i64::from(gene.action.code()),
                Action::COUNT as i64,
                &enum_weights,
                rng,
            );
            gene.action = Action::from_code(code);
            return;
        }

        let node = gene.function.random_node(rng);
        if rng.random::<f64>() < rates.struct_mod {
            match weighted_pick(rng, &struct_weights) {
                0 => gene.function.replace_subtree(node, &params, rng),
                1 => gene.function.insert_op_above(node, &params, rng),
                _ => gene.function.swap_operands(node),
            }
            return;
        }

        if let Some(op) = gene.function.op(node) {
            let next = cycle_enum(op.index() as i64, 9, &enum_weights, rng);
            gene.function.set_op(node, crate::expr::Op::from_index(next as usize));
        } else if let Some(leaf) = gene.function.leaf(node) {
            let mutated = if rng.random::<f64>() < rates.leaf_type {
                redraw_leaf_kind(leaf, &leaf_weights, rng)
            } else {
                perturb_leaf(leaf, &const_weights, incr, mult, bounds, len, rng)
            };
            gene.function.set_leaf(node, mutated);
        }
    }

    /// Cross two parent genomes into a child.
    ///
    /// The metagenome vectors are spliced at a shared cut, with the color
    /// block re-sourced per color from both sides so offspring stay
    /// visually distinguishable from either parent. The coding region takes
    /// genes before a shared cut from `a` and the rest from `b`, then
    /// grafts a random subtree of `a`'s cut gene into the child's cut gene.
    /// The splice is re-serialized and re-parsed, which relinks it.
    pub fn crossover(a: &Genome, b: &Genome, rng: &mut SmallRng) -> Result<Genome, GenomeError> {
        let meta = splice_meta(&a.meta, &b.meta, rng);

        let min_len = a.len().min(b.len());
        let gene_cut = rng.random_range(0..min_len);
        let mut genes: Vec<Gene> = a.genes[..gene_cut].to_vec();
        genes.extend_from_slice(&b.genes[gene_cut..]);

        let donor = &a.genes[gene_cut].function;
        let donor_node = donor.random_node(rng);
        let host = &mut genes[gene_cut].function;
        let host_node = host.random_node(rng);
        host.graft(host_node, donor, donor_node);

        let child = Genome { meta, genes };
        let (meta_text, coding_text) = child.sequences();
        Genome::parse(&meta_text, &coding_text)
    }
}

/// Splice two metagenomes at a shared random cut, re-sourcing the color
/// block per color from both sides. A cut that lands two empty half-tables
/// together is redrawn; after that the splice falls back to `a`'s block
/// wholesale, so crossover of two well-formed genomes always succeeds.
fn splice_meta(a: &Metagenome, b: &Metagenome, rng: &mut SmallRng) -> Metagenome {
    let fa = a.fields();
    let fb = b.fields();
    for _ in 0..8 {
        let cut = rng.random_range(0..=META_FIELDS);
        let mut fields = Vec::with_capacity(META_FIELDS);
        fields.extend_from_slice(&fa[..cut]);
        fields.extend_from_slice(&fb[cut..]);
        let color_cut = rng.random_range(1..NUM_COLORS);
        for ci in 0..NUM_COLORS {
            let src = if ci < color_cut { &fa } else { &fb };
            fields[ci * 3..ci * 3 + 3].copy_from_slice(&src[ci * 3..ci * 3 + 3]);
        }
        if let Ok(meta) = Metagenome::from_fields(&fields) {
            return meta;
        }
    }
    a.clone()
}

/// Cyclically step or redraw a value over `0..domain`.
fn cycle_enum(current: i64, domain: i64, weights: &[f64; 3], rng: &mut SmallRng) -> i64 {
    match weighted_pick(rng, weights) {
        0 => (current + 1).rem_euclid(domain),
        1 => (current - 1).rem_euclid(domain),
        _ => rng.random_range(0..domain),
    }
}

fn leaf_kind_index(leaf: LeafKind) -> usize {
    match leaf {
        LeafKind::PureCall { .. } => 0,
        LeafKind::ImpureCall { .. } => 1,
        LeafKind::Sensor(_) => 2,
        LeafKind::Const(_) => 3,
    }
}

/// Change a leaf's reference kind, preserving its numeric value (rounded
/// when a non-integer constant becomes an integer-valued kind). Re-draws
/// until the kind differs, with a bounded fallback for lopsided tables.
fn redraw_leaf_kind(leaf: LeafKind, weights: &[f64; 4], rng: &mut SmallRng) -> LeafKind {
    let current = leaf_kind_index(leaf);
    let mut chosen = (current + 1) % 4;
    for _ in 0..KIND_REDRAW_TRIES {
        let pick = weighted_pick(rng, weights);
        if pick != current {
            chosen = pick;
            break;
        }
    }
    let raw = match leaf {
        LeafKind::Const(v) => v,
        LeafKind::Sensor(n)
        | LeafKind::PureCall { offset: n, .. }
        | LeafKind::ImpureCall { offset: n, .. } => n as f64,
    };
    match chosen {
        0 => LeafKind::PureCall {
            offset: raw.round() as i64,
            target: 0,
        },
        1 => LeafKind::ImpureCall {
            offset: raw.round() as i64,
            target: 0,
        },
        2 => LeafKind::Sensor(raw.round() as i64),
        _ => LeafKind::Const(raw),
    }
}

/// Perturb a leaf's value in a kind-appropriate way.
fn perturb_leaf(
    leaf: LeafKind,
    const_weights: &[f64; 4],
    incr: f64,
    mult: f64,
    bounds: [f64; 2],
    genome_len: i64,
    rng: &mut SmallRng,
) -> LeafKind {
    match leaf {
        LeafKind::Const(value) => {
            let drifted = match weighted_pick(rng, const_weights) {
                0 => value + rng.random_range(0.0..=incr),
                1 => value - rng.random_range(0.0..=incr),
                2 => value * rng.random_range(1.0..=mult),
                _ => value / rng.random_range(1.0..=mult),
            };
            LeafKind::Const(drifted.clamp(bounds[0], bounds[1]))
        }
        LeafKind::PureCall { .. } => LeafKind::PureCall {
            offset: rng.random_range(-genome_len..=genome_len),
            target: 0,
        },
        LeafKind::ImpureCall { .. } => LeafKind::ImpureCall {
            offset: rng.random_range(-genome_len..=genome_len),
            target: 0,
        },
        LeafKind::Sensor(_) => LeafKind::Sensor(rng.random_range(0..Sensor::COUNT as i64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn meta_text() -> String {
        Metagenome::default().encode()
    }

    fn aggressive_meta() -> Metagenome {
        let mut meta = Metagenome::default();
        meta.rates = MutationRates {
            mute: 0.8,
            genome: 0.6,
            gene_action: 0.3,
            struct_mod: 0.5,
            leaf_type: 0.3,
        };
        meta
    }

    #[test]
    fn metagenome_round_trips() {
        let meta = Metagenome::parse(&meta_text()).expect("meta parses");
        assert_eq!(meta, Metagenome::default());
        let reparsed = Metagenome::parse(&meta.encode()).expect("encoded meta parses");
        assert_eq!(reparsed, meta);
    }

    #[test]
    fn metagenome_rejects_malformed_text() {
        assert_eq!(
            Metagenome::parse("1.0 2.0"),
            Err(GenomeError::MetaFieldCount(2))
        );
        let mut broken = meta_text();
        broken.push_str(" bogus");
        assert!(matches!(
            Metagenome::parse(&broken),
            Err(GenomeError::MetaFieldInvalid(_))
        ));

        let mut fields = Metagenome::default().fields();
        fields[12] = 0.0;
        assert_eq!(
            Metagenome::from_fields(&fields),
            Err(GenomeError::NonPositiveFuzziness(0.0))
        );

        let mut fields = Metagenome::default().fields();
        for f in &mut fields[32..36] {
            *f = 0.0;
        }
        assert_eq!(
            Metagenome::from_fields(&fields),
            Err(GenomeError::DegenerateWeights("leaf"))
        );
    }

    #[test]
    fn metagenome_normalizes_inverted_bounds() {
        let mut fields = Metagenome::default().fields();
        fields[13] = 5.0;
        fields[14] = -5.0;
        let meta = Metagenome::from_fields(&fields).expect("meta parses");
        assert_eq!(meta.const_bounds, [-5.0, 5.0]);
    }

    #[test]
    fn genome_round_trips() {
        let coding = "12 + 1 $10 | 4 * = 0 % $10 23 * 100 $1 | 1 20";
        let genome = Genome::parse(&meta_text(), coding).expect("genome parses");
        assert_eq!(genome.len(), 3);
        let (meta_out, coding_out) = genome.sequences();
        let again = Genome::parse(&meta_out, &coding_out).expect("round trip parses");
        assert_eq!(again.sequences(), (meta_out, coding_out));
    }

    #[test]
    fn genome_rejects_malformed_coding() {
        let meta = meta_text();
        assert_eq!(
            Genome::parse(&meta, "1 5 | | 2 3").unwrap_err(),
            GenomeError::EmptyGene { index: 1 }
        );
        assert!(matches!(
            Genome::parse(&meta, "x 5").unwrap_err(),
            GenomeError::InvalidAction { index: 0, .. }
        ));
        assert_eq!(
            Genome::parse(&meta, "1 + 5").unwrap_err(),
            GenomeError::Function {
                index: 0,
                source: ExprError::Truncated
            }
        );
    }

    #[test]
    fn action_codes_wrap_modulo_domain() {
        let genome = Genome::parse(&meta_text(), "99 1").expect("genome parses");
        assert_eq!(genome.gene(0).action, Action::Promote);
        let genome = Genome::parse(&meta_text(), "-1 1").expect("genome parses");
        assert_eq!(genome.gene(0).action, Action::SetState);
    }

    #[test]
    fn link_wraps_offsets_into_range() {
        let genome = Genome::parse(&meta_text(), "0 [-7 | 0 1 | 0 {12").expect("parses");
        let leaves = genome.gene(0).function.leaf_kinds();
        assert_eq!(
            leaves[0],
            LeafKind::PureCall {
                offset: -7,
                target: 2
            }
        );
        let leaves = genome.gene(2).function.leaf_kinds();
        assert_eq!(
            leaves[0],
            LeafKind::ImpureCall {
                offset: 12,
                target: 2
            }
        );
    }

    #[test]
    fn mutation_preserves_linkability() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut genome = Genome::random_coding(aggressive_meta(), 6, &mut rng);
        for _ in 0..50 {
            genome.mutate(&mut rng);
            assert!(genome.len() >= 1);
            for gene in genome.genes() {
                for leaf in gene.function.leaf_kinds() {
                    if let LeafKind::PureCall { target, .. }
                    | LeafKind::ImpureCall { target, .. } = leaf
                    {
                        assert!(target < genome.len());
                    }
                }
            }
            let (meta_text, coding_text) = genome.sequences();
            assert!(Genome::parse(&meta_text, &coding_text).is_ok());
        }
    }

    #[test]
    fn metagenome_mutation_respects_domains() {
        let mut rng = SmallRng::seed_from_u64(9);
        let mut meta = aggressive_meta();
        for _ in 0..200 {
            meta.mutate(&mut rng);
            assert!(meta.fuzziness > 0.0);
            assert!(meta.const_bounds[0] <= meta.const_bounds[1]);
            assert!((1.0..=MAX_GEN_DEPTH).contains(&meta.fun_gen_depth));
            for color in &meta.colors {
                for &c in color {
                    assert!((0.0..=1.0).contains(&c));
                }
            }
            for rate in [
                meta.rates.mute,
                meta.rates.genome,
                meta.rates.gene_action,
                meta.rates.struct_mod,
                meta.rates.leaf_type,
            ] {
                assert!((0.0..=1.0).contains(&rate));
            }
            assert!(meta.genome_weights.iter().all(|&w| w > 0.0));
        }
    }

    #[test]
    fn crossover_yields_parseable_child() {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut meta_a = Metagenome::default();
        meta_a.colors = [[0.1, 0.2, 0.3]; NUM_COLORS];
        let mut meta_b = Metagenome::default();
        meta_b.colors = [[0.9, 0.8, 0.7]; NUM_COLORS];

        let a = Genome::random_coding(meta_a.clone(), 5, &mut rng);
        let b = Genome::random_coding(meta_b.clone(), 8, &mut rng);
        for _ in 0..25 {
            let child = Genome::crossover(&a, &b, &mut rng).expect("crossover parses");
            assert_eq!(child.len(), b.len());
            for (ci, color) in child.meta.colors.iter().enumerate() {
                assert!(
                    *color == meta_a.colors[ci] || *color == meta_b.colors[ci],
                    "child color {ci} must come from a parent"
                );
            }
            let hues: Vec<bool> = child
                .meta
                .colors
                .iter()
                .map(|c| *c == meta_a.colors[0])
                .collect();
            assert!(hues.contains(&true) && hues.contains(&false));
        }
    }
}
