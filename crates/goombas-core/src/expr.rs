//! Arena-backed expression trees: the functions carried by genes.
//!
//! A tree is strictly binary at internal nodes (one of nine arithmetic or
//! comparison operators) with four kinds of leaves: constants, sensor
//! polls, and pure/impure offset calls into the enclosing genome. Child
//! links own their subtrees; parent links are plain back-references into
//! the arena, so no reference cycles exist.
//!
//! Trees serialize to Polish (prefix) notation and parse back from it;
//! `parse(serialize(t))` is behaviourally equal to `t`. Evaluation is
//! post-order through an [`EvalContext`] and never panics: division and
//! modulo by zero yield the left operand, invalid powers and any
//! non-finite intermediate collapse to zero.

use crate::weighted_pick;
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use rand::Rng;
use slotmap::{SlotMap, new_key_type};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for expression-tree nodes in the arena.
    pub struct NodeId;
}

/// Binary operators available to function trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Equ,
    Les,
    Gre,
}

impl Op {
    pub const ALL: [Op; 9] = [
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Pow,
        Op::Equ,
        Op::Les,
        Op::Gre,
    ];

    /// Textual symbol used by the Polish-notation encoding.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::Mod => "%",
            Op::Pow => "^",
            Op::Equ => "=",
            Op::Les => "<",
            Op::Gre => ">",
        }
    }

    #[must_use]
    pub fn from_symbol(token: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.symbol() == token)
    }

    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// The four leaf kinds a function tree may carry.
///
/// `offset` and sensor values are the raw genotype: they may transiently
/// encode out-of-domain numbers after mutation. Offset leaves carry a
/// `target` gene index resolved by the genome's link pass; sensors wrap
/// at lookup time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeafKind {
    Const(f64),
    Sensor(i64),
    PureCall { offset: i64, target: usize },
    ImpureCall { offset: i64, target: usize },
}

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Op { op: Op, left: NodeId, right: NodeId },
    Leaf(LeafKind),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// Where a node hangs in its tree; captured before detaching a subtree.
#[derive(Clone, Copy)]
enum Slot {
    Root,
    Left(NodeId),
    Right(NodeId),
}

/// Parameters steering random tree growth, derived from a metagenome.
#[derive(Debug, Clone)]
pub struct GrowthParams {
    /// Maximum depth of generated subtrees; depth strictly decreases on
    /// every path, so generation always terminates.
    pub depth: u32,
    /// Genome length used to bound random offsets to `[-len, len]`.
    pub genome_len: i64,
    /// Inclusive bounds for random constants.
    pub const_bounds: [f64; 2],
    /// Relative weights for leaf kinds: pure, impure, sensor, constant.
    pub leaf_weights: [f64; 4],
    /// Size of the sensor domain random sensor indices are drawn from.
    pub sensor_domain: i64,
}

/// Host hooks required to evaluate a tree.
///
/// The tree itself has no world knowledge: sensors, offset-call dispatch,
/// and the comparison fuzziness all come from the context. Implementors
/// are responsible for recursion bounding in `call_function`/`call_gene`.
pub trait EvalContext {
    /// Current fuzziness for comparison operators; expected positive.
    fn fuzziness(&self) -> f64;
    /// Resolve a sensor poll from a raw (possibly out-of-domain) index.
    fn sensor(&mut self, raw: i64) -> f64;
    /// Invoke the referenced gene's function only.
    fn call_function(&mut self, gene: usize) -> f64;
    /// Invoke the referenced gene's function and perform its action.
    fn call_gene(&mut self, gene: usize) -> f64;
}

/// Errors raised while parsing a Polish-notation expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("expression ended before all operands were supplied")]
    Truncated,
    #[error("unrecognised token `{0}`")]
    BadToken(String),
    #[error("trailing tokens after expression, starting at `{0}`")]
    Trailing(String),
}

/// An expression tree stored as an arena of nodes.
#[derive(Debug, Clone)]
pub struct FuncTree {
    nodes: SlotMap<NodeId, Node>,
    root: NodeId,
}

impl FuncTree {
    /// Parse a complete expression from whitespace-split tokens.
    pub fn parse(tokens: &[&str]) -> Result<Self, ExprError> {
        let mut tree = Self {
            nodes: SlotMap::with_key(),
            root: NodeId::default(),
        };
        let mut pos = 0;
        tree.root = tree.parse_node(tokens, &mut pos, None)?;
        if pos != tokens.len() {
            return Err(ExprError::Trailing(tokens[pos].to_string()));
        }
        Ok(tree)
    }

    fn parse_node(
        &mut self,
        tokens: &[&str],
        pos: &mut usize,
        parent: Option<NodeId>,
    ) -> Result<NodeId, ExprError> {
        let token = *tokens.get(*pos).ok_or(ExprError::Truncated)?;
        *pos += 1;

        if let Some(op) = Op::from_symbol(token) {
            let id = self.nodes.insert(Node {
                parent,
                kind: NodeKind::Leaf(LeafKind::Const(0.0)),
            });
            let left = self.parse_node(tokens, pos, Some(id))?;
            let right = self.parse_node(tokens, pos, Some(id))?;
            self.nodes[id].kind = NodeKind::Op { op, left, right };
            return Ok(id);
        }

        let bad = || ExprError::BadToken(token.to_string());
        let kind = if let Some(rest) = token.strip_prefix('[') {
            let offset = rest.parse::<i64>().map_err(|_| bad())?;
            LeafKind::PureCall { offset, target: 0 }
        } else if let Some(rest) = token.strip_prefix('{') {
            let offset = rest.parse::<i64>().map_err(|_| bad())?;
            LeafKind::ImpureCall { offset, target: 0 }
        } else if let Some(rest) = token.strip_prefix('$') {
            let index = rest.parse::<i64>().map_err(|_| bad())?;
            LeafKind::Sensor(index)
        } else {
            let value = token.parse::<f64>().ok().filter(|v| v.is_finite());
            LeafKind::Const(value.ok_or_else(bad)?)
        };
        Ok(self.nodes.insert(Node {
            parent,
            kind: NodeKind::Leaf(kind),
        }))
    }

    /// Grow a random tree of at most `params.depth` levels.
    #[must_use]
    pub fn random(params: &GrowthParams, rng: &mut SmallRng) -> Self {
        let mut tree = Self {
            nodes: SlotMap::with_key(),
            root: NodeId::default(),
        };
        tree.root = tree.grow(params.depth, params, rng, None);
        tree
    }

    fn grow(
        &mut self,
        depth: u32,
        params: &GrowthParams,
        rng: &mut SmallRng,
        parent: Option<NodeId>,
    ) -> NodeId {
        if depth <= 1 {
            return self.grow_leaf(params, rng, parent);
        }
        let op = Op::from_index(rng.random_range(0..Op::ALL.len()));
        let id = self.nodes.insert(Node {
            parent,
            kind: NodeKind::Leaf(LeafKind::Const(0.0)),
        });
        let left_depth = rng.random_range(0..depth - 1);
        let left = self.grow(left_depth, params, rng, Some(id));
        let right_depth = rng.random_range(0..depth - 1);
        let right = self.grow(right_depth, params, rng, Some(id));
        self.nodes[id].kind = NodeKind::Op { op, left, right };
        id
    }

    fn grow_leaf(
        &mut self,
        params: &GrowthParams,
        rng: &mut SmallRng,
        parent: Option<NodeId>,
    ) -> NodeId {
        let len = params.genome_len.max(0);
        let kind = match weighted_pick(rng, &params.leaf_weights) {
            0 => LeafKind::PureCall {
                offset: rng.random_range(-len..=len),
                target: 0,
            },
            1 => LeafKind::ImpureCall {
                offset: rng.random_range(-len..=len),
                target: 0,
            },
            2 => LeafKind::Sensor(rng.random_range(0..params.sensor_domain.max(1))),
            _ => LeafKind::Const(
                rng.random_range(params.const_bounds[0]..=params.const_bounds[1]),
            ),
        };
        self.nodes.insert(Node {
            parent,
            kind: NodeKind::Leaf(kind),
        })
    }

    /// Number of nodes in the tree.
    #[must_use]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Evaluate the tree post-order through the supplied context.
    pub fn eval<C: EvalContext>(&self, ctx: &mut C) -> f64 {
        self.eval_node(self.root, ctx)
    }

    fn eval_node<C: EvalContext>(&self, id: NodeId, ctx: &mut C) -> f64 {
        match self.nodes[id].kind {
            NodeKind::Leaf(LeafKind::Const(value)) => value,
            NodeKind::Leaf(LeafKind::Sensor(raw)) => ctx.sensor(raw),
            NodeKind::Leaf(LeafKind::PureCall { target, .. }) => ctx.call_function(target),
            NodeKind::Leaf(LeafKind::ImpureCall { target, .. }) => ctx.call_gene(target),
            NodeKind::Op { op, left, right } => {
                let l = self.eval_node(left, ctx);
                let r = self.eval_node(right, ctx);
                apply_op(op, l, r, ctx.fuzziness())
            }
        }
    }

    /// Rebind every offset leaf's resolved gene index.
    ///
    /// Must be re-run after any structural change to gene count or order.
    pub fn bind_offsets(&mut self, gene_index: usize, gene_count: usize) {
        for node in self.nodes.values_mut() {
            if let NodeKind::Leaf(
                LeafKind::PureCall { offset, target }
                | LeafKind::ImpureCall { offset, target },
            ) = &mut node.kind
            {
                *target = resolve_offset(*offset, gene_index, gene_count);
            }
        }
    }

    /// All node ids, in-order.
    #[must_use]
    pub fn flatten(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.collect_in_order(self.root, &mut out);
        out
    }

    fn collect_in_order(&self, id: NodeId, out: &mut Vec<NodeId>) {
        match self.nodes[id].kind {
            NodeKind::Op { left, right, .. } => {
                self.collect_in_order(left, out);
                out.push(id);
                self.collect_in_order(right, out);
            }
            NodeKind::Leaf(_) => out.push(id),
        }
    }

    /// Leaf payloads, in-order.
    #[must_use]
    pub fn leaf_kinds(&self) -> Vec<LeafKind> {
        self.flatten()
            .into_iter()
            .filter_map(|id| match self.nodes[id].kind {
                NodeKind::Leaf(kind) => Some(kind),
                NodeKind::Op { .. } => None,
            })
            .collect()
    }

    /// Pick a uniformly random node.
    #[must_use]
    pub fn random_node(&self, rng: &mut SmallRng) -> NodeId {
        self.flatten()
            .as_slice()
            .choose(rng)
            .copied()
            .unwrap_or(self.root)
    }

    /// Operator at `id`, when it is an internal node.
    #[must_use]
    pub fn op(&self, id: NodeId) -> Option<Op> {
        match self.nodes[id].kind {
            NodeKind::Op { op, .. } => Some(op),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn set_op(&mut self, id: NodeId, op: Op) {
        if let NodeKind::Op { op: slot, .. } = &mut self.nodes[id].kind {
            *slot = op;
        }
    }

    /// Leaf payload at `id`, when it is a leaf.
    #[must_use]
    pub fn leaf(&self, id: NodeId) -> Option<LeafKind> {
        match self.nodes[id].kind {
            NodeKind::Leaf(kind) => Some(kind),
            NodeKind::Op { .. } => None,
        }
    }

    pub fn set_leaf(&mut self, id: NodeId, kind: LeafKind) {
        if let NodeKind::Leaf(slot) = &mut self.nodes[id].kind {
            *slot = kind;
        }
    }

    /// Replace the subtree rooted at `at` with a freshly grown one.
    pub fn replace_subtree(&mut self, at: NodeId, params: &GrowthParams, rng: &mut SmallRng) {
        let slot = self.slot_of(at);
        let parent = slot.parent();
        self.remove_subtree(at);
        let fresh = self.grow(params.depth, params, rng, parent);
        self.attach(slot, fresh);
    }

    /// Insert a random operator in `at`'s place; the original node becomes
    /// one operand (50/50 left or right) and a fresh subtree the other.
    pub fn insert_op_above(&mut self, at: NodeId, params: &GrowthParams, rng: &mut SmallRng) {
        let slot = self.slot_of(at);
        let op = Op::from_index(rng.random_range(0..Op::ALL.len()));
        let wrapper = self.nodes.insert(Node {
            parent: None,
            kind: NodeKind::Leaf(LeafKind::Const(0.0)),
        });
        let fresh = self.grow(params.depth, params, rng, Some(wrapper));
        let (left, right) = if rng.random_bool(0.5) {
            (at, fresh)
        } else {
            (fresh, at)
        };
        self.nodes[wrapper].kind = NodeKind::Op { op, left, right };
        self.nodes[at].parent = Some(wrapper);
        self.attach(slot, wrapper);
    }

    /// Swap a node's operands. For a leaf, the parent's operands are
    /// swapped instead; a leaf that is also the root is a no-op.
    pub fn swap_operands(&mut self, at: NodeId) {
        let target = match self.nodes[at].kind {
            NodeKind::Op { .. } => Some(at),
            NodeKind::Leaf(_) => self.nodes[at].parent,
        };
        if let Some(id) = target {
            if let NodeKind::Op { op, left, right } = self.nodes[id].kind {
                self.nodes[id].kind = NodeKind::Op {
                    op,
                    left: right,
                    right: left,
                };
            }
        }
    }

    /// Replace the subtree at `at` with a copy of `donor_node`'s subtree
    /// from another tree. Choosing the root replaces the whole tree.
    pub fn graft(&mut self, at: NodeId, donor: &FuncTree, donor_node: NodeId) {
        let slot = self.slot_of(at);
        let parent = slot.parent();
        self.remove_subtree(at);
        let copied = self.copy_from(donor, donor_node, parent);
        self.attach(slot, copied);
    }

    fn copy_from(&mut self, donor: &FuncTree, id: NodeId, parent: Option<NodeId>) -> NodeId {
        match donor.nodes[id].kind {
            NodeKind::Leaf(kind) => self.nodes.insert(Node {
                parent,
                kind: NodeKind::Leaf(kind),
            }),
            NodeKind::Op { op, left, right } => {
                let nid = self.nodes.insert(Node {
                    parent,
                    kind: NodeKind::Leaf(LeafKind::Const(0.0)),
                });
                let l = self.copy_from(donor, left, Some(nid));
                let r = self.copy_from(donor, right, Some(nid));
                self.nodes[nid].kind = NodeKind::Op { op, left: l, right: r };
                nid
            }
        }
    }

    fn slot_of(&self, id: NodeId) -> Slot {
        match self.nodes[id].parent {
            None => Slot::Root,
            Some(p) => match self.nodes[p].kind {
                NodeKind::Op { left, .. } if left == id => Slot::Left(p),
                _ => Slot::Right(p),
            },
        }
    }

    fn attach(&mut self, slot: Slot, id: NodeId) {
        match slot {
            Slot::Root => {
                self.root = id;
                self.nodes[id].parent = None;
            }
            Slot::Left(p) => {
                if let NodeKind::Op { left, .. } = &mut self.nodes[p].kind {
                    *left = id;
                }
                self.nodes[id].parent = Some(p);
            }
            Slot::Right(p) => {
                if let NodeKind::Op { right, .. } = &mut self.nodes[p].kind {
                    *right = id;
                }
                self.nodes[id].parent = Some(p);
            }
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            if let NodeKind::Op { left, right, .. } = node.kind {
                self.remove_subtree(left);
                self.remove_subtree(right);
            }
        }
    }

    fn fmt_node(&self, id: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nodes[id].kind {
            NodeKind::Op { op, left, right } => {
                write!(f, "{} ", op.symbol())?;
                self.fmt_node(left, f)?;
                write!(f, " ")?;
                self.fmt_node(right, f)
            }
            NodeKind::Leaf(LeafKind::Const(value)) => write!(f, "{value}"),
            NodeKind::Leaf(LeafKind::Sensor(index)) => write!(f, "${index}"),
            NodeKind::Leaf(LeafKind::PureCall { offset, .. }) => write!(f, "[{offset}"),
            NodeKind::Leaf(LeafKind::ImpureCall { offset, .. }) => write!(f, "{{{offset}"),
        }
    }
}

impl fmt::Display for FuncTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(self.root, f)
    }
}

impl Slot {
    fn parent(self) -> Option<NodeId> {
        match self {
            Slot::Root => None,
            Slot::Left(p) | Slot::Right(p) => Some(p),
        }
    }
}

/// Wrap a raw signed offset into a valid gene index.
pub(crate) fn resolve_offset(offset: i64, gene_index: usize, gene_count: usize) -> usize {
    if gene_count == 0 {
        return 0;
    }
    offset
        .wrapping_add(gene_index as i64)
        .rem_euclid(gene_count as i64) as usize
}

fn apply_op(op: Op, l: f64, r: f64, fuzziness: f64) -> f64 {
    let f = fuzziness.max(f64::EPSILON);
    let value = match op {
        Op::Add => l + r,
        Op::Sub => l - r,
        Op::Mul => l * r,
        Op::Div => {
            if r == 0.0 {
                l
            } else {
                l / r
            }
        }
        // Floored modulo: the sign follows the divisor.
        Op::Mod => {
            if r == 0.0 {
                l
            } else {
                l - r * (l / r).floor()
            }
        }
        Op::Pow => pow_real(l, r),
        Op::Equ => (f - (l - r).abs()).max(0.0) / f,
        Op::Les => (r - l).clamp(0.0, f) / f,
        Op::Gre => (l - r).clamp(0.0, f) / f,
    };
    if value.is_finite() { value } else { 0.0 }
}

/// Real component of the principal value of `l^r`; zero base yields zero.
fn pow_real(l: f64, r: f64) -> f64 {
    if l == 0.0 {
        0.0
    } else if l > 0.0 {
        l.powf(r)
    } else {
        (-l).powf(r) * (std::f64::consts::PI * r).cos()
    }
}
