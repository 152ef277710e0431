//! The vpsc placement backend
//!
//! # Summary
//!
//! This module places weighted variables on a line, as close as possible to
//! their desired positions, subject to separation constraints
//! `right - left >= gap` (or `= gap` for equalities).
//!
//! The solver is an active-set method over *blocks*. Variables joined by
//! constraints that currently hold with equality ("active" constraints) are
//! gathered into a block and move as one rigid unit; each member keeps a
//! fixed offset from the block's reference position, and the block itself
//! sits at the weighted mean that is optimal for its members. Feasibility is
//! reached by merging blocks across violated constraints
//! ([solve::Solver::satisfy]); optimality by splitting blocks at active
//! constraints whose Lagrange multipliers have gone negative
//! ([solve::Solver::refine]). The incremental solver ([solve::IncSolver])
//! keeps the block structure between solves so that layout iteration, where
//! desired positions drift a little on every pass, pays only for the
//! adjustments.
//!
//! # Reference-level explanation
//!
//! The module is organized bottom up:
//!
//! - [index] defines the typed indices used to key the variable, constraint,
//!   and block pools, plus the generation-checked block handle.
//! - [problem] defines [problem::Variable] and [problem::Constraint], the
//!   externally-supplied description of an instance.
//! - [block] defines [block::Block] and its internal machinery: offset
//!   bookkeeping, the post-order Lagrange-multiplier pass over the active
//!   tree, and the path searches used to decide splits.
//! - [blocks] defines [blocks::BlockSet], the arena that owns live blocks and
//!   implements merging, splitting, and the slack-keyed boundary heaps.
//! - [graph] answers order and cyclicity questions about the input
//!   constraint digraph via petgraph.
//! - [solve] holds the two entry points, [solve::Solver] and
//!   [solve::IncSolver].
//! - [nonoverlap] is a producer of instances: a sweep-line over axis-aligned
//!   rectangles that emits the separation constraints whose satisfaction
//!   removes overlap along one axis.
//!
//! ## Vocabulary
//!
//! *Slack* of a constraint is `right.position - left.position - gap`;
//! non-negative means satisfied. An *active* constraint has zero slack and an
//! edge in some block's spanning tree. The *Lagrange multiplier* of an active
//! edge `u -> v` is the sum of `weight * (position - desired)` over the
//! subtree hanging off `v`; a negative value names an edge whose removal
//! would let the solver lower the cost, which is exactly when a block is
//! split.

pub mod error {
    //! Error types for placement
    //!
    //! # Summary
    //!
    //! The backend exposes errors with fine-grained types and attaches
    //! [SpanTrace]s so failures deep inside a solve report where they were
    //! triggered.
    //!
    //! [OrErrExt] helps attach current span information to [Option]s.
    use tracing_error::{ExtractSpanTrace, InstrumentError, SpanTrace, TracedError};

    use miette::Diagnostic;

    use super::index::{BlockIx, ConIx};

    #[non_exhaustive]
    #[derive(Debug, Diagnostic, thiserror::Error)]
    #[diagnostic(code(vpsc::placement::error))]
    pub enum Kind {
        #[error("indexing error")]
        IndexingError {},
        #[error("stale block handle {block}")]
        StaleBlockError { block: BlockIx },
    }

    #[non_exhaustive]
    #[derive(Debug, thiserror::Error)]
    pub enum SolveError {
        #[error("unsatisfied separation constraint {constraint} (slack {slack})")]
        UnsatisfiedConstraint { constraint: ConIx, slack: f64 },
    }

    #[non_exhaustive]
    #[derive(Debug, Diagnostic, thiserror::Error)]
    #[diagnostic(code(vpsc::placement::error))]
    pub enum Error {
        #[error(transparent)]
        PlacementError {
            #[from]
            source: TracedError<Kind>,
        },
        #[error(transparent)]
        SolveError {
            #[from]
            source: TracedError<SolveError>,
        },
    }

    impl From<Kind> for Error {
        fn from(source: Kind) -> Self {
            Self::PlacementError {
                source: source.into(),
            }
        }
    }

    impl ExtractSpanTrace for Error {
        fn span_trace(&self) -> Option<&SpanTrace> {
            use std::error::Error as _;
            match self {
                Error::PlacementError { source } => {
                    source.source().and_then(ExtractSpanTrace::span_trace)
                }
                Error::SolveError { source } => {
                    source.source().and_then(ExtractSpanTrace::span_trace)
                }
            }
        }
    }

    /// A trait to use to annotate [Option] values with rich error information.
    pub trait OrErrExt<E> {
        type Item;
        fn or_err(self, error: E) -> Result<Self::Item, Error>;
    }

    impl<V, E> OrErrExt<E> for Option<V>
    where
        TracedError<E>: From<E>,
        Error: From<TracedError<E>>,
    {
        type Item = V;
        fn or_err(self, error: E) -> Result<V, Error> {
            self.ok_or_else(|| Error::from(error.in_current_span()))
        }
    }
}

pub mod index {
    //! Index types for placement
    //!
    //! # Summary
    //!
    //! The solver keeps variables, constraints, and blocks in pools and
    //! threads integer handles through the algorithms instead of references,
    //! which would otherwise form ownership cycles (variables point at their
    //! block, blocks list their variables). Typed indices keep the handle
    //! kinds from mixing.
    //!
    //! Block handles additionally carry a generation. Block slots are
    //! recycled when tombstoned blocks are swept, and a handle that outlives
    //! the sweep must be detected rather than silently read whatever moved
    //! into the slot.
    use std::fmt::Display;

    use derive_more::{From, Into};

    #[derive(Clone, Copy, Debug, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd)]
    pub struct VarIx(pub usize);

    #[derive(Clone, Copy, Debug, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd)]
    pub struct ConIx(pub usize);

    #[derive(Clone, Copy, Debug, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd)]
    pub struct BlockIx(pub usize);

    /// A generation-checked handle to a block slot.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct BlockRef {
        pub ix: BlockIx,
        pub gen: u32,
    }

    impl Default for BlockRef {
        fn default() -> Self {
            Self {
                ix: BlockIx(usize::MAX),
                gen: u32::MAX,
            }
        }
    }

    impl Display for VarIx {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_fmt(format_args!("v{}", self.0))
        }
    }

    impl Display for ConIx {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_fmt(format_args!("c{}", self.0))
        }
    }

    impl Display for BlockIx {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_fmt(format_args!("b{}", self.0))
        }
    }

    impl Display for BlockRef {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_fmt(format_args!("{}@{}", self.ix, self.gen))
        }
    }
}

pub mod problem {
    //! The externally-supplied description of a placement instance.
    use super::index::{BlockRef, ConIx, VarIx};

    /// A scalar to be placed on the number line.
    ///
    /// Callers fill in `desired_position`, `weight` (and, for scaled
    /// sub-problems, `scale`); the solver maintains the rest. After a solve
    /// the result is read back from `final_position`.
    #[derive(Clone, Debug)]
    pub struct Variable {
        pub desired_position: f64,
        pub weight: f64,
        pub scale: f64,
        /// Position relative to the owning block's reference position.
        pub offset: f64,
        pub final_position: f64,
        pub block: BlockRef,
        /// Constraints in which this variable is the right endpoint.
        pub in_cons: Vec<ConIx>,
        /// Constraints in which this variable is the left endpoint.
        pub out_cons: Vec<ConIx>,
    }

    impl Variable {
        pub fn new(desired_position: f64, weight: f64) -> Self {
            Self::with_scale(desired_position, weight, 1.0)
        }

        pub fn with_scale(desired_position: f64, weight: f64, scale: f64) -> Self {
            Self {
                desired_position,
                weight,
                scale,
                offset: 0.0,
                final_position: desired_position,
                block: BlockRef::default(),
                in_cons: Vec::new(),
                out_cons: Vec::new(),
            }
        }
    }

    /// A separation constraint `right - left >= gap`, or `right - left = gap`
    /// when `equality` is set.
    ///
    /// `active`, `lm`, and `unsatisfiable` are solver state: whether the
    /// constraint currently spans an edge inside a block, its Lagrange
    /// multiplier as of the last multiplier pass over that block, and whether
    /// the solver gave up on it (a constraint that would close a directed
    /// cycle of active constraints, or that no split could free, is flagged
    /// and thereafter ignored rather than failing the whole solve).
    #[derive(Clone, Debug)]
    pub struct Constraint {
        pub left: VarIx,
        pub right: VarIx,
        pub gap: f64,
        pub equality: bool,
        pub active: bool,
        pub lm: f64,
        pub unsatisfiable: bool,
    }

    impl Constraint {
        pub fn new(left: VarIx, right: VarIx, gap: f64) -> Self {
            Self {
                left,
                right,
                gap,
                equality: false,
                active: false,
                lm: 0.0,
                unsatisfiable: false,
            }
        }

        pub fn new_equality(left: VarIx, right: VarIx, gap: f64) -> Self {
            Self {
                equality: true,
                ..Self::new(left, right, gap)
            }
        }
    }
}

pub mod block {
    //! Blocks and their internal machinery
    //!
    //! # Summary
    //!
    //! A block is a non-empty set of variables whose relative positions are
    //! frozen by active constraints. The active constraints over a block's
    //! members always form a spanning tree: one edge fewer would disconnect
    //! the block, one more would close a cycle, which activation is careful
    //! never to do.
    //!
    //! The block does not store that tree explicitly. Every traversal walks
    //! the members' incident constraint lists and follows the `active` flags,
    //! exactly as the merge and split operations maintain them.
    use std::collections::{BinaryHeap, HashMap, HashSet};

    use typed_index_collections::TiVec;

    use super::index::{ConIx, VarIx};
    use super::problem::{Constraint, Variable};

    /// An entry in a block's boundary-constraint heap.
    ///
    /// `key` is the constraint's slack as of the push (equalities key at
    /// negative infinity so they always surface first). Block positions move
    /// between pushes and pops, so the consumer re-checks the key against the
    /// live slack and re-queues entries that have gone stale.
    #[derive(Clone, Copy, Debug)]
    pub struct HeapEntry {
        pub key: f64,
        pub cix: ConIx,
    }

    impl PartialEq for HeapEntry {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == std::cmp::Ordering::Equal
        }
    }

    impl Eq for HeapEntry {}

    impl PartialOrd for HeapEntry {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for HeapEntry {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            // reversed so that the std max-heap pops the smallest slack
            other
                .key
                .total_cmp(&self.key)
                .then_with(|| other.cix.cmp(&self.cix))
        }
    }

    /// Merge `src` into `dst`, allocating `dst` if it was never set up.
    pub fn merge_heaps(dst: &mut Option<BinaryHeap<HeapEntry>>, src: Option<BinaryHeap<HeapEntry>>) {
        let Some(mut src) = src else { return };
        match dst.take() {
            Some(mut d) => {
                d.append(&mut src);
                *dst = Some(d);
            }
            None => *dst = Some(src),
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct Block {
        pub vars: Vec<VarIx>,
        /// Reference position: the weighted mean minimizing the members'
        /// squared displacements given their offsets.
        pub posn: f64,
        /// Numerator of `posn`: `sum of weight * scale * (desired - offset/scale)`.
        pub wposn: f64,
        /// Denominator of `posn`: `sum of weight * scale^2`.
        pub weight: f64,
        /// Tombstone set when this block is absorbed or split; swept by
        /// [super::blocks::BlockSet::cleanup].
        pub deleted: bool,
        pub in_heap: Option<BinaryHeap<HeapEntry>>,
        pub out_heap: Option<BinaryHeap<HeapEntry>>,
    }

    impl Block {
        /// The singleton block every variable starts out in.
        pub fn for_variable(vix: VarIx, v: &Variable) -> Self {
            let mut b = Self::default();
            b.vars.push(vix);
            b.wposn = v.weight * v.scale * (v.desired_position - v.offset / v.scale);
            b.weight = v.weight * v.scale * v.scale;
            b.posn = b.wposn / b.weight;
            b
        }

        /// Position of a member variable.
        pub fn member_position(&self, vars: &TiVec<VarIx, Variable>, vix: VarIx) -> f64 {
            let v = &vars[vix];
            self.posn + v.offset / v.scale
        }

        /// Recompute the weighted-position accumulators from the members.
        pub fn update_weighted_position(&mut self, vars: &TiVec<VarIx, Variable>) {
            self.wposn = 0.0;
            self.weight = 0.0;
            for &vix in &self.vars {
                let v = &vars[vix];
                self.wposn += v.weight * v.scale * (v.desired_position - v.offset / v.scale);
                self.weight += v.weight * v.scale * v.scale;
            }
            self.posn = self.wposn / self.weight;
        }

        /// Find the active constraint with the most negative Lagrange
        /// multiplier, writing fresh multipliers into every active edge of
        /// this block along the way. Equality edges are never candidates:
        /// they must stay active no matter how hard they pull.
        pub fn find_min_lm(
            &self,
            vars: &TiVec<VarIx, Variable>,
            cons: &mut TiVec<ConIx, Constraint>,
        ) -> Option<ConIx> {
            self.lagrangian_pass(vars, cons)
        }

        /// One post-order pass over the active tree.
        ///
        /// On each tree edge `u -> v` the multiplier is the sum of
        /// `weight * (position - desired)` over the subtree hanging off `v`,
        /// negated when the edge is oriented against the traversal.
        fn lagrangian_pass(
            &self,
            vars: &TiVec<VarIx, Variable>,
            cons: &mut TiVec<ConIx, Constraint>,
        ) -> Option<ConIx> {
            let &root = self.vars.first()?;
            for &vix in &self.vars {
                for &cix in &vars[vix].out_cons {
                    if cons[cix].active {
                        cons[cix].lm = 0.0;
                    }
                }
            }

            // preorder with the edge that led into each node
            let mut visited: HashSet<VarIx> = HashSet::with_capacity(self.vars.len());
            let mut visit: Vec<(VarIx, Option<(ConIx, bool, VarIx)>)> =
                Vec::with_capacity(self.vars.len());
            let mut stack = vec![(root, None)];
            visited.insert(root);
            while let Some((v, edge)) = stack.pop() {
                visit.push((v, edge));
                for &cix in &vars[v].out_cons {
                    let c = &cons[cix];
                    if c.active && visited.insert(c.right) {
                        stack.push((c.right, Some((cix, true, v))));
                    }
                }
                for &cix in &vars[v].in_cons {
                    let c = &cons[cix];
                    if c.active && visited.insert(c.left) {
                        stack.push((c.left, Some((cix, false, v))));
                    }
                }
            }

            // post-order accumulation of subtree displacement sums
            let mut sums: HashMap<VarIx, f64> = HashMap::with_capacity(visit.len());
            let mut min_lm: Option<ConIx> = None;
            for &(v, edge) in visit.iter().rev() {
                let pos = self.member_position(vars, v);
                let subtree = sums.get(&v).copied().unwrap_or(0.0)
                    + vars[v].weight * (pos - vars[v].desired_position);
                if let Some((cix, child_is_right, parent)) = edge {
                    cons[cix].lm = if child_is_right { subtree } else { -subtree };
                    *sums.entry(parent).or_insert(0.0) += subtree;
                    if !cons[cix].equality {
                        min_lm = match min_lm {
                            Some(m) if cons[m].lm <= cons[cix].lm => Some(m),
                            _ => Some(cix),
                        };
                    }
                }
            }
            min_lm
        }

        /// Is there a directed path `from -> ... -> to` through active
        /// constraints? Used to detect that activating a constraint would
        /// close a cycle and over-constrain the block.
        pub fn is_active_directed_path_between(
            &self,
            vars: &TiVec<VarIx, Variable>,
            cons: &TiVec<ConIx, Constraint>,
            from: VarIx,
            to: VarIx,
        ) -> bool {
            let mut visited: HashSet<VarIx> = HashSet::new();
            let mut stack = vec![from];
            visited.insert(from);
            while let Some(v) = stack.pop() {
                if v == to {
                    return true;
                }
                for &cix in &vars[v].out_cons {
                    let c = &cons[cix];
                    if c.active && visited.insert(c.right) {
                        stack.push(c.right);
                    }
                }
            }
            false
        }

        /// Choose the active constraint to free so that the block can split
        /// between `lv` and `rv`: the most negative multiplier among the
        /// non-equality edges on the tree path between them. Returns None if
        /// every edge on the path is an equality.
        pub fn find_min_lm_between(
            &self,
            vars: &TiVec<VarIx, Variable>,
            cons: &mut TiVec<ConIx, Constraint>,
            lv: VarIx,
            rv: VarIx,
        ) -> Option<ConIx> {
            self.lagrangian_pass(vars, cons);
            let path = self.active_path_between(vars, cons, lv, rv)?;
            let mut min_lm: Option<ConIx> = None;
            for cix in path {
                if cons[cix].equality {
                    continue;
                }
                min_lm = match min_lm {
                    Some(m) if cons[m].lm <= cons[cix].lm => Some(m),
                    _ => Some(cix),
                };
            }
            min_lm
        }

        /// The undirected tree path between two members, as the constraints
        /// along it.
        fn active_path_between(
            &self,
            vars: &TiVec<VarIx, Variable>,
            cons: &TiVec<ConIx, Constraint>,
            from: VarIx,
            to: VarIx,
        ) -> Option<Vec<ConIx>> {
            let mut parent: HashMap<VarIx, (VarIx, ConIx)> = HashMap::new();
            let mut visited: HashSet<VarIx> = HashSet::new();
            let mut stack = vec![from];
            visited.insert(from);
            while let Some(v) = stack.pop() {
                if v == to {
                    break;
                }
                for &cix in &vars[v].out_cons {
                    let c = &cons[cix];
                    if c.active && visited.insert(c.right) {
                        parent.insert(c.right, (v, cix));
                        stack.push(c.right);
                    }
                }
                for &cix in &vars[v].in_cons {
                    let c = &cons[cix];
                    if c.active && visited.insert(c.left) {
                        parent.insert(c.left, (v, cix));
                        stack.push(c.left);
                    }
                }
            }
            if !visited.contains(&to) {
                return None;
            }
            let mut path = Vec::new();
            let mut v = to;
            while v != from {
                let &(p, cix) = parent.get(&v)?;
                path.push(cix);
                v = p;
            }
            Some(path)
        }
    }

    /// The connected component of the active tree reachable from `start`,
    /// optionally treating one constraint as removed.
    pub fn active_component(
        vars: &TiVec<VarIx, Variable>,
        cons: &TiVec<ConIx, Constraint>,
        start: VarIx,
        exclude: Option<ConIx>,
    ) -> Vec<VarIx> {
        let mut visited: HashSet<VarIx> = HashSet::new();
        let mut component = Vec::new();
        let mut stack = vec![start];
        visited.insert(start);
        while let Some(v) = stack.pop() {
            component.push(v);
            for &cix in &vars[v].out_cons {
                let c = &cons[cix];
                if c.active && Some(cix) != exclude && visited.insert(c.right) {
                    stack.push(c.right);
                }
            }
            for &cix in &vars[v].in_cons {
                let c = &cons[cix];
                if c.active && Some(cix) != exclude && visited.insert(c.left) {
                    stack.push(c.left);
                }
            }
        }
        component
    }
}

pub mod blocks {
    //! The owning collection of live blocks
    //!
    //! # Summary
    //!
    //! [BlockSet] is an arena: block slots carry a generation counter, handles
    //! are `(index, generation)` pairs, and [BlockSet::cleanup] frees
    //! tombstoned slots and bumps their generation so stale handles surface as
    //! errors instead of reads of recycled slots.
    //!
    //! Besides ownership, this module implements the operations that change
    //! the partition: merging two blocks over a newly-activating constraint,
    //! splitting one at a freed constraint, and the `merge_left` /
    //! `merge_right` loops that pull in the most violated boundary constraint
    //! until none is violated.
    use typed_index_collections::TiVec;

    use tracing::{event, Level};

    use super::block::{self, Block, HeapEntry};
    use super::error::{Error, Kind, OrErrExt};
    use super::index::{BlockIx, BlockRef, ConIx, VarIx};
    use super::problem::{Constraint, Variable};

    #[derive(Clone, Debug, Default)]
    struct Slot {
        gen: u32,
        block: Option<Block>,
    }

    #[derive(Clone, Debug, Default)]
    pub struct BlockSet {
        slots: TiVec<BlockIx, Slot>,
        free: Vec<BlockIx>,
    }

    impl BlockSet {
        pub fn insert(&mut self, block: Block) -> BlockRef {
            match self.free.pop() {
                Some(ix) => {
                    let slot = &mut self.slots[ix];
                    slot.block = Some(block);
                    BlockRef { ix, gen: slot.gen }
                }
                None => {
                    let ix = self.slots.push_and_get_key(Slot {
                        gen: 0,
                        block: Some(block),
                    });
                    BlockRef { ix, gen: 0 }
                }
            }
        }

        pub fn get(&self, r: BlockRef) -> Result<&Block, Error> {
            self.slots
                .get(r.ix)
                .filter(|slot| slot.gen == r.gen)
                .and_then(|slot| slot.block.as_ref())
                .or_err(Kind::StaleBlockError { block: r.ix })
        }

        pub fn get_mut(&mut self, r: BlockRef) -> Result<&mut Block, Error> {
            self.slots
                .get_mut(r.ix)
                .filter(|slot| slot.gen == r.gen)
                .and_then(|slot| slot.block.as_mut())
                .or_err(Kind::StaleBlockError { block: r.ix })
        }

        fn take(&mut self, r: BlockRef) -> Result<Block, Error> {
            self.slots
                .get_mut(r.ix)
                .filter(|slot| slot.gen == r.gen)
                .and_then(|slot| slot.block.take())
                .or_err(Kind::StaleBlockError { block: r.ix })
        }

        fn untake(&mut self, r: BlockRef, block: Block) {
            if let Some(slot) = self.slots.get_mut(r.ix) {
                debug_assert_eq!(slot.gen, r.gen);
                slot.block = Some(block);
            }
        }

        /// Sweep tombstoned blocks, recycling their slots under a fresh
        /// generation.
        pub fn cleanup(&mut self) {
            let dead: Vec<BlockIx> = self
                .slots
                .iter_enumerated()
                .filter(|(_, slot)| slot.block.as_ref().is_some_and(|b| b.deleted))
                .map(|(ix, _)| ix)
                .collect();
            for ix in dead {
                let slot = &mut self.slots[ix];
                slot.block = None;
                slot.gen = slot.gen.wrapping_add(1);
                self.free.push(ix);
            }
        }

        pub fn live_refs(&self) -> Vec<BlockRef> {
            self.slots
                .iter_enumerated()
                .filter_map(|(ix, slot)| {
                    slot.block
                        .as_ref()
                        .filter(|b| !b.deleted)
                        .map(|_| BlockRef { ix, gen: slot.gen })
                })
                .collect()
        }

        pub fn live_count(&self) -> usize {
            self.slots
                .iter_enumerated()
                .filter(|(_, slot)| slot.block.as_ref().is_some_and(|b| !b.deleted))
                .count()
        }

        /// Position of any variable, through its owning block.
        pub fn position(&self, vars: &TiVec<VarIx, Variable>, vix: VarIx) -> Result<f64, Error> {
            let v = &vars[vix];
            let b = self.get(v.block)?;
            Ok(b.posn + v.offset / v.scale)
        }

        /// Slack of a constraint. Constraints flagged unsatisfiable report
        /// `f64::MAX` so that verification passes them and the violated-merge
        /// loop never picks them again.
        pub fn slack(
            &self,
            vars: &TiVec<VarIx, Variable>,
            cons: &TiVec<ConIx, Constraint>,
            cix: ConIx,
        ) -> Result<f64, Error> {
            let c = &cons[cix];
            if c.unsatisfiable {
                return Ok(f64::MAX);
            }
            let l = &vars[c.left];
            let r = &vars[c.right];
            Ok(r.scale * self.position(vars, c.right)? - c.gap
                - l.scale * self.position(vars, c.left)?)
        }

        /// Total weighted squared displacement over the live blocks.
        pub fn cost(&self, vars: &TiVec<VarIx, Variable>) -> f64 {
            let mut cost = 0.0;
            for (_, slot) in self.slots.iter_enumerated() {
                let Some(b) = slot.block.as_ref() else { continue };
                if b.deleted {
                    continue;
                }
                for &vix in &b.vars {
                    let v = &vars[vix];
                    let d = b.posn + v.offset / v.scale - v.desired_position;
                    cost += v.weight * d * d;
                }
            }
            cost
        }

        /// Rebuild the heap of inactive constraints entering this block,
        /// keyed by slack ascending.
        pub fn setup_in_constraints(
            &mut self,
            bref: BlockRef,
            vars: &TiVec<VarIx, Variable>,
            cons: &TiVec<ConIx, Constraint>,
        ) -> Result<(), Error> {
            let entries = {
                let b = self.get(bref)?;
                let mut entries = Vec::new();
                for &vix in &b.vars {
                    for &cix in &vars[vix].in_cons {
                        let c = &cons[cix];
                        if c.active || vars[c.left].block == bref {
                            continue;
                        }
                        let key = if c.equality {
                            f64::NEG_INFINITY
                        } else {
                            self.slack(vars, cons, cix)?
                        };
                        entries.push(HeapEntry { key, cix });
                    }
                }
                entries
            };
            let b = self.get_mut(bref)?;
            b.in_heap = Some(entries.into_iter().collect());
            Ok(())
        }

        /// Rebuild the heap of inactive constraints leaving this block.
        pub fn setup_out_constraints(
            &mut self,
            bref: BlockRef,
            vars: &TiVec<VarIx, Variable>,
            cons: &TiVec<ConIx, Constraint>,
        ) -> Result<(), Error> {
            let entries = {
                let b = self.get(bref)?;
                let mut entries = Vec::new();
                for &vix in &b.vars {
                    for &cix in &vars[vix].out_cons {
                        let c = &cons[cix];
                        if c.active || vars[c.right].block == bref {
                            continue;
                        }
                        let key = if c.equality {
                            f64::NEG_INFINITY
                        } else {
                            self.slack(vars, cons, cix)?
                        };
                        entries.push(HeapEntry { key, cix });
                    }
                }
                entries
            };
            let b = self.get_mut(bref)?;
            b.out_heap = Some(entries.into_iter().collect());
            Ok(())
        }

        /// The minimum-slack inactive constraint entering the block.
        ///
        /// Heap keys go stale whenever block positions move, so the top entry
        /// is validated before it is believed: entries that became active or
        /// internal are dropped, entries whose slack moved are re-queued
        /// under the current value.
        pub fn find_min_in_constraint(
            &mut self,
            bref: BlockRef,
            vars: &TiVec<VarIx, Variable>,
            cons: &TiVec<ConIx, Constraint>,
        ) -> Result<Option<ConIx>, Error> {
            loop {
                let top = {
                    let b = self.get(bref)?;
                    let heap = b.in_heap.as_ref().or_err(Kind::IndexingError {})?;
                    heap.peek().copied()
                };
                let Some(entry) = top else { return Ok(None) };
                let c = &cons[entry.cix];
                if c.active || vars[c.left].block == vars[c.right].block {
                    if let Some(heap) = self.get_mut(bref)?.in_heap.as_mut() {
                        heap.pop();
                    }
                    continue;
                }
                let key = if c.equality {
                    f64::NEG_INFINITY
                } else {
                    self.slack(vars, cons, entry.cix)?
                };
                if key != entry.key {
                    if let Some(heap) = self.get_mut(bref)?.in_heap.as_mut() {
                        heap.pop();
                        heap.push(HeapEntry {
                            key,
                            cix: entry.cix,
                        });
                    }
                    continue;
                }
                return Ok(Some(entry.cix));
            }
        }

        /// The minimum-slack inactive constraint leaving the block.
        pub fn find_min_out_constraint(
            &mut self,
            bref: BlockRef,
            vars: &TiVec<VarIx, Variable>,
            cons: &TiVec<ConIx, Constraint>,
        ) -> Result<Option<ConIx>, Error> {
            loop {
                let top = {
                    let b = self.get(bref)?;
                    let heap = b.out_heap.as_ref().or_err(Kind::IndexingError {})?;
                    heap.peek().copied()
                };
                let Some(entry) = top else { return Ok(None) };
                let c = &cons[entry.cix];
                if c.active || vars[c.left].block == vars[c.right].block {
                    if let Some(heap) = self.get_mut(bref)?.out_heap.as_mut() {
                        heap.pop();
                    }
                    continue;
                }
                let key = if c.equality {
                    f64::NEG_INFINITY
                } else {
                    self.slack(vars, cons, entry.cix)?
                };
                if key != entry.key {
                    if let Some(heap) = self.get_mut(bref)?.out_heap.as_mut() {
                        heap.pop();
                        heap.push(HeapEntry {
                            key,
                            cix: entry.cix,
                        });
                    }
                    continue;
                }
                return Ok(Some(entry.cix));
            }
        }

        /// Fuse the two endpoint blocks of `cix` into one, activating `cix`.
        ///
        /// The smaller block is absorbed into the larger; the absorbed side's
        /// offsets are rebased so that `right.offset - left.offset = gap`
        /// holds across the newly active constraint. Returns the surviving
        /// block; the absorbed one is tombstoned for the next sweep.
        pub fn merge_over(
            &mut self,
            cix: ConIx,
            vars: &mut TiVec<VarIx, Variable>,
            cons: &mut TiVec<ConIx, Constraint>,
        ) -> Result<BlockRef, Error> {
            let (lvar, rvar, gap) = {
                let c = &cons[cix];
                (c.left, c.right, c.gap)
            };
            let lref = vars[lvar].block;
            let rref = vars[rvar].block;
            debug_assert_ne!(lref, rref);
            let dist = vars[lvar].offset + gap - vars[rvar].offset;
            let (survivor, absorbed, dist) =
                if self.get(lref)?.vars.len() >= self.get(rref)?.vars.len() {
                    (lref, rref, dist)
                } else {
                    (rref, lref, -dist)
                };
            let mut other = self.take(absorbed)?;
            {
                let b = self.get_mut(survivor)?;
                let mut shifted_weight = 0.0;
                for &vix in &other.vars {
                    vars[vix].offset += dist;
                    vars[vix].block = survivor;
                    shifted_weight += vars[vix].weight;
                }
                // each term of wposn is w * s * (d - o/s); moving o by dist
                // moves the term by -w * dist, whatever the scale
                b.wposn += other.wposn - dist * shifted_weight;
                b.weight += other.weight;
                b.posn = b.wposn / b.weight;
                b.vars.append(&mut other.vars);
                block::merge_heaps(&mut b.in_heap, other.in_heap.take());
                block::merge_heaps(&mut b.out_heap, other.out_heap.take());
            }
            other.deleted = true;
            self.untake(absorbed, other);
            cons[cix].active = true;
            event!(
                Level::DEBUG,
                constraint = %cix,
                from = %absorbed,
                into = %survivor,
                %dist,
                "MERGE"
            );
            Ok(survivor)
        }

        /// While any constraint entering the block is violated (or is an
        /// equality, which must always be activated), merge the block on its
        /// left across the most violated one.
        pub fn merge_left(
            &mut self,
            mut bref: BlockRef,
            vars: &mut TiVec<VarIx, Variable>,
            cons: &mut TiVec<ConIx, Constraint>,
        ) -> Result<BlockRef, Error> {
            self.setup_in_constraints(bref, vars, cons)?;
            while let Some(cix) = self.find_min_in_constraint(bref, vars, cons)? {
                if !cons[cix].equality && self.slack(vars, cons, cix)? >= 0.0 {
                    break;
                }
                if let Some(heap) = self.get_mut(bref)?.in_heap.as_mut() {
                    heap.pop();
                }
                let lref = vars[cons[cix].left].block;
                if self.get(lref)?.in_heap.is_none() {
                    // the absorbed side's boundary heap rides along into the
                    // merged block, so it has to exist before the merge
                    self.setup_in_constraints(lref, vars, cons)?;
                }
                bref = self.merge_over(cix, vars, cons)?;
            }
            Ok(bref)
        }

        /// The mirror image of [BlockSet::merge_left]: merge right across the
        /// most violated constraint leaving the block.
        pub fn merge_right(
            &mut self,
            mut bref: BlockRef,
            vars: &mut TiVec<VarIx, Variable>,
            cons: &mut TiVec<ConIx, Constraint>,
        ) -> Result<BlockRef, Error> {
            self.setup_out_constraints(bref, vars, cons)?;
            while let Some(cix) = self.find_min_out_constraint(bref, vars, cons)? {
                if !cons[cix].equality && self.slack(vars, cons, cix)? >= 0.0 {
                    break;
                }
                if let Some(heap) = self.get_mut(bref)?.out_heap.as_mut() {
                    heap.pop();
                }
                let rref = vars[cons[cix].right].block;
                if self.get(rref)?.out_heap.is_none() {
                    self.setup_out_constraints(rref, vars, cons)?;
                }
                bref = self.merge_over(cix, vars, cons)?;
            }
            Ok(bref)
        }

        /// Split a block at an active internal constraint. Removing the
        /// constraint partitions the active tree into the component holding
        /// its left endpoint and the component holding its right endpoint;
        /// offsets are preserved within each, and the new blocks take the
        /// weighted-mean positions of their retained members.
        pub fn split_block(
            &mut self,
            bref: BlockRef,
            cix: ConIx,
            vars: &mut TiVec<VarIx, Variable>,
            cons: &mut TiVec<ConIx, Constraint>,
        ) -> Result<(BlockRef, BlockRef), Error> {
            cons[cix].active = false;
            let (lvar, rvar) = (cons[cix].left, cons[cix].right);
            let lcomp = block::active_component(vars, cons, lvar, Some(cix));
            let rcomp = block::active_component(vars, cons, rvar, Some(cix));
            self.get_mut(bref)?.deleted = true;
            let lref = self.insert_component(lcomp, vars);
            let rref = self.insert_component(rcomp, vars);
            event!(
                Level::DEBUG,
                constraint = %cix,
                block = %bref,
                left = %lref,
                right = %rref,
                "SPLIT"
            );
            Ok((lref, rref))
        }

        fn insert_component(
            &mut self,
            members: Vec<VarIx>,
            vars: &mut TiVec<VarIx, Variable>,
        ) -> BlockRef {
            let mut b = Block::default();
            b.vars = members;
            b.update_weighted_position(vars);
            let bref = self.insert(b);
            if let Some(b) = self.slots[bref.ix].block.as_ref() {
                for &vix in &b.vars {
                    vars[vix].block = bref;
                }
            }
            bref
        }
    }
}

pub mod graph {
    //! Constraint-graph queries
    //!
    //! # Summary
    //!
    //! The input constraints form a digraph over the variables (an edge per
    //! constraint, from left endpoint to right). The batch solver consumes a
    //! topological order of that digraph, and the diagnostics here answer
    //! whether the inputs, or the block adjacencies after a solve, contain
    //! cycles.
    use std::collections::HashMap;

    use petgraph::algo::is_cyclic_directed;
    use petgraph::visit::DfsPostOrder;
    use petgraph::{EdgeDirection::Incoming, Graph};
    use tracing::{event, Level};
    use typed_index_collections::TiVec;

    use super::blocks::BlockSet;
    use super::index::{BlockIx, ConIx, VarIx};
    use super::problem::{Constraint, Variable};

    pub fn constraint_graph(
        vars: &TiVec<VarIx, Variable>,
        cons: &TiVec<ConIx, Constraint>,
    ) -> Graph<VarIx, ConIx> {
        let mut g = Graph::new();
        let mut nodes = Vec::with_capacity(vars.len());
        for (vix, _) in vars.iter_enumerated() {
            nodes.push(g.add_node(vix));
        }
        for (cix, c) in cons.iter_enumerated() {
            g.add_edge(nodes[usize::from(c.left)], nodes[usize::from(c.right)], cix);
        }
        g
    }

    /// Variables in an order consistent with the constraint digraph: every
    /// constraint's left endpoint comes before its right endpoint, provided
    /// the digraph is acyclic. Inputs with cycles still yield every variable
    /// (back edges are ignored), but no order can respect them.
    pub fn total_order(
        vars: &TiVec<VarIx, Variable>,
        cons: &TiVec<ConIx, Constraint>,
    ) -> Vec<VarIx> {
        let g = constraint_graph(vars, cons);
        let roots = g.externals(Incoming).collect::<Vec<_>>();
        event!(Level::DEBUG, ?roots, "ROOTS");
        let mut dfs = DfsPostOrder::empty(&g);
        let mut order = Vec::with_capacity(vars.len());
        for start in roots.into_iter().chain(g.node_indices()) {
            dfs.move_to(start);
            while let Some(nx) = dfs.next(&g) {
                order.push(g[nx]);
            }
        }
        order.reverse();
        order
    }

    pub fn constraint_graph_is_cyclic(
        vars: &TiVec<VarIx, Variable>,
        cons: &TiVec<ConIx, Constraint>,
    ) -> bool {
        is_cyclic_directed(&constraint_graph(vars, cons))
    }

    /// Cyclicity of the block-adjacency digraph: an edge per constraint whose
    /// endpoints lie in distinct blocks. A cycle here would mean the merge
    /// machinery produced an inconsistent partition.
    pub fn block_graph_is_cyclic(
        blocks: &BlockSet,
        vars: &TiVec<VarIx, Variable>,
        cons: &TiVec<ConIx, Constraint>,
    ) -> bool {
        let mut g: Graph<BlockIx, ConIx> = Graph::new();
        let mut nodes: HashMap<BlockIx, _> = HashMap::new();
        for r in blocks.live_refs() {
            nodes.insert(r.ix, g.add_node(r.ix));
        }
        for (cix, c) in cons.iter_enumerated() {
            let l = vars[c.left].block;
            let r = vars[c.right].block;
            if l.ix == r.ix {
                continue;
            }
            if let (Some(&ln), Some(&rn)) = (nodes.get(&l.ix), nodes.get(&r.ix)) {
                g.add_edge(ln, rn, cix);
            }
        }
        is_cyclic_directed(&g)
    }
}

pub mod solve {
    //! The batch and incremental solvers
    //!
    //! # Summary
    //!
    //! [Solver] answers a fresh instance: `satisfy` walks the variables in
    //! constraint order, merging blocks across violated constraints until the
    //! placement is feasible, and `refine` repeatedly splits any block whose
    //! active tree holds a constraint with a sufficiently negative Lagrange
    //! multiplier, restoring feasibility around each split.
    //!
    //! [IncSolver] answers a sequence of instances that differ only in
    //! desired positions. It keeps the block partition between calls: each
    //! `satisfy` first splits whatever the moved positions made worth
    //! splitting, then merges over the most violated inactive constraint
    //! until none is violated, with a special case for a violated constraint
    //! whose endpoints already share a block. That one either names a cycle
    //! (the constraint is flagged unsatisfiable and skipped) or forces a
    //! split at the cheapest active constraint on the path between its
    //! endpoints.
    use tracing::{event, instrument, Level};
    use tracing_error::InstrumentError;
    use typed_index_collections::TiVec;

    use super::block::Block;
    use super::blocks::BlockSet;
    use super::error::{Error, SolveError};
    use super::graph;
    use super::index::{ConIx, VarIx};
    use super::problem::{Constraint, Variable};

    /// Slacks no lower than this count as satisfied.
    pub const ZERO_UPPERBOUND: f64 = -1e-10;
    /// Multipliers below this mark an active constraint worth splitting on.
    pub const LAGRANGIAN_TOLERANCE: f64 = -1e-4;
    /// The incremental cost loop stops once successive solves agree this closely.
    const COST_TOLERANCE: f64 = 1e-4;
    /// Refinement cannot loop forever, but cap the passes regardless.
    const MAX_REFINE_PASSES: usize = 100;

    #[derive(Clone, Debug)]
    pub struct Solver {
        pub vars: TiVec<VarIx, Variable>,
        pub cons: TiVec<ConIx, Constraint>,
        pub blocks: BlockSet,
    }

    impl Solver {
        /// Take ownership of an instance, wire up the per-variable incident
        /// constraint lists, and put every variable in its own block.
        pub fn new(vars: Vec<Variable>, cons: Vec<Constraint>) -> Self {
            let mut vars: TiVec<VarIx, Variable> = vars.into();
            let cons: TiVec<ConIx, Constraint> = cons.into();
            for v in vars.iter_mut() {
                v.in_cons.clear();
                v.out_cons.clear();
            }
            for (cix, c) in cons.iter_enumerated() {
                vars[c.left].out_cons.push(cix);
                vars[c.right].in_cons.push(cix);
            }
            let mut blocks = BlockSet::default();
            for i in 0..vars.len() {
                let vix = VarIx::from(i);
                debug_assert!(vars[vix].weight > 0.0);
                vars[vix].offset = 0.0;
                let bref = blocks.insert(Block::for_variable(vix, &vars[vix]));
                vars[vix].block = bref;
            }
            Self { vars, cons, blocks }
        }

        /// Produce a feasible, though not necessarily optimal, placement.
        ///
        /// Blocks are examined in the partial order defined by the constraint
        /// digraph. Processing left to right maintains the invariant that
        /// every constraint behind the scan front is satisfied; each step
        /// restores it by merging across violated incoming constraints, most
        /// violated first.
        ///
        /// Returns whether any constraint ended up active. Fails with
        /// [SolveError::UnsatisfiedConstraint] if a constraint remains
        /// violated, which for this non-incremental path means the inputs
        /// were over-constrained (for example by a cycle).
        pub fn satisfy(&mut self) -> Result<bool, Error> {
            let order = graph::total_order(&self.vars, &self.cons);
            for vix in order {
                let bref = self.vars[vix].block;
                if !self.blocks.get(bref)?.deleted {
                    self.blocks.merge_left(bref, &mut self.vars, &mut self.cons)?;
                }
            }
            self.blocks.cleanup();
            let active = self.verify()?;
            self.copy_result()?;
            Ok(active)
        }

        /// Improve a feasible placement until no block wants to split.
        ///
        /// Each pass rebuilds every block's boundary heaps, then looks for a
        /// block whose minimum Lagrange multiplier falls below
        /// [LAGRANGIAN_TOLERANCE]. Splitting there lets the two halves
        /// separate; the halves are immediately re-merged across anything the
        /// separation violated. A split changes the block set, so the pass
        /// restarts from scratch.
        pub fn refine(&mut self) -> Result<(), Error> {
            let mut solved = false;
            let mut passes = MAX_REFINE_PASSES;
            while !solved && passes > 0 {
                solved = true;
                passes -= 1;
                let live = self.blocks.live_refs();
                for &bref in &live {
                    self.blocks
                        .setup_in_constraints(bref, &self.vars, &self.cons)?;
                    self.blocks
                        .setup_out_constraints(bref, &self.vars, &self.cons)?;
                }
                for &bref in &live {
                    let b = self.blocks.get(bref)?;
                    if b.deleted {
                        continue;
                    }
                    let Some(cix) = b.find_min_lm(&self.vars, &mut self.cons) else {
                        continue;
                    };
                    if self.cons[cix].lm < LAGRANGIAN_TOLERANCE {
                        event!(Level::DEBUG, constraint = %cix, lm = self.cons[cix].lm, "SPLIT POINT");
                        let (lref, _) =
                            self.blocks
                                .split_block(bref, cix, &mut self.vars, &mut self.cons)?;
                        self.blocks.merge_left(lref, &mut self.vars, &mut self.cons)?;
                        // the right half may already have been absorbed by the
                        // left merge; look it up again
                        let rref = self.vars[self.cons[cix].right].block;
                        self.blocks.merge_right(rref, &mut self.vars, &mut self.cons)?;
                        self.blocks.cleanup();
                        solved = false;
                        break;
                    }
                }
            }
            for i in 0..self.cons.len() {
                let cix = ConIx::from(i);
                let slack = self.blocks.slack(&self.vars, &self.cons, cix)?;
                if slack < ZERO_UPPERBOUND {
                    return Err(SolveError::UnsatisfiedConstraint {
                        constraint: cix,
                        slack,
                    }
                    .in_current_span()
                    .into());
                }
            }
            Ok(())
        }

        /// Calculate the optimal placement: a feasible one, refined until no
        /// further improvement is possible. Returns whether any constraints
        /// remained active, that is, whether any block holds more than one
        /// variable.
        #[instrument(skip(self))]
        pub fn solve(&mut self) -> Result<bool, Error> {
            self.satisfy()?;
            self.refine()?;
            self.copy_result()?;
            Ok(self.blocks.live_count() != self.vars.len())
        }

        /// Store every variable's current position in its `final_position`.
        pub fn copy_result(&mut self) -> Result<(), Error> {
            for i in 0..self.vars.len() {
                let vix = VarIx::from(i);
                let position = self.blocks.position(&self.vars, vix)?;
                self.vars[vix].final_position = position;
            }
            Ok(())
        }

        pub fn cost(&self) -> f64 {
            self.blocks.cost(&self.vars)
        }

        pub(super) fn verify(&self) -> Result<bool, Error> {
            let mut active = false;
            for (cix, c) in self.cons.iter_enumerated() {
                if c.active {
                    active = true;
                }
                let slack = self.blocks.slack(&self.vars, &self.cons, cix)?;
                if slack < ZERO_UPPERBOUND {
                    event!(Level::DEBUG, constraint = %cix, %slack, "UNSATISFIED");
                    return Err(SolveError::UnsatisfiedConstraint {
                        constraint: cix,
                        slack,
                    }
                    .in_current_span()
                    .into());
                }
            }
            Ok(active)
        }
    }

    #[derive(Clone, Debug)]
    pub struct IncSolver {
        pub solver: Solver,
        /// Constraints not currently spanning an edge inside any block.
        pub inactive: Vec<ConIx>,
    }

    impl IncSolver {
        pub fn new(vars: Vec<Variable>, cons: Vec<Constraint>) -> Self {
            let solver = Solver::new(vars, cons);
            let inactive = solver.cons.iter_enumerated().map(|(cix, _)| cix).collect();
            Self { solver, inactive }
        }

        /// Solve, reusing whatever block structure previous solves built.
        /// Iterates [IncSolver::satisfy] until the cost settles.
        #[instrument(skip(self))]
        pub fn solve(&mut self) -> Result<bool, Error> {
            self.satisfy()?;
            let mut last_cost = f64::MAX;
            let mut cost = self.solver.cost();
            while (last_cost - cost).abs() > COST_TOLERANCE {
                self.satisfy()?;
                last_cost = cost;
                cost = self.solver.cost();
                event!(
                    Level::DEBUG,
                    %cost,
                    blocks = self.solver.blocks.live_count(),
                    "CONVERGENCE"
                );
            }
            self.solver.copy_result()?;
            Ok(self.solver.blocks.live_count() != self.solver.vars.len())
        }

        /// One incremental feasibility pass.
        ///
        /// First split every block that the moved desired positions made
        /// worth splitting, then repeatedly take the most violated inactive
        /// constraint and activate it. Across blocks that is a merge. Within
        /// a block it takes a split first; a constraint that would close a
        /// directed active cycle, or whose path holds nothing but equalities,
        /// is flagged unsatisfiable and skipped instead.
        pub fn satisfy(&mut self) -> Result<bool, Error> {
            self.split_blocks()?;
            while let Some(cix) = self.most_violated()? {
                let Solver { vars, cons, blocks } = &mut self.solver;
                let (equality, active) = {
                    let c = &cons[cix];
                    (c.equality, c.active)
                };
                let slack = blocks.slack(vars, cons, cix)?;
                if !(equality || (slack < ZERO_UPPERBOUND && !active)) {
                    break;
                }
                debug_assert!(!active);
                let lref = vars[cons[cix].left].block;
                let rref = vars[cons[cix].right].block;
                if lref != rref {
                    blocks.merge_over(cix, vars, cons)?;
                } else {
                    let (cleft, cright) = (cons[cix].left, cons[cix].right);
                    if blocks
                        .get(lref)?
                        .is_active_directed_path_between(vars, cons, cright, cleft)
                    {
                        // cycle found; relax the violated, cyclic constraint
                        cons[cix].unsatisfiable = true;
                        event!(Level::DEBUG, constraint = %cix, "CYCLE");
                        continue;
                    }
                    let split = blocks
                        .get(lref)?
                        .find_min_lm_between(vars, cons, cleft, cright);
                    let Some(scix) = split else {
                        cons[cix].unsatisfiable = true;
                        event!(Level::DEBUG, constraint = %cix, "UNSPLITTABLE");
                        continue;
                    };
                    blocks.split_block(lref, scix, vars, cons)?;
                    self.inactive.push(scix);
                    if blocks.slack(vars, cons, cix)? >= 0.0 {
                        // the split on its own relieved the violation
                        self.inactive.push(cix);
                    } else {
                        blocks.merge_over(cix, vars, cons)?;
                    }
                }
                blocks.cleanup();
            }
            self.solver.blocks.cleanup();
            let active = self.solver.verify()?;
            self.solver.copy_result()?;
            Ok(active)
        }

        /// Move every block to its fresh weighted position, then split each
        /// one whose cheapest active constraint has a multiplier below
        /// [LAGRANGIAN_TOLERANCE]. Freed constraints rejoin the inactive
        /// list.
        fn split_blocks(&mut self) -> Result<(), Error> {
            let Solver { vars, cons, blocks } = &mut self.solver;
            for bref in blocks.live_refs() {
                blocks.get_mut(bref)?.update_weighted_position(vars);
            }
            for bref in blocks.live_refs() {
                let b = blocks.get(bref)?;
                if b.deleted {
                    continue;
                }
                let Some(cix) = b.find_min_lm(vars, cons) else {
                    continue;
                };
                if cons[cix].lm < LAGRANGIAN_TOLERANCE {
                    debug_assert!(!cons[cix].equality);
                    event!(Level::TRACE, constraint = %cix, lm = cons[cix].lm, "SPLIT POINT");
                    blocks.split_block(bref, cix, vars, cons)?;
                    self.inactive.push(cix);
                }
            }
            blocks.cleanup();
            Ok(())
        }

        /// Scan the inactive list for the most violated constraint, with the
        /// first equality met taking priority outright. The winner is
        /// swap-removed in O(1) (the list is order-insensitive) when it is an
        /// equality or a genuinely violated inactive constraint; otherwise it
        /// is returned un-removed and the caller stops merging.
        pub(super) fn most_violated(&mut self) -> Result<Option<ConIx>, Error> {
            let Solver { vars, cons, blocks } = &self.solver;
            let mut min_slack = f64::MAX;
            let mut winner: Option<(usize, ConIx)> = None;
            for (i, &cix) in self.inactive.iter().enumerate() {
                let c = &cons[cix];
                let slack = blocks.slack(vars, cons, cix)?;
                if c.equality || slack < min_slack {
                    min_slack = slack;
                    winner = Some((i, cix));
                    if c.equality {
                        break;
                    }
                }
            }
            let Some((i, cix)) = winner else {
                return Ok(None);
            };
            let c = &self.solver.cons[cix];
            if c.equality || (min_slack < ZERO_UPPERBOUND && !c.active) {
                self.inactive.swap_remove(i);
            }
            event!(Level::TRACE, constraint = %cix, slack = min_slack, "MOST VIOLATED");
            Ok(Some(cix))
        }
    }
}

pub mod nonoverlap {
    //! Rectangle non-overlap constraint generation
    //!
    //! # Summary
    //!
    //! Given axis-aligned rectangles and, per rectangle, the variable that
    //! stands for its centre on one axis, emit the separation constraints
    //! whose satisfaction removes overlap along that axis. The output feeds
    //! the solver unchanged.
    //!
    //! The generator sweeps the perpendicular extent. While a rectangle is
    //! open it sits in a scanline ordered by centre position; relationships
    //! are recorded against nearby open rectangles at the opening event and
    //! the constraints are emitted at the closing event, so only rectangles
    //! that actually coexist in the sweep are ever related.
    use std::collections::BTreeSet;

    use itertools::Itertools;

    use super::index::VarIx;
    use super::problem::Constraint;

    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct Rectangle {
        pub min_x: f64,
        pub max_x: f64,
        pub min_y: f64,
        pub max_y: f64,
    }

    impl Rectangle {
        pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
            Self {
                min_x,
                max_x,
                min_y,
                max_y,
            }
        }

        pub fn width(&self) -> f64 {
            self.max_x - self.min_x
        }

        pub fn height(&self) -> f64 {
            self.max_y - self.min_y
        }

        pub fn centre_x(&self) -> f64 {
            (self.min_x + self.max_x) / 2.0
        }

        pub fn centre_y(&self) -> f64 {
            (self.min_y + self.max_y) / 2.0
        }

        pub fn set_centre_x(&mut self, x: f64) {
            let half = self.width() / 2.0;
            self.min_x = x - half;
            self.max_x = x + half;
        }

        pub fn set_centre_y(&mut self, y: f64) {
            let half = self.height() / 2.0;
            self.min_y = y - half;
            self.max_y = y + half;
        }

        /// Horizontal overlap with `other`; zero or less means disjoint in x.
        pub fn overlap_x(&self, other: &Rectangle) -> f64 {
            if self.centre_x() <= other.centre_x() && other.min_x < self.max_x {
                return self.max_x - other.min_x;
            }
            if other.centre_x() <= self.centre_x() && self.min_x < other.max_x {
                return other.max_x - self.min_x;
            }
            0.0
        }

        /// Vertical overlap with `other`; zero or less means disjoint in y.
        pub fn overlap_y(&self, other: &Rectangle) -> f64 {
            if self.centre_y() <= other.centre_y() && other.min_y < self.max_y {
                return self.max_y - other.min_y;
            }
            if other.centre_y() <= self.centre_y() && self.min_y < other.max_y {
                return other.max_y - self.min_y;
            }
            0.0
        }
    }

    // Close sorts before Open so that rectangles that merely touch in the
    // sweep dimension are never co-open, hence never related.
    #[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
    enum EventKind {
        Close,
        Open,
    }

    #[derive(Clone, Copy, Debug)]
    struct Event {
        pos: f64,
        kind: EventKind,
        rect: usize,
    }

    #[derive(Clone, Copy, Debug)]
    struct ScanKey {
        centre: f64,
        rect: usize,
    }

    impl PartialEq for ScanKey {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == std::cmp::Ordering::Equal
        }
    }

    impl Eq for ScanKey {}

    impl PartialOrd for ScanKey {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for ScanKey {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.centre
                .total_cmp(&other.centre)
                .then_with(|| self.rect.cmp(&other.rect))
        }
    }

    fn sweep_events(rects: &[Rectangle], horizontal: bool) -> Vec<Event> {
        rects
            .iter()
            .enumerate()
            .flat_map(|(i, r)| {
                let (open, close) = if horizontal {
                    (r.min_y, r.max_y)
                } else {
                    (r.min_x, r.max_x)
                };
                [
                    Event {
                        pos: open,
                        kind: EventKind::Open,
                        rect: i,
                    },
                    Event {
                        pos: close,
                        kind: EventKind::Close,
                        rect: i,
                    },
                ]
            })
            .sorted_by(|a, b| {
                a.pos
                    .total_cmp(&b.pos)
                    .then_with(|| a.kind.cmp(&b.kind))
                    .then_with(|| a.rect.cmp(&b.rect))
            })
            .collect()
    }

    /// Emit constraints `x_r - x_l >= (w_l + w_r) / 2` between the centre-x
    /// variables of rectangles that overlap vertically.
    ///
    /// With `use_neighbour_lists` each opening rectangle records every open
    /// neighbour out to the first one already disjoint in x (that one is
    /// recorded too, anchoring the transitive separation); neighbours whose x
    /// overlap exceeds their y overlap are skipped, since separating that
    /// pair vertically would be cheaper. Without it, only scan-adjacent pairs
    /// at closing time are related, which is enough when overlap is already
    /// ruled out and only ordering must be preserved.
    pub fn generate_x_constraints(
        rects: &[Rectangle],
        vars: &[VarIx],
        use_neighbour_lists: bool,
    ) -> Vec<Constraint> {
        let mut scanline: BTreeSet<ScanKey> = BTreeSet::new();
        let mut left_of: Vec<Vec<usize>> = vec![Vec::new(); rects.len()];
        let mut right_of: Vec<Vec<usize>> = vec![Vec::new(); rects.len()];
        let mut cs = Vec::new();
        for Event { kind, rect: i, .. } in sweep_events(rects, true) {
            let key = ScanKey {
                centre: rects[i].centre_x(),
                rect: i,
            };
            match kind {
                EventKind::Open => {
                    scanline.insert(key);
                    if !use_neighbour_lists {
                        continue;
                    }
                    for u in scanline.range(..key).rev().map(|k| k.rect) {
                        let ox = rects[u].overlap_x(&rects[i]);
                        if ox <= 0.0 {
                            left_of[i].push(u);
                            break;
                        }
                        if ox <= rects[u].overlap_y(&rects[i]) {
                            left_of[i].push(u);
                        }
                    }
                    for u in scanline.range(key..).skip(1).map(|k| k.rect) {
                        let ox = rects[i].overlap_x(&rects[u]);
                        if ox <= 0.0 {
                            right_of[i].push(u);
                            break;
                        }
                        if ox <= rects[i].overlap_y(&rects[u]) {
                            right_of[i].push(u);
                        }
                    }
                    // cross-register so whichever side closes first emits the
                    // pair exactly once
                    for &u in &left_of[i] {
                        right_of[u].push(i);
                    }
                    for &u in &right_of[i] {
                        left_of[u].push(i);
                    }
                }
                EventKind::Close => {
                    scanline.remove(&key);
                    if use_neighbour_lists {
                        let lefts = std::mem::take(&mut left_of[i]);
                        let rights = std::mem::take(&mut right_of[i]);
                        for u in lefts {
                            cs.push(Constraint::new(
                                vars[u],
                                vars[i],
                                (rects[u].width() + rects[i].width()) / 2.0,
                            ));
                            right_of[u].retain(|&w| w != i);
                        }
                        for u in rights {
                            cs.push(Constraint::new(
                                vars[i],
                                vars[u],
                                (rects[i].width() + rects[u].width()) / 2.0,
                            ));
                            left_of[u].retain(|&w| w != i);
                        }
                    } else {
                        if let Some(u) = scanline.range(..key).next_back().map(|k| k.rect) {
                            cs.push(Constraint::new(
                                vars[u],
                                vars[i],
                                (rects[u].width() + rects[i].width()) / 2.0,
                            ));
                        }
                        if let Some(u) = scanline.range(key..).next().map(|k| k.rect) {
                            cs.push(Constraint::new(
                                vars[i],
                                vars[u],
                                (rects[i].width() + rects[u].width()) / 2.0,
                            ));
                        }
                    }
                }
            }
        }
        cs
    }

    /// The transpose of [generate_x_constraints]: sweep the horizontal
    /// extent and emit `y_below - y_above >= (h_a + h_b) / 2` between
    /// scan-adjacent rectangles that overlap horizontally.
    pub fn generate_y_constraints(rects: &[Rectangle], vars: &[VarIx]) -> Vec<Constraint> {
        let mut scanline: BTreeSet<ScanKey> = BTreeSet::new();
        let mut cs = Vec::new();
        for Event { kind, rect: i, .. } in sweep_events(rects, false) {
            let key = ScanKey {
                centre: rects[i].centre_y(),
                rect: i,
            };
            match kind {
                EventKind::Open => {
                    scanline.insert(key);
                }
                EventKind::Close => {
                    scanline.remove(&key);
                    if let Some(u) = scanline.range(..key).next_back().map(|k| k.rect) {
                        cs.push(Constraint::new(
                            vars[u],
                            vars[i],
                            (rects[u].height() + rects[i].height()) / 2.0,
                        ));
                    }
                    if let Some(u) = scanline.range(key..).next().map(|k| k.rect) {
                        cs.push(Constraint::new(
                            vars[i],
                            vars[u],
                            (rects[i].height() + rects[u].height()) / 2.0,
                        ));
                    }
                }
            }
        }
        cs
    }
}

#[cfg(test)]
mod tests {
    use super::block::active_component;
    use super::error::Error;
    use super::graph::{block_graph_is_cyclic, constraint_graph_is_cyclic, total_order};
    use super::index::{ConIx, VarIx};
    use super::nonoverlap::{generate_x_constraints, generate_y_constraints, Rectangle};
    use super::problem::{Constraint, Variable};
    use super::solve::{IncSolver, Solver, LAGRANGIAN_TOLERANCE, ZERO_UPPERBOUND};

    fn vars(desired: &[f64]) -> Vec<Variable> {
        desired.iter().map(|&d| Variable::new(d, 1.0)).collect()
    }

    fn cons(gaps: &[(usize, usize, f64)]) -> Vec<Constraint> {
        gaps.iter()
            .map(|&(l, r, g)| Constraint::new(VarIx(l), VarIx(r), g))
            .collect()
    }

    fn finals(s: &Solver) -> Vec<f64> {
        s.vars.iter().map(|v| v.final_position).collect()
    }

    fn manual_slack(s: &Solver, cix: ConIx) -> f64 {
        let c = &s.cons[cix];
        s.vars[c.right].final_position - s.vars[c.left].final_position - c.gap
    }

    fn assert_near(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_feasible(s: &Solver) {
        for (cix, c) in s.cons.iter_enumerated() {
            assert!(
                c.unsatisfiable || manual_slack(s, cix) >= ZERO_UPPERBOUND,
                "constraint {cix} violated: slack {}",
                manual_slack(s, cix)
            );
        }
    }

    fn assert_blocks_are_spanning_trees(s: &Solver) {
        for bref in s.blocks.live_refs() {
            let b = s.blocks.get(bref).unwrap();
            let internal_active = s
                .cons
                .iter_enumerated()
                .filter(|(_, c)| {
                    c.active && s.vars[c.left].block == bref && s.vars[c.right].block == bref
                })
                .count();
            assert_eq!(internal_active, b.vars.len() - 1);
            let component = active_component(&s.vars, &s.cons, b.vars[0], None);
            assert_eq!(component.len(), b.vars.len());
        }
    }

    fn lcg(seed: &mut u64) -> f64 {
        *seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (*seed >> 40) as f64 / (1u64 << 24) as f64
    }

    #[test]
    fn unconstrained_variable_stays_put() -> Result<(), Error> {
        let mut s = Solver::new(vec![Variable::new(5.0, 1.0)], vec![]);
        let active = s.solve()?;
        assert!(!active);
        assert_near(s.vars[VarIx(0)].final_position, 5.0);
        Ok(())
    }

    #[test]
    fn violated_gap_splits_the_difference() -> Result<(), Error> {
        let mut s = Solver::new(vars(&[0.0, 0.0]), cons(&[(0, 1, 10.0)]));
        let active = s.solve()?;
        assert!(active);
        assert_eq!(finals(&s), vec![-5.0, 5.0]);
        assert!(s.cons[ConIx(0)].active);
        assert_eq!(s.vars[VarIx(0)].block, s.vars[VarIx(1)].block);
        assert_eq!(s.blocks.live_count(), 1);
        Ok(())
    }

    #[test]
    fn chain_spreads_around_common_centre() -> Result<(), Error> {
        let mut s = Solver::new(vars(&[0.0, 0.0, 0.0]), cons(&[(0, 1, 1.0), (1, 2, 1.0)]));
        s.solve()?;
        let p = finals(&s);
        assert_near(p[0], -1.0);
        assert_near(p[1], 0.0);
        assert_near(p[2], 1.0);
        Ok(())
    }

    #[test]
    fn equality_holds_at_exact_gap() -> Result<(), Error> {
        let mut s = Solver::new(
            vars(&[0.0, 10.0]),
            vec![Constraint::new_equality(VarIx(0), VarIx(1), 2.0)],
        );
        s.solve()?;
        let p = finals(&s);
        assert_near(p[0], 4.0);
        assert_near(p[1], 6.0);
        assert!(s.cons[ConIx(0)].active);
        Ok(())
    }

    #[test]
    fn equality_holds_for_incremental_solver() -> Result<(), Error> {
        let mut s = IncSolver::new(
            vars(&[0.0, 10.0]),
            vec![Constraint::new_equality(VarIx(0), VarIx(1), 2.0)],
        );
        let active = s.solve()?;
        assert!(active);
        let p = finals(&s.solver);
        assert_near(p[0], 4.0);
        assert_near(p[1], 6.0);
        Ok(())
    }

    #[test]
    fn equality_activates_even_with_positive_slack() -> Result<(), Error> {
        // already separated further than the equality allows; the solver has
        // to pull the pair together
        let mut s = Solver::new(
            vars(&[0.0, 0.0, 0.0]),
            vec![
                Constraint::new_equality(VarIx(0), VarIx(1), 2.0),
                Constraint::new(VarIx(1), VarIx(2), 1.0),
            ],
        );
        s.solve()?;
        let p = finals(&s);
        assert_near(p[0], -5.0 / 3.0);
        assert_near(p[1], 1.0 / 3.0);
        assert_near(p[2], 4.0 / 3.0);
        assert!(s.cons[ConIx(0)].active);
        assert_near(p[1] - p[0], 2.0);
        Ok(())
    }

    #[test]
    fn directed_cycle_relaxes_one_constraint() -> Result<(), Error> {
        let mut s = IncSolver::new(
            vars(&[0.0, 0.0, 0.0]),
            cons(&[(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0)]),
        );
        let active = s.solve()?;
        assert!(active);
        let flagged: Vec<ConIx> = s
            .solver
            .cons
            .iter_enumerated()
            .filter(|(_, c)| c.unsatisfiable)
            .map(|(cix, _)| cix)
            .collect();
        assert_eq!(flagged, vec![ConIx(2)]);
        // the flagged constraint reports unbounded slack and the others hold
        let slack = s
            .solver
            .blocks
            .slack(&s.solver.vars, &s.solver.cons, ConIx(2))?;
        assert_eq!(slack, f64::MAX);
        assert!(manual_slack(&s.solver, ConIx(0)) >= ZERO_UPPERBOUND);
        assert!(manual_slack(&s.solver, ConIx(1)) >= ZERO_UPPERBOUND);
        let p = finals(&s.solver);
        assert_near(p[0], -1.0);
        assert_near(p[1], 0.0);
        assert_near(p[2], 1.0);
        Ok(())
    }

    #[test]
    fn batch_solver_rejects_unsatisfiable_cycles() {
        let mut s = Solver::new(
            vars(&[0.0, 0.0, 0.0]),
            cons(&[(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0)]),
        );
        assert!(s.solve().is_err());
    }

    #[test]
    fn incremental_resolve_after_moving_desired_positions() -> Result<(), Error> {
        let mut inc = IncSolver::new(vars(&[0.0, 0.0, 0.0]), cons(&[(0, 1, 1.0), (1, 2, 1.0)]));
        inc.solve()?;
        assert_feasible(&inc.solver);

        inc.solver.vars[VarIx(0)].desired_position = 10.0;
        inc.solve()?;
        assert_feasible(&inc.solver);

        let mut batch = Solver::new(vars(&[10.0, 0.0, 0.0]), cons(&[(0, 1, 1.0), (1, 2, 1.0)]));
        batch.solve()?;
        assert!(inc.solver.cost() <= batch.cost() + 1e-6);
        Ok(())
    }

    #[test]
    fn incremental_split_releases_separated_pair() -> Result<(), Error> {
        let mut inc = IncSolver::new(vars(&[0.0, 0.0]), cons(&[(0, 1, 10.0)]));
        inc.solve()?;
        assert_eq!(finals(&inc.solver), vec![-5.0, 5.0]);

        inc.solver.vars[VarIx(0)].desired_position = -10.0;
        inc.solver.vars[VarIx(1)].desired_position = 10.0;
        let active = inc.solve()?;
        assert!(!active);
        assert_eq!(finals(&inc.solver), vec![-10.0, 10.0]);
        assert!(!inc.solver.cons[ConIx(0)].active);
        assert_eq!(inc.solver.blocks.live_count(), 2);
        Ok(())
    }

    #[test]
    fn incremental_cost_is_monotone() -> Result<(), Error> {
        let mut inc = IncSolver::new(
            vars(&[3.0, -2.0, 8.0, 0.0, 1.0]),
            cons(&[(0, 1, 2.0), (1, 2, 2.0), (2, 3, 2.0), (3, 4, 2.0)]),
        );
        inc.satisfy()?;
        let mut cost = inc.solver.cost();
        for _ in 0..5 {
            inc.satisfy()?;
            let next = inc.solver.cost();
            assert!(next <= cost + 1e-9, "cost went up: {cost} -> {next}");
            cost = next;
        }
        Ok(())
    }

    #[test]
    fn resolving_unchanged_inputs_is_deterministic() -> Result<(), Error> {
        let build = || {
            Solver::new(
                vars(&[7.0, -3.0, 2.0, 2.0]),
                cons(&[(0, 1, 3.0), (1, 2, 1.0), (0, 3, 2.0)]),
            )
        };
        let mut a = build();
        let mut b = build();
        a.solve()?;
        b.solve()?;
        assert_eq!(finals(&a), finals(&b));
        // a second solve of the same instance lands in exactly the same place
        a.solve()?;
        assert_eq!(finals(&a), finals(&b));
        Ok(())
    }

    #[test]
    fn block_position_matches_member_offsets() -> Result<(), Error> {
        let mut s = Solver::new(vars(&[0.0, 0.0, 0.0]), cons(&[(0, 1, 1.0), (1, 2, 1.0)]));
        s.solve()?;
        for (vix, v) in s.vars.iter_enumerated() {
            let b = s.blocks.get(v.block)?;
            assert_near(v.final_position, b.posn + v.offset / v.scale);
            assert_near(v.final_position, s.blocks.position(&s.vars, vix)?);
        }
        Ok(())
    }

    #[test]
    fn weighted_block_position_follows_weights() -> Result<(), Error> {
        let mut vs = vars(&[0.0, 0.0, 0.0, 0.0, 0.0]);
        vs[4].weight = 100.0;
        let mut s = Solver::new(
            vs,
            cons(&[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0), (3, 4, 1.0)]),
        );
        s.solve()?;
        let p = finals(&s);
        let posn = -406.0 / 104.0;
        assert_near(p[4], posn + 4.0);
        assert_near(p[0], posn);
        Ok(())
    }

    #[test]
    fn scaled_variables_keep_consistent_accumulators() -> Result<(), Error> {
        let vs = vec![
            Variable::with_scale(0.0, 1.0, 2.0),
            Variable::with_scale(0.0, 1.0, 2.0),
            Variable::with_scale(0.0, 1.0, 2.0),
        ];
        let mut s = Solver::new(vs, cons(&[(0, 1, 10.0), (1, 2, 10.0)]));
        let active = s.solve()?;
        assert!(active);
        let p = finals(&s);
        assert_near(p[0], -2.5);
        assert_near(p[1], 2.5);
        assert_near(p[2], 7.5);
        // separations are exact in scaled coordinates
        assert_near(2.0 * (p[1] - p[0]), 10.0);
        assert_near(2.0 * (p[2] - p[1]), 10.0);
        // merging left the accumulators exactly where a from-scratch
        // recomputation puts them
        let merged = s.blocks.get(s.vars[VarIx(0)].block)?;
        let mut fresh = merged.clone();
        fresh.update_weighted_position(&s.vars);
        assert_near(fresh.wposn, merged.wposn);
        assert_near(fresh.posn, merged.posn);
        Ok(())
    }

    #[test]
    fn stale_heap_keys_are_rekeyed_on_pop() -> Result<(), Error> {
        // merging {x1,x2} moves x1 left and re-violates the already-examined
        // constraint into x1, whose heap key is stale by then
        let mut s = Solver::new(vars(&[0.0, 5.0, -5.0]), cons(&[(0, 1, 1.0), (1, 2, 1.0)]));
        s.solve()?;
        let p = finals(&s);
        assert_near(p[0], -1.0);
        assert_near(p[1], 0.0);
        assert_near(p[2], 1.0);
        assert_feasible(&s);
        Ok(())
    }

    #[test]
    fn refine_splits_overtight_block() -> Result<(), Error> {
        // the equality drags x2's pull into the block through satisfy; only
        // refine discovers that the inequality should never have been active
        let mut vs = vars(&[0.0, -1.0, 50.0]);
        vs[0].weight = 100.0;
        let mut s = Solver::new(
            vs,
            vec![
                Constraint::new(VarIx(0), VarIx(1), 1.0),
                Constraint::new_equality(VarIx(1), VarIx(2), 1.0),
            ],
        );
        let active = s.solve()?;
        assert!(active);
        let p = finals(&s);
        assert_near(p[0], 0.0);
        assert_near(p[1], 24.0);
        assert_near(p[2], 25.0);
        assert!(!s.cons[ConIx(0)].active);
        assert!(s.cons[ConIx(1)].active);
        assert_eq!(s.blocks.live_count(), 2);
        Ok(())
    }

    #[test]
    fn no_negative_multiplier_after_refine() -> Result<(), Error> {
        let mut s = Solver::new(
            vars(&[0.0, 5.0, -5.0, 2.0]),
            cons(&[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0)]),
        );
        s.solve()?;
        for bref in s.blocks.live_refs() {
            let b = s.blocks.get(bref)?;
            if let Some(cix) = b.find_min_lm(&s.vars, &mut s.cons) {
                assert!(s.cons[cix].lm >= LAGRANGIAN_TOLERANCE);
            }
        }
        Ok(())
    }

    #[test]
    fn most_violated_prefers_equalities() -> Result<(), Error> {
        let mut inc = IncSolver::new(
            vars(&[0.0, 0.0, 0.0]),
            vec![
                Constraint::new(VarIx(0), VarIx(1), 10.0),
                Constraint::new_equality(VarIx(1), VarIx(2), 1.0),
            ],
        );
        let winner = inc.most_violated()?;
        assert_eq!(winner, Some(ConIx(1)));
        // the winner was removed from the inactive list in O(1)
        assert_eq!(inc.inactive, vec![ConIx(0)]);
        Ok(())
    }

    #[test]
    fn unsatisfiable_constraints_report_max_slack() -> Result<(), Error> {
        let mut s = Solver::new(vars(&[0.0, 0.0]), cons(&[(0, 1, 10.0)]));
        s.cons[ConIx(0)].unsatisfiable = true;
        assert_eq!(s.blocks.slack(&s.vars, &s.cons, ConIx(0))?, f64::MAX);
        Ok(())
    }

    #[test]
    fn variable_order_respects_constraints() {
        let s = Solver::new(
            vars(&[0.0, 0.0, 0.0, 0.0]),
            cons(&[(0, 1, 1.0), (0, 2, 1.0), (1, 3, 1.0), (2, 3, 1.0)]),
        );
        let order = total_order(&s.vars, &s.cons);
        assert_eq!(order.len(), 4);
        let position = |v: usize| order.iter().position(|&x| x == VarIx(v)).unwrap();
        for (_, c) in s.cons.iter_enumerated() {
            assert!(position(c.left.into()) < position(c.right.into()));
        }
    }

    #[test]
    fn cyclic_inputs_are_detected() {
        let cyclic = Solver::new(
            vars(&[0.0, 0.0, 0.0]),
            cons(&[(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0)]),
        );
        assert!(constraint_graph_is_cyclic(&cyclic.vars, &cyclic.cons));
        let chain = Solver::new(vars(&[0.0, 0.0, 0.0]), cons(&[(0, 1, 1.0), (1, 2, 1.0)]));
        assert!(!constraint_graph_is_cyclic(&chain.vars, &chain.cons));
    }

    #[test]
    fn stale_block_handles_are_rejected() -> Result<(), Error> {
        let mut s = Solver::new(vars(&[0.0, 0.0]), cons(&[(0, 1, 10.0)]));
        let before = [s.vars[VarIx(0)].block, s.vars[VarIx(1)].block];
        s.solve()?;
        // one of the two singleton blocks was absorbed and its slot swept
        let survivors = before.iter().filter(|&&r| s.blocks.get(r).is_ok()).count();
        assert_eq!(survivors, 1);
        Ok(())
    }

    #[test]
    fn random_dag_solves_and_keeps_invariants() -> Result<(), Error> {
        let mut seed = 0x9e3779b97f4a7c15u64;
        let n = 20;
        let desired: Vec<f64> = (0..n).map(|_| lcg(&mut seed) * 100.0).collect();
        let mut edges: Vec<(usize, usize, f64)> = (0..n - 1)
            .map(|i| (i, i + 1, 1.0 + lcg(&mut seed) * 4.0))
            .collect();
        for _ in 0..10 {
            let i = (lcg(&mut seed) * (n as f64 - 2.0)) as usize;
            let j = i + 1 + (lcg(&mut seed) * (n as f64 - 1.0 - i as f64)) as usize;
            let j = j.min(n - 1);
            if i < j {
                edges.push((i, j, 1.0 + lcg(&mut seed) * 3.0));
            }
        }

        let mut batch = Solver::new(vars(&desired), cons(&edges));
        batch.solve()?;
        assert_feasible(&batch);
        assert_blocks_are_spanning_trees(&batch);
        assert!(!block_graph_is_cyclic(&batch.blocks, &batch.vars, &batch.cons));
        for bref in batch.blocks.live_refs() {
            let b = batch.blocks.get(bref)?;
            if let Some(cix) = b.find_min_lm(&batch.vars, &mut batch.cons) {
                assert!(batch.cons[cix].lm >= LAGRANGIAN_TOLERANCE);
            }
        }

        let mut inc = IncSolver::new(vars(&desired), cons(&edges));
        inc.solve()?;
        assert_feasible(&inc.solver);
        assert_blocks_are_spanning_trees(&inc.solver);
        let (cb, ci) = (batch.cost(), inc.solver.cost());
        assert!(
            (cb - ci).abs() <= 1e-4 * (1.0 + cb),
            "batch cost {cb} vs incremental cost {ci}"
        );
        Ok(())
    }

    #[test]
    fn overlapping_rectangles_get_a_separation() -> Result<(), Error> {
        let rects = [
            Rectangle::new(0.0, 10.0, 0.0, 10.0),
            Rectangle::new(5.0, 15.0, 0.0, 10.0),
        ];
        let vixs = [VarIx(0), VarIx(1)];
        let cs = generate_x_constraints(&rects, &vixs, true);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].left, VarIx(0));
        assert_eq!(cs[0].right, VarIx(1));
        assert_near(cs[0].gap, 10.0);

        let vs = rects
            .iter()
            .map(|r| Variable::new(r.centre_x(), 1.0))
            .collect();
        let mut s = Solver::new(vs, cs);
        s.solve()?;
        let p = finals(&s);
        assert_near(p[0], 2.5);
        assert_near(p[1], 12.5);
        Ok(())
    }

    #[test]
    fn adjacent_variant_relates_scan_neighbours() {
        let rects = [
            Rectangle::new(0.0, 10.0, 0.0, 10.0),
            Rectangle::new(5.0, 15.0, 0.0, 10.0),
        ];
        let vixs = [VarIx(0), VarIx(1)];
        let cs = generate_x_constraints(&rects, &vixs, false);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].left, VarIx(0));
        assert_eq!(cs[0].right, VarIx(1));
    }

    #[test]
    fn vertical_overlap_generates_y_constraint() -> Result<(), Error> {
        let rects = [
            Rectangle::new(0.0, 10.0, 0.0, 10.0),
            Rectangle::new(0.0, 10.0, 5.0, 15.0),
        ];
        let vixs = [VarIx(0), VarIx(1)];
        let cs = generate_y_constraints(&rects, &vixs);
        assert_eq!(cs.len(), 1);
        assert_near(cs[0].gap, 10.0);

        let vs = rects
            .iter()
            .map(|r| Variable::new(r.centre_y(), 1.0))
            .collect();
        let mut s = Solver::new(vs, cs);
        s.solve()?;
        let p = finals(&s);
        assert_near(p[0], 2.5);
        assert_near(p[1], 12.5);
        Ok(())
    }

    #[test]
    fn pileup_resolves_on_both_axes() -> Result<(), Error> {
        let mut rects = [
            Rectangle::new(0.0, 10.0, 0.0, 10.0),
            Rectangle::new(4.0, 14.0, 2.0, 12.0),
            Rectangle::new(8.0, 18.0, 4.0, 14.0),
        ];
        let vixs = [VarIx(0), VarIx(1), VarIx(2)];

        let xcs = generate_x_constraints(&rects, &vixs, true);
        assert_eq!(xcs.len(), 3);
        let vs = rects
            .iter()
            .map(|r| Variable::new(r.centre_x(), 1.0))
            .collect();
        let mut sx = Solver::new(vs, xcs);
        sx.solve()?;
        for (i, r) in rects.iter_mut().enumerate() {
            r.set_centre_x(sx.vars[VarIx(i)].final_position);
        }

        let ycs = generate_y_constraints(&rects, &vixs);
        let vs = rects
            .iter()
            .map(|r| Variable::new(r.centre_y(), 1.0))
            .collect();
        let mut sy = Solver::new(vs, ycs);
        sy.solve()?;
        for (i, r) in rects.iter_mut().enumerate() {
            r.set_centre_y(sy.vars[VarIx(i)].final_position);
        }

        for i in 0..rects.len() {
            for j in i + 1..rects.len() {
                let (ox, oy) = (rects[i].overlap_x(&rects[j]), rects[i].overlap_y(&rects[j]));
                assert!(
                    ox <= 0.0 || oy <= 0.0,
                    "rectangles {i} and {j} still overlap: {ox} x {oy}"
                );
            }
        }
        Ok(())
    }
}
