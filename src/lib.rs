//! A solver for the problem of Variable Placement with Separation Constraints.
//!
//! # Summary
//!
//! Given a set of real-valued variables, each with a desired position and a
//! weight, and a set of separation constraints of the form
//! `right - left >= gap` (or `right - left = gap`), find positions for the
//! variables that minimize the weighted sum of squared displacements from the
//! desired positions while satisfying every constraint.
//!
//! Problems of this shape fall out of diagram layout everywhere: removing
//! overlap between node rectangles, keeping ports in order along an edge
//! bundle, aligning a column of boxes while respecting minimum gaps. They are
//! quadratic programs, but of such a restricted form that a purpose-built
//! solver beats a general one by a wide margin and, unlike a general solver,
//! can be re-run incrementally as desired positions drift during layout
//! iteration.
//!
//! # Guide-level explanation
//!
//! The solver works on *blocks*. A block is a maximal set of variables chained
//! together by *active* constraints, constraints that hold with equality, so
//! that the whole set moves as one rigid unit. Each variable keeps a fixed
//! offset inside its block, and a block sits at the weighted-mean position
//! that is optimal for its members.
//!
//! Solving proceeds in two movements:
//!
//! 1. *satisfy*: merge blocks across violated constraints until every
//!    constraint holds. Merging fixes the two sides at exactly the required
//!    gap, which is where an optimal solution must have them if the
//!    constraint binds at all.
//! 2. *refine*: inspect each block's active constraints through their
//!    Lagrange multipliers. A negative multiplier names a constraint that is
//!    pinning its block together against the pull of the objective; splitting
//!    the block there lowers the cost without breaking feasibility. Repeat
//!    until no such constraint remains.
//!
//! The incremental variant keeps the block structure between solves, splits
//! whatever became worth splitting after desired positions moved, then merges
//! over the most violated constraints until the cost settles.
//!
//! All of that machinery, the data model (variables, constraints, blocks, the
//! block set), the batch and incremental solvers, the constraint-graph
//! queries, and a sweep-line generator of rectangle non-overlap constraints,
//! lives in [placement].

pub mod placement;
