//! Dependency graph construction.
//!
//! Turns an ordered sequence of declarations into a validated, acyclic
//! dependency graph. Edges come from explicit `depends_on` hints and from
//! output references embedded in property values.

mod builder;
mod dag;

pub use builder::GraphBuilder;
pub use dag::DependencyGraph;
