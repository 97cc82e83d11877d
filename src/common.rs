//! Small graph-traversal traits shared by the hashgraph engine and the push
//! protocol's diff computation.

/// A read-only view of a directed graph, abstract over node identifier type.
///
/// [`algorithm::datastructure::sync::Jobs::generate`](crate::algorithm::datastructure::sync::Jobs::generate)
/// only needs neighbor lookups, not the underlying storage, so the hashgraph
/// engine and any future graph representation can both implement this.
pub trait Directed {
    type NodeIdentifier;
    type NodeIdentifiers;

    /// Nodes with an edge pointing into `node` (its parents, in event-graph terms).
    fn in_neighbors(&self, node: &Self::NodeIdentifier) -> Option<Self::NodeIdentifiers>;

    /// Nodes `node` has an edge pointing to (its children, in event-graph terms).
    fn out_neighbors(&self, node: &Self::NodeIdentifier) -> Option<Self::NodeIdentifiers>;
}

/// A graph that can hand back a view with every edge flipped.
pub trait Reversable {
    type Reversed;

    fn reversed(&self) -> Self::Reversed;
}
