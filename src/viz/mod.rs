//! Read-only views of the pose graph.

pub mod graphviz;
