//! GraphViz dump of the pose graph.
//!
//! Emits an undirected graph with the vertices pinned at their XY
//! positions. Edge styling encodes the constraint state: red for
//! invalid registration edges, blue for non-sequential (loop closure)
//! registration edges, default for sequential ones; the fitness score is
//! attached as a two-decimal label when known. Vertices without an
//! attached cloud are dashed.

use std::io::{self, Write};

use crate::system::SlamBackend;

impl SlamBackend {
    /// Write the current graph as GraphViz text.
    pub fn dump_graphviz<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        writeln!(sink, "graph trajectory {{")?;

        for vertex in self.graph.vertices() {
            let position = vertex.estimate().translation.vector;
            let mut attributes = vec![format!("pos=\"{:.3},{:.3}!\"", position.x, position.y)];
            if !vertex.has_cloud() {
                attributes.push("style=dashed".into());
            }
            writeln!(sink, "    {} [{}];", vertex.id, attributes.join(", "))?;
        }

        for edge in self.graph.edges() {
            let mut attributes: Vec<String> = Vec::new();
            if edge.is_gicp() && !edge.is_valid_measurement() {
                attributes.push("color=red".into());
            } else if edge.is_gicp() && !edge.is_sequential() {
                attributes.push("color=blue".into());
            }
            if let Some(fitness) = edge.fitness_score() {
                if fitness.is_finite() && fitness != f64::MAX {
                    attributes.push(format!("label=\"{fitness:.2}\""));
                }
            }

            if attributes.is_empty() {
                writeln!(sink, "    {} -- {};", edge.source, edge.target)?;
            } else {
                writeln!(
                    sink,
                    "    {} -- {} [{}];",
                    edge.source,
                    edge.target,
                    attributes.join(", ")
                )?;
            }
        }

        writeln!(sink, "}}")
    }
}
