//! Output assembler: writes the ID -> username mapping and the edge list as
//! tab-separated files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::graph::{AccountRegistry, EdgeSet};

/// Write `id<TAB>username` rows in ascending ID order.
pub fn write_users<W: Write>(registry: &AccountRegistry, mut out: W) -> Result<usize> {
    let mut rows = 0;
    for (id, username) in registry.all_mappings() {
        writeln!(out, "{}\t{}", id, username)?;
        rows += 1;
    }
    out.flush()?;
    Ok(rows)
}

/// Write `follower<TAB>followed` rows in discovery order.
pub fn write_graph<W: Write>(edges: &EdgeSet, mut out: W) -> Result<usize> {
    for edge in edges.iter() {
        writeln!(out, "{}\t{}", edge.follower, edge.followed)?;
    }
    out.flush()?;
    Ok(edges.len())
}

/// Write both artifacts. The mapping file is written first so a graph file
/// never exists without the IDs it references.
pub fn write_outputs(
    registry: &AccountRegistry,
    edges: &EdgeSet,
    users_path: &Path,
    graph_path: &Path,
) -> Result<()> {
    let users = write_users(registry, BufWriter::new(File::create(users_path)?))?;
    log::info!("Wrote {} accounts to {}", users, users_path.display());

    let graph = write_graph(edges, BufWriter::new(File::create(graph_path)?))?;
    log::info!("Wrote {} edges to {}", graph, graph_path.display());

    Ok(())
}
