use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use nxsas::container::{Container, Group, Node};

/// Display information about a .nxc container file
pub fn run(file: PathBuf) -> Result<()> {
    if !file.exists() {
        bail!("file does not exist: {}", file.display());
    }

    let container = Container::open(&file).context("failed to open container")?;

    println!("nxsas Container Information");
    println!("===========================");
    println!("File: {}", file.display());
    println!();

    let (groups, datasets, links) = count_nodes(container.root());
    println!("Nodes: {groups} group(s), {datasets} dataset(s), {links} link(s)");
    println!();

    println!("Tree:");
    print_group(container.root(), 1);
    Ok(())
}

fn count_nodes(group: &Group) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for (_, node) in &group.children {
        match node {
            Node::Group(g) => {
                counts.0 += 1;
                let (groups, datasets, links) = count_nodes(g);
                counts.0 += groups;
                counts.1 += datasets;
                counts.2 += links;
            }
            Node::Dataset(_) => counts.1 += 1,
            Node::Link(_) => counts.2 += 1,
        }
    }
    counts
}

fn print_group(group: &Group, depth: usize) {
    let indent = "  ".repeat(depth);
    for (name, node) in &group.children {
        match node {
            Node::Group(g) => {
                if g.attrs.is_empty() {
                    println!("{indent}{name}/");
                } else {
                    println!("{indent}{name}/  ({} attr(s))", g.attrs.len());
                }
                print_group(g, depth + 1);
            }
            Node::Dataset(d) => {
                println!("{indent}{name}  [{} {:?}]", d.dtype, d.shape);
            }
            Node::Link(l) => {
                println!("{indent}{name} -> /{}", l.target);
            }
        }
    }
}
