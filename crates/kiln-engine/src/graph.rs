//! The derivation graph: units expanded per platform, with cycle detection,
//! topological ordering and parallel levels.

use std::collections::{BTreeSet, HashMap};

use kiln_config::Manifest;
use kiln_targets::{resolve_platform, Platform, TargetError};
use kiln_toolchain::env::env_name_segment;

/// One edge of the graph: the node depended on and the reference that named it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepEdge {
    pub index: usize,
    /// The reference as written in the unit's `deps` list.
    pub reference: String,
}

/// A unit instantiated for one platform.
#[derive(Debug, Clone)]
pub struct Node {
    /// `<unit>` or, for matrix units, `<unit>@<platform>`.
    pub name: String,
    pub unit: String,
    pub platform: Platform,
    pub deps: Vec<DepEdge>,
    pub source: Option<String>,
    pub packages: Vec<String>,
    /// 1 for nodes without dependencies, otherwise 1 + the deepest dependency.
    pub depth: usize,
}

/// A subset of the graph in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Node indices, dependencies first.
    pub order: Vec<usize>,
    /// Node indices grouped by depth. Nodes within a level are independent.
    pub levels: Vec<Vec<usize>>,
}

/// Arena of nodes, edges by index.
#[derive(Debug, Clone)]
pub struct DerivationGraph {
    nodes: Vec<Node>,
    order: Vec<usize>,
    by_name: HashMap<String, usize>,
    by_instance: HashMap<(String, Platform), usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

impl DerivationGraph {
    /// Expand the manifest's units into nodes and link their dependencies.
    ///
    /// Units without an explicit target are built for `default_target`.
    ///
    /// # Errors
    /// Returns an error if a reference is undeclared, a platform name is
    /// unknown, or the dependencies form a cycle.
    pub fn build(
        manifest: &Manifest,
        default_target: &Platform,
        host: &Platform,
    ) -> Result<Self, GraphError> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut by_name = HashMap::new();
        let mut by_instance = HashMap::new();
        let mut matrix: HashMap<&str, bool> = HashMap::new();

        for (unit_name, unit) in &manifest.units {
            matrix.insert(unit_name.as_str(), unit.is_matrix());
            if let Some(source) = &unit.source {
                if !manifest.sources.contains_key(source) {
                    return Err(GraphError::UnknownReference {
                        unit: unit_name.clone(),
                        reference: format!("sources.{source}"),
                    });
                }
            }
            if let Some(package) = unit
                .packages
                .iter()
                .find(|p| !manifest.packages.contains_key(*p))
            {
                return Err(GraphError::UnknownReference {
                    unit: unit_name.clone(),
                    reference: format!("packages.{package}"),
                });
            }
            for (prefix, names) in [("KILN_DEP_", &unit.deps), ("KILN_PKG_", &unit.packages)] {
                if let Some((first, second, segment)) = env_name_clash(names) {
                    return Err(GraphError::EnvNameClash {
                        unit: unit_name.clone(),
                        first,
                        second,
                        variable: format!("{prefix}{segment}"),
                    });
                }
            }

            for declared in unit.declared_targets() {
                let platform = match declared {
                    Some(name) => resolve_platform(name, host).map_err(|source| {
                        GraphError::Platform {
                            unit: unit_name.clone(),
                            source,
                        }
                    })?,
                    None => *default_target,
                };
                let name = if unit.is_matrix() {
                    format!("{unit_name}@{platform}")
                } else {
                    unit_name.clone()
                };
                if by_name.contains_key(&name) {
                    return Err(GraphError::DuplicateInstance { name });
                }
                let index = nodes.len();
                by_name.insert(name.clone(), index);
                by_instance.insert((unit_name.clone(), platform), index);
                nodes.push(Node {
                    name,
                    unit: unit_name.clone(),
                    platform,
                    deps: Vec::new(),
                    source: unit.source.clone(),
                    packages: unit.packages.clone(),
                    depth: 0,
                });
            }
        }

        // Second pass: every node now has an index, so references can resolve.
        let mut edges: Vec<Vec<DepEdge>> = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let Some(unit) = manifest.units.get(&node.unit) else {
                edges.push(Vec::new());
                continue;
            };
            let mut node_edges = Vec::with_capacity(unit.deps.len());
            for reference in &unit.deps {
                let index = resolve_reference(
                    reference,
                    node,
                    host,
                    &matrix,
                    &by_name,
                    &by_instance,
                )?;
                node_edges.push(DepEdge {
                    index,
                    reference: reference.clone(),
                });
            }
            edges.push(node_edges);
        }
        for (node, node_edges) in nodes.iter_mut().zip(edges) {
            node.deps = node_edges;
        }

        let order = topological_order(&nodes)?;
        for &index in &order {
            let depth = nodes
                .get(index)
                .map(|n| {
                    n.deps
                        .iter()
                        .filter_map(|d| nodes.get(d.index).map(|dep| dep.depth))
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0)
                + 1;
            if let Some(node) = nodes.get_mut(index) {
                node.depth = depth;
            }
        }

        Ok(Self {
            nodes,
            order,
            by_name,
            by_instance,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node in topological order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// The instance of `unit` built for `platform`, if declared.
    pub fn instance(&self, unit: &str, platform: &Platform) -> Option<usize> {
        self.by_instance.get(&(unit.to_owned(), *platform)).copied()
    }

    /// The whole graph as a selection.
    pub fn all(&self) -> Selection {
        self.select(&self.order)
    }

    /// The named nodes plus everything they transitively depend on.
    ///
    /// A name may be a node name (`cli@linux-x64`) or a unit name, which
    /// selects every instance of the unit.
    ///
    /// # Errors
    /// Returns an error if a name matches neither.
    pub fn closure(&self, names: &[String]) -> Result<Selection, GraphError> {
        let mut wanted: BTreeSet<usize> = BTreeSet::new();
        let mut stack: Vec<usize> = Vec::new();
        for name in names {
            let roots: Vec<usize> = match self.index_of(name) {
                Some(index) => vec![index],
                None => self
                    .nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| &n.unit == name)
                    .map(|(i, _)| i)
                    .collect(),
            };
            if roots.is_empty() {
                return Err(GraphError::UnknownUnit { name: name.clone() });
            }
            stack.extend(roots);
        }
        while let Some(index) = stack.pop() {
            if !wanted.insert(index) {
                continue;
            }
            if let Some(node) = self.nodes.get(index) {
                stack.extend(node.deps.iter().map(|d| d.index));
            }
        }
        let order: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|i| wanted.contains(i))
            .collect();
        Ok(self.select(&order))
    }

    fn select(&self, order: &[usize]) -> Selection {
        let max_depth = order
            .iter()
            .filter_map(|&i| self.nodes.get(i).map(|n| n.depth))
            .max()
            .unwrap_or(0);
        let mut levels: Vec<Vec<usize>> = vec![Vec::new(); max_depth];
        for &index in order {
            let Some(node) = self.nodes.get(index) else {
                continue;
            };
            if let Some(level) = node.depth.checked_sub(1).and_then(|d| levels.get_mut(d)) {
                level.push(index);
            }
        }
        levels.retain(|level| !level.is_empty());
        Selection {
            order: order.to_vec(),
            levels,
        }
    }
}

fn resolve_reference(
    reference: &str,
    node: &Node,
    host: &Platform,
    matrix: &HashMap<&str, bool>,
    by_name: &HashMap<String, usize>,
    by_instance: &HashMap<(String, Platform), usize>,
) -> Result<usize, GraphError> {
    let unknown = || GraphError::UnknownReference {
        unit: node.name.clone(),
        reference: reference.to_owned(),
    };

    if let Some((unit, platform)) = reference.split_once('@') {
        if !matrix.contains_key(unit) {
            return Err(unknown());
        }
        let platform = resolve_platform(platform, host).map_err(|source| GraphError::Platform {
            unit: node.name.clone(),
            source,
        })?;
        return by_instance
            .get(&(unit.to_owned(), platform))
            .copied()
            .ok_or_else(unknown);
    }

    match matrix.get(reference) {
        None => Err(unknown()),
        Some(false) => by_name.get(reference).copied().ok_or_else(unknown),
        Some(true) => by_instance
            .get(&(reference.to_owned(), node.platform))
            .copied()
            .ok_or_else(|| GraphError::UnknownReference {
                unit: node.name.clone(),
                reference: format!("{reference}@{}", node.platform),
            }),
    }
}

/// Post-order DFS with three-color marking. Dependencies come first.
fn topological_order(nodes: &[Node]) -> Result<Vec<usize>, GraphError> {
    let mut marks = vec![Mark::White; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    let mut stack: Vec<usize> = Vec::new();
    for index in 0..nodes.len() {
        visit(index, nodes, &mut marks, &mut order, &mut stack)?;
    }
    Ok(order)
}

fn visit(
    index: usize,
    nodes: &[Node],
    marks: &mut [Mark],
    order: &mut Vec<usize>,
    stack: &mut Vec<usize>,
) -> Result<(), GraphError> {
    match marks.get(index).copied() {
        Some(Mark::Black) | None => return Ok(()),
        Some(Mark::Gray) => {
            let start = stack.iter().position(|&i| i == index).unwrap_or(0);
            let mut cycle: Vec<&str> = stack
                .get(start..)
                .unwrap_or(stack.as_slice())
                .iter()
                .filter_map(|&i| nodes.get(i).map(|n| n.name.as_str()))
                .collect();
            if let Some(node) = nodes.get(index) {
                cycle.push(&node.name);
            }
            return Err(GraphError::Cycle {
                cycle: cycle.join(" -> "),
            });
        }
        Some(Mark::White) => {}
    }

    if let Some(mark) = marks.get_mut(index) {
        *mark = Mark::Gray;
    }
    stack.push(index);
    if let Some(node) = nodes.get(index) {
        for dep in &node.deps {
            visit(dep.index, nodes, marks, order, stack)?;
        }
    }
    stack.pop();
    if let Some(mark) = marks.get_mut(index) {
        *mark = Mark::Black;
    }
    order.push(index);
    Ok(())
}

/// The first two distinct names that map to the same variable suffix.
fn env_name_clash(names: &[String]) -> Option<(String, String, String)> {
    let mut seen: HashMap<String, &String> = HashMap::new();
    for name in names {
        let segment = env_name_segment(name);
        match seen.get(&segment) {
            Some(&first) if first != name => {
                return Some((first.clone(), name.clone(), segment));
            }
            Some(_) => {}
            None => {
                seen.insert(segment, name);
            }
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle detected: {cycle}")]
    Cycle { cycle: String },

    #[error("unit `{unit}` references undeclared `{reference}`")]
    UnknownReference { unit: String, reference: String },

    #[error("no unit named `{name}` — run `kiln plan` to list units")]
    UnknownUnit { name: String },

    #[error("unit instance `{name}` is declared twice — check for `host` aliasing another target")]
    DuplicateInstance { name: String },

    #[error("unit `{unit}`: {source}")]
    Platform { unit: String, source: TargetError },

    #[error("unit `{unit}`: `{first}` and `{second}` would both be exposed as ${variable} — rename one of them")]
    EnvNameClash {
        unit: String,
        first: String,
        second: String,
        variable: String,
    },
}
