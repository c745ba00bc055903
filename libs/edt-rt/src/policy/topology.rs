// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::guid::{Guid, Kind};
use core::fmt;

/// The component tree of a policy domain.
///
/// Nodes live in a flat arena and refer to each other by index. Node 0 is the domain itself, its
/// children are the allocator and the schedulers, workers hang off the scheduler serving them and
/// each worker has its workpile as the only child.
pub struct Topology {
    nodes: Vec<TopologyNode>,
}

#[derive(Debug, Clone)]
pub struct TopologyNode {
    kind: Kind,
    guid: Guid,
    /// Index of the component among components of the same kind.
    index: usize,
    parent: Option<usize>,
    children: Vec<usize>,
}

// === impl Topology ===

impl Topology {
    pub(crate) fn new(policy: Guid) -> Self {
        Self {
            nodes: vec![TopologyNode {
                kind: Kind::Policy,
                guid: policy,
                index: 0,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// Adds a node below `parent` and returns its index.
    pub(crate) fn add(&mut self, parent: usize, kind: Kind, guid: Guid, index: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TopologyNode {
            kind,
            guid,
            index,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn root(&self) -> &TopologyNode {
        &self.nodes[0]
    }

    pub fn get(&self, node: usize) -> Option<&TopologyNode> {
        self.nodes.get(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter()
    }

    /// Returns the children of `node` together with their indices.
    pub fn children(&self, node: usize) -> impl Iterator<Item = (usize, &TopologyNode)> {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|n| n.children.iter())
            .map(|&child| (child, &self.nodes[child]))
    }

    /// Walks up from `node` to the first ancestor of `kind`.
    pub fn ancestor(&self, mut node: usize, kind: Kind) -> Option<&TopologyNode> {
        while let Some(parent) = self.nodes.get(node)?.parent {
            if self.nodes[parent].kind == kind {
                return Some(&self.nodes[parent]);
            }
            node = parent;
        }
        None
    }

    /// Maps each of the `workers` workers to the index of the scheduler above it.
    pub(crate) fn scheduler_of_workers(&self, workers: usize) -> Box<[usize]> {
        let mut mapping = vec![0; workers];
        for (id, node) in self.nodes.iter().enumerate() {
            if node.kind == Kind::Worker
                && let Some(scheduler) = self.ancestor(id, Kind::Scheduler)
            {
                mapping[node.index] = scheduler.index;
            }
        }
        mapping.into_boxed_slice()
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_node(
            topology: &Topology,
            node: usize,
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            let n = &topology.nodes[node];
            writeln!(f, "{:indent$}{} {} {:?}", "", n.kind, n.index, n.guid, indent = depth * 2)?;
            for &child in &n.children {
                fmt_node(topology, child, depth + 1, f)?;
            }
            Ok(())
        }

        fmt_node(self, 0, 0, f)
    }
}

// === impl TopologyNode ===

impl TopologyNode {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn guid(i: u32) -> Guid {
        Guid::from_parts(i, 1)
    }

    #[test]
    fn workers_map_to_their_scheduler() {
        let mut topology = Topology::new(guid(0));
        let s0 = topology.add(0, Kind::Scheduler, guid(1), 0);
        let s1 = topology.add(0, Kind::Scheduler, guid(2), 1);
        topology.add(s0, Kind::Worker, guid(3), 0);
        let w1 = topology.add(s1, Kind::Worker, guid(4), 1);
        let wp = topology.add(w1, Kind::Workpile, guid(5), 1);
        topology.add(s1, Kind::Worker, guid(6), 2);

        assert_eq!(&*topology.scheduler_of_workers(3), &[0, 1, 1]);
        assert_eq!(topology.ancestor(wp, Kind::Scheduler).unwrap().guid(), guid(2));
        assert_eq!(topology.ancestor(wp, Kind::Policy).unwrap().guid(), guid(0));
        assert!(topology.ancestor(0, Kind::Policy).is_none());

        let children: Vec<_> = topology.children(0).map(|(i, _)| i).collect();
        assert_eq!(children, vec![s0, s1]);
        assert_eq!(topology.len(), 7);
    }
}
