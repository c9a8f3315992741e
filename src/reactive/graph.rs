//! Node arena for the reactive graph.
//!
//! Nodes live in a [`Slab`] and are addressed by [`NodeId`], an index plus the
//! generation the slot had when the node was inserted. Consumer back-edges are
//! plain ids; a consumer that has been removed (or whose slot was reused) is
//! detected by the generation check and skipped.

use std::rc::Weak;

use slab::Slab;

/// Handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Signal,
    Computed,
    Effect,
}

/// A producer read during the last evaluation, with the version observed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    pub(crate) producer: NodeId,
    pub(crate) seen: u64,
}

/// Brings a derived node up to date when a consumer pulls through it.
pub(crate) trait Refresh {
    fn refresh(&self);
}

struct Node {
    kind: NodeKind,
    generation: u64,
    version: u64,
    dirty: bool,
    producers: Vec<Edge>,
    consumers: Vec<NodeId>,
    hook: Option<Weak<dyn Refresh>>,
    effect: Option<u64>,
}

#[derive(Default)]
pub(crate) struct Graph {
    nodes: Slab<Node>,
    next_generation: u64,
}

impl Graph {
    pub(crate) fn insert(&mut self, kind: NodeKind) -> NodeId {
        self.next_generation += 1;
        let generation = self.next_generation;
        let index = self.nodes.insert(Node {
            kind,
            generation,
            version: 0,
            // derived nodes and effects start without a value
            dirty: kind != NodeKind::Signal,
            producers: Vec::new(),
            consumers: Vec::new(),
            hook: None,
            effect: None,
        });
        NodeId { index, generation }
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .get(id.index)
            .filter(|node| node.generation == id.generation)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes
            .get_mut(id.index)
            .filter(|node| node.generation == id.generation)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn set_hook(&mut self, id: NodeId, hook: Weak<dyn Refresh>) {
        if let Some(node) = self.get_mut(id) {
            node.hook = Some(hook);
        }
    }

    pub(crate) fn set_effect(&mut self, id: NodeId, seq: u64) {
        if let Some(node) = self.get_mut(id) {
            node.effect = Some(seq);
        }
    }

    pub(crate) fn hook(&self, id: NodeId) -> Option<Weak<dyn Refresh>> {
        self.get(id).and_then(|node| node.hook.clone())
    }

    /// Removes a node and its consumer edges from every producer.
    pub(crate) fn remove(&mut self, id: NodeId) {
        let Some(node) = self.get(id) else {
            return;
        };
        let producers: Vec<NodeId> = node.producers.iter().map(|e| e.producer).collect();
        for producer in producers {
            self.unlink(producer, id);
        }
        self.nodes.remove(id.index);
    }

    pub(crate) fn version(&self, id: NodeId) -> Option<u64> {
        self.get(id).map(|node| node.version)
    }

    pub(crate) fn is_dirty(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(|node| node.dirty)
    }

    pub(crate) fn set_clean(&mut self, id: NodeId) {
        if let Some(node) = self.get_mut(id) {
            node.dirty = false;
        }
    }

    pub(crate) fn bump(&mut self, id: NodeId) {
        if let Some(node) = self.get_mut(id) {
            node.version += 1;
        }
    }

    pub(crate) fn producers(&self, id: NodeId) -> Vec<Edge> {
        self.get(id)
            .map(|node| node.producers.clone())
            .unwrap_or_default()
    }

    /// Records every producer's current version as seen by `id`.
    pub(crate) fn resync(&mut self, id: NodeId) {
        let edges = self.producers(id);
        let current: Vec<Option<u64>> = edges.iter().map(|e| self.version(e.producer)).collect();
        if let Some(node) = self.get_mut(id) {
            for (edge, version) in node.producers.iter_mut().zip(current) {
                if let Some(version) = version {
                    edge.seen = version;
                }
            }
        }
    }

    /// Starts a new evaluation of `id`: clears its dirty flag and returns the
    /// producer edges of the previous evaluation.
    pub(crate) fn begin_evaluation(&mut self, id: NodeId) -> Vec<Edge> {
        match self.get_mut(id) {
            Some(node) => {
                node.dirty = false;
                std::mem::take(&mut node.producers)
            }
            None => Vec::new(),
        }
    }

    /// Drops consumer edges from producers that the evaluation just finished
    /// no longer read.
    pub(crate) fn end_evaluation(&mut self, id: NodeId, previous: Vec<Edge>) {
        let current: Vec<NodeId> = self
            .get(id)
            .map(|node| node.producers.iter().map(|e| e.producer).collect())
            .unwrap_or_default();
        for edge in previous {
            if !current.contains(&edge.producer) {
                self.unlink(edge.producer, id);
            }
        }
    }

    /// Records that `consumer` read `producer` at its current version.
    pub(crate) fn link(&mut self, consumer: NodeId, producer: NodeId) {
        if consumer == producer {
            return;
        }
        let Some(seen) = self.version(producer) else {
            return;
        };
        let Some(node) = self.get_mut(consumer) else {
            return;
        };
        match node.producers.iter_mut().find(|e| e.producer == producer) {
            Some(edge) => edge.seen = seen,
            None => node.producers.push(Edge { producer, seen }),
        }
        if let Some(node) = self.get_mut(producer) {
            if !node.consumers.contains(&consumer) {
                node.consumers.push(consumer);
            }
        }
    }

    fn unlink(&mut self, producer: NodeId, consumer: NodeId) {
        if let Some(node) = self.get_mut(producer) {
            node.consumers.retain(|c| *c != consumer);
        }
    }

    /// Marks every transitive consumer of `id` dirty and returns the
    /// scheduling keys of effects that just became dirty.
    pub(crate) fn mark_consumers_dirty(&mut self, id: NodeId) -> Vec<u64> {
        let mut effects = Vec::new();
        let mut stack: Vec<NodeId> = match self.get(id) {
            Some(node) => node.consumers.clone(),
            None => return effects,
        };
        while let Some(consumer) = stack.pop() {
            let Some(node) = self.get_mut(consumer) else {
                continue;
            };
            if node.dirty {
                continue;
            }
            node.dirty = true;
            if node.kind == NodeKind::Effect {
                effects.extend(node.effect);
            }
            stack.extend(node.consumers.iter().copied());
        }
        effects
    }

    /// Number of live nodes.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id)
            .map(|node| node.consumers.clone())
            .unwrap_or_default()
    }

    pub(crate) fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.get(id).map(|node| node.kind)
    }
}
