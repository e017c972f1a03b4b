//! Loop Analysis
//!
//! This module provides the loop metadata the escape analysis relies on:
//! - Dominator tree computation (iterative dataflow algorithm)
//! - Natural loop detection via back-edge identification
//! - Loop nesting, back-edge order and exit blocks

use super::{BlockId, Graph};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Dominator tree for a graph's control flow.
///
/// A block D dominates block B if every path from the entry to B goes through D.
/// The immediate dominator (idom) of B is the closest strict dominator.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator for each block (entry block has no idom)
    idom: FxHashMap<BlockId, BlockId>,

    /// Children in the dominator tree
    children: FxHashMap<BlockId, Vec<BlockId>>,

    /// Dominator tree depth for each block (entry = 0)
    depth: FxHashMap<BlockId, usize>,

    /// Blocks reachable from the entry, in reverse postorder
    reverse_postorder: Vec<BlockId>,

    entry: BlockId,
}

impl DominatorTree {
    /// Compute the dominator tree using Cooper, Harvey, and Kennedy's
    /// iterative algorithm.
    pub fn compute(graph: &Graph) -> Self {
        let entry = graph.entry();
        let rpo = Self::compute_reverse_postorder(graph, entry);
        let rpo_index: FxHashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut idom: FxHashMap<BlockId, Option<BlockId>> =
            rpo.iter().map(|&b| (b, None)).collect();
        idom.insert(entry, Some(entry));

        let mut changed = true;
        while changed {
            changed = false;

            for &block in &rpo {
                if block == entry {
                    continue;
                }

                let predecessors = graph
                    .block(block)
                    .map(|b| b.predecessors.as_slice())
                    .unwrap_or(&[]);

                let mut new_idom: Option<BlockId> = None;
                for &pred in predecessors {
                    if idom.get(&pred).copied().flatten().is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(current, pred, &idom, &rpo_index),
                    });
                }

                if idom.get(&block).copied().flatten() != new_idom {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        let final_idom: FxHashMap<BlockId, BlockId> = idom
            .iter()
            .filter(|(&block, _)| block != entry)
            .filter_map(|(&block, &dom)| dom.map(|d| (block, d)))
            .collect();

        let mut children: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &block in &rpo {
            if let Some(&dom) = final_idom.get(&block) {
                children.entry(dom).or_default().push(block);
            }
        }

        let mut depth: FxHashMap<BlockId, usize> = FxHashMap::default();
        depth.insert(entry, 0);
        let mut queue = VecDeque::from([entry]);
        while let Some(block) = queue.pop_front() {
            let d = depth[&block];
            for &child in children.get(&block).map(|c| c.as_slice()).unwrap_or(&[]) {
                depth.insert(child, d + 1);
                queue.push_back(child);
            }
        }

        Self {
            idom: final_idom,
            children,
            depth,
            reverse_postorder: rpo,
            entry,
        }
    }

    /// Reverse postorder of the blocks reachable from `entry`.
    fn compute_reverse_postorder(graph: &Graph, entry: BlockId) -> Vec<BlockId> {
        let mut visited = FxHashSet::default();
        let mut postorder = Vec::new();
        // (block, index of the next successor to visit)
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);

        while let Some((block, next)) = stack.pop() {
            let successors = graph
                .block(block)
                .map(|b| b.successors.as_slice())
                .unwrap_or(&[]);
            if let Some(&succ) = successors.get(next) {
                stack.push((block, next + 1));
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
            }
        }

        postorder.reverse();
        postorder
    }

    fn intersect(
        mut b1: BlockId,
        mut b2: BlockId,
        idom: &FxHashMap<BlockId, Option<BlockId>>,
        rpo_index: &FxHashMap<BlockId, usize>,
    ) -> BlockId {
        let index = |b: BlockId| rpo_index.get(&b).copied().unwrap_or(usize::MAX);
        while b1 != b2 {
            while index(b1) > index(b2) {
                match idom.get(&b1).copied().flatten() {
                    Some(dom) => b1 = dom,
                    None => return b1,
                }
            }
            while index(b2) > index(b1) {
                match idom.get(&b2).copied().flatten() {
                    Some(dom) => b2 = dom,
                    None => return b2,
                }
            }
        }
        b1
    }

    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied()
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn depth(&self, block: BlockId) -> usize {
        self.depth.get(&block).copied().unwrap_or(0)
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.reverse_postorder
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        block == self.entry || self.idom.contains_key(&block)
    }

    /// Check if block A dominates block B.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(&dom) = self.idom.get(&current) {
            if dom == a {
                return true;
            }
            current = dom;
        }
        false
    }
}

/// A natural loop.
///
/// The header's first predecessor is the forward entry; every other
/// predecessor is a back edge from inside the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub header: BlockId,

    /// All blocks of the loop, header and nested loops included
    pub blocks: BTreeSet<BlockId>,

    /// Back-edge sources in header predecessor order
    pub back_edges: Vec<BlockId>,

    /// Blocks outside the loop entered from inside it, sorted by id
    pub exits: Vec<BlockId>,

    /// Header of the innermost enclosing loop
    pub parent: Option<BlockId>,

    /// Nesting depth (1 = outermost)
    pub depth: usize,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

/// Loops of a graph indexed by header
#[derive(Debug, Clone, Default)]
pub struct LoopNestInfo {
    pub loops: BTreeMap<BlockId, Loop>,

    /// Innermost loop header for each block inside a loop
    pub block_to_loop: FxHashMap<BlockId, BlockId>,

    pub max_depth: usize,
}

impl LoopNestInfo {
    /// Find natural loops. Returns the retreating edges that do not target a
    /// dominator (irreducible control flow) separately.
    pub fn analyze(graph: &Graph, domtree: &DominatorTree) -> (Self, Vec<(BlockId, BlockId)>) {
        let mut bodies: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
        let mut irreducible = Vec::new();
        let rpo_index: FxHashMap<BlockId, usize> = domtree
            .reverse_postorder()
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, i))
            .collect();

        for &block in domtree.reverse_postorder() {
            let Some(info) = graph.block(block) else {
                continue;
            };
            for &succ in &info.successors {
                if domtree.dominates(succ, block) {
                    let body = bodies.entry(succ).or_default();
                    body.extend(Self::find_loop_blocks(graph, succ, block));
                } else if rpo_index.get(&succ).copied().unwrap_or(usize::MAX) <= rpo_index[&block] {
                    irreducible.push((block, succ));
                }
            }
        }

        let mut loops: BTreeMap<BlockId, Loop> = BTreeMap::new();
        for (&header, body) in &bodies {
            let back_edges = graph
                .block(header)
                .map(|h| {
                    h.predecessors
                        .iter()
                        .copied()
                        .filter(|p| body.contains(p))
                        .collect()
                })
                .unwrap_or_default();
            let exits: BTreeSet<BlockId> = body
                .iter()
                .filter_map(|b| graph.block(*b))
                .flat_map(|b| b.successors.iter().copied())
                .filter(|s| !body.contains(s))
                .collect();
            loops.insert(
                header,
                Loop {
                    header,
                    blocks: body.clone(),
                    back_edges,
                    exits: exits.into_iter().collect(),
                    parent: None,
                    depth: 1,
                },
            );
        }

        // The innermost enclosing loop is the smallest other loop containing the header.
        let headers: Vec<BlockId> = loops.keys().copied().collect();
        for &header in &headers {
            let parent = headers
                .iter()
                .filter(|&&other| other != header && loops[&other].contains(header))
                .min_by_key(|&&other| loops[&other].blocks.len())
                .copied();
            if let Some(l) = loops.get_mut(&header) {
                l.parent = parent;
            }
        }
        for &header in &headers {
            let mut depth = 1;
            let mut current = loops[&header].parent;
            while let Some(parent) = current {
                depth += 1;
                current = loops[&parent].parent;
            }
            if let Some(l) = loops.get_mut(&header) {
                l.depth = depth;
            }
        }

        let mut block_to_loop: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        for (&header, l) in &loops {
            for &block in &l.blocks {
                let deeper = match block_to_loop.get(&block) {
                    Some(existing) => l.depth > loops[existing].depth,
                    None => true,
                };
                if deeper {
                    block_to_loop.insert(block, header);
                }
            }
        }

        let max_depth = loops.values().map(|l| l.depth).max().unwrap_or(0);
        (
            Self {
                loops,
                block_to_loop,
                max_depth,
            },
            irreducible,
        )
    }

    /// Blocks that reach `back_edge_source` without passing through `header`.
    fn find_loop_blocks(graph: &Graph, header: BlockId, back_edge_source: BlockId) -> BTreeSet<BlockId> {
        let mut blocks = BTreeSet::from([header]);
        let mut worklist = vec![back_edge_source];
        while let Some(block) = worklist.pop() {
            if blocks.insert(block) {
                if let Some(info) = graph.block(block) {
                    worklist.extend(info.predecessors.iter().copied());
                }
            }
        }
        blocks
    }

    pub fn innermost_loop(&self, block: BlockId) -> Option<&Loop> {
        self.block_to_loop
            .get(&block)
            .and_then(|header| self.loops.get(header))
    }
}
