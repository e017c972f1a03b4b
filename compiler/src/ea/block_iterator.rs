//! Reentrant block iterator
//!
//! Walks the blocks of a [`ControlFlowGraph`] in execution order, carrying an
//! abstract state from block to block. Joins wait until every incoming edge
//! has produced a state; loops are handed to the closure, which runs the
//! iterator again bounded by the loop body (hence "reentrant").
//!
//! The iterator only knows block ids and edges. What a state means and how
//! states combine is entirely up to the [`BlockIteratorClosure`].

use super::EscapeAnalysisError;
use crate::ir::{BlockId, ControlFlowGraph, Loop};
use fxhash::FxHashMap;
use log::trace;
use std::collections::VecDeque;

/// Per-block abstract state that can be copied when control forks.
pub trait MergeableBlockState: Clone {
    /// Copy handed to one successor of a fork.
    fn clone_state(&self) -> Self {
        self.clone()
    }
}

/// Hooks a concrete analysis implements to be driven by the iterator
pub trait BlockIteratorClosure {
    type State: MergeableBlockState;

    /// Transfer function over the nodes of `block`.
    fn process_block(&mut self, block: BlockId, state: &mut Self::State) -> Result<(), EscapeAnalysisError>;

    /// Combine the states flowing into `merge`, in predecessor order.
    /// `Ok(None)` means the merge is not ready yet and should be retried later.
    fn merge(
        &mut self,
        merge: BlockId,
        states: &mut [Self::State],
    ) -> Result<Option<Self::State>, EscapeAnalysisError>;

    /// Entry state of `block`, the single successor of a branch.
    fn after_split(&mut self, block: BlockId, state: &Self::State) -> Self::State;

    /// Run the body of `l` starting from `initial`. Returns one state per
    /// entry of `l.exits`.
    fn process_loop(
        &mut self,
        l: &Loop,
        initial: Self::State,
    ) -> Result<Vec<Self::State>, EscapeAnalysisError>;
}

/// Control edge a recorded state belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEdge {
    /// Leaving the end of a block
    BlockEnd(BlockId),
    /// Entering a loop exit block, produced by loop processing
    LoopExit(BlockId),
}

/// States at the edges leaving one loop iteration
#[derive(Debug, Clone)]
pub struct LoopInfo<S> {
    /// One per back edge, in header predecessor order
    pub end_states: Vec<S>,
    /// One per loop exit, in `Loop::exits` order
    pub exit_states: Vec<S>,
}

fn within(boundary: Option<&Loop>, block: BlockId) -> bool {
    boundary.map_or(true, |l| l.contains(block))
}

/// Walk the blocks reachable from `start`, staying inside `boundary` if given.
/// Returns the states recorded at edges the walk did not follow: back edges,
/// edges leaving the boundary, and the ends of forks.
pub fn apply<C: BlockIteratorClosure>(
    closure: &mut C,
    cfg: &ControlFlowGraph,
    start: BlockId,
    initial: C::State,
    boundary: Option<&Loop>,
) -> Result<FxHashMap<ControlEdge, C::State>, EscapeAnalysisError> {
    let mut states: FxHashMap<ControlEdge, C::State> = FxHashMap::default();
    let mut worklist: VecDeque<BlockId> = VecDeque::new();
    let mut current = Some((start, initial));

    loop {
        if let Some((block, mut state)) = current.take() {
            trace!("processing {}", block);
            closure.process_block(block, &mut state)?;

            match cfg.successors(block) {
                [] => {}
                [succ] => {
                    let succ = *succ;
                    if let Some(l) = cfg.loop_at(succ) {
                        if l.contains(block) {
                            // back edge, collected by the enclosing process_loop
                            states.insert(ControlEdge::BlockEnd(block), state);
                        } else {
                            let exit_states = closure.process_loop(l, state)?;
                            if exit_states.len() != l.exits.len() {
                                return Err(EscapeAnalysisError::InvalidGraph(format!(
                                    "loop at {} returned {} exit states for {} exits",
                                    l.header,
                                    exit_states.len(),
                                    l.exits.len()
                                )));
                            }
                            for (&exit, exit_state) in l.exits.iter().zip(exit_states) {
                                states.insert(ControlEdge::LoopExit(exit), exit_state);
                                worklist.push_back(exit);
                            }
                        }
                    } else if !within(boundary, succ) {
                        states.insert(ControlEdge::BlockEnd(block), state);
                    } else if cfg.predecessors(succ).len() > 1 {
                        states.insert(ControlEdge::BlockEnd(block), state);
                        let ready = cfg
                            .predecessors(succ)
                            .iter()
                            .all(|p| states.contains_key(&ControlEdge::BlockEnd(*p)));
                        if ready {
                            worklist.push_back(succ);
                        }
                    } else {
                        current = Some((succ, state));
                    }
                }
                succs => {
                    for &succ in succs {
                        if within(boundary, succ) {
                            worklist.push_back(succ);
                        }
                    }
                    states.insert(ControlEdge::BlockEnd(block), state);
                }
            }
        } else {
            current = next_block(closure, cfg, &mut states, &mut worklist, boundary)?;
            if current.is_none() {
                return Ok(states);
            }
        }
    }
}

/// Pop the next block that can be processed and compute its entry state.
fn next_block<C: BlockIteratorClosure>(
    closure: &mut C,
    cfg: &ControlFlowGraph,
    states: &mut FxHashMap<ControlEdge, C::State>,
    worklist: &mut VecDeque<BlockId>,
    boundary: Option<&Loop>,
) -> Result<Option<(BlockId, C::State)>, EscapeAnalysisError> {
    let mut deferred = 0;
    while let Some(block) = worklist.pop_front() {
        if !within(boundary, block) {
            continue;
        }
        let preds = cfg.predecessors(block);

        if preds.len() > 1 {
            let mut incoming = Vec::with_capacity(preds.len());
            for pred in preds {
                let state = states.remove(&ControlEdge::BlockEnd(*pred)).ok_or_else(|| {
                    EscapeAnalysisError::InvalidGraph(format!(
                        "merge {} scheduled without a state from {}",
                        block, pred
                    ))
                })?;
                incoming.push(state);
            }

            match closure.merge(block, &mut incoming)? {
                Some(state) => return Ok(Some((block, state))),
                None => {
                    trace!("merge {} not ready, deferring", block);
                    for (pred, state) in preds.iter().zip(incoming) {
                        states.insert(ControlEdge::BlockEnd(*pred), state);
                    }
                    worklist.push_back(block);
                    deferred += 1;
                    if deferred > worklist.len() {
                        return Err(EscapeAnalysisError::BlockScheduleStuck {
                            pending: worklist.iter().copied().collect(),
                        });
                    }
                }
            }
        } else {
            let state = match states.remove(&ControlEdge::LoopExit(block)) {
                Some(exit_state) => exit_state,
                None => {
                    let pred = preds.first().copied().ok_or_else(|| {
                        EscapeAnalysisError::InvalidGraph(format!("{} has no predecessor", block))
                    })?;
                    let pred_state = states.get(&ControlEdge::BlockEnd(pred)).ok_or_else(|| {
                        EscapeAnalysisError::InvalidGraph(format!(
                            "{} scheduled without a state from {}",
                            block, pred
                        ))
                    })?;
                    closure.after_split(block, pred_state)
                }
            };
            return Ok(Some((block, state)));
        }
    }
    Ok(None)
}

/// Run one iteration of `l`'s body from `initial` and collect the states at
/// its back edges and exits.
pub fn process_loop<C: BlockIteratorClosure>(
    closure: &mut C,
    cfg: &ControlFlowGraph,
    l: &Loop,
    initial: C::State,
) -> Result<LoopInfo<C::State>, EscapeAnalysisError> {
    let mut states = apply(closure, cfg, l.header, initial, Some(l))?;

    let mut end_states = Vec::with_capacity(l.back_edges.len());
    for &back_edge in &l.back_edges {
        let state = states
            .remove(&ControlEdge::BlockEnd(back_edge))
            .ok_or(EscapeAnalysisError::MissingLoopState {
                header: l.header,
                block: back_edge,
            })?;
        end_states.push(state);
    }

    let mut exit_states = Vec::with_capacity(l.exits.len());
    for &exit in &l.exits {
        let state = match states.remove(&ControlEdge::LoopExit(exit)) {
            Some(state) => Some(state),
            None => cfg
                .predecessors(exit)
                .first()
                .and_then(|pred| states.get(&ControlEdge::BlockEnd(*pred)))
                .map(|s| s.clone_state()),
        };
        exit_states.push(state.ok_or(EscapeAnalysisError::MissingLoopState {
            header: l.header,
            block: exit,
        })?);
    }

    Ok(LoopInfo {
        end_states,
        exit_states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Graph, GraphBuilder, ValueKind};

    /// Records the blocks a path went through.
    #[derive(Debug, Clone, PartialEq)]
    struct Trace(Vec<BlockId>);

    impl MergeableBlockState for Trace {}

    #[derive(Default)]
    struct RecordingClosure {
        processed: Vec<BlockId>,
        merges: Vec<(BlockId, usize)>,
        loops: Vec<BlockId>,
        refuse_merges: usize,
        cfg: Option<ControlFlowGraph>,
    }

    impl BlockIteratorClosure for RecordingClosure {
        type State = Trace;

        fn process_block(&mut self, block: BlockId, state: &mut Trace) -> Result<(), EscapeAnalysisError> {
            self.processed.push(block);
            state.0.push(block);
            Ok(())
        }

        fn merge(&mut self, merge: BlockId, states: &mut [Trace]) -> Result<Option<Trace>, EscapeAnalysisError> {
            if self.refuse_merges > 0 {
                self.refuse_merges -= 1;
                return Ok(None);
            }
            self.merges.push((merge, states.len()));
            Ok(Some(Trace(Vec::new())))
        }

        fn after_split(&mut self, _block: BlockId, state: &Trace) -> Trace {
            state.clone()
        }

        fn process_loop(&mut self, l: &Loop, initial: Trace) -> Result<Vec<Trace>, EscapeAnalysisError> {
            self.loops.push(l.header);
            let cfg = self.cfg.clone().ok_or_else(|| EscapeAnalysisError::InvalidGraph("no cfg".into()))?;
            let info = process_loop(self, &cfg, l, initial)?;
            assert_eq!(info.end_states.len(), l.back_edges.len());
            Ok(info.exit_states)
        }
    }

    fn diamond() -> (Graph, [BlockId; 4]) {
        let mut b = GraphBuilder::new();
        let cond = b.build_parameter(0, ValueKind::Bool);
        let entry = b.entry();
        let left = b.create_block("left");
        let right = b.create_block("right");
        let merge = b.create_block("merge");
        b.build_if(cond, left, right).unwrap();
        for arm in [left, right] {
            b.switch_to_block(arm);
            b.build_goto(merge).unwrap();
        }
        b.switch_to_block(merge);
        b.build_return(None).unwrap();
        (b.finish(), [entry, left, right, merge])
    }

    #[test]
    fn test_merge_waits_for_all_predecessors() {
        let (graph, [entry, left, right, merge]) = diamond();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        let mut closure = RecordingClosure::default();

        apply(&mut closure, &cfg, entry, Trace(Vec::new()), None).unwrap();

        assert_eq!(closure.processed, vec![entry, left, right, merge]);
        assert_eq!(closure.merges, vec![(merge, 2)]);
    }

    #[test]
    fn test_deferred_merge_is_retried() {
        let (graph, [entry, _, _, merge]) = diamond();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        let mut closure = RecordingClosure {
            refuse_merges: 1,
            ..RecordingClosure::default()
        };

        apply(&mut closure, &cfg, entry, Trace(Vec::new()), None).unwrap();
        assert_eq!(closure.merges, vec![(merge, 2)]);
        assert_eq!(closure.processed.last(), Some(&merge));
    }

    #[test]
    fn test_merge_that_never_becomes_ready_is_reported() {
        let (graph, [entry, _, _, merge]) = diamond();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        let mut closure = RecordingClosure {
            refuse_merges: usize::MAX,
            ..RecordingClosure::default()
        };

        let err = apply(&mut closure, &cfg, entry, Trace(Vec::new()), None).unwrap_err();
        assert_eq!(
            err,
            EscapeAnalysisError::BlockScheduleStuck {
                pending: vec![merge]
            }
        );
    }

    #[test]
    fn test_loop_is_delegated_and_exit_continues() {
        let mut b = GraphBuilder::new();
        let cond = b.build_parameter(0, ValueKind::Bool);
        let entry = b.entry();
        let header = b.create_block("header");
        let body = b.create_block("body");
        let exit = b.create_block("exit");
        b.build_goto(header).unwrap();
        b.switch_to_block(header);
        b.build_if(cond, body, exit).unwrap();
        b.switch_to_block(body);
        b.build_goto(header).unwrap();
        b.switch_to_block(exit);
        b.build_return(None).unwrap();
        let graph = b.finish();

        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        let mut closure = RecordingClosure {
            cfg: Some(cfg.clone()),
            ..RecordingClosure::default()
        };
        let states = apply(&mut closure, &cfg, entry, Trace(Vec::new()), None).unwrap();

        assert_eq!(closure.loops, vec![header]);
        assert_eq!(closure.processed, vec![entry, header, body, exit]);
        assert!(states.is_empty());
    }
}
