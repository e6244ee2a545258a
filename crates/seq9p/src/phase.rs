//! Bookkeeping for a tree of nested sequences.
//!
//! Operations submitted anywhere in the tree go out on one pipeline, so their
//! results come back in submission order. The tracker splits that order into
//! phases: a run of consecutive operations that all belong to the same node.
//! Beginning a subsequence starts a phase for it; ending one starts a phase for
//! its parent. The head phase is the one the next result belongs to.
//!
//! A subsequence is finished once it has been ended, every one of its
//! operations has been answered and all of its children have finished.

use std::collections::VecDeque;

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    parent: Option<usize>,
    npending: usize,
    live_children: usize,
    closed: bool,
    finished: bool,
    is_final: bool,
}

#[derive(Debug)]
struct Phase {
    npending: usize,
    node: usize,
}

#[derive(Debug)]
pub(crate) struct PhaseTracker<T> {
    nodes: Vec<Node<T>>,
    phases: VecDeque<Phase>,
    top: Option<usize>,
    total: usize,
}

pub(crate) const ROOT: usize = 0;

impl<T> PhaseTracker<T> {
    pub fn new(root: T) -> Self {
        PhaseTracker {
            nodes: vec![Node {
                value: Some(root),
                parent: None,
                npending: 0,
                live_children: 0,
                closed: false,
                finished: false,
                is_final: false,
            }],
            phases: VecDeque::from([Phase {
                npending: 0,
                node: ROOT,
            }]),
            top: Some(ROOT),
            total: 0,
        }
    }

    /// Operations submitted but not yet answered, across the whole tree.
    pub fn total_pending(&self) -> usize {
        self.total
    }

    /// The innermost open node, or `None` once the root has ended.
    #[cfg(test)]
    pub fn top(&self) -> Option<usize> {
        self.top
    }

    /// Count one operation submitted by the innermost open node.
    pub fn submit(&mut self) -> bool {
        let Some(top) = self.top else {
            return false;
        };
        let Some(tail) = self.phases.back_mut() else {
            return false;
        };
        debug_assert_eq!(tail.node, top);
        tail.npending += 1;
        self.nodes[top].npending += 1;
        self.total += 1;
        true
    }

    /// Open a subsequence of the innermost open node.
    pub fn begin(&mut self, value: T) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            value: Some(value),
            parent: self.top,
            npending: 0,
            live_children: 0,
            closed: false,
            finished: false,
            is_final: false,
        });
        if let Some(p) = self.top {
            self.nodes[p].live_children += 1;
        }
        self.top = Some(idx);

        // A phase that has collected nothing can be taken over, unless its node
        // has already ended and needs the phase to be noticed.
        match self.phases.back_mut() {
            Some(tail) if tail.npending == 0 && !self.nodes[tail.node].closed => tail.node = idx,
            _ => self.phases.push_back(Phase {
                npending: 0,
                node: idx,
            }),
        }
        idx
    }

    /// End the innermost open subsequence. Returns false if only the root is open.
    pub fn end_subsequence(&mut self) -> bool {
        let Some(top) = self.top else {
            return false;
        };
        let Some(parent) = self.nodes[top].parent else {
            return false;
        };
        self.nodes[top].closed = true;
        self.top = Some(parent);
        self.phases.push_back(Phase {
            npending: 0,
            node: parent,
        });
        true
    }

    /// End the root. Returns false if subsequences are still open.
    pub fn end_root(&mut self) -> bool {
        match self.top {
            Some(ROOT) => {
                self.nodes[ROOT].closed = true;
                self.top = None;
                true
            }
            _ => false,
        }
    }

    /// The node the next result belongs to.
    pub fn head(&self) -> usize {
        self.phases.front().map_or(ROOT, |p| p.node)
    }

    /// Account for one result delivered to the head node.
    pub fn reply(&mut self) -> bool {
        let Some(head) = self.phases.front_mut() else {
            return false;
        };
        if head.npending == 0 {
            return false;
        }
        head.npending -= 1;
        self.nodes[head.node].npending -= 1;
        self.total -= 1;
        true
    }

    /// Retire exhausted phases, returning the next subsequence that has finished.
    ///
    /// The caller must hand the finished node's result to its parent before
    /// calling again.
    pub fn next_finished(&mut self) -> Option<usize> {
        while self.phases.len() > 1 && self.phases[0].npending == 0 {
            let p = self.phases.pop_front()?;
            let n = &self.nodes[p.node];
            if n.closed && !n.finished && n.npending == 0 && n.live_children == 0 {
                if let Some(parent) = n.parent {
                    self.nodes[p.node].finished = true;
                    self.nodes[parent].live_children -= 1;
                    return Some(p.node);
                }
            }
        }
        None
    }

    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].parent
    }

    pub fn is_closed(&self, idx: usize) -> bool {
        self.nodes[idx].closed
    }

    pub fn value(&self, idx: usize) -> Option<&T> {
        self.nodes[idx].value.as_ref()
    }

    pub fn value_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.nodes[idx].value.as_mut()
    }

    pub fn take(&mut self, idx: usize) -> Option<T> {
        self.nodes[idx].value.take()
    }

    /// Mark the head node and its ancestors final, innermost first.
    pub fn mark_final(&mut self) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut at = Some(self.head());
        while let Some(idx) = at {
            self.nodes[idx].is_final = true;
            chain.push(idx);
            at = self.nodes[idx].parent;
        }
        chain
    }

    /// Nodes still holding a value that are neither finished nor final.
    pub fn unfinished_non_final(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.finished && !n.is_final && n.value.is_some())
            .map(|(i, _)| i)
            .collect()
    }

    /// True when nothing is pending and no subsequence is open.
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.total == 0 && matches!(self.top, Some(ROOT) | None)
    }
}
