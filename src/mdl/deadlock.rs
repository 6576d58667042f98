use crate::mdl::context::ContextShared;
use std::sync::Arc;

/// Searches deeper than this count as a deadlock.
pub const MAX_SEARCH_DEPTH: usize = 32;

/// A waiting context as seen by the deadlock search.
#[derive(Clone)]
pub struct DeadlockNode {
    pub ctx: Arc<ContextShared>,
    /// Generation of the wait the context was in when it was visited.
    pub generation: u64,
    pub weight: u32,
}

/// Depth first search for a path from the start context back to itself.
///
/// While the search unwinds from a found cycle, every context on the path is
/// offered as victim; the one with the lowest weight wins and, on a tie, the
/// one offered later, which ends up being the start context.
pub struct DeadlockVisitor {
    start: u64,
    victim: Option<DeadlockNode>,
    depth: usize,
    found: bool,
}

impl DeadlockVisitor {
    pub fn new(start: &ContextShared) -> DeadlockVisitor {
        DeadlockVisitor {
            start: start.id(),
            victim: None,
            depth: 0,
            found: false,
        }
    }

    pub fn enter_node(&mut self, node: &DeadlockNode) -> bool {
        self.depth += 1;
        self.found = self.depth >= MAX_SEARCH_DEPTH;
        if self.found {
            self.opt_change_victim_to(node);
        }
        self.found
    }

    pub fn leave_node(&mut self, node: &DeadlockNode) {
        self.depth -= 1;
        if self.found {
            self.opt_change_victim_to(node);
        }
    }

    pub fn inspect_edge(&mut self, ctx: &ContextShared) -> bool {
        self.found = ctx.id() == self.start;
        self.found
    }

    fn opt_change_victim_to(&mut self, node: &DeadlockNode) {
        let replace = match &self.victim {
            None => true,
            Some(victim) => victim.weight >= node.weight,
        };
        if replace {
            self.victim = Some(node.clone());
        }
    }

    pub fn into_victim(self) -> Option<DeadlockNode> {
        self.victim
    }
}
