use crate::options::VictimPolicy;
use crate::transactions::lock::range_lock_table::TableState;
use crate::transactions::lock::row_lock::LockRequest;
use crate::transactions::TransactionID;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Who waits for whom, built from the pending queues of every lock table.
///
/// An edge `a -> b` means a pending request of `a` overlaps and conflicts
/// with a lock granted to `b`.
#[derive(Default)]
pub struct WaitForGraph {
    edges: BTreeMap<TransactionID, BTreeSet<TransactionID>>,
    waiting: BTreeMap<TransactionID, Arc<LockRequest>>,
}

impl WaitForGraph {
    pub(crate) fn build<'a>(tables: impl IntoIterator<Item = &'a TableState>) -> WaitForGraph {
        let mut graph = WaitForGraph::default();
        for state in tables {
            for (request, blockers) in state.waits() {
                let txn = request.txn;
                graph.waiting.entry(txn).or_insert(request);
                graph.edges.entry(txn).or_default().extend(blockers);
            }
        }
        graph
    }

    pub fn add_edge(&mut self, waiter: TransactionID, holder: TransactionID) {
        self.edges.entry(waiter).or_default().insert(holder);
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|s| s.len()).sum()
    }

    pub(crate) fn request_of(&self, txn: TransactionID) -> Option<&Arc<LockRequest>> {
        self.waiting.get(&txn)
    }

    /// A cycle through `start`, listed from `start` along the edges.
    pub fn find_cycle_from(&self, start: TransactionID) -> Option<Vec<TransactionID>> {
        let mut path = vec![start];
        let mut visited = BTreeSet::new();
        visited.insert(start);
        if self.search(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn search(
        &self,
        node: TransactionID,
        target: TransactionID,
        path: &mut Vec<TransactionID>,
        visited: &mut BTreeSet<TransactionID>,
    ) -> bool {
        let next_nodes = match self.edges.get(&node) {
            Some(n) => n,
            None => return false,
        };
        for &next in next_nodes {
            if next == target {
                return true;
            }
            if visited.insert(next) {
                path.push(next);
                if self.search(next, target, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    /// The cycle through the lowest transaction id that is on one.
    pub fn find_any_cycle(&self) -> Option<Vec<TransactionID>> {
        self.edges.keys().find_map(|&txn| self.find_cycle_from(txn))
    }
}

/// Picks the member of `cycle` to abort. Deterministic for a given cycle.
pub fn choose_victim(
    cycle: &[TransactionID],
    policy: VictimPolicy,
    requester: Option<TransactionID>,
) -> Option<TransactionID> {
    let youngest = cycle.iter().copied().max();
    match (policy, requester) {
        (VictimPolicy::Requester, Some(txn)) if cycle.contains(&txn) => Some(txn),
        _ => youngest,
    }
}
