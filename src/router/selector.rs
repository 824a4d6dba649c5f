//! Backend selection strategies

use std::sync::Arc;

use crate::health::{Backend, BackendRole, BackendState};

/// Strategy for picking the backend a new client is routed to
pub trait BackendSelector: Send + Sync {
    /// Index of the chosen backend, or `None` if no backend qualifies
    fn pick(&self, backends: &[Arc<Backend>]) -> Option<usize>;
}

/// Shortest-queue-first over the read-write backends.
///
/// Picks the RW backend that is not DOWN with the fewest connected clients;
/// ties go to the lowest index.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShortestQueueFirst;

impl BackendSelector for ShortestQueueFirst {
    fn pick(&self, backends: &[Arc<Backend>]) -> Option<usize> {
        pick_least_loaded(
            backends
                .iter()
                .map(|b| (b.role, b.state(), b.connected_clients())),
        )
    }
}

fn pick_least_loaded(
    candidates: impl Iterator<Item = (BackendRole, BackendState, usize)>,
) -> Option<usize> {
    candidates
        .enumerate()
        .filter(|(_, (role, state, _))| *role == BackendRole::Rw && *state != BackendState::Down)
        // min_by_key keeps the first of equal keys
        .min_by_key(|(_, (_, _, clients))| *clients)
        .map(|(index, _)| index)
}
