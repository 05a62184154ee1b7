//! Shared fixtures for integration tests.

use strata::service::{Collaborators, StackService};
use strata::storage::memory::MemoryBackingStore;
use strata::storage::Oid;
use strata::worktree::mock::MockWorktree;

/// A deterministic fake commit id.
pub fn oid(seed: u8) -> Oid {
    Oid::from_hex(&format!("{:02x}", seed).repeat(20)).unwrap()
}

/// Service over the in-memory backend and mock worktree, with trunk
/// `main` at `oid(1)` already initialized.
pub fn initialized_service() -> (StackService, MockWorktree, MemoryBackingStore) {
    let worktree = MockWorktree::new();
    let backing = MemoryBackingStore::new();
    let service = StackService::new(Collaborators::new(
        Box::new(backing.clone()),
        Box::new(worktree.clone()),
    ));

    worktree.set_branch("main", oid(1));
    worktree.set_current("main");
    service.init("main", Some("origin")).unwrap();

    (service, worktree, backing)
}

/// Track a linear stack main → a → b → c with distinct fake tips.
#[allow(dead_code)]
pub fn track_linear_stack(service: &StackService, worktree: &MockWorktree) {
    worktree.set_branch("a", oid(11));
    worktree.set_branch("b", oid(12));
    worktree.set_branch("c", oid(13));

    service.track("a", "main", &oid(1)).unwrap();
    service.track("b", "a", &oid(11)).unwrap();
    service.track("c", "b", &oid(12)).unwrap();
}

/// Count snapshots from the current head back to the root.
#[allow(dead_code)]
pub fn snapshot_depth(backing: &MemoryBackingStore) -> usize {
    use strata::storage::BackingRefStore;

    let mut depth = 0;
    let mut cursor = backing.head().unwrap();
    while let Some(id) = cursor {
        depth += 1;
        cursor = backing.read_snapshot(&id).unwrap().parent;
    }
    depth
}
