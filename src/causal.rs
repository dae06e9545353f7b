//! Causal-chain id allocation.
//!
//! Every host-API call gets a node in its thread's call tree, identified by
//! a process-unique id plus the id of the enclosing call and the nesting
//! depth. Ids come from a process-wide counter; the parent relationship is
//! tracked on a per-thread stack that mirrors ENTER/EXIT nesting.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub id: u64,
    pub parent: u64,
    pub depth: u32,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static PARENT_STACK: RefCell<Vec<ChainLink>> = const { RefCell::new(Vec::new()) };
}

/// Allocates the next link in this thread's call tree and makes it the
/// parent of subsequent allocations until [`end`] is called.
pub fn begin() -> ChainLink {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    PARENT_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let link = match stack.last() {
            Some(parent) => ChainLink {
                id,
                parent: parent.id,
                depth: parent.depth + 1,
            },
            None => ChainLink {
                id,
                parent: 0,
                depth: 0,
            },
        };
        stack.push(link);
        link
    })
}

/// Closes the innermost open link on this thread.
pub fn end() {
    PARENT_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_reflect_nesting() {
        let outer = begin();
        assert_eq!(outer.depth, 0);
        assert_eq!(outer.parent, 0);

        let inner = begin();
        assert_eq!(inner.depth, 1);
        assert_eq!(inner.parent, outer.id);
        end();

        let sibling = begin();
        assert_eq!(sibling.depth, 1);
        assert_eq!(sibling.parent, outer.id);
        assert_ne!(sibling.id, inner.id);
        end();
        end();

        let next_root = begin();
        assert_eq!(next_root.depth, 0);
        assert_eq!(next_root.parent, 0);
        end();
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let link = begin();
                    end();
                    link.id
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let local = begin();
        end();
        ids.push(local.id);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }
}
