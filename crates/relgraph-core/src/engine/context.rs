use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use crate::tuple::ObjectRef;

use super::CheckError;

type PathKey = (String, String, String);

/// Path-local state threaded through one recursive evaluation: remaining depth
/// budget, the (type, id, name) keys already on the path, and the request's
/// cancellation token. The subject is fixed per request, so it is not part of
/// the key.
#[derive(Debug, Clone)]
pub(crate) struct Traversal {
    remaining: usize,
    max_depth: usize,
    visited: HashSet<PathKey>,
    cancel: CancellationToken,
}

pub(crate) enum Step {
    Enter(Traversal),
    Cycle,
}

impl Traversal {
    pub(crate) fn new(max_depth: usize, cancel: CancellationToken) -> Self {
        Self {
            remaining: max_depth,
            max_depth,
            visited: HashSet::new(),
            cancel,
        }
    }

    /// Enters a named subcall. A key already on the path is a cycle; otherwise
    /// one unit of depth is consumed.
    pub(crate) fn enter(&self, object: &ObjectRef, name: &str) -> Result<Step, CheckError> {
        self.ensure_active()?;
        let key = (
            object.object_type.clone(),
            object.object_id.clone(),
            name.to_string(),
        );
        if self.visited.contains(&key) {
            return Ok(Step::Cycle);
        }
        if self.remaining == 0 {
            return Err(CheckError::DepthExceeded(self.max_depth));
        }
        let mut next = self.clone();
        next.remaining -= 1;
        next.visited.insert(key);
        Ok(Step::Enter(next))
    }

    /// Named subcalls this path may still enter.
    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    pub(crate) fn ensure_active(&self) -> Result<(), CheckError> {
        if self.cancel.is_cancelled() {
            return Err(CheckError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Same path, with a child token that a combinator cancels once it has decided.
    pub(crate) fn child_scope(&self) -> Self {
        Self {
            remaining: self.remaining,
            max_depth: self.max_depth,
            visited: self.visited.clone(),
            cancel: self.cancel.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> ObjectRef {
        ObjectRef::new("document", id)
    }

    #[test]
    fn enter_consumes_depth() {
        let t = Traversal::new(2, CancellationToken::new());

        let Ok(Step::Enter(t1)) = t.enter(&doc("1"), "view") else {
            panic!("expected to enter");
        };
        let Ok(Step::Enter(t2)) = t1.enter(&doc("2"), "view") else {
            panic!("expected to enter");
        };

        assert_eq!(t1.remaining(), 1);
        assert_eq!(t2.remaining(), 0);
        assert_eq!(t2.enter(&doc("3"), "view").err(), Some(CheckError::DepthExceeded(2)));
    }

    #[test]
    fn revisiting_a_key_on_the_path_is_a_cycle() {
        let t = Traversal::new(5, CancellationToken::new());
        let Ok(Step::Enter(t1)) = t.enter(&doc("1"), "view") else {
            panic!("expected to enter");
        };

        assert!(matches!(t1.enter(&doc("1"), "view"), Ok(Step::Cycle)));
        assert!(matches!(t1.enter(&doc("1"), "edit"), Ok(Step::Enter(_))));
    }

    #[test]
    fn cycle_detected_before_depth_exhaustion() {
        let t = Traversal::new(1, CancellationToken::new());
        let Ok(Step::Enter(t1)) = t.enter(&doc("1"), "view") else {
            panic!("expected to enter");
        };

        assert!(matches!(t1.enter(&doc("1"), "view"), Ok(Step::Cycle)));
    }

    #[test]
    fn sibling_paths_do_not_share_visited_keys() {
        let t = Traversal::new(5, CancellationToken::new());
        let Ok(Step::Enter(_left)) = t.enter(&doc("1"), "view") else {
            panic!("expected to enter");
        };

        assert!(matches!(t.enter(&doc("1"), "view"), Ok(Step::Enter(_))));
    }

    #[test]
    fn cancelled_parent_cancels_child_scope() {
        let token = CancellationToken::new();
        let t = Traversal::new(5, token.clone());
        let child = t.child_scope();

        token.cancel();

        assert_eq!(child.ensure_active(), Err(CheckError::Cancelled));
        assert_eq!(
            child.enter(&doc("1"), "view").err(),
            Some(CheckError::Cancelled)
        );
    }

    #[test]
    fn cancelled_child_leaves_parent_active() {
        let t = Traversal::new(5, CancellationToken::new());
        let child = t.child_scope();

        child.cancel_token().cancel();

        assert!(t.ensure_active().is_ok());
    }
}
