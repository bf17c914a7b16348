// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/// Undo actions for resources acquired during one operation.
///
/// Every kernel resource acquired by an operation registers the action that
/// releases it. If the guard is dropped without `commit()`, the actions run
/// newest first, so that a device-mapper node is removed before the loop
/// devices beneath it are detached.
#[must_use = "dropping a Rollback immediately undoes everything registered with it"]
pub struct Rollback<'a> {
    undo: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Rollback<'a> {
    /// Create a guard with nothing to undo.
    pub fn new() -> Rollback<'a> {
        Rollback { undo: Vec::new() }
    }

    /// Register the action that releases the most recently acquired
    /// resource.
    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() + 'a,
    {
        self.undo.push(Box::new(action));
    }

    /// Keep every acquired resource.
    pub fn commit(mut self) {
        self.undo.clear();
    }
}

impl Default for Rollback<'_> {
    fn default() -> Self {
        Rollback::new()
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            debug!("Rolling back {} acquired resources", self.undo.len());
        }
        while let Some(action) = self.undo.pop() {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[test]
    fn test_drop_undoes_newest_first() {
        let log = RefCell::new(Vec::new());
        {
            let mut rollback = Rollback::new();
            rollback.push(|| log.borrow_mut().push("loop0"));
            rollback.push(|| log.borrow_mut().push("loop1"));
            rollback.push(|| log.borrow_mut().push("dm"));
        }
        assert_eq!(*log.borrow(), vec!["dm", "loop1", "loop0"]);
    }

    #[test]
    fn test_commit_keeps_resources() {
        let log = RefCell::new(Vec::new());
        let mut rollback = Rollback::new();
        rollback.push(|| log.borrow_mut().push("loop0"));
        rollback.commit();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_early_return_undoes() {
        fn acquire(log: &RefCell<Vec<&'static str>>, fail: bool) -> Result<(), ()> {
            let mut rollback = Rollback::new();
            rollback.push(|| log.borrow_mut().push("released"));
            if fail {
                return Err(());
            }
            rollback.commit();
            Ok(())
        }

        let log = RefCell::new(Vec::new());
        assert!(acquire(&log, false).is_ok());
        assert!(log.borrow().is_empty());
        assert!(acquire(&log, true).is_err());
        assert_eq!(*log.borrow(), vec!["released"]);
    }
}
