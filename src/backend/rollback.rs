//! Undo actions for multi-step operations

/// Runs its action when dropped unless disarmed first
pub(crate) struct Rollback<F: FnOnce()> {
    undo: Option<F>,
}

impl<F: FnOnce()> Rollback<F> {
    pub(crate) fn new(undo: F) -> Self {
        Self { undo: Some(undo) }
    }

    /// Keep the work done; the action will not run
    pub(crate) fn disarm(mut self) {
        self.undo = None;
    }
}

impl<F: FnOnce()> Drop for Rollback<F> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = Rollback::new(|| ran.set(true));
        }
        assert!(ran.get());
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let ran = Cell::new(false);
        Rollback::new(|| ran.set(true)).disarm();
        assert!(!ran.get());
    }

    #[test]
    fn test_runs_on_early_return() {
        fn fallible(ran: &Cell<u32>, fail: bool) -> Result<(), ()> {
            let guard = Rollback::new(|| ran.set(ran.get() + 1));
            if fail {
                return Err(());
            }
            guard.disarm();
            Ok(())
        }

        let ran = Cell::new(0);
        assert!(fallible(&ran, true).is_err());
        assert!(fallible(&ran, false).is_ok());
        assert_eq!(ran.get(), 1);
    }
}
