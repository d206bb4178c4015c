/// Runs its action on drop unless dismissed.
///
/// Used to unwind partially-completed transitions (init, start, connect) so that a
/// failure leaves the same state as never having tried.
pub(crate) struct RollbackGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> RollbackGuard<F> {
    pub(crate) fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Keep the work done so far
    pub(crate) fn dismiss(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for RollbackGuard<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
