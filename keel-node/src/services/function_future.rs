// Function call futures
//
// A call produces a (promise, future) pair. The promise is fulfilled exactly once,
// either inline, by a scheduler task, or with an explicit error; a later attempt is
// ignored. The future can be awaited from async code or waited on with a timeout
// from blocking code. Waiting never needs a runtime, so it is safe on any thread.

use keel_common::types::FunctionResult;
use keel_common::ServiceError;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Slot {
    result: Option<FunctionResult>,
    waker: Option<Waker>,
}

#[derive(Default)]
struct PromiseState {
    fulfilled: AtomicBool,
    slot: Mutex<Slot>,
    ready: Condvar,
}

/// Write side of a call
#[derive(Clone)]
pub struct FunctionPromise {
    state: Arc<PromiseState>,
}

impl FunctionPromise {
    /// Fulfil the call. Returns `false` if it was already fulfilled.
    pub fn set(&self, result: FunctionResult) -> bool {
        if self
            .state
            .fulfilled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let waker = {
            let mut slot = self.state.slot.lock();
            slot.result = Some(result);
            slot.waker.take()
        };
        self.state.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    pub fn is_set(&self) -> bool {
        self.state.fulfilled.load(Ordering::Acquire)
    }
}

/// Read side of a call
pub struct FunctionFuture {
    state: Arc<PromiseState>,
}

/// Create a linked promise/future pair
pub fn function_promise() -> (FunctionPromise, FunctionFuture) {
    let state = Arc::new(PromiseState::default());
    (
        FunctionPromise {
            state: state.clone(),
        },
        FunctionFuture { state },
    )
}

impl FunctionFuture {
    /// A future that is already resolved
    pub fn ready(result: FunctionResult) -> Self {
        let (promise, future) = function_promise();
        promise.set(result);
        future
    }

    pub fn is_ready(&self) -> bool {
        self.state.slot.lock().result.is_some()
    }

    /// Block until the result arrives or `timeout` elapses.
    ///
    /// On timeout the call keeps running; its late result is dropped with this future.
    pub fn wait(self, timeout: Duration) -> FunctionResult {
        let deadline = Instant::now() + timeout;
        let mut slot = self.state.slot.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return result;
            }
            if self.state.ready.wait_until(&mut slot, deadline).timed_out() {
                return match slot.result.take() {
                    Some(result) => result,
                    None => ServiceError::Timeout(format!("Timeout after {}ms", timeout.as_millis())).into(),
                };
            }
        }
    }
}

impl Future for FunctionFuture {
    type Output = FunctionResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.state.slot.lock();
        match slot.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promise_is_fulfilled_once() {
        let (promise, future) = function_promise();
        assert!(promise.set(FunctionResult::ok(None)));
        assert!(!promise.set(FunctionResult::fail("late")));
        let result = future.wait(Duration::from_millis(10));
        assert!(result.success);
    }

    #[test]
    fn test_wait_times_out_and_late_result_is_dropped() {
        let (promise, future) = function_promise();
        let result = future.wait(Duration::from_millis(20));
        assert_eq!(result.error_message, "Timeout after 20ms");
        // The call finishing afterwards is harmless
        assert!(promise.set(FunctionResult::ok(None)));
    }

    #[test]
    fn test_future_resolves_across_threads() {
        let (promise, future) = function_promise();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.set(FunctionResult::fail("done"));
        });
        let result = tokio_test::block_on(future);
        assert_eq!(result.error_message, "done");
        worker.join().unwrap();
    }
}
