// I/O reactor for RPC.
//
// A current-thread tokio runtime driven by one dedicated poller thread. The thread
// repeatedly drives ready I/O work and otherwise sleeps for the poll interval, so
// network traffic is serviced without a busy-spinning core. Other threads hand work
// to it through its `Handle`.

use keel_common::logging::Logger;
use keel_common::{log_debug, log_error, log_info};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime::Handle;

use crate::config::ManagerStartConfig;

struct Poller {
    thread: JoinHandle<()>,
    thread_id: ThreadId,
    stop: Arc<AtomicBool>,
}

pub struct Reactor {
    logger: Arc<Logger>,
    handle: RwLock<Option<Handle>>,
    poller: Mutex<Option<Poller>>,
}

impl Reactor {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            handle: RwLock::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn start(&self, config: &ManagerStartConfig) -> bool {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            log_debug!(self.logger, "Reactor already running");
            return true;
        }

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                log_error!(self.logger, "Failed to build reactor: {}", e);
                return false;
            }
        };
        let handle = runtime.handle().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let interval = config.poll_interval;

        let spawned = thread::Builder::new()
            .name("keel-reactor".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    runtime.block_on(tokio::time::sleep(interval));
                }
                runtime.shutdown_background();
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                log_error!(self.logger, "Failed to spawn reactor thread: {}", e);
                return false;
            }
        };

        *self.handle.write() = Some(handle);
        *poller = Some(Poller {
            thread_id: thread.thread().id(),
            thread,
            stop,
        });
        log_info!(self.logger, "Reactor started, poll interval {}ms", interval.as_millis());
        true
    }

    pub fn stop(&self) {
        let Some(poller) = self.poller.lock().take() else {
            return;
        };
        *self.handle.write() = None;
        poller.stop.store(true, Ordering::Release);

        // Joining from the poller itself would never return
        if thread::current().id() != poller.thread_id && poller.thread.join().is_err() {
            log_error!(self.logger, "Reactor thread panicked");
        }
        log_info!(self.logger, "Reactor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.read().is_some()
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle.read().clone()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::logging::Component;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_reactor_drives_spawned_work() {
        let reactor = Reactor::new(Arc::new(Logger::new_root(Component::Test, "reactor-test")));
        assert!(reactor.handle().is_none());
        assert!(reactor.start(&ManagerStartConfig::default().with_poll_interval(Duration::from_millis(5))));

        let (sender, receiver) = mpsc::channel();
        let handle = reactor.handle().unwrap();
        handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = sender.send(42);
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok(42));

        reactor.stop();
        assert!(!reactor.is_running());
    }
}
