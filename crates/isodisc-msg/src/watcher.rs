//! Background message watcher.
//!
//! The watcher owns an outlist frame on the bus and drains it at short
//! intervals on its own thread, handing every message to caller-provided
//! handlers. Shutdown drains the remaining backlog synchronously before the
//! thread exits, so no message submitted before [`Watcher::shutdown`] is
//! lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{Message, MessageBus, MsgError};

const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

pub type MessageHandler = Box<dyn Fn(&Message) + Send>;

/// Handle to a running watcher thread.
pub struct Watcher {
    bus: Arc<MessageBus>,
    handle: u32,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Pushes an outlist frame and starts the drain thread. `result_handler`
    /// receives result-channel messages, `info_handler` the rest.
    pub fn start(
        bus: Arc<MessageBus>,
        result_handler: MessageHandler,
        info_handler: MessageHandler,
    ) -> Result<Self, MsgError> {
        let handle = bus.push_outlists()?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread_bus = bus.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            loop {
                let stopping = thread_stop.load(Ordering::Acquire);
                match thread_bus.fetch_outlists(handle) {
                    Ok((result, info)) => {
                        if result.is_empty() && info.is_empty() {
                            thread_bus.mark_watcher_idle();
                        } else {
                            thread_bus.mark_watcher_busy();
                            for msg in &result {
                                result_handler(msg);
                            }
                            for msg in &info {
                                info_handler(msg);
                            }
                            thread_bus.mark_watcher_idle();
                        }
                    }
                    Err(_) => break,
                }
                if stopping {
                    break;
                }
                std::thread::sleep(DRAIN_INTERVAL);
            }
        });

        Ok(Self {
            bus,
            handle,
            stop,
            thread: Some(thread),
        })
    }

    /// Stops the thread, drains whatever is still queued, and pops the
    /// outlist frame. Returns any messages that arrived after the final
    /// thread drain.
    pub fn shutdown(mut self) -> Result<(Vec<Message>, Vec<Message>), MsgError> {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.bus.pop_outlists(self.handle)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = self.bus.pop_outlists(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, Severity};
    use std::sync::Mutex;

    #[test]
    fn watcher_drains_in_submission_order() {
        let bus = Arc::new(MessageBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result_seen = seen.clone();
        let info_seen = seen.clone();
        let watcher = Watcher::start(
            bus.clone(),
            Box::new(move |m| result_seen.lock().unwrap().push(m.text.clone())),
            Box::new(move |m| info_seen.lock().unwrap().push(m.text.clone())),
        )
        .unwrap();

        for i in 0..20 {
            bus.submit_text(0, Severity::Note, Channel::Result, format!("msg-{i}"));
        }
        // Wait semantics: returns false once the watcher confirms no backlog.
        let pending = bus
            .peek_outlists(watcher.handle, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(!pending);

        let (late_result, late_info) = watcher.shutdown().unwrap();
        assert!(late_result.is_empty() && late_info.is_empty());

        let seen = seen.lock().unwrap();
        let expect: Vec<String> = (0..20).map(|i| format!("msg-{i}")).collect();
        assert_eq!(*seen, expect);
    }

    #[test]
    fn shutdown_drains_remaining_backlog() {
        let bus = Arc::new(MessageBus::new());
        let seen = Arc::new(Mutex::new(0usize));
        let count = seen.clone();
        let watcher = Watcher::start(
            bus.clone(),
            Box::new(move |_| *count.lock().unwrap() += 1),
            Box::new(|_| {}),
        )
        .unwrap();

        bus.submit_text(0, Severity::Note, Channel::Result, "tail");
        let (result, _info) = watcher.shutdown().unwrap();
        // Either the thread handled it or shutdown returned it; never lost.
        assert_eq!(*seen.lock().unwrap() + result.len(), 1);
    }
}
