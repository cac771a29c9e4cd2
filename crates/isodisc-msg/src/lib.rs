//! Message bus for the isodisc library.
//!
//! All user-visible reporting flows through a [`MessageBus`]: severity-tagged,
//! channel-tagged messages which can be redirected into caller-owned lists
//! ("outlists"), filtered by a programmable [`sieve`], or consumed by a
//! background [`watcher`] thread. The bus also keeps the problem-status
//! register from which exit values are derived.
//!
//! The bus is the only component of the library that takes internal locks;
//! everything else runs on the caller's thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub mod sieve;
pub mod watcher;

pub use sieve::{Sieve, SieveRule, parse_line};
pub use watcher::Watcher;

/// Maximum depth of the outlist redirection stack.
pub const MAX_OUTLIST_STACK: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    /// The outlist stack already holds [`MAX_OUTLIST_STACK`] frames.
    #[error("outlist stack is full ({MAX_OUTLIST_STACK} frames)")]
    StackFull,

    /// The handle does not name a live outlist frame.
    #[error("stale or unknown outlist handle {0}")]
    BadHandle(u32),

    /// Frames must be popped in reverse order of pushing.
    #[error("outlist handle {0} is not on top of the stack")]
    NotOnTop(u32),
}

/// Message severity, ordered from least to most severe.
///
/// The derived `Ord` is the comparison contract: `DEBUG < UPDATE < NOTE <
/// WARNING < HINT < SORRY < MISHAP < FAILURE < FATAL < ABORT`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Update,
    Note,
    Warning,
    Hint,
    Sorry,
    Mishap,
    Failure,
    Fatal,
    Abort,
}

impl Severity {
    /// Parses a severity name. Unknown names compare as `FATAL`, so this
    /// never fails; use [`Severity::try_from_text`] to detect unknown input.
    pub fn from_text(text: &str) -> Self {
        Self::try_from_text(text).unwrap_or(Severity::Fatal)
    }

    pub fn try_from_text(text: &str) -> Option<Self> {
        Some(match text.to_ascii_uppercase().as_str() {
            "DEBUG" => Severity::Debug,
            "UPDATE" => Severity::Update,
            "NOTE" => Severity::Note,
            "WARNING" => Severity::Warning,
            "HINT" => Severity::Hint,
            "SORRY" => Severity::Sorry,
            "MISHAP" => Severity::Mishap,
            "FAILURE" => Severity::Failure,
            "FATAL" => Severity::Fatal,
            "ABORT" => Severity::Abort,
            _ => return None,
        })
    }

    pub fn as_text(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Update => "UPDATE",
            Severity::Note => "NOTE",
            Severity::Warning => "WARNING",
            Severity::Hint => "HINT",
            Severity::Sorry => "SORRY",
            Severity::Mishap => "MISHAP",
            Severity::Failure => "FAILURE",
            Severity::Fatal => "FATAL",
            Severity::Abort => "ABORT",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_text())
    }
}

/// Output channel of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Final command output.
    Result,
    /// Diagnostics and progress.
    Info,
    /// Delimiters for machine parsing.
    Mark,
}

bitflags::bitflags! {
    /// Channel selection mask for sieve rules.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelMask: u8 {
        const RESULT = 1 << 0;
        const INFO = 1 << 1;
        const MARK = 1 << 2;
    }
}

impl ChannelMask {
    pub fn matches(&self, channel: Channel) -> bool {
        match channel {
            Channel::Result => self.contains(ChannelMask::RESULT),
            Channel::Info => self.contains(ChannelMask::INFO),
            Channel::Mark => self.contains(ChannelMask::MARK),
        }
    }
}

/// A single bus message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Error code, namespaced by the originating library.
    pub error_code: u32,
    pub text: String,
    /// OS errno, 0 when not OS-originated.
    pub os_errno: i32,
    pub severity: Severity,
    pub channel: Channel,
}

impl Message {
    pub fn new(
        error_code: u32,
        severity: Severity,
        channel: Channel,
        text: impl Into<String>,
    ) -> Self {
        Self {
            error_code,
            text: text.into(),
            os_errno: 0,
            severity,
            channel,
        }
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.os_errno = errno;
        self
    }
}

struct OutlistFrame {
    handle: u32,
    result: Vec<Message>,
    info: Vec<Message>,
}

struct BusState {
    stack: Vec<OutlistFrame>,
    next_handle: u32,
    problem_status: Option<Severity>,
    pardon: Severity,
    sieve: Option<Sieve>,
    /// Set by the watcher after it drained an empty outlist.
    watcher_idle: bool,
    sink: Option<Box<dyn FnMut(&Message) + Send>>,
}

/// Severity-ordered, channel-tagged message queue.
///
/// Messages submitted while an outlist frame is pushed are captured into
/// that frame instead of reaching the sink ("main channels"). Frames nest up
/// to [`MAX_OUTLIST_STACK`] deep and must be popped innermost-first.
pub struct MessageBus {
    state: Mutex<BusState>,
    idle_cond: Condvar,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                stack: Vec::new(),
                next_handle: 1,
                problem_status: None,
                pardon: Severity::Debug,
                sieve: None,
                watcher_idle: true,
                sink: None,
            }),
            idle_cond: Condvar::new(),
        }
    }

    /// Replaces the terminal sink for messages that no outlist captures.
    /// The default sink prints result lines to stdout and everything else
    /// to stderr.
    pub fn set_sink(&self, sink: Box<dyn FnMut(&Message) + Send>) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    /// Submits a message: sieve inspection, problem-status accounting, then
    /// capture by the top outlist or delivery to the sink.
    pub fn submit(&self, msg: Message) {
        let mut st = self.state.lock().unwrap();
        if let Some(sieve) = st.sieve.as_mut() {
            sieve.inspect(&msg);
        }
        if msg.severity > st.pardon {
            match st.problem_status {
                Some(prev) if prev >= msg.severity => {}
                _ => st.problem_status = Some(msg.severity),
            }
        }
        if let Some(top) = st.stack.last_mut() {
            match msg.channel {
                Channel::Result => top.result.push(msg),
                Channel::Info | Channel::Mark => top.info.push(msg),
            }
            st.watcher_idle = false;
            return;
        }
        match st.sink.as_mut() {
            Some(sink) => sink(&msg),
            None => {
                let line = format!("{} : {}", msg.severity, msg.text);
                match msg.channel {
                    Channel::Result => println!("{line}"),
                    Channel::Info | Channel::Mark => eprintln!("{line}"),
                }
            }
        }
    }

    /// Convenience submission of a text message.
    pub fn submit_text(
        &self,
        error_code: u32,
        severity: Severity,
        channel: Channel,
        text: impl Into<String>,
    ) {
        self.submit(Message::new(error_code, severity, channel, text));
    }

    /// Starts capturing subsequent messages. Returns the frame handle.
    pub fn push_outlists(&self) -> Result<u32, MsgError> {
        let mut st = self.state.lock().unwrap();
        if st.stack.len() >= MAX_OUTLIST_STACK {
            return Err(MsgError::StackFull);
        }
        let handle = st.next_handle;
        st.next_handle += 1;
        st.stack.push(OutlistFrame {
            handle,
            result: Vec::new(),
            info: Vec::new(),
        });
        Ok(handle)
    }

    /// Ends capturing for `handle` and returns the captured
    /// `(result, info)` lists. The frame must be on top of the stack.
    pub fn pop_outlists(&self, handle: u32) -> Result<(Vec<Message>, Vec<Message>), MsgError> {
        let mut st = self.state.lock().unwrap();
        match st.stack.last() {
            None => Err(MsgError::BadHandle(handle)),
            Some(top) if top.handle != handle => {
                if st.stack.iter().any(|f| f.handle == handle) {
                    Err(MsgError::NotOnTop(handle))
                } else {
                    Err(MsgError::BadHandle(handle))
                }
            }
            Some(_) => {
                let frame = st.stack.pop().unwrap();
                Ok((frame.result, frame.info))
            }
        }
    }

    /// Drains the messages captured so far without ending the redirection.
    pub fn fetch_outlists(&self, handle: u32) -> Result<(Vec<Message>, Vec<Message>), MsgError> {
        let mut st = self.state.lock().unwrap();
        let frame = st
            .stack
            .iter_mut()
            .find(|f| f.handle == handle)
            .ok_or(MsgError::BadHandle(handle))?;
        let out = (
            std::mem::take(&mut frame.result),
            std::mem::take(&mut frame.info),
        );
        let empty = st.stack.iter().all(|f| f.result.is_empty() && f.info.is_empty());
        if empty {
            st.watcher_idle = true;
            self.idle_cond.notify_all();
        }
        Ok(out)
    }

    /// Reports whether messages are pending in the frame. With a timeout,
    /// blocks until the watcher confirms it has no backlog or the timeout
    /// elapses; returns `true` while messages remain pending.
    pub fn peek_outlists(&self, handle: u32, timeout: Option<Duration>) -> Result<bool, MsgError> {
        let mut st = self.state.lock().unwrap();
        if !st.stack.iter().any(|f| f.handle == handle) {
            return Err(MsgError::BadHandle(handle));
        }
        let pending = |st: &BusState| {
            st.stack
                .iter()
                .find(|f| f.handle == handle)
                .map(|f| !f.result.is_empty() || !f.info.is_empty())
                .unwrap_or(false)
        };
        match timeout {
            None => Ok(pending(&st)),
            Some(dur) => {
                let deadline = std::time::Instant::now() + dur;
                while pending(&st) || !st.watcher_idle {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Ok(pending(&st));
                    }
                    let (guard, _) = self
                        .idle_cond
                        .wait_timeout(st, deadline - now)
                        .unwrap();
                    st = guard;
                    if !st.stack.iter().any(|f| f.handle == handle) {
                        return Err(MsgError::BadHandle(handle));
                    }
                }
                Ok(false)
            }
        }
    }

    /// Highest severity observed since the last reset, ignoring severities
    /// at or below the pardon threshold.
    pub fn problem_status(&self) -> Option<Severity> {
        self.state.lock().unwrap().problem_status
    }

    pub fn reset_problem_status(&self) -> Option<Severity> {
        self.state.lock().unwrap().problem_status.take()
    }

    /// Severities at or below `pardon` no longer raise the problem status.
    pub fn set_pardon(&self, pardon: Severity) {
        self.state.lock().unwrap().pardon = pardon;
    }

    /// Whether an operation may still run under the given abort threshold.
    pub fn is_below(&self, threshold: Severity) -> bool {
        match self.problem_status() {
            None => true,
            Some(sev) => sev < threshold,
        }
    }

    /// Exit-style return code derived from the problem-status register:
    /// below SORRY → 0, SORRY/MISHAP → 1, FAILURE → 2, FATAL/ABORT → 3.
    pub fn exit_value(&self) -> i32 {
        match self.problem_status() {
            None => 0,
            Some(sev) if sev < Severity::Sorry => 0,
            Some(Severity::Sorry) | Some(Severity::Mishap) => 1,
            Some(Severity::Failure) => 2,
            _ => 3,
        }
    }

    /// Installs a sieve. Replaces any previously installed rules.
    pub fn install_sieve(&self, sieve: Sieve) {
        self.state.lock().unwrap().sieve = Some(sieve);
    }

    /// Adds one rule to the installed sieve, installing an empty sieve
    /// first if none is active.
    pub fn sieve_add_rule(&self, rule: SieveRule) {
        let mut st = self.state.lock().unwrap();
        st.sieve.get_or_insert_with(Sieve::new).add_rule(rule);
    }

    /// Takes all recorded result tuples of the named rule.
    pub fn sieve_take_results(&self, name: &str) -> Option<Vec<Vec<String>>> {
        let mut st = self.state.lock().unwrap();
        st.sieve.as_mut().and_then(|s| s.take_results(name))
    }

    /// Drops recorded results, keeps the rules.
    pub fn sieve_clear_results(&self) {
        if let Some(sieve) = self.state.lock().unwrap().sieve.as_mut() {
            sieve.clear_results();
        }
    }

    /// Removes the sieve entirely. This is the state at startup.
    pub fn sieve_dispose(&self) {
        self.state.lock().unwrap().sieve = None;
    }

    pub(crate) fn mark_watcher_busy(&self) {
        self.state.lock().unwrap().watcher_idle = false;
    }

    pub(crate) fn mark_watcher_idle(&self) {
        let mut st = self.state.lock().unwrap();
        st.watcher_idle = true;
        self.idle_cond.notify_all();
    }
}

/// Installs the sieve rules for the library's own report lines, so callers
/// can query session tables and media state without parsing text themselves.
pub fn standard_sieve() -> Sieve {
    let mut sieve = Sieve::new();
    sieve.add_rule(SieveRule::new(
        "ISO session  :",
        ChannelMask::RESULT,
        "ISO session  :",
        " \t",
        &[0, 1, 2, 3],
        10000,
    ));
    sieve.add_rule(SieveRule::new(
        "Media status :",
        ChannelMask::RESULT,
        "Media status :",
        " \t",
        &[0],
        2,
    ));
    sieve.add_rule(SieveRule::new(
        "Media nwa    :",
        ChannelMask::RESULT,
        "Media nwa    :",
        " \t",
        &[0],
        1,
    ));
    sieve.add_rule(SieveRule::new(
        "Image size   :",
        ChannelMask::RESULT,
        "Image size   :",
        " \t",
        &[0],
        1,
    ));
    sieve
}

/// Used by `VecDeque`-backed result queues in the sieve.
pub(crate) fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    if cap != 0 && queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(item);
}
