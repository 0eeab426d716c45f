//! Channel boundary — where frames leave for, and arrive from, the chat system.
//!
//! The transport never touches the chat system itself. It hands each sealed
//! frame to a `ChannelAdapter`; the host feeds every received chat line back
//! through `Transport::on_receive`.

use std::fmt;
use std::sync::Mutex;

use chatwire_core::Direction;

/// Identity of a chat user (the host's platform id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a frame is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    /// The implicit peer of a client: the server it is connected to.
    Local,
    /// One specific client (server role).
    Peer(PeerId),
    /// Every connected client (server role).
    Broadcast,
}

/// Physically emits one frame-sized chat message.
///
/// Implementations must send `frame` as-is: no splitting, trimming, or
/// re-encoding. Ordering across calls is not relied on.
pub trait ChannelAdapter: Send + Sync {
    fn send(&self, direction: Direction, frame: &str, target: SendTarget);
}

impl<F> ChannelAdapter for F
where
    F: Fn(Direction, &str, SendTarget) + Send + Sync,
{
    fn send(&self, direction: Direction, frame: &str, target: SendTarget) {
        self(direction, frame, target)
    }
}

/// A frame captured by `RecordingChannel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub direction: Direction,
    pub target: SendTarget,
    pub text: String,
}

/// Adapter that queues frames in memory instead of sending them.
///
/// Hosts that must emit chat lines from their own update loop drain it once
/// per tick; tests use it to wire two transports together.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentFrame>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&self) -> Vec<SentFrame> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SentFrame>> {
        // A panic while holding the lock cannot leave a Vec half-pushed.
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChannelAdapter for RecordingChannel {
    fn send(&self, direction: Direction, frame: &str, target: SendTarget) {
        self.lock().push(SentFrame {
            direction,
            target,
            text: frame.to_string(),
        });
    }
}
