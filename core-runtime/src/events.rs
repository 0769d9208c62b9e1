//! # Event Bus System
//!
//! Broadcasts engine lifecycle events using `tokio::sync::broadcast` so hosts
//! (UI, analytics, tests) can follow what the delivery engine is doing without
//! polling it.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: `CoreEvent` wrapping token, playback and transport events
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐
//! │ Token Client ├────────────>│           │
//! └──────────────┘             │           │    subscribe   ┌────────────┐
//!                              │ EventBus  ├───────────────>│ Subscriber │
//! ┌──────────────┐    emit     │ (broadcast│                └────────────┘
//! │    Engine    ├────────────>│  channel) │
//! └──────────────┘             └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Playback(PlaybackEvent::Loading {
//!         track_id: "42".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Playback(_)));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Non-fatal; the subscriber continues with newer events.
//! - **`RecvError::Closed`**: All senders have been dropped.
//!
//! Emitting with no subscribers returns an error; the engine ignores it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Access grant events
    Token(TokenEvent),
    /// Session and buffering events
    Playback(PlaybackEvent),
    /// Delivery tier selection events
    Transport(TransportEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Token(e) => e.description(),
            CoreEvent::Playback(e) => e.description(),
            CoreEvent::Transport(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Playback(PlaybackEvent::Error {
                recoverable: false, ..
            })
            | CoreEvent::Transport(TransportEvent::Exhausted { .. }) => EventSeverity::Error,
            CoreEvent::Token(TokenEvent::Failed { .. })
            | CoreEvent::Playback(PlaybackEvent::Error { .. })
            | CoreEvent::Transport(TransportEvent::Downgraded { .. }) => EventSeverity::Warning,
            CoreEvent::Playback(PlaybackEvent::Ready { .. })
            | CoreEvent::Playback(PlaybackEvent::EndOfStream { .. })
            | CoreEvent::Transport(TransportEvent::Selected { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Track the event refers to, when there is one.
    pub fn track_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Token(e) => Some(e.track_id()),
            CoreEvent::Playback(e) => e.track_id(),
            CoreEvent::Transport(e) => Some(e.track_id()),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Token Events
// ============================================================================

/// Events emitted by the token client.
///
/// Never carries the credential itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TokenEvent {
    /// A grant was issued.
    Issued {
        track_id: String,
        /// Segment index for segment-scoped grants.
        segment: Option<u64>,
        /// Expiry (Unix epoch seconds) if the service supplied one.
        expires_at: Option<i64>,
    },
    /// A grant was rejected or found expired and is being re-issued.
    Refreshing {
        track_id: String,
        segment: Option<u64>,
    },
    /// The token endpoint could not produce a grant.
    Failed { track_id: String, message: String },
}

impl TokenEvent {
    fn description(&self) -> &str {
        match self {
            TokenEvent::Issued { .. } => "Access grant issued",
            TokenEvent::Refreshing { .. } => "Refreshing access grant",
            TokenEvent::Failed { .. } => "Access grant request failed",
        }
    }

    fn track_id(&self) -> &str {
        match self {
            TokenEvent::Issued { track_id, .. }
            | TokenEvent::Refreshing { track_id, .. }
            | TokenEvent::Failed { track_id, .. } => track_id,
        }
    }
}

// ============================================================================
// Playback Events
// ============================================================================

/// Session lifecycle and buffering events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaybackEvent {
    /// A track load started.
    Loading { track_id: String },
    /// The initial window is buffered and the sink can play.
    Ready {
        track_id: String,
        /// Delivery tier name.
        tier: String,
        /// Estimated duration (milliseconds).
        duration_ms: u64,
    },
    /// Buffering progress.
    Progress {
        track_id: String,
        loaded_segments: u64,
        total_segments: u64,
        /// Progress percentage (0-100).
        percent: u8,
    },
    /// A seek landed on unbuffered data and is waiting for its window.
    SeekPending {
        track_id: String,
        position_ms: u64,
        segment: u64,
    },
    /// The sink playhead was moved.
    SeekCompleted { track_id: String, position_ms: u64 },
    /// Every segment was delivered and end-of-stream signalled.
    EndOfStream { track_id: String },
    /// The session was torn down.
    Stopped { track_id: Option<String> },
    /// Playback error occurred.
    Error {
        track_id: Option<String>,
        message: String,
        /// `true` when the engine is recovering on a lower tier.
        recoverable: bool,
    },
}

impl PlaybackEvent {
    fn description(&self) -> &str {
        match self {
            PlaybackEvent::Loading { .. } => "Track loading",
            PlaybackEvent::Ready { .. } => "Playback ready",
            PlaybackEvent::Progress { .. } => "Buffering progress",
            PlaybackEvent::SeekPending { .. } => "Seek waiting for data",
            PlaybackEvent::SeekCompleted { .. } => "Seek completed",
            PlaybackEvent::EndOfStream { .. } => "End of stream",
            PlaybackEvent::Stopped { .. } => "Playback stopped",
            PlaybackEvent::Error { .. } => "Playback error",
        }
    }

    fn track_id(&self) -> Option<&str> {
        match self {
            PlaybackEvent::Loading { track_id }
            | PlaybackEvent::Ready { track_id, .. }
            | PlaybackEvent::Progress { track_id, .. }
            | PlaybackEvent::SeekPending { track_id, .. }
            | PlaybackEvent::SeekCompleted { track_id, .. }
            | PlaybackEvent::EndOfStream { track_id } => Some(track_id),
            PlaybackEvent::Stopped { track_id } | PlaybackEvent::Error { track_id, .. } => {
                track_id.as_deref()
            }
        }
    }
}

// ============================================================================
// Transport Events
// ============================================================================

/// Delivery tier selection and fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TransportEvent {
    /// A tier was chosen and is starting.
    Selected { track_id: String, tier: String },
    /// A tier was passed over because the platform cannot support it.
    Skipped {
        track_id: String,
        tier: String,
        reason: String,
    },
    /// A running tier failed and the engine moved down.
    Downgraded {
        track_id: String,
        from: String,
        to: String,
        reason: String,
    },
    /// No tier is left.
    Exhausted { track_id: String },
}

impl TransportEvent {
    fn description(&self) -> &str {
        match self {
            TransportEvent::Selected { .. } => "Delivery tier selected",
            TransportEvent::Skipped { .. } => "Delivery tier skipped",
            TransportEvent::Downgraded { .. } => "Delivery tier downgraded",
            TransportEvent::Exhausted { .. } => "All delivery tiers failed",
        }
    }

    fn track_id(&self) -> &str {
        match self {
            TransportEvent::Selected { track_id, .. }
            | TransportEvent::Skipped { track_id, .. }
            | TransportEvent::Downgraded { track_id, .. }
            | TransportEvent::Exhausted { track_id } => track_id,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// `capacity` is the maximum number of events buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let transport_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Transport(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Only events for the given track.
    pub fn for_track(self, track_id: impl Into<String>) -> Self {
        let track_id = track_id.into();
        self.filter(move |event| event.track_id() == Some(track_id.as_str()))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(track: &str) -> CoreEvent {
        CoreEvent::Playback(PlaybackEvent::Ready {
            track_id: track.to_string(),
            tier: "adaptive-segmented".to_string(),
            duration_ms: 62_500,
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(ready("t1")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = CoreEvent::Transport(TransportEvent::Selected {
            track_id: "t1".to_string(),
            tier: "native-playlist".to_string(),
        });

        assert_eq!(bus.emit(event.clone()).unwrap(), 2);
        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Transport(_)));

        bus.emit(ready("t1")).ok();
        let downgrade = CoreEvent::Transport(TransportEvent::Downgraded {
            track_id: "t1".to_string(),
            from: "adaptive-segmented".to_string(),
            to: "native-playlist".to_string(),
            reason: "append rejected".to_string(),
        });
        bus.emit(downgrade.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), downgrade);
    }

    #[tokio::test]
    async fn test_event_stream_for_track() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe()).for_track("t2");

        bus.emit(ready("t1")).ok();
        bus.emit(ready("t2")).ok();

        assert_eq!(stream.recv().await.unwrap(), ready("t2"));
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5u64 {
            bus.emit(CoreEvent::Playback(PlaybackEvent::Progress {
                track_id: "t1".to_string(),
                loaded_segments: i,
                total_segments: 16,
                percent: (i * 6) as u8,
            }))
            .ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let terminal = CoreEvent::Playback(PlaybackEvent::Error {
            track_id: Some("t1".to_string()),
            message: "all tiers failed".to_string(),
            recoverable: false,
        });
        assert_eq!(terminal.severity(), EventSeverity::Error);

        let recovering = CoreEvent::Playback(PlaybackEvent::Error {
            track_id: Some("t1".to_string()),
            message: "decode fault".to_string(),
            recoverable: true,
        });
        assert_eq!(recovering.severity(), EventSeverity::Warning);

        assert_eq!(ready("t1").severity(), EventSeverity::Info);

        let progress = CoreEvent::Token(TokenEvent::Issued {
            track_id: "t1".to_string(),
            segment: Some(3),
            expires_at: None,
        });
        assert_eq!(progress.severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_description_and_track() {
        let event = CoreEvent::Transport(TransportEvent::Exhausted {
            track_id: "t9".to_string(),
        });
        assert_eq!(event.description(), "All delivery tiers failed");
        assert_eq!(event.track_id(), Some("t9"));

        let stopped = CoreEvent::Playback(PlaybackEvent::Stopped { track_id: None });
        assert_eq!(stopped.track_id(), None);
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let handle1 = tokio::spawn(async move {
            for i in 0..10u64 {
                bus1.emit(CoreEvent::Token(TokenEvent::Issued {
                    track_id: "t1".to_string(),
                    segment: Some(i),
                    expires_at: Some(1_700_000_000),
                }))
                .ok();
            }
        });

        let handle2 = tokio::spawn(async move {
            for i in 0..10u64 {
                bus2.emit(CoreEvent::Playback(PlaybackEvent::Progress {
                    track_id: "t1".to_string(),
                    loaded_segments: i,
                    total_segments: 10,
                    percent: (i * 10) as u8,
                }))
                .ok();
            }
        });

        handle1.await.ok();
        handle2.await.ok();

        let mut count = 0;
        while sub.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Playback(PlaybackEvent::SeekPending {
            track_id: "t1".to_string(),
            position_ms: 90_000,
            segment: 21,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Playback\""));
        assert!(json.contains("SeekPending"));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }
}
