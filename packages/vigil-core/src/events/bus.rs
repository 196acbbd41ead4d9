//! Event bus abstraction for decoupling supervisors from transport.
//!
//! Supervisors depend on the [`EventBus`] trait rather than a concrete
//! delivery mechanism, enabling testing and alternative transports.

use super::ChannelEvent;

/// Trait for publishing channel events without knowledge of transport.
///
/// Supervisors use this trait to publish events, decoupling them from how
/// events reach consumers (detector queue, IPC bridge, test recorder, etc.).
///
/// # Example
///
/// ```ignore
/// struct MyConsumer {
///     bus: Arc<dyn EventBus>,
/// }
///
/// impl MyConsumer {
///     fn on_fault(&self) {
///         self.bus.emit("mic-0", ChannelEvent::Stderr { line: "...".into() });
///     }
/// }
/// ```
pub trait EventBus: Send + Sync {
    /// Publishes one event for the named channel.
    fn emit(&self, channel: &str, event: ChannelEvent);
}

/// No-op bus for tests or embedded use.
///
/// Events are silently discarded. Useful when a caller only consumes the
/// framed unit stream and has no interest in lifecycle events.
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn emit(&self, _channel: &str, _event: ChannelEvent) {
        // No-op
    }
}

/// Logging bus for debugging and headless deployments.
///
/// Logs every event at debug level, with data payloads reduced to their size.
pub struct LoggingEventBus;

impl EventBus for LoggingEventBus {
    fn emit(&self, channel: &str, event: ChannelEvent) {
        match &event {
            ChannelEvent::Data { unit } => {
                tracing::trace!(channel, bytes = unit.len(), "channel_data");
            }
            other => {
                tracing::debug!(channel, event = other.name(), ?other, "channel_event");
            }
        }
    }
}
