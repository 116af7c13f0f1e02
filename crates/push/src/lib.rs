//! Push delivery subsystem.
//!
//! Takes device records + a message, chunks tokens to the provider's batch
//! limit, classifies per-token failures (retryable vs permanently invalid),
//! retries transient failures through its own Redis-backed backoff queue, and
//! reports invalid tokens back to the device directory for cleanup.

pub mod directory;
pub mod dispatch;
pub mod message;
pub mod provider;

pub use directory::{DeviceDirectory, DeviceRecord, PgDeviceDirectory};
pub use dispatch::{DispatchReport, PushConfig, PushDispatcher};
pub use message::PushMessage;
pub use provider::{HttpPushProvider, NoopPushProvider, PushProvider, TokenOutcome, TokenStatus};
