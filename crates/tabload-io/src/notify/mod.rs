//! Failure notification delivery.
//!
//! Notifications are best-effort: they are retried on transient transport
//! errors but a failed delivery never fails the pipeline. The runner only
//! uses the delivery result to decide whether a file-notifiable error
//! counts as handled.

mod email;
mod webhook;

pub use email::EmailNotifier;
pub use webhook::{AlertLevel, WebhookNotifier};
