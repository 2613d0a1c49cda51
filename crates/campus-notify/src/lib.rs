//! Out-of-app delivery of durable notifications (email, SMS, WhatsApp).
//!
//! Events are written by the fan-out engine for recipients with no live
//! connection; the worker here drains them through one provider per channel.

pub mod error;
pub mod provider;
pub mod worker;

pub use error::ProviderError;
pub use provider::{DeliveryProvider, DeliveryRequest, Providers, WebhookProvider};
pub use worker::{DeliveryWorker, WorkerPass};
