//! Subscription engine (H/I/J, §4.8/§4.9): durable subscription
//! definitions replicated through the cluster consensus log, one
//! connection per active worker pulling batches in ascending etag order,
//! and a supervisor enforcing each subscription's admission strategy.

mod connection;
mod error;
mod handler;
mod state;
mod store;
mod supervisor;

pub use connection::{SubscriptionBatch, SubscriptionConnection, SubscriptionItem};
pub use error::SubError;
pub use handler::SubscriptionHandler;
pub use state::{matches_query, SubscriptionOptions, SubscriptionState, SubscriptionStrategy};
pub use store::SubscriptionStore;
pub use supervisor::{RegistrationOutcome, SubscriptionSupervisor};
