//! Write models
//!
//! Per-aggregate state folded from events, built on demand to validate the
//! next command and discarded afterwards. Folds are pure; event types a
//! model does not know are skipped, so old binaries tolerate new events.

pub mod application;
pub mod auth_request;
pub mod device_auth;
pub mod idp;
pub mod instance;
pub mod org;
pub mod project;
pub mod token;
pub mod user;

pub use application::AppWriteModel;
pub use auth_request::AuthRequestWriteModel;
pub use device_auth::DeviceAuthWriteModel;
pub use idp::IdpWriteModel;
pub use instance::InstanceWriteModel;
pub use org::OrgWriteModel;
pub use project::ProjectWriteModel;
pub use token::TokenWriteModel;
pub use user::UserWriteModel;

use crate::event_store::StoredEvent;

/// A transient fold of one aggregate's events
pub trait WriteModel: Default {
    /// Aggregate type this model folds (`user`, `org`, ...)
    const AGGREGATE_TYPE: &'static str;

    /// Version of the last applied event, 0 for a fresh model
    fn version(&self) -> i64;

    /// Apply a single event. Implementations record the event's
    /// `aggregate_version` as their own.
    fn apply(&mut self, event: &StoredEvent);

    /// Fold a slice of events in order
    fn fold<'a>(events: impl IntoIterator<Item = &'a StoredEvent>) -> Self {
        let mut model = Self::default();
        for event in events {
            model.apply(event);
        }
        model
    }

    /// Whether any event has been applied
    fn exists(&self) -> bool {
        self.version() > 0
    }
}
