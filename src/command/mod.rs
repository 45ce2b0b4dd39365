//! Command layer
//!
//! One method per command. Every command loads the target aggregate's events,
//! folds them into a write model, validates against it, and appends the new
//! events in a single push together with any unique-constraint changes.
//! Optimistic-concurrency conflicts are retried a bounded number of times
//! with a fresh reload before being surfaced.

mod application;
mod auth_request;
mod device_auth;
mod idp;
mod instance;
mod org;
mod project;
mod token;
mod user;

pub use application::{AddOidcApp, AddedOidcApp, UpdateOidcApp};
pub use auth_request::{AddAuthRequest, FactorCheck, SucceededAuthRequest};
pub use device_auth::{AddedDeviceAuth, DevicePoll};
pub use idp::{AddIdpData, IdpOwner};
pub use instance::SetupInstance;
pub use token::{AddToken, IssuedToken};
pub use user::AddHumanUser;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::org::LoginPolicy;
use crate::aggregate::{application as application_agg, device_auth as device_auth_agg};
use crate::aggregate::{AppWriteModel, DeviceAuthWriteModel, WriteModel};
use crate::config::Config;
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::event_store::{
    EventFilter, EventPosition, EventStore, EventStoreError, PendingEvent, Push,
    UniqueConstraintOp,
};

/// Bounded retries on optimistic-concurrency conflicts
const MAX_RETRIES: u32 = 3;

/// Password verification seam; the hash algorithm itself is a deployment
/// choice, not part of this engine.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> String;
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// sha256-based hasher used by the default wiring and tests
pub struct Sha256PasswordHasher;

impl PasswordHasher for Sha256PasswordHasher {
    fn hash(&self, password: &str) -> String {
        crate::oauth::codes::hash_secret(password)
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        self.hash(password) == hash
    }
}

/// Second-factor verification seam
pub trait OtpVerifier: Send + Sync {
    fn verify(&self, secret: &str, code: &str, now: DateTime<Utc>) -> bool;
}

/// Accepts the exact shared secret as the code; stands in for a real TOTP
/// implementation, which is a deployment choice.
pub struct ExactMatchOtpVerifier;

impl OtpVerifier for ExactMatchOtpVerifier {
    fn verify(&self, secret: &str, code: &str, _now: DateTime<Utc>) -> bool {
        !secret.is_empty() && secret == code
    }
}

/// Tunables shared by all commands
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub issuer: String,
    pub auth_code_lifetime: chrono::Duration,
    pub access_token_lifetime: chrono::Duration,
    pub refresh_token_lifetime: chrono::Duration,
    pub device_auth_lifetime: chrono::Duration,
    pub device_auth_interval_secs: i64,
    pub default_login_policy: LoginPolicy,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:3000".to_string(),
            auth_code_lifetime: chrono::Duration::seconds(300),
            access_token_lifetime: chrono::Duration::seconds(3600),
            refresh_token_lifetime: chrono::Duration::days(30),
            device_auth_lifetime: chrono::Duration::seconds(600),
            device_auth_interval_secs: 5,
            default_login_policy: LoginPolicy::default(),
        }
    }
}

impl From<&Config> for CommandConfig {
    fn from(config: &Config) -> Self {
        Self {
            issuer: config.issuer.clone(),
            auth_code_lifetime: chrono::Duration::seconds(config.auth_code_lifetime_secs),
            access_token_lifetime: chrono::Duration::seconds(config.access_token_lifetime_secs),
            refresh_token_lifetime: chrono::Duration::days(30),
            device_auth_lifetime: chrono::Duration::seconds(config.device_auth_lifetime_secs),
            device_auth_interval_secs: config.device_auth_interval_secs,
            default_login_policy: LoginPolicy {
                require_mfa: config.default_require_mfa,
            },
        }
    }
}

/// Outcome of a successful command
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub aggregate_id: String,
    /// Version of the last event written; unchanged for no-op commands
    pub sequence: i64,
    /// Commit position; `None` when nothing was written
    pub position: Option<EventPosition>,
}

/// Event produced by a command handler, before versions are assigned
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub owner: String,
}

impl EventDraft {
    pub fn new<P: Serialize>(event_type: &str, payload: &P, owner: &str) -> AppResult<Self> {
        Ok(Self {
            event_type: event_type.to_string(),
            payload: serde_json::to_value(payload)?,
            owner: owner.to_string(),
        })
    }
}

/// What a handler decided to write
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub events: Vec<EventDraft>,
    pub constraints: Vec<UniqueConstraintOp>,
}

impl Decision {
    /// A decision that writes nothing; the command succeeds without events
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn single(event: EventDraft) -> Self {
        Self {
            events: vec![event],
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: UniqueConstraintOp) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn and(mut self, event: EventDraft) -> Self {
        self.events.push(event);
        self
    }
}

/// The command dispatcher
#[derive(Clone)]
pub struct Commands {
    store: Arc<dyn EventStore>,
    config: Arc<CommandConfig>,
    password_hasher: Arc<dyn PasswordHasher>,
    otp_verifier: Arc<dyn OtpVerifier>,
}

impl Commands {
    pub fn new(store: Arc<dyn EventStore>, config: CommandConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            password_hasher: Arc::new(Sha256PasswordHasher),
            otp_verifier: Arc::new(ExactMatchOtpVerifier),
        }
    }

    pub fn with_password_hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.password_hasher = hasher;
        self
    }

    pub fn with_otp_verifier(mut self, verifier: Arc<dyn OtpVerifier>) -> Self {
        self.otp_verifier = verifier;
        self
    }

    pub(crate) fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub(crate) fn config(&self) -> &CommandConfig {
        &self.config
    }

    pub(crate) fn password_hasher(&self) -> &dyn PasswordHasher {
        self.password_hasher.as_ref()
    }

    pub(crate) fn otp_verifier(&self) -> &dyn OtpVerifier {
        self.otp_verifier.as_ref()
    }

    /// Load an aggregate's write model by replaying its events
    pub(crate) async fn load<M: WriteModel>(
        &self,
        ctx: &Context,
        aggregate_id: &str,
    ) -> AppResult<M> {
        ctx.check_deadline()?;
        let events = self
            .store
            .filter(&EventFilter::aggregate(
                &ctx.instance_id,
                M::AGGREGATE_TYPE,
                aggregate_id,
            ))
            .await?;
        Ok(M::fold(&events))
    }

    /// Core pipeline: load, decide, push with intended versions; retry with
    /// a fresh reload on concurrency conflicts, bounded.
    pub(crate) async fn execute<M, F>(
        &self,
        ctx: &Context,
        aggregate_id: &str,
        decide: F,
    ) -> AppResult<CommandResult>
    where
        M: WriteModel,
        F: Fn(&M) -> AppResult<Decision>,
    {
        let mut attempt = 0;
        loop {
            let model: M = self.load(ctx, aggregate_id).await?;
            let decision = decide(&model)?;

            if decision.events.is_empty() {
                return Ok(CommandResult {
                    aggregate_id: aggregate_id.to_string(),
                    sequence: model.version(),
                    position: None,
                });
            }

            let push = self.assemble(ctx, M::AGGREGATE_TYPE, aggregate_id, model.version(), decision);
            ctx.check_deadline()?;
            match self.store.push(push).await {
                Ok(stored) => {
                    let last = stored
                        .last()
                        .ok_or_else(|| AppError::Fatal("push returned no events".to_string()))?;
                    return Ok(CommandResult {
                        aggregate_id: aggregate_id.to_string(),
                        sequence: last.aggregate_version,
                        position: Some(last.position),
                    });
                }
                Err(err @ EventStoreError::OptimisticConcurrency { .. })
                    if attempt + 1 < MAX_RETRIES =>
                {
                    attempt += 1;
                    tracing::warn!(
                        aggregate_id = aggregate_id,
                        attempt = attempt,
                        "Concurrency conflict, retrying with fresh reload: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn assemble(
        &self,
        ctx: &Context,
        aggregate_type: &str,
        aggregate_id: &str,
        base_version: i64,
        decision: Decision,
    ) -> Push {
        let creator = ctx.creator();
        let events = decision
            .events
            .into_iter()
            .enumerate()
            .map(|(idx, draft)| PendingEvent {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
                aggregate_version: base_version + 1 + idx as i64,
                event_type: draft.event_type,
                payload: draft.payload,
                creator: creator.clone(),
                owner: draft.owner,
                revision: 1,
            })
            .collect();
        Push::new(&ctx.instance_id, events).with_constraints(decision.constraints)
    }

    /// Resolve an application by its OIDC client id.
    ///
    /// Client ids are unique per instance (side-table constraint), so the
    /// scan over `application.oidc.config.added` events yields at most one
    /// live aggregate; removed applications free their client id, so the
    /// newest matching aggregate wins.
    pub async fn app_by_client_id(
        &self,
        ctx: &Context,
        client_id: &str,
    ) -> AppResult<AppWriteModel> {
        ctx.check_deadline()?;
        let config_events = self
            .store
            .filter(
                &EventFilter::instance(&ctx.instance_id)
                    .with_aggregate_types(&[application_agg::AGGREGATE_TYPE])
                    .with_event_types(&[application_agg::OIDC_CONFIG_ADDED]),
            )
            .await?;

        for event in config_events.iter().rev() {
            if event.payload.get("client_id").and_then(|v| v.as_str()) == Some(client_id) {
                let model: AppWriteModel = self.load(ctx, &event.aggregate_id).await?;
                if model.state != application_agg::AppState::Removed {
                    return Ok(model);
                }
            }
        }
        Err(AppError::NotFound(format!("client {client_id}")))
    }

    /// Resolve a device authorization by its user code. Only grants added
    /// within the configured lifetime can still be pending, which bounds
    /// the scan.
    pub async fn device_auth_by_user_code(
        &self,
        ctx: &Context,
        user_code: &str,
    ) -> AppResult<DeviceAuthWriteModel> {
        ctx.check_deadline()?;
        let window_start = Utc::now() - self.config.device_auth_lifetime;
        let added_events = self
            .store
            .filter(
                &EventFilter::instance(&ctx.instance_id)
                    .with_aggregate_types(&[device_auth_agg::AGGREGATE_TYPE])
                    .with_event_types(&[device_auth_agg::ADDED])
                    .created_after(window_start),
            )
            .await?;

        for event in added_events.iter().rev() {
            if event.payload.get("user_code").and_then(|v| v.as_str()) == Some(user_code) {
                return self.load(ctx, &event.aggregate_id).await;
            }
        }
        Err(AppError::NotFound(format!("device authorization {user_code}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::UserWriteModel;
    use crate::event_store::MemoryEventStore;

    fn commands() -> Commands {
        Commands::new(Arc::new(MemoryEventStore::new()), CommandConfig::default())
    }

    #[tokio::test]
    async fn test_noop_decision_writes_nothing() {
        let commands = commands();
        let ctx = Context::new("inst-1");

        let result = commands
            .execute::<UserWriteModel, _>(&ctx, "u1", |_model| Ok(Decision::noop()))
            .await
            .unwrap();

        assert_eq!(result.sequence, 0);
        assert!(result.position.is_none());
        assert_eq!(
            commands
                .store()
                .latest_version("inst-1", "user", "u1")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_execute_assigns_contiguous_versions() {
        let commands = commands();
        let ctx = Context::new("inst-1").with_user("admin");

        let result = commands
            .execute::<UserWriteModel, _>(&ctx, "u1", |_model| {
                Ok(Decision::single(
                    EventDraft::new(
                        crate::aggregate::user::HUMAN_ADDED,
                        &serde_json::json!({"username": "alice", "email": "a@ex.com"}),
                        "org-1",
                    )
                    .unwrap(),
                )
                .and(
                    EventDraft::new(
                        crate::aggregate::user::DEACTIVATED,
                        &serde_json::json!({}),
                        "org-1",
                    )
                    .unwrap(),
                ))
            })
            .await
            .unwrap();

        assert_eq!(result.sequence, 2);
        assert!(result.position.is_some());
    }

    #[test]
    fn test_sha256_hasher_roundtrip() {
        let hasher = Sha256PasswordHasher;
        let hash = hasher.hash("hunter2");
        assert!(hasher.verify("hunter2", &hash));
        assert!(!hasher.verify("hunter3", &hash));
    }

    #[test]
    fn test_exact_match_otp() {
        let verifier = ExactMatchOtpVerifier;
        assert!(verifier.verify("123456", "123456", Utc::now()));
        assert!(!verifier.verify("123456", "000000", Utc::now()));
        assert!(!verifier.verify("", "", Utc::now()));
    }
}
