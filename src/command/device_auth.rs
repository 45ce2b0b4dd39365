//! Device-authorization commands (RFC 8628)
//!
//! The device code is the aggregate id. User codes are claimed in the
//! unique-constraint side table for the lifetime of the grant; a collision
//! regenerates the code a bounded number of times before surfacing as
//! transient.

use chrono::Utc;
use serde_json::json;

use crate::aggregate::device_auth::{
    self, DecisionPayload, DeviceAuthAddedPayload, DeviceAuthState, PolledPayload,
};
use crate::aggregate::{DeviceAuthWriteModel, WriteModel};
use crate::domain::Context;
use crate::error::{AppError, AppResult};
use crate::event_store::{EventStoreError, Push, UniqueConstraintOp};
use crate::oauth::codes;

use super::{CommandResult, Commands, Decision, EventDraft};

/// Attempts at generating a collision-free user code
const USER_CODE_ATTEMPTS: u32 = 3;

/// Result of opening a device authorization; mirrors the RFC 8628 response
#[derive(Debug, Clone)]
pub struct AddedDeviceAuth {
    pub result: CommandResult,
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: i64,
}

/// Outcome of a token-endpoint poll for a device grant
#[derive(Debug, Clone)]
pub enum DevicePoll {
    /// Still waiting for the user; the poll was recorded
    Pending,
    /// Polling faster than the advertised interval
    SlowDown,
    /// The user denied the grant
    Denied,
    /// The grant expired before a decision
    Expired,
    /// The device code was already redeemed
    AlreadyRedeemed,
    /// Approved; issue tokens, then mark completed
    Approved(DeviceAuthWriteModel),
}

impl Commands {
    pub async fn add_device_auth(
        &self,
        ctx: &Context,
        client_id: &str,
        scope: Vec<String>,
        verification_uri: Option<String>,
    ) -> AppResult<AddedDeviceAuth> {
        if client_id.trim().is_empty() {
            return Err(AppError::InvalidInput("client_id must not be empty".to_string()));
        }
        let app = self
            .app_by_client_id(ctx, client_id)
            .await
            .map_err(|_| AppError::InvalidInput("unknown client".to_string()))?;
        if !app.is_active() {
            return Err(AppError::Precondition("client is not active".to_string()));
        }
        if !app.supports_grant(crate::oauth::GRANT_DEVICE_CODE) {
            return Err(AppError::PermissionDenied(
                "client is not allowed to use the device grant".to_string(),
            ));
        }

        let config = self.config();
        let verification_uri =
            verification_uri.unwrap_or_else(|| format!("{}/device", config.issuer));
        let expires_in = config.device_auth_lifetime.num_seconds();
        let interval = config.device_auth_interval_secs;
        let owner = app.resource_owner.clone();

        // The user code is claimed atomically with the add event; on a
        // collision a fresh code is tried.
        let mut attempt = 0;
        loop {
            let device_code = codes::generate_device_code();
            let user_code = codes::generate_user_code();
            let expires_at = Utc::now() + config.device_auth_lifetime;
            let payload = DeviceAuthAddedPayload {
                client_id: client_id.to_string(),
                scope: scope.clone(),
                user_code: user_code.clone(),
                verification_uri: verification_uri.clone(),
                verification_uri_complete: format!(
                    "{verification_uri}?user_code={user_code}"
                ),
                expires_at,
                interval_secs: interval,
            };

            let push = Push::new(
                &ctx.instance_id,
                vec![crate::event_store::PendingEvent::new(
                    device_auth::AGGREGATE_TYPE,
                    &device_code,
                    1,
                    device_auth::ADDED,
                    &payload,
                    &ctx.creator(),
                    &owner,
                )?],
            )
            .with_constraints(vec![UniqueConstraintOp::add(
                device_auth::USER_CODE_CONSTRAINT,
                &user_code,
            )]);

            ctx.check_deadline()?;
            match self.store().push(push).await {
                Ok(stored) => {
                    let last = stored
                        .last()
                        .ok_or_else(|| AppError::Fatal("push returned no events".to_string()))?;
                    return Ok(AddedDeviceAuth {
                        result: CommandResult {
                            aggregate_id: device_code.clone(),
                            sequence: last.aggregate_version,
                            position: Some(last.position),
                        },
                        device_code,
                        user_code,
                        verification_uri: payload.verification_uri,
                        verification_uri_complete: payload.verification_uri_complete,
                        expires_in,
                        interval,
                    });
                }
                Err(EventStoreError::UniqueConstraintViolation { name, .. })
                    if name == device_auth::USER_CODE_CONSTRAINT
                        && attempt + 1 < USER_CODE_ATTEMPTS =>
                {
                    attempt += 1;
                    tracing::warn!(attempt = attempt, "User code collision, regenerating");
                }
                Err(EventStoreError::UniqueConstraintViolation { name, .. })
                    if name == device_auth::USER_CODE_CONSTRAINT =>
                {
                    return Err(AppError::Transient(
                        "could not generate a unique user code".to_string(),
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn approve_device_auth(
        &self,
        ctx: &Context,
        user_code: &str,
        user_id: &str,
    ) -> AppResult<CommandResult> {
        self.decide_device_auth(ctx, user_code, user_id, device_auth::APPROVED, false)
            .await
    }

    pub async fn deny_device_auth(
        &self,
        ctx: &Context,
        user_code: &str,
        user_id: &str,
    ) -> AppResult<CommandResult> {
        self.decide_device_auth(ctx, user_code, user_id, device_auth::DENIED, true)
            .await
    }

    async fn decide_device_auth(
        &self,
        ctx: &Context,
        user_code: &str,
        user_id: &str,
        event_type: &str,
        release_user_code: bool,
    ) -> AppResult<CommandResult> {
        match &ctx.user_id {
            Some(ctx_user) if ctx_user == user_id => {}
            Some(_) => return Err(AppError::PermissionDenied("user mismatch".to_string())),
            None => {
                return Err(AppError::PermissionDenied(
                    "authenticated user required".to_string(),
                ))
            }
        }

        let found = self.device_auth_by_user_code(ctx, user_code).await?;
        let device_code = found.id.clone();

        self.execute::<DeviceAuthWriteModel, _>(ctx, &device_code, |model| {
            let now = Utc::now();
            match model.state_at(now) {
                DeviceAuthState::Pending => {}
                DeviceAuthState::Expired => {
                    return Err(AppError::Precondition("device authorization expired".to_string()))
                }
                _ => {
                    return Err(AppError::Precondition(
                        "device authorization already decided".to_string(),
                    ))
                }
            }
            let mut decision = Decision::single(EventDraft::new(
                event_type,
                &DecisionPayload {
                    user_id: user_id.to_string(),
                    decided_at: now,
                },
                &model_owner(model),
            )?);
            if release_user_code {
                decision = decision.with_constraint(UniqueConstraintOp::remove(
                    device_auth::USER_CODE_CONSTRAINT,
                    &model.user_code,
                ));
            }
            Ok(decision)
        })
        .await
    }

    /// Cancel a pending grant from the device side
    pub async fn cancel_device_auth(
        &self,
        ctx: &Context,
        device_code: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<DeviceAuthWriteModel, _>(ctx, device_code, |model| {
            if !model.exists() {
                return Err(AppError::NotFound("device authorization".to_string()));
            }
            if model.state_at(Utc::now()) != DeviceAuthState::Pending {
                return Err(AppError::Precondition(
                    "only a pending device authorization can be cancelled".to_string(),
                ));
            }
            Ok(Decision::single(EventDraft::new(
                device_auth::CANCELLED,
                &json!({}),
                &model_owner(model),
            )?)
            .with_constraint(UniqueConstraintOp::remove(
                device_auth::USER_CODE_CONSTRAINT,
                &model.user_code,
            )))
        })
        .await
    }

    /// Token-endpoint poll. Validates the client binding, reflects the
    /// current state, records pending polls, and lazily writes the expired
    /// event (releasing the user code) when a poll observes expiry.
    pub async fn poll_device_auth(
        &self,
        ctx: &Context,
        device_code: &str,
        client_id: &str,
    ) -> AppResult<DevicePoll> {
        let model: DeviceAuthWriteModel = self.load(ctx, device_code).await?;
        if !model.exists() {
            return Err(AppError::NotFound("device code".to_string()));
        }
        if model.client_id != client_id {
            return Err(AppError::PermissionDenied("client mismatch".to_string()));
        }

        let now = Utc::now();
        match model.state_at(now) {
            DeviceAuthState::Approved => Ok(DevicePoll::Approved(model)),
            DeviceAuthState::Denied => Ok(DevicePoll::Denied),
            DeviceAuthState::Cancelled => Ok(DevicePoll::Expired),
            DeviceAuthState::Completed => Ok(DevicePoll::AlreadyRedeemed),
            DeviceAuthState::Expired => {
                // Write the terminal event once so the user code is released
                if model.state == DeviceAuthState::Pending {
                    self.execute::<DeviceAuthWriteModel, _>(ctx, device_code, |model| {
                        if model.state != DeviceAuthState::Pending {
                            return Ok(Decision::noop());
                        }
                        Ok(Decision::single(EventDraft::new(
                            device_auth::EXPIRED,
                            &json!({}),
                            &model_owner(model),
                        )?)
                        .with_constraint(UniqueConstraintOp::remove(
                            device_auth::USER_CODE_CONSTRAINT,
                            &model.user_code,
                        )))
                    })
                    .await?;
                }
                Ok(DevicePoll::Expired)
            }
            DeviceAuthState::Pending => {
                if model.polling_too_fast(now) {
                    return Ok(DevicePoll::SlowDown);
                }
                self.execute::<DeviceAuthWriteModel, _>(ctx, device_code, |model| {
                    Ok(Decision::single(EventDraft::new(
                        device_auth::POLLED,
                        &PolledPayload { polled_at: now },
                        &model_owner(model),
                    )?))
                })
                .await?;
                Ok(DevicePoll::Pending)
            }
            DeviceAuthState::Unspecified => Err(AppError::NotFound("device code".to_string())),
        }
    }

    /// Mark an approved grant redeemed after tokens were issued; releases
    /// the user code.
    pub async fn complete_device_auth(
        &self,
        ctx: &Context,
        device_code: &str,
    ) -> AppResult<CommandResult> {
        self.execute::<DeviceAuthWriteModel, _>(ctx, device_code, |model| {
            if model.state != DeviceAuthState::Approved {
                return Err(AppError::Precondition(
                    "device authorization is not approved".to_string(),
                ));
            }
            Ok(Decision::single(EventDraft::new(
                device_auth::COMPLETED,
                &json!({}),
                &model_owner(model),
            )?)
            .with_constraint(UniqueConstraintOp::remove(
                device_auth::USER_CODE_CONSTRAINT,
                &model.user_code,
            )))
        })
        .await
    }
}

fn model_owner(model: &DeviceAuthWriteModel) -> String {
    model.resource_owner.clone()
}
