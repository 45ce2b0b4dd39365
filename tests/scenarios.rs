//! End-to-end scenarios over the in-memory event store
//!
//! Exercises the command layer, the auth/device state machines, the token
//! engine and the projection runtime the way a deployment wires them,
//! without a database.

use std::sync::Arc;

use castellan::aggregate::user::UserState;
use castellan::command::{AddHumanUser, AddOidcApp, Commands};
use castellan::event_store::{EventFilter, EventStore, MemoryEventStore};
use castellan::oauth::dpop::DpopValidator;
use castellan::oauth::grants::{GrantFailure, GrantHandler, RequestFacts, TokenRequest};
use castellan::oauth::tokens::TokenEngine;
use castellan::oauth::{OAuthErrorCode, GRANT_DEVICE_CODE};
use castellan::projection::{
    MemoryCheckpoints, MemoryUsersProjection, Projection, Projector, ProjectorConfig,
};
use castellan::{AppError, Context};

mod common;

use common::{admin_ctx, memory_commands};

struct World {
    commands: Commands,
    store: Arc<MemoryEventStore>,
    handler: GrantHandler,
    ctx: Context,
    org_id: String,
    project_id: String,
}

async fn world() -> World {
    let (commands, store) = memory_commands();
    let ctx = admin_ctx();
    let org_id = commands.add_org(&ctx, "acme", None).await.unwrap().aggregate_id;
    let project_id = commands
        .add_project(&ctx, &org_id, "crm")
        .await
        .unwrap()
        .aggregate_id;

    let engine = TokenEngine::new(commands.clone(), "https://iam.example.com", "signing-key");
    let handler = GrantHandler::new(commands.clone(), engine, Arc::new(DpopValidator::new()));

    World {
        commands,
        store,
        handler,
        ctx,
        org_id,
        project_id,
    }
}

async fn device_client(world: &World) -> String {
    let mut app = AddOidcApp::new(&world.project_id, "tv", vec!["https://tv/cb".to_string()]);
    app.grant_types.push(GRANT_DEVICE_CODE.to_string());
    world
        .commands
        .add_oidc_app(&world.ctx, app)
        .await
        .unwrap()
        .client_id
}

fn token_facts() -> RequestFacts {
    RequestFacts::post("https://iam.example.com/oauth/token")
}

// =========================================================================
// S1: user lifecycle
// =========================================================================

#[tokio::test]
async fn s1_user_lifecycle() {
    let world = world().await;
    let ctx = &world.ctx;

    let user_id = world
        .commands
        .add_human_user(
            ctx,
            AddHumanUser::new("alice", "alice@ex.com").with_org(&world.org_id),
        )
        .await
        .unwrap()
        .aggregate_id;

    world.commands.deactivate_user(ctx, &user_id).await.unwrap();
    world.commands.reactivate_user(ctx, &user_id).await.unwrap();
    world
        .commands
        .change_username(ctx, &user_id, "alice2")
        .await
        .unwrap();
    world.commands.remove_user(ctx, &user_id).await.unwrap();

    // Exact event-type sequence, versions 1..5
    let events = world
        .store
        .filter(&EventFilter::aggregate("inst-1", "user", &user_id))
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "user.human.added",
            "user.deactivated",
            "user.reactivated",
            "user.username.changed",
            "user.removed",
        ]
    );
    let versions: Vec<i64> = events.iter().map(|e| e.aggregate_version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    // After projection, the row reads removed with the final username
    let users = Arc::new(MemoryUsersProjection::new());
    let projector = Projector::new(
        world.store.clone(),
        Arc::new(MemoryCheckpoints::new()),
        vec![users.clone() as Arc<dyn Projection>],
        ProjectorConfig::default(),
    );
    projector.catch_up().await.unwrap();

    let row = users.get("inst-1", &user_id).await.unwrap();
    assert_eq!(row.username, "alice2");
    assert_eq!(row.state, UserState::Removed);

    // Any command on the removed user fails as deleted
    let err = world.commands.deactivate_user(ctx, &user_id).await.unwrap_err();
    assert!(matches!(err, AppError::Precondition(msg) if msg == "deleted"));
}

// =========================================================================
// S2/S3: device authorization
// =========================================================================

#[tokio::test]
async fn s2_device_authorization_happy_path() {
    let world = world().await;
    let client_id = device_client(&world).await;

    let added = world
        .commands
        .add_device_auth(
            &world.ctx,
            &client_id,
            vec!["openid".to_string(), "offline_access".to_string()],
            None,
        )
        .await
        .unwrap();
    assert_eq!(added.expires_in, 600);
    assert_eq!(added.interval, 5);

    let poll = TokenRequest {
        grant_type: GRANT_DEVICE_CODE.to_string(),
        device_code: Some(added.device_code.clone()),
        client_id: Some(client_id.clone()),
        ..Default::default()
    };

    // Pending before approval
    match world
        .handler
        .token(&world.ctx, poll.clone(), token_facts())
        .await
        .unwrap_err()
    {
        GrantFailure::Protocol(err) => assert_eq!(err.code, OAuthErrorCode::AuthorizationPending),
        other => panic!("unexpected failure: {other:?}"),
    }

    // The user approves with the user code
    let user_ctx = Context::new("inst-1").with_user("u-tv");
    world
        .commands
        .approve_device_auth(&user_ctx, &added.user_code, "u-tv")
        .await
        .unwrap();

    // Polling now yields the token set
    let response = world
        .handler
        .token(&world.ctx, poll, token_facts())
        .await
        .unwrap();
    assert_eq!(response.token_type, "Bearer");
    assert_eq!(response.expires_in, 3600);
    assert!(response.refresh_token.is_some());
    assert!(response.id_token.is_some());
}

#[tokio::test]
async fn s3_device_authorization_denial() {
    let world = world().await;
    let client_id = device_client(&world).await;

    let added = world
        .commands
        .add_device_auth(&world.ctx, &client_id, vec![], None)
        .await
        .unwrap();

    let user_ctx = Context::new("inst-1").with_user("u-tv");
    world
        .commands
        .deny_device_auth(&user_ctx, &added.user_code, "u-tv")
        .await
        .unwrap();

    let err = world
        .handler
        .token(
            &world.ctx,
            TokenRequest {
                grant_type: GRANT_DEVICE_CODE.to_string(),
                device_code: Some(added.device_code),
                client_id: Some(client_id),
                ..Default::default()
            },
            token_facts(),
        )
        .await
        .unwrap_err();
    match err {
        GrantFailure::Protocol(err) => assert_eq!(err.code, OAuthErrorCode::AccessDenied),
        other => panic!("unexpected failure: {other:?}"),
    }
}

// =========================================================================
// S4: redirect URI management
// =========================================================================

#[tokio::test]
async fn s4_redirect_uri_rules() {
    let world = world().await;
    let app = world
        .commands
        .add_oidc_app(
            &world.ctx,
            AddOidcApp::new(&world.project_id, "web", vec!["https://a/cb".to_string()]),
        )
        .await
        .unwrap();

    let err = world
        .commands
        .add_redirect_uri(&world.ctx, &app.app_id, "https://a/cb")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Precondition(msg) if msg == "already exists"));

    world
        .commands
        .add_redirect_uri(&world.ctx, &app.app_id, "https://a/cb2")
        .await
        .unwrap();
    world
        .commands
        .remove_redirect_uri(&world.ctx, &app.app_id, "https://a/cb2")
        .await
        .unwrap();

    let err = world
        .commands
        .remove_redirect_uri(&world.ctx, &app.app_id, "https://a/cb")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Precondition(msg) if msg == "cannot remove last redirect URI"));
}

// =========================================================================
// S5: cross-aggregate uniqueness under concurrency
// =========================================================================

#[tokio::test]
async fn s5_concurrent_username_claims() {
    let world = world().await;

    let first = world.commands.add_human_user(
        &world.ctx,
        AddHumanUser::new("bob", "bob1@ex.com").with_org(&world.org_id),
    );
    let second = world.commands.add_human_user(
        &world.ctx,
        AddHumanUser::new("bob", "bob2@ex.com").with_org(&world.org_id),
    );

    let (first, second) = tokio::join!(first, second);
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(
        outcomes.iter().filter(|ok| **ok).count(),
        1,
        "exactly one claim must win: {outcomes:?}"
    );
    let losing = if outcomes[0] { second } else { first };
    assert!(matches!(
        losing.unwrap_err(),
        AppError::UniqueConstraint { name, .. } if name == "user.username"
    ));
}

#[tokio::test]
async fn s5_concurrent_push_same_aggregate() {
    let world = world().await;
    let user_id = world
        .commands
        .add_human_user(
            &world.ctx,
            AddHumanUser::new("carol", "carol@ex.com").with_org(&world.org_id),
        )
        .await
        .unwrap()
        .aggregate_id;

    // Conflicting lifecycle transitions on the same aggregate: the retry
    // loop reloads, so one command succeeds and the other hits its
    // business rule instead of clobbering state.
    let deactivate = world.commands.deactivate_user(&world.ctx, &user_id);
    let remove = world.commands.remove_user(&world.ctx, &user_id);
    let (deactivate, remove) = tokio::join!(deactivate, remove);

    let versions_written = [&deactivate, &remove]
        .iter()
        .filter(|r| r.is_ok())
        .count();
    assert!(versions_written >= 1);

    let events = world
        .store
        .filter(&EventFilter::aggregate("inst-1", "user", &user_id))
        .await
        .unwrap();
    // Versions stay contiguous regardless of interleaving
    for (idx, event) in events.iter().enumerate() {
        assert_eq!(event.aggregate_version, idx as i64 + 1);
    }
}

// =========================================================================
// S6: token revocation and introspection
// =========================================================================

#[tokio::test]
async fn s6_token_revocation_and_introspection() {
    let world = world().await;
    let engine = world.handler.engine();

    let response = engine
        .issue(
            &world.ctx,
            "web",
            Some("u1"),
            &["openid".to_string(), "profile".to_string()],
            None,
        )
        .await
        .unwrap();

    let introspection = engine
        .introspect(&world.ctx, &response.access_token)
        .await
        .unwrap();
    assert!(introspection.active);
    assert_eq!(introspection.scope.as_deref(), Some("openid profile"));
    assert_eq!(introspection.sub.as_deref(), Some("u1"));
    assert!(introspection.aud.is_some());
    assert!(introspection.exp.is_some());
    assert!(introspection.iat.is_some());
    assert_eq!(introspection.iss.as_deref(), Some("https://iam.example.com"));

    engine
        .revoke(&world.ctx, &response.access_token, "admin")
        .await
        .unwrap();
    let introspection = engine
        .introspect(&world.ctx, &response.access_token)
        .await
        .unwrap();
    assert!(!introspection.active);
    assert!(introspection.scope.is_none());

    let err = engine
        .revoke(&world.ctx, &response.access_token, "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Precondition(msg) if msg == "token already revoked"));
}

// =========================================================================
// Universal invariants
// =========================================================================

#[tokio::test]
async fn positions_strictly_increase_per_instance() {
    let world = world().await;
    for i in 0..5 {
        world
            .commands
            .add_human_user(
                &world.ctx,
                AddHumanUser::new(&format!("user{i}"), &format!("u{i}@ex.com"))
                    .with_org(&world.org_id),
            )
            .await
            .unwrap();
    }

    let events = world
        .store
        .filter(&EventFilter::instance("inst-1"))
        .await
        .unwrap();
    assert!(events.len() >= 5);
    for pair in events.windows(2) {
        assert!(pair[0].position < pair[1].position, "positions must increase");
    }
}

#[tokio::test]
async fn replay_from_zero_matches_live_read_model() {
    let world = world().await;
    let ctx = &world.ctx;

    let user_id = world
        .commands
        .add_human_user(
            ctx,
            AddHumanUser::new("dave", "dave@ex.com").with_org(&world.org_id),
        )
        .await
        .unwrap()
        .aggregate_id;
    world
        .commands
        .change_username(ctx, &user_id, "david")
        .await
        .unwrap();
    world.commands.deactivate_user(ctx, &user_id).await.unwrap();

    // Live read model, fed incrementally
    let live = Arc::new(MemoryUsersProjection::new());
    let projector = Projector::new(
        world.store.clone(),
        Arc::new(MemoryCheckpoints::new()),
        vec![live.clone() as Arc<dyn Projection>],
        ProjectorConfig::default(),
    );
    projector.catch_up().await.unwrap();

    // Fresh replay from position zero
    let replayed = Arc::new(MemoryUsersProjection::new());
    let replay_projector = Projector::new(
        world.store.clone(),
        Arc::new(MemoryCheckpoints::new()),
        vec![replayed.clone() as Arc<dyn Projection>],
        ProjectorConfig::default(),
    );
    replay_projector.catch_up().await.unwrap();

    let live_rows = live.rows("inst-1").await;
    let replayed_rows = replayed.rows("inst-1").await;
    assert_eq!(live_rows.len(), replayed_rows.len());
    for (live_row, replayed_row) in live_rows.iter().zip(&replayed_rows) {
        assert_eq!(live_row.id, replayed_row.id);
        assert_eq!(live_row.username, replayed_row.username);
        assert_eq!(live_row.state, replayed_row.state);
        assert_eq!(live_row.sequence, replayed_row.sequence);
    }
}

#[tokio::test]
async fn noop_commands_leave_version_unchanged() {
    let world = world().await;
    let user_id = world
        .commands
        .add_human_user(
            &world.ctx,
            AddHumanUser::new("erin", "erin@ex.com").with_org(&world.org_id),
        )
        .await
        .unwrap()
        .aggregate_id;

    // Renaming to the current name writes nothing
    let result = world
        .commands
        .change_username(&world.ctx, &user_id, "erin")
        .await
        .unwrap();
    assert_eq!(result.sequence, 1);
    assert!(result.position.is_none());

    assert_eq!(
        world
            .store
            .latest_version("inst-1", "user", &user_id)
            .await
            .unwrap(),
        1
    );
}
