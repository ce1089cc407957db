use std::collections::HashMap;
use std::sync::Arc;

use pmp_session_engine::config;
use pmp_session_engine::session::{
    DestroyReason, DeviceSignals, FanoutEventSink, MemoryDurableStore, RequestContext,
    SessionLifecycleManager, TracingEventSink, ValidateOptions,
};
use pmp_session_engine::token::MemoryTokenAuthority;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pmp_session_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let policy = match config::load_config_with_fallback() {
        Ok(policy) => policy,
        Err(e) => {
            tracing::error!("Failed to load session policy: {}", e);
            std::process::exit(1);
        }
    };

    let manager = match SessionLifecycleManager::builder()
        .config(policy)
        .token_authority(Arc::new(MemoryTokenAuthority::default()))
        .durable_store(Arc::new(MemoryDurableStore::new()))
        .event_sink(Arc::new(FanoutEventSink::new().with(Arc::new(TracingEventSink))))
        .build()
    {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!("Failed to start session manager: {}", e);
            std::process::exit(1);
        }
    };

    let context = RequestContext {
        ip: Some("127.0.0.1".to_string()),
        user_agent: Some("pmp-session-demo/0.1".to_string()),
        login_method: Some("password".to_string()),
        device: DeviceSignals {
            platform: Some(std::env::consts::OS.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    if let Err(e) = run(&manager, context).await {
        tracing::error!("Demo failed: {}", e.reason());
        print_json(&e.to_failure());
    }

    manager.shutdown();
}

async fn run(
    manager: &SessionLifecycleManager,
    context: RequestContext,
) -> Result<(), pmp_session_engine::error::SessionError> {
    let created = manager
        .create_session(
            "demo-user",
            serde_json::json!({"email": "demo@example.com"}),
            context.clone(),
        )
        .await?;
    print_json(&created.session_info);

    let validated = manager
        .validate_session(&created.session.id, ValidateOptions::new(context))
        .await?;
    print_json(&validated);

    let recovery = manager.create_recovery_token(&created.session.id).await?;
    print_json(&recovery);

    print_json(&manager.session_stats().await);

    let destroyed = manager
        .destroy_session(&created.session.id, DestroyReason::Logout, HashMap::new())
        .await?;
    print_json(&destroyed);

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("Could not serialize output: {}", e),
    }
}
