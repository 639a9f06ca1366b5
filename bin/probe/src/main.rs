//! Registers the configured integrations and health-checks each one.
//!
//! Usage: `switchboard-probe [CONFIG_PATH]`. The path defaults to
//! `$SWITCHBOARD_CONFIG`, then `switchboard.toml`. Results are printed to
//! stdout as a JSON object keyed by integration id. Exits non-zero if any
//! enabled integration fails its check.

mod config;

use crate::config::{CONFIG_PATH_VAR, DEFAULT_CONFIG_PATH, ProbeConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use switchboard_integration::{
    ConfigError, ConnectionTester, IntegrationEventType, IntegrationManager, WILDCARD,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_VAR).ok())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    let config = match ProbeConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        path = %path.display(),
        integrations = config.integrations.len(),
        "loaded configuration"
    );

    let http = reqwest::Client::new();
    let tester = ConnectionTester::new(http.clone()).with_timeout(config.tester.timeout());
    let manager = IntegrationManager::builder()
        .http_client(http)
        .tester(tester)
        .build();

    manager.add_event_listener(WILDCARD, |event| {
        if event.event_type == IntegrationEventType::Error {
            tracing::warn!(
                integration_id = %event.integration_id,
                error = event.error.as_deref().unwrap_or_default(),
                "integration error"
            );
        }
    });

    let mut failed = 0usize;
    for integration in config.integrations {
        let id = integration.id.clone();
        let name = integration.name.clone();
        if let Err(report) = manager.register_integration(integration).await {
            tracing::error!(integration_id = %id, error = %report, "registration failed");
            failed += 1;
            continue;
        }
        if manager.get_connector(&id).is_none() {
            let note = ConfigError::UnknownConnector { name };
            tracing::info!(integration_id = %id, "{note}, checking base URL instead");
        }
    }

    let manager = Arc::new(manager);
    let checks = manager
        .list_integrations()
        .into_iter()
        .filter(|integration| integration.enabled)
        .map(|integration| {
            let manager = Arc::clone(&manager);
            let settings = config.tester.clone();
            tokio::spawn(async move {
                let result = manager
                    .test_connection_with_retry(
                        &integration.id,
                        settings.max_retries,
                        settings.retry_delay(),
                    )
                    .await;
                (integration.id, result)
            })
        })
        .collect::<Vec<_>>();

    let mut results = BTreeMap::new();
    for check in checks {
        match check.await {
            Ok((id, result)) => {
                if result.success {
                    tracing::info!(
                        integration_id = %id,
                        latency_ms = result.latency_ms,
                        "{}",
                        result.message
                    );
                } else {
                    failed += 1;
                    tracing::error!(
                        integration_id = %id,
                        latency_ms = result.latency_ms,
                        error = result.error.as_deref().unwrap_or_default(),
                        "{}",
                        result.message
                    );
                }
                results.insert(id, result);
            }
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, "health check task failed");
            }
        }
    }

    match serde_json::to_string_pretty(&results) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "failed to serialize results"),
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        tracing::error!(failed, "integration checks failed");
        ExitCode::FAILURE
    }
}
