use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use td_bridge::http_api::{api_router, ApiState};
use td_core::config::{expand_home, Config, CredentialProvider};
use td_core::crypto::OtpKey;
use td_core::store::Store;
use td_harness::shutdown::ShutdownSignal;
use td_integrations::sms::{HttpSmsClient, SmsSender};
use td_integrations::storage::{HttpObjectStorage, Uploader};
use td_intelligence::llm::{provider_from_config, LlmConfig};
use td_intelligence::TravelAssistant;
use tracing::{error, info, warn};

use crate::scheduler::{CronScheduler, LimiterSweeper, SWEEP_INTERVAL};

/// The tourdesk server process: HTTP API, the rate limiter sweeper and the
/// optional cron loop.
///
/// Shuts down gracefully when the `ShutdownSignal` fires; in-flight requests
/// finish before `run` returns.
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    api_state: Arc<ApiState>,
    sweep_interval: Duration,
}

impl Daemon {
    /// Open the database from config and wire every integration whose
    /// credentials are present in the environment.
    pub async fn new(config: Config) -> Result<Self> {
        let db_path = expand_home(&config.database.path);
        let store = Store::open(&db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        info!(path = %db_path.display(), "database ready");
        let state = build_api_state(config.clone(), Arc::new(store))?;
        Ok(Self::with_state(config, Arc::new(state)))
    }

    /// Wrap an already-built state. Tests use this with mock integrations.
    pub fn with_state(config: Config, api_state: Arc<ApiState>) -> Self {
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            api_state,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Handle for triggering shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    /// Bind `server.host:server.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;

        let sweeper = LimiterSweeper::new(self.api_state.limiter.clone(), self.sweep_interval);
        let sweep_handle = tokio::spawn(sweeper.run(self.shutdown.clone()));

        let cron_handle = if self.config.cron.enabled {
            let scheduler = CronScheduler::from_config(self.api_state.clone());
            Some(tokio::spawn(scheduler.run(self.shutdown.clone())))
        } else {
            info!("in-process cron disabled; use the /api/cron endpoints");
            None
        };

        let app = api_router(self.api_state.clone());
        let shutdown = self.shutdown.clone();
        info!(%local_addr, "API server listening");
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await;

        // A server error must still stop the background tasks.
        self.shutdown.trigger();
        if let Err(e) = sweep_handle.await {
            error!(error = %e, "rate limiter sweeper failed");
        }
        if let Some(handle) = cron_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "cron scheduler task failed");
            }
        }
        served.context("API server error")?;
        info!("daemon stopped");
        Ok(())
    }
}

/// Assemble `ApiState` from config plus environment credentials.
///
/// Missing SMS credentials only log a warning (codes are then not
/// delivered). Missing storage or AI settings leave uploads and chat
/// answering 503.
pub fn build_api_state(config: Config, store: Arc<Store>) -> Result<ApiState> {
    let otp_key = match CredentialProvider::otp_secret() {
        Some(secret) => OtpKey::new(secret),
        None => {
            warn!("TOURDESK_OTP_SECRET not set; OTP codes will not survive a restart");
            OtpKey::ephemeral().context("failed to generate OTP key")?
        }
    };

    let mut state = ApiState::new(config.clone(), store, otp_key)
        .with_cron_secret(CredentialProvider::cron_secret());
    if state.cron_secret.is_none() {
        warn!("TOURDESK_CRON_SECRET not set; /api/cron endpoints are closed");
    }

    match CredentialProvider::from_env(&config.sms.api_key_env) {
        Some(key) => {
            let client =
                HttpSmsClient::from_config(&config.sms, key).context("invalid sms settings")?;
            let sms: Arc<dyn SmsSender> = Arc::new(client);
            state = state.with_sms(sms);
        }
        None => warn!(env = %config.sms.api_key_env, "SMS key not set; messages will be skipped"),
    }

    match (
        config.storage.endpoint.as_deref(),
        CredentialProvider::from_env(&config.storage.token_env),
    ) {
        (Some(_), Some(token)) => {
            let storage = HttpObjectStorage::from_config(&config.storage, token)
                .context("invalid storage settings")?;
            state = state.with_uploader(Uploader::new(
                Arc::new(storage),
                config.storage.max_upload_bytes,
            ));
        }
        _ => info!("object storage not configured; uploads disabled"),
    }

    let ai_key = CredentialProvider::from_env(&config.ai.api_key_env);
    if let Some(provider) = provider_from_config(&config.ai, ai_key) {
        state = state.with_assistant(TravelAssistant::new(provider, LlmConfig::from(&config.ai)));
    }

    info!(
        integrations = ?CredentialProvider::available_integrations(&config),
        "integrations resolved"
    );
    Ok(state)
}
