use crate::{
    api::{self, HttpMetrics, Services},
    cli::{
        commands::{admission, bearer, idp, session, store},
        telemetry,
    },
    session::{
        idp::{CognitoConfig, CognitoGateway, MemoryIdentityProvider},
        ledger::{MemoryLedger, PgLedger},
        AccountStore, AdmissionControl, BearerValidator, Clock, IdentityProvider,
        IdpBearerValidator, LifecycleConfig, LocalKeyValidator, SessionLedger, SystemClock,
        TokenLifecycleManager,
    },
};
use anyhow::{Context, Result};
use chrono::TimeDelta;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub store: store::Options,
    pub idp: idp::Options,
    pub session: session::Options,
    pub bearer: bearer::Options,
    pub admission: admission::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database or identity provider cannot be set up, or the server fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let upstream_timeout = Duration::from_secs(args.idp.timeout_seconds);

    let (accounts, ledger): (Arc<dyn AccountStore>, Arc<dyn SessionLedger>) =
        match args.store.backend {
            store::Backend::Postgres => {
                let dsn = args
                    .store
                    .dsn
                    .as_deref()
                    .context("missing required argument: --dsn")?;
                let ledger = Arc::new(PgLedger::connect(dsn, args.store.max_connections).await?);
                (ledger.clone() as Arc<dyn AccountStore>, ledger as Arc<dyn SessionLedger>)
            }
            store::Backend::Memory => {
                warn!("Using the in-memory session ledger, sessions are lost on restart");
                let ledger = Arc::new(MemoryLedger::new(clock.clone()));
                (ledger.clone() as Arc<dyn AccountStore>, ledger as Arc<dyn SessionLedger>)
            }
        };

    let idp: Arc<dyn IdentityProvider> = match args.idp.backend {
        idp::Backend::Cognito => Arc::new(cognito_gateway(&args.idp, upstream_timeout)?),
        idp::Backend::Memory => {
            warn!("Using the in-memory identity provider, confirmation code is 000000");
            Arc::new(MemoryIdentityProvider::new())
        }
    };

    let bearer: Arc<dyn BearerValidator> = match args.bearer.mode {
        bearer::Mode::Idp => Arc::new(IdpBearerValidator::new(idp.clone(), upstream_timeout)),
        bearer::Mode::Local => {
            let secret = args
                .bearer
                .jwt_secret
                .as_ref()
                .context("missing required argument: --jwt-secret")?;
            let mut validator = LocalKeyValidator::new(secret);
            if let Some(issuer) = &args.bearer.issuer {
                validator = validator.with_issuer(issuer);
            }
            if let Some(audience) = &args.bearer.audience {
                validator = validator.with_audience(audience);
            }
            Arc::new(validator)
        }
    };

    let config = LifecycleConfig::new()
        .with_refresh_ttl(TimeDelta::seconds(args.session.refresh_ttl_seconds))
        .with_upstream_timeout(upstream_timeout)
        .with_revoke_chain_on_reuse(args.session.revoke_chain_on_reuse);

    let manager = Arc::new(TokenLifecycleManager::new(
        idp,
        accounts,
        ledger.clone(),
        clock.clone(),
        config,
    ));

    let admission = Arc::new(
        AdmissionControl::new(
            args.admission.capacity,
            TimeDelta::seconds(args.admission.window_seconds),
            clock,
        )
        .with_max_keys(args.admission.max_clients),
    );

    let metrics = Arc::new(HttpMetrics::new().context("failed to create metrics registry")?);

    let services = Services {
        manager,
        bearer,
        ledger,
        admission,
        metrics,
    };

    let result = api::serve(args.port, services, api::shutdown_signal()).await;

    telemetry::shutdown_tracer();

    result
}

fn cognito_gateway(options: &idp::Options, timeout: Duration) -> Result<CognitoGateway> {
    let client_id = options
        .client_id
        .clone()
        .context("missing required argument: --cognito-client-id")?;

    let mut config = CognitoConfig::new(&options.region, client_id)?.with_timeout(timeout);
    if let Some(endpoint) = &options.endpoint {
        config = config.with_endpoint(endpoint.clone());
    }
    if let Some(secret) = &options.client_secret {
        config = config.with_client_secret(secret.clone());
    }

    CognitoGateway::new(config)
}

fn log_startup_args(args: &Args) {
    let store = match args.store.backend {
        store::Backend::Postgres => format!(
            "postgres {}",
            args.store.dsn.as_deref().map_or_else(|| "none".to_string(), redact_dsn)
        ),
        store::Backend::Memory => "memory".to_string(),
    };
    let idp = match args.idp.backend {
        idp::Backend::Cognito => format!(
            "cognito {} client {}",
            args.idp.region,
            args.idp.client_id.as_deref().unwrap_or("none")
        ),
        idp::Backend::Memory => "memory".to_string(),
    };
    let bearer = match args.bearer.mode {
        bearer::Mode::Idp => "idp",
        bearer::Mode::Local => "local",
    };
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("store", store),
        ("idp", idp),
        ("upstream_timeout", format!("{}s", args.idp.timeout_seconds)),
        ("refresh_ttl", format!("{}s", args.session.refresh_ttl_seconds)),
        (
            "revoke_chain_on_reuse",
            args.session.revoke_chain_on_reuse.to_string(),
        ),
        ("bearer", bearer.to_string()),
        (
            "admission",
            format!(
                "{} per {}s, {} clients",
                args.admission.capacity, args.admission.window_seconds, args.admission.max_clients
            ),
        ),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}
