use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use url::Url;

pub const ARG_IDP: &str = "idp";
pub const ARG_COGNITO_REGION: &str = "cognito-region";
pub const ARG_COGNITO_CLIENT_ID: &str = "cognito-client-id";
pub const ARG_COGNITO_CLIENT_SECRET: &str = "cognito-client-secret";
pub const ARG_COGNITO_ENDPOINT: &str = "cognito-endpoint";
pub const ARG_UPSTREAM_TIMEOUT_SECONDS: &str = "upstream-timeout-seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cognito,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub backend: Backend,
    pub region: String,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub endpoint: Option<Url>,
    pub timeout_seconds: u64,
}

impl Options {
    /// Parse identity provider arguments from matches.
    ///
    /// # Errors
    /// Returns an error if Cognito is selected without a client id or the endpoint is not a URL.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let backend = match matches.get_one::<String>(ARG_IDP).map(String::as_str) {
            Some("memory") => Backend::Memory,
            _ => Backend::Cognito,
        };

        let client_id = get_non_empty(ARG_COGNITO_CLIENT_ID);
        if backend == Backend::Cognito && client_id.is_none() {
            anyhow::bail!("missing required argument: --{ARG_COGNITO_CLIENT_ID}");
        }

        let endpoint = get_non_empty(ARG_COGNITO_ENDPOINT)
            .map(|value| Url::parse(&value))
            .transpose()
            .map_err(|err| anyhow::anyhow!("invalid --{ARG_COGNITO_ENDPOINT}: {err}"))?;

        Ok(Self {
            backend,
            region: get_non_empty(ARG_COGNITO_REGION)
                .unwrap_or_else(|| "ap-southeast-2".to_string()),
            client_id,
            client_secret: get_non_empty(ARG_COGNITO_CLIENT_SECRET).map(SecretString::from),
            endpoint,
            timeout_seconds: matches
                .get_one::<u64>(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(5),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_IDP)
                .long(ARG_IDP)
                .help("Identity provider backend")
                .long_help(
                    "Identity provider backend. `memory` accepts the confirmation code 000000 and is meant for local development.",
                )
                .default_value("cognito")
                .value_parser(["cognito", "memory"])
                .env("CUSTODIAN_IDP"),
        )
        .arg(
            Arg::new(ARG_COGNITO_REGION)
                .long(ARG_COGNITO_REGION)
                .help("AWS region of the Cognito user pool")
                .default_value("ap-southeast-2")
                .env("CUSTODIAN_COGNITO_REGION"),
        )
        .arg(
            Arg::new(ARG_COGNITO_CLIENT_ID)
                .long(ARG_COGNITO_CLIENT_ID)
                .help("Cognito app client id")
                .env("CUSTODIAN_COGNITO_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_COGNITO_CLIENT_SECRET)
                .long(ARG_COGNITO_CLIENT_SECRET)
                .help("Cognito app client secret, enables SECRET_HASH")
                .env("CUSTODIAN_COGNITO_CLIENT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_COGNITO_ENDPOINT)
                .long(ARG_COGNITO_ENDPOINT)
                .help("Override the regional Cognito endpoint")
                .env("CUSTODIAN_COGNITO_ENDPOINT"),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .long(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .help("Timeout for every identity provider call, in seconds")
                .default_value("5")
                .env("CUSTODIAN_UPSTREAM_TIMEOUT_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
