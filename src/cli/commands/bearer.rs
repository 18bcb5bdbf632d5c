use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_BEARER: &str = "bearer";
pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_JWT_ISSUER: &str = "jwt-issuer";
pub const ARG_JWT_AUDIENCE: &str = "jwt-audience";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idp,
    Local,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    pub jwt_secret: Option<SecretString>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl Options {
    /// Parse bearer validation arguments from matches.
    ///
    /// # Errors
    /// Returns an error if local validation is selected without a signing key.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let mode = match matches.get_one::<String>(ARG_BEARER).map(String::as_str) {
            Some("local") => Mode::Local,
            _ => Mode::Idp,
        };

        let jwt_secret = get_non_empty(ARG_JWT_SECRET).map(SecretString::from);
        if mode == Mode::Local && jwt_secret.is_none() {
            anyhow::bail!("missing required argument: --{ARG_JWT_SECRET}");
        }

        Ok(Self {
            mode,
            jwt_secret,
            issuer: get_non_empty(ARG_JWT_ISSUER),
            audience: get_non_empty(ARG_JWT_AUDIENCE),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BEARER)
                .long(ARG_BEARER)
                .help("How access tokens are validated")
                .long_help(
                    "How access tokens are validated. `idp` asks the identity provider on every request, `local` verifies HS256 tokens with --jwt-secret.",
                )
                .default_value("idp")
                .value_parser(["idp", "local"])
                .env("CUSTODIAN_BEARER"),
        )
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("HS256 signing key for local bearer validation")
                .env("CUSTODIAN_JWT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_JWT_ISSUER)
                .long(ARG_JWT_ISSUER)
                .help("Expected access token issuer (iss)")
                .env("CUSTODIAN_JWT_ISSUER"),
        )
        .arg(
            Arg::new(ARG_JWT_AUDIENCE)
                .long(ARG_JWT_AUDIENCE)
                .help("Expected access token audience (aud)")
                .env("CUSTODIAN_JWT_AUDIENCE"),
        )
}
