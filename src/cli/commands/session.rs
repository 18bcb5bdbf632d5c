use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_REFRESH_TTL_SECONDS: &str = "refresh-ttl-seconds";
pub const ARG_REVOKE_CHAIN_ON_REUSE: &str = "revoke-chain-on-reuse";

#[derive(Debug, Clone)]
pub struct Options {
    pub refresh_ttl_seconds: i64,
    pub revoke_chain_on_reuse: bool,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            refresh_ttl_seconds: matches
                .get_one::<i64>(ARG_REFRESH_TTL_SECONDS)
                .copied()
                .unwrap_or(2_592_000),
            revoke_chain_on_reuse: matches
                .get_one::<bool>(ARG_REVOKE_CHAIN_ON_REUSE)
                .copied()
                .unwrap_or(true),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_REFRESH_TTL_SECONDS)
                .long(ARG_REFRESH_TTL_SECONDS)
                .help("Lifetime of a refresh token, in seconds")
                .default_value("2592000")
                .env("CUSTODIAN_REFRESH_TTL_SECONDS")
                .value_parser(clap::value_parser!(i64).range(60..)),
        )
        .arg(
            Arg::new(ARG_REVOKE_CHAIN_ON_REUSE)
                .long(ARG_REVOKE_CHAIN_ON_REUSE)
                .help("Revoke every live session of an account when a revoked refresh token is reused")
                .default_value("true")
                .env("CUSTODIAN_REVOKE_CHAIN_ON_REUSE")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
}
