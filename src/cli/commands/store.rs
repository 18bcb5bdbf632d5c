use clap::{Arg, ArgMatches, Command};

pub const ARG_STORE: &str = "store";
pub const ARG_DSN: &str = "dsn";
pub const ARG_DB_MAX_CONNECTIONS: &str = "db-max-connections";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub backend: Backend,
    pub dsn: Option<String>,
    pub max_connections: u32,
}

impl Options {
    /// Parse session store arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the postgres store is selected without a DSN.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let backend = match matches.get_one::<String>(ARG_STORE).map(String::as_str) {
            Some("memory") => Backend::Memory,
            _ => Backend::Postgres,
        };

        let dsn = matches
            .get_one::<String>(ARG_DSN)
            .cloned()
            .filter(|v| !v.trim().is_empty());

        if backend == Backend::Postgres && dsn.is_none() {
            anyhow::bail!("missing required argument: --{ARG_DSN}");
        }

        Ok(Self {
            backend,
            dsn,
            max_connections: matches
                .get_one::<u32>(ARG_DB_MAX_CONNECTIONS)
                .copied()
                .unwrap_or(10),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_STORE)
                .long(ARG_STORE)
                .help("Session ledger backend")
                .long_help(
                    "Session ledger backend. `memory` keeps sessions in process and loses them on restart; use it for local development only.",
                )
                .default_value("postgres")
                .value_parser(["postgres", "memory"])
                .env("CUSTODIAN_STORE"),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .env("CUSTODIAN_DSN"),
        )
        .arg(
            Arg::new(ARG_DB_MAX_CONNECTIONS)
                .long(ARG_DB_MAX_CONNECTIONS)
                .help("Maximum number of pooled database connections")
                .default_value("10")
                .env("CUSTODIAN_DB_MAX_CONNECTIONS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
}
