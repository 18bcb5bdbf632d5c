use clap::{Arg, ArgMatches, Command};

pub const ARG_ADMISSION_CAPACITY: &str = "admission-capacity";
pub const ARG_ADMISSION_WINDOW_SECONDS: &str = "admission-window-seconds";
pub const ARG_ADMISSION_MAX_CLIENTS: &str = "admission-max-clients";

#[derive(Debug, Clone)]
pub struct Options {
    pub capacity: u32,
    pub window_seconds: i64,
    pub max_clients: usize,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            capacity: matches
                .get_one::<u32>(ARG_ADMISSION_CAPACITY)
                .copied()
                .unwrap_or(10),
            window_seconds: matches
                .get_one::<i64>(ARG_ADMISSION_WINDOW_SECONDS)
                .copied()
                .unwrap_or(60),
            max_clients: matches
                .get_one::<usize>(ARG_ADMISSION_MAX_CLIENTS)
                .copied()
                .unwrap_or(crate::session::admission::DEFAULT_MAX_KEYS),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ADMISSION_CAPACITY)
                .long(ARG_ADMISSION_CAPACITY)
                .help("Requests admitted per client and window on sign-up, sign-in, refresh and revoke")
                .default_value("10")
                .env("CUSTODIAN_ADMISSION_CAPACITY")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_ADMISSION_WINDOW_SECONDS)
                .long(ARG_ADMISSION_WINDOW_SECONDS)
                .help("Admission window length, in seconds")
                .default_value("60")
                .env("CUSTODIAN_ADMISSION_WINDOW_SECONDS")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_ADMISSION_MAX_CLIENTS)
                .long(ARG_ADMISSION_MAX_CLIENTS)
                .help("Client keys tracked at once; new clients are throttled while the table is full")
                .default_value("100000")
                .env("CUSTODIAN_ADMISSION_MAX_CLIENTS")
                .value_parser(clap::value_parser!(usize)),
        )
}
