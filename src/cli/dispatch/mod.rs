//! Map validated CLI arguments to an action.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{admission, bearer, idp, session, store, ARG_PORT};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);

    Ok(Action::Server(Args {
        port,
        store: store::Options::parse(matches)?,
        idp: idp::Options::parse(matches)?,
        session: session::Options::parse(matches),
        bearer: bearer::Options::parse(matches)?,
        admission: admission::Options::parse(matches),
    }))
}
