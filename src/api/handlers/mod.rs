//! Route handlers.

pub mod auth;
pub mod health;
pub mod me;
pub mod metrics;
pub mod root;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use utoipa::ToSchema;

static EMAIL_SHAPE: OnceLock<Option<Regex>> = OnceLock::new();

/// Basic `local@domain.tld` shape check. Deliverability is the `IdP`'s problem.
pub fn valid_email(email: &str) -> bool {
    EMAIL_SHAPE
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(email))
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub(crate) fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}
