use crate::GIT_COMMIT_HASH;

// axum handler for the banner
pub async fn root() -> String {
    format!(
        "{} {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        GIT_COMMIT_HASH
    )
}
