use super::admission;
use super::handlers::{auth, health, me, metrics};
use utoipa::openapi::{
    security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Components, Contact, InfoBuilder, License, OpenApiBuilder, Tag,
};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Credential endpoints sit behind admission control; confirmation, logout,
/// metrics and the health probes do not.
pub(crate) fn api_router() -> OpenApiRouter {
    let admitted = OpenApiRouter::new()
        .routes(routes!(auth::signup))
        .routes(routes!(auth::signin))
        .routes(routes!(auth::refresh))
        .routes(routes!(auth::revoke))
        .route_layer(axum::middleware::from_fn(admission::admit));

    OpenApiRouter::with_openapi(base_document())
        .routes(routes!(health::health))
        .routes(routes!(health::ping))
        .routes(routes!(metrics::metrics))
        .routes(routes!(auth::confirm))
        .routes(routes!(auth::logout))
        .routes(routes!(me::me))
        .merge(admitted)
}

/// Cargo metadata plus the tags and security scheme shared by every route.
fn base_document() -> utoipa::openapi::OpenApi {
    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Registration, sign-in, rotation and sign-out".to_string());

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Liveness, readiness and metrics".to_string());

    let mut components = Components::new();
    components.add_security_scheme(
        "bearer",
        SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
    );

    let mut openapi = cargo_openapi();
    openapi.tags = Some(vec![auth_tag, health_tag]);
    openapi.components = Some(components);
    openapi
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (
            non_empty(name.trim()),
            non_empty(email.trim_end_matches('>').trim()),
        ),
        None => (non_empty(author.trim()), None),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
