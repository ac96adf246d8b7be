use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use uuid::Uuid;

use crate::api::errors::ErrorResponse;

pub const ACTOR_HEADER: &str = "x-actor-user-id";

/// The already-authenticated user performing the request, as forwarded by the auth layer
/// in front of this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor(pub Uuid);

#[derive(Debug, PartialEq, Eq)]
pub enum ActorRejection {
    Missing,
    Invalid,
}

impl IntoResponse for ActorRejection {
    fn into_response(self) -> Response {
        let detail = match self {
            ActorRejection::Missing => format!("missing {ACTOR_HEADER} header"),
            ActorRejection::Invalid => format!("{ACTOR_HEADER} header is not a valid uuid"),
        };
        let body = ErrorResponse {
            error_type: "authentication_error".to_string(),
            code: "not_authenticated".to_string(),
            detail,
            attr: None,
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ActorRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACTOR_HEADER)
            .ok_or(ActorRejection::Missing)?;

        raw.to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(Actor)
            .ok_or(ActorRejection::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<Actor, ActorRejection> {
        let mut builder = Request::builder().uri("/flags");
        if let Some(value) = header {
            builder = builder.header(ACTOR_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_actor_from_header() {
        let id = Uuid::now_v7();
        assert_eq!(extract(Some(&id.to_string())).await, Ok(Actor(id)));
    }

    #[tokio::test]
    async fn test_missing_or_malformed_actor() {
        assert_eq!(extract(None).await, Err(ActorRejection::Missing));
        assert_eq!(extract(Some("bob")).await, Err(ActorRejection::Invalid));
        assert_eq!(
            ActorRejection::Missing.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
