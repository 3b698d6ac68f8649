//! Custom extractors that convert axum rejections to structured AppError responses.
//!
//! Use `AppJson<T>` as a drop-in replacement for `axum::Json<T>` in handler signatures.
//! Unlike the standard extractor, deserialization failures produce a JSON `AppError`
//! instead of axum's default plain-text 422 response.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

/// JSON extractor that converts deserialization errors to structured `AppError` responses.
///
/// # Example
/// ```ignore
/// async fn create_chat(AppJson(req): AppJson<CreateChatRequest>) -> Result<impl IntoResponse, AppError> {
///     // a malformed body never reaches the handler
/// }
/// ```
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

/// Convert a `JsonRejection` to a structured `AppError::Validation`.
pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let body_text = rejection.body_text();

    // "missing field `content`" -> field = "content"
    let field_hint = extract_field_from_serde_message(&body_text);

    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field_hint.unwrap_or("body".to_string())),
        received: None,
        docs_hint: Some(
            "Check the request body against the endpoint's schema (GET /api-doc/openapi.json)."
                .to_string(),
        ),
    }
}

fn extract_field_from_serde_message(msg: &str) -> Option<String> {
    ["missing field `", "unknown field `", "unknown variant `"]
        .iter()
        .find_map(|pattern| {
            let after = msg.split_once(pattern)?.1;
            let (field, _) = after.split_once('`')?;
            Some(field.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, header};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    #[allow(dead_code)]
    struct TurnBody {
        content: String,
    }

    #[test]
    fn extracts_missing_field_name() {
        let msg = "Failed to deserialize: missing field `content` at line 1 column 2";
        assert_eq!(
            extract_field_from_serde_message(msg),
            Some("content".to_string())
        );
    }

    #[test]
    fn extracts_unknown_field_name() {
        let msg = "unknown field `contnet`, expected `content`";
        assert_eq!(
            extract_field_from_serde_message(msg),
            Some("contnet".to_string())
        );
    }

    #[test]
    fn returns_none_for_generic_error() {
        let msg = "invalid type: string, expected u64";
        assert_eq!(extract_field_from_serde_message(msg), None);
    }

    #[tokio::test]
    async fn rejection_becomes_validation_error() {
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"role":"user"}"#))
            .expect("request should build");

        let result = AppJson::<TurnBody>::from_request(req, &()).await;
        match result {
            Err(AppError::Validation { field, .. }) => {
                assert_eq!(field.as_deref(), Some("role"));
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("body should have been rejected"),
        }
    }
}
