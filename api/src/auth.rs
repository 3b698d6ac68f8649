use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";

/// End user on whose behalf a chat request is made.
///
/// Identity is established by the upstream gateway, which forwards the ids
/// in `x-user-id` / `x-organization-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

fn header_uuid(parts: &Parts, name: &'static str) -> Result<Uuid, AppError> {
    let raw = parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized {
            message: format!("Missing {name} header"),
            docs_hint: Some(format!(
                "Requests must pass through the gateway, which sets '{USER_ID_HEADER}' and '{ORGANIZATION_ID_HEADER}'."
            )),
        })?;
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::Validation {
        message: format!("{name} must be a UUID"),
        field: Some(name.to_string()),
        received: Some(serde_json::Value::String(raw.to_string())),
        docs_hint: None,
    })
}

impl<S: Send + Sync> FromRequestParts<S> for CallerIdentity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self {
            user_id: header_uuid(parts, USER_ID_HEADER)?,
            organization_id: header_uuid(parts, ORGANIZATION_ID_HEADER)?,
        })
    }
}

/// Proof that the request carries the operator bearer token.
#[derive(Debug, Clone, Copy)]
pub struct OperatorAuth;

fn extract_bearer_token(parts: &Parts) -> Result<&str, AppError> {
    let auth_header = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized {
            message: "Missing Authorization header".to_string(),
            docs_hint: Some(
                "Include 'Authorization: Bearer <token>' with the operator token (cg_op_...)."
                    .to_string(),
            ),
        })?;

    auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized {
            message: "Authorization header must use Bearer scheme".to_string(),
            docs_hint: Some("Format: 'Authorization: Bearer <token>'".to_string()),
        })
}

impl FromRequestParts<AppState> for OperatorAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let operation = format!("{} {}", parts.method, parts.uri.path());
        let Some(expected) = state.operator_token_sha256.as_deref() else {
            tracing::warn!(
                operation = %operation,
                decision = "deny",
                "operator access requested but no operator token is configured"
            );
            return Err(AppError::Forbidden {
                message: "Operator endpoints are disabled".to_string(),
            });
        };

        let token = extract_bearer_token(parts)?;
        if chatguard_core::auth::verify_token(token, expected) {
            tracing::info!(operation = %operation, decision = "allow", "operator authorization decision");
            Ok(OperatorAuth)
        } else {
            tracing::warn!(operation = %operation, decision = "deny", "operator authorization decision");
            Err(AppError::Unauthorized {
                message: "Invalid operator token".to_string(),
                docs_hint: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/v1/chats");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).expect("request should build").into_parts().0
    }

    #[tokio::test]
    async fn caller_identity_reads_gateway_headers() {
        let user = Uuid::now_v7();
        let org = Uuid::now_v7();
        let mut parts = parts(&[
            (USER_ID_HEADER, &user.to_string()),
            (ORGANIZATION_ID_HEADER, &org.to_string()),
        ]);
        let caller = CallerIdentity::from_request_parts(&mut parts, &())
            .await
            .expect("identity should parse");
        assert_eq!(caller.user_id, user);
        assert_eq!(caller.organization_id, org);
    }

    #[tokio::test]
    async fn caller_identity_requires_both_headers() {
        let mut parts = parts(&[(USER_ID_HEADER, &Uuid::now_v7().to_string())]);
        let err = CallerIdentity::from_request_parts(&mut parts, &())
            .await
            .expect_err("org header is missing");
        assert!(matches!(err, AppError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn malformed_identity_is_a_validation_error() {
        let mut parts = parts(&[
            (USER_ID_HEADER, "not-a-uuid"),
            (ORGANIZATION_ID_HEADER, &Uuid::now_v7().to_string()),
        ]);
        let err = CallerIdentity::from_request_parts(&mut parts, &())
            .await
            .expect_err("user header is malformed");
        assert!(matches!(err, AppError::Validation { field: Some(f), .. } if f == USER_ID_HEADER));
    }

    #[test]
    fn bearer_scheme_is_required() {
        let p = parts(&[("authorization", "Basic abc")]);
        assert!(extract_bearer_token(&p).is_err());
        let p = parts(&[("authorization", "Bearer cg_op_abc")]);
        assert_eq!(extract_bearer_token(&p).expect("token"), "cg_op_abc");
    }
}
