//! Tenant identity middleware.
//!
//! Authentication happens upstream. The gateway in front of Recall forwards
//! the resolved identity as two headers:
//! - `X-Tenant-Id` - the tenant (organisation) the request acts for
//! - `X-User-Id` - the end user inside that tenant
//!
//! Every memory route requires both.

use axum::{
    body::Body,
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::error::Error;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";

/// Identity injected into request extensions by [`require_tenant`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
}

impl TenantContext {
    /// Read the identity headers. Missing or blank headers yield `None`.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Some(Self {
            tenant_id: read(TENANT_HEADER)?,
            user_id: read(USER_HEADER)?,
        })
    }
}

/// Middleware that requires the tenant and user headers.
///
/// # Errors
///
/// Returns 401 Unauthorized when either header is missing or blank.
///
/// # Example
///
/// ```rust,ignore
/// use axum::{Router, middleware};
/// use recall::middleware::require_tenant;
///
/// let app = Router::new()
///     .route("/memories", get(list_memories))
///     .layer(middleware::from_fn(require_tenant));
/// ```
pub async fn require_tenant(mut req: Request<Body>, next: Next) -> Result<Response, Error> {
    let context = TenantContext::from_headers(req.headers()).ok_or(Error::Unauthenticated)?;

    req.extensions_mut().insert(context);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(TenantContext::from_headers(&headers).is_none());

        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme-agency"));
        assert!(TenantContext::from_headers(&headers).is_none());

        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        assert!(TenantContext::from_headers(&headers).is_none());

        headers.insert(USER_HEADER, HeaderValue::from_static(" user-1 "));
        assert_eq!(
            TenantContext::from_headers(&headers),
            Some(TenantContext {
                tenant_id: "acme-agency".into(),
                user_id: "user-1".into(),
            })
        );
    }
}
