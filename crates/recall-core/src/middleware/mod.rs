//! Middleware for Recall.
//!
//! - `tenant` - resolves the tenant and user a request acts for

mod tenant;

pub use tenant::{require_tenant, TenantContext, TENANT_HEADER, USER_HEADER};
