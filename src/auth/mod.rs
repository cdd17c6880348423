//! Authentication: JWT dashboard auth, machine API keys, tenant records.

pub mod api_keys;
pub mod jwt;
pub mod middleware;
pub mod tenants;

pub use api_keys::ApiKeyManager;
pub use jwt::{Claims, JwtHandler, TokenType};
pub use middleware::{api_key_auth, jwt_auth, TenantContext};
pub use tenants::{Tenant, TenantStore};
