//! Access control for generated SQL.

pub mod guards;
pub mod policy;
pub mod shapes;
pub mod validator;

pub use guards::{find_forbidden_token, is_single_select};
pub use policy::{AuthorizedIds, CallerIdentity, Role};
pub use shapes::{find_isolation_shape, IsolationShape};
pub use validator::{check, check_unrestricted, normalize_sql, validate, Verdict};
