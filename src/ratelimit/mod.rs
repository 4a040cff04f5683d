//! Rate limiting logic: identity resolution, key construction and decisions.

mod identity;
mod key;
mod limiter;

pub use identity::IdentityResolver;
pub use key::{IdentityClass, RateKey};
pub use limiter::{Decision, LimitConfig, RateLimiter};
