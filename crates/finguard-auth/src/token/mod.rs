//! Bearer token management.
//!
//! - [`jwt`]: HMAC JWT codec
//! - [`claims`]: claim set and validation outcomes
//! - [`authority`]: [`TokenAuthority`], the token lifecycle

pub mod authority;
pub mod claims;
pub mod jwt;

pub use authority::TokenAuthority;
pub use claims::{IssuedToken, TokenClaims, TokenRejection, TokenValidation};
pub use jwt::{JwtCodec, JwtError, SigningAlgorithm};
