//! OAuth2 Authorization Code + PKCE against a single confidential-client IdP,
//! plus the server-held sessions built on top of it.

pub mod flow;
pub mod jwk;
pub mod pending;
pub mod pkce;
pub mod session;
pub mod token;

pub use flow::{CallbackParams, LoginRedirect, OAuthFlow, VerifiedCallback};
pub use jwk::{Audience, Claims, JwksCache, TokenVerifier};
pub use pending::{PendingAuthorization, PendingStore};
pub use session::{Session, SessionId, SessionStore};
pub use token::{ExchangeRequest, TokenSet};
