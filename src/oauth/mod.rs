/// OAuth2 authorization engine
///
/// Client applications, signed authorize requests, single-use
/// authorization codes, and access/refresh token issuance with rotation.

pub mod applications;
pub mod engine;
pub mod scope;

pub use applications::{Application, ApplicationStore, ApplicationUpdate, ApplicationView};
pub use engine::{
    AccountProfile, AuthCodeExpiryHandler, AuthorizationGrant, AuthorizeRequest, OAuthEngine,
    RefreshTokenExpiryHandler, TokenGrant, UserInfo,
};
pub use scope::ScopeSet;
