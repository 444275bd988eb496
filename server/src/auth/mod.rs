pub mod extractor;
pub mod oauth;
pub mod session;
pub mod session_store;
pub mod token_store;

pub use extractor::AuthedSession;
pub use oauth::{AuthError, SessionManager};
pub use session::{Identity, Session, SessionState};
pub use token_store::{CookiePolicy, CookieTokenStore, TokenStore};
