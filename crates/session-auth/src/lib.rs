//! Browser session credentials for the storefront proxy
//!
//! The browser holds the only session state: an access token and a refresh
//! token in httpOnly cookies. This crate reads that pair off an inbound
//! request, interprets the upstream's loosely shaped refresh payload, and
//! builds the cookies that write a rotated pair back.
//!
//! Nothing here performs I/O; the transport lives in the `upstream` crate.

pub mod constants;
pub mod cookies;
pub mod credentials;
pub mod refresh;

pub use constants::*;
pub use cookies::CookiePolicy;
pub use credentials::{CredentialPair, extract};
pub use refresh::{RefreshResult, parse_refresh_payload};
