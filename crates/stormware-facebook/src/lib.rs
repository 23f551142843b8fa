//! # stormware-facebook
//!
//! Facebook Ads insights through the Graph API, authenticated with an app
//! secret proof.

pub mod ads;
pub mod error;

pub use ads::{FacebookAds, FacebookCredentials, ReportRequest, DEFAULT_SECRET_KEY, GRAPH_API_VERSION};
pub use error::{FacebookError, FacebookErrorKind, FacebookResult};
