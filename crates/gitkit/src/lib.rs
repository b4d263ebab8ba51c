//! Server side client for the Google Identity Toolkit.
//!
//! Verifies the ID tokens issued by the sign in widget against the toolkit's public
//! certificates, which are kept in a cache that refreshes itself in the background.
//! Also wraps the relyingparty account api.
pub mod api;
pub mod certs;
pub mod client;
pub mod config;
pub mod credentials;
mod error;
pub mod layer;
pub mod segment;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use api::ApiClient;
pub use certs::{CertError, Certificate, CertificateSource, Certificates, KeyId};
pub use client::{Client, ListUsersStream, error_response, success_response};
pub use config::Config;
pub use credentials::{Credentials, MetadataServer, ServiceAccount};
pub use error::{Error, StatusError};
pub use layer::{VerifyTokenLayer, VerifyTokenService};
pub use token::{Token, VerifyError, verify_token};
pub use transport::{AuthorizedTransport, Transport};

pub type Result<T, E = Error> = core::result::Result<T, E>;
