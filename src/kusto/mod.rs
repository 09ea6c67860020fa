//! Kusto (Azure Data Explorer) access
//!
//! - [`token`]: access tokens, JWT claims and claim validation
//! - [`http`]: transport seam and the reqwest implementation
//! - [`credential`]: primary credential providers
//! - [`legacy`]: cached account, `az login` and device code providers
//! - [`auth`]: the two-tier [`Authenticator`]
//! - [`client`]: query and management requests
//! - [`table`]: result tables and their clean-up passes

pub mod auth;
pub mod client;
pub mod credential;
pub mod http;
pub mod legacy;
pub mod table;
pub mod token;

pub use auth::Authenticator;
pub use client::{kusto_timespan, CommandKind, KustoClient};
pub use credential::{
    AzureCliCredential, CredentialProvider, ManagedIdentityCredential, MsiEndpoint, ServicePrincipalCredential,
    DEFAULT_AUTHORITY,
};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use legacy::{
    AccountCache, CachedAccount, DeviceCodeCredential, InteractiveBrowser, LegacySettings, SilentCachedAccount,
    AZURE_CLI_CLIENT_ID,
};
pub use table::{parse_v1, Column, ResultTable};
pub use token::{decode_claims, validate_token_claims, AccessToken, Claims, TokenExpectation};
