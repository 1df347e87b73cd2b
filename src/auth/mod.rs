//! Authentication against API providers
//!
//! This module provides:
//! - PKCE and state generation
//! - The provider registry and layered client credential discovery
//! - Authorization URL construction
//! - Token exchange/normalization and the device-code flow
//! - The on-disk token store
//! - [`Authenticator`], which runs a provider's flow end to end

mod authorize;
mod device;
mod discovery;
mod exchange;
mod flow;
mod pkce;
mod providers;
mod store;

pub use authorize::build_auth_url;
pub use device::{
    open_in_system, poll_for_token, request_device_code, run_device_flow, DeviceCode, PageOpener, PollSchedule,
};
pub use discovery::{discovery_entry, ClientCredentials, CredentialResolver, DiscoveryEntry, SourceConfig};
pub use exchange::{decode_jwt_payload, exchange_code, normalize, split_scopes, FlowVariant, Normalized, PkceContext, TokenResponse};
pub use flow::Authenticator;
pub use pkce::{generate_code_challenge, generate_code_verifier, generate_state, PkcePair};
pub use providers::{
    ApiKeyConfig, DeviceFlowConfig, FlowKind, OAuth2Config, ProviderConfig, ProviderId, TokenContentType,
};
pub use store::{TokenKind, TokenMap, TokenRecord, TokenStore};
