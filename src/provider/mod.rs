//! Provider plugins.
//!
//! Every resource type maps to a [`Provider`] through the
//! [`ProviderRegistry`]. Two transports ship with the crate: the in-memory
//! [`SimulatedProvider`] and the [`HttpProvider`] client for plugin servers.

mod http;
mod plugin;
mod registry;
mod simulated;

pub use http::{DEFAULT_TIMEOUT_SECS, HttpProvider, TOKEN_CREDENTIAL};
pub use plugin::{
    Created, Outputs, Provider, ProviderContext, ProviderRequest, ProviderResult, ResolvedDiff,
    ResourceId,
};
pub use registry::ProviderRegistry;
pub use simulated::SimulatedProvider;
