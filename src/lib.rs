//! Self-hosted LLM gateway: clients authenticate with locally issued
//! application keys; the gateway throttles, budgets, forwards and meters
//! each request, streamed responses included.

pub mod config;
pub mod domain;
mod error;
pub mod execution;
pub mod http;
pub mod keys;
pub mod middlewares;
pub mod pipeline;
pub mod pricing;
pub mod providers;
pub mod storage;

use std::sync::Arc;

pub use config::Config;
pub use error::{GatewayError, Result};

use execution::ExecutionHandler;
use http::AppState;
use keys::KeyService;
use middlewares::MiddlewareRegistry;
use pipeline::ProxyPipeline;
use providers::{Anthropic, Gemini, MockProvider, OpenAi, ProviderRegistry};
use storage::KeyRepository;

/// Wires repositories, registries and services into a ready-to-serve
/// application state. Providers without credentials are left unregistered;
/// the mock provider is always available.
pub fn build_app_state(repo: Arc<dyn KeyRepository>, config: &Config) -> AppState {
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(MockProvider::new()));
    if let Some(api_key) = config.openai_api_key.as_deref() {
        let mut openai = OpenAi::new(api_key);
        if let Some(base_url) = config.openai_base_url.as_deref() {
            openai = openai.with_base_url(base_url);
        }
        providers.register(Arc::new(openai));
    }
    if let Some(api_key) = config.anthropic_api_key.as_deref() {
        providers.register(Arc::new(Anthropic::new(api_key)));
    }
    if let Some(api_key) = config.gemini_api_key.as_deref() {
        providers.register(Arc::new(Gemini::new(api_key)));
    }
    let providers = Arc::new(providers);

    let middlewares = Arc::new(MiddlewareRegistry::new());
    let keys = Arc::new(KeyService::new(
        repo,
        Arc::clone(&providers),
        Arc::clone(&middlewares),
    ));
    middlewares::register_builtins(&middlewares, Arc::clone(&keys));

    let pipeline = Arc::new(ProxyPipeline::new(
        Arc::new(ExecutionHandler::new()),
        middlewares,
        Arc::clone(&keys),
    ));

    AppState {
        keys,
        providers,
        pipeline,
    }
}
