use std::time::Duration;

use tandem::{RetryPolicy, SyncConfig};

/// Where the API lives and how patient to be with it. Every field has a default, so JS can pass `{}`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(default, rename_all = "camelCase")]
pub struct StorefrontConfig {
    pub base_url: String,
    pub events_path: String,
    pub chat_path: String,
    /// How long a REST call behind an optimistic update may take before it's rolled back.
    pub request_timeout_ms: u64,
    /// After this long, cached balances and orders are reported stale. 0 means never.
    pub cache_ttl_ms: u64,
    pub cache_prefix: String,
    pub push_queue_limit: usize,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

fn default_base_url() -> &'static str {
    if cfg!(feature = "local-backend") {
        "http://localhost:8080"
    } else {
        option_env!("STOREFRONT_API_URL").unwrap_or("https://api.storefront.dev")
    }
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            base_url: default_base_url().to_string(),
            events_path: "/events".to_string(),
            chat_path: "/chat".to_string(),
            request_timeout_ms: 10_000,
            cache_ttl_ms: 5 * 60 * 1000,
            cache_prefix: "storefront".to_string(),
            push_queue_limit: sync.push_queue_limit,
            reconnect_initial_delay_ms: sync.retry.initial_delay_ms,
            reconnect_max_delay_ms: sync.retry.max_delay_ms,
            reconnect_max_attempts: sync.retry.max_attempts,
        }
    }
}

impl StorefrontConfig {
    /// The defaults, with the base URL baked in at build time from `STOREFRONT_API_URL`
    /// (or the local backend with the `local-backend` feature).
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn events_url(&self) -> String {
        self.channel_url(&self.events_path)
    }

    pub fn chat_url(&self) -> String {
        self.channel_url(&self.chat_path)
    }

    pub fn api_url(&self, path: &str) -> String {
        self.channel_url(path)
    }

    pub fn cart_items_url(&self) -> String {
        self.api_url("cart/items")
    }

    /// `product_id` must already be URI-encoded.
    pub fn favorite_url(&self, product_id: &str) -> String {
        self.api_url(&format!("favorites/{product_id}"))
    }

    pub fn payments_url(&self) -> String {
        self.api_url("balance/payments")
    }

    fn channel_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_ms > 0).then(|| Duration::from_millis(self.cache_ttl_ms))
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            retry: RetryPolicy {
                initial_delay_ms: self.reconnect_initial_delay_ms,
                max_delay_ms: self.reconnect_max_delay_ms,
                max_attempts: self.reconnect_max_attempts,
            },
            push_queue_limit: self.push_queue_limit,
            cache_prefix: self.cache_prefix.clone(),
        }
    }
}
