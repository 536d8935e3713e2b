//! The REST calls behind optimistic updates.

use futures::future::LocalBoxFuture;

use crate::entities::{Balance, Cart, Favorite, Order};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("the session token was rejected")]
    Unauthorized,

    /// The server understood the request and said no, e.g. insufficient balance.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToCart {
    pub item_id: String,
    pub qty: u32,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub order_id: String,
    pub amount_cents: i64,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub balance: Balance,
    pub order: Order,
}

/// Every call resolves to the server's copy of the entity it changed.
pub trait CommerceApi {
    fn add_to_cart(
        &self,
        token: &str,
        request: AddToCart,
    ) -> LocalBoxFuture<'static, Result<Cart, ApiError>>;

    fn set_favorite(
        &self,
        token: &str,
        product_id: &str,
        favorited: bool,
    ) -> LocalBoxFuture<'static, Result<Favorite, ApiError>>;

    fn pay_with_balance(
        &self,
        token: &str,
        request: PaymentRequest,
    ) -> LocalBoxFuture<'static, Result<PaymentReceipt, ApiError>>;
}

#[cfg(target_arch = "wasm32")]
pub use http::HttpCommerceApi;

#[cfg(target_arch = "wasm32")]
mod http {
    use fetch_happen::Client;
    use futures::{FutureExt, future::LocalBoxFuture};

    use super::{AddToCart, ApiError, CommerceApi, PaymentReceipt, PaymentRequest};
    use crate::{
        config::StorefrontConfig,
        entities::{Cart, Favorite},
    };

    #[derive(serde::Serialize)]
    struct SetFavorite {
        favorited: bool,
    }

    /// Posts JSON to the storefront API with `fetch`.
    #[derive(Clone, Debug)]
    pub struct HttpCommerceApi {
        config: StorefrontConfig,
    }

    impl HttpCommerceApi {
        pub fn new(config: StorefrontConfig) -> Self {
            Self { config }
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        url: String,
        token: String,
        body: impl serde::Serialize,
    ) -> Result<T, ApiError> {
        let response = Client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .json(&body)
            .map_err(|e| ApiError::Decode(format!("{e:?}")))?
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("{e:?}")))?;

        let status: u16 = response.status();
        if status == 401 || status == 403 {
            return Err(ApiError::Unauthorized);
        }
        let ok = response.ok();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("{e:?}")))?;
        if !ok {
            log::warn!("POST {url} failed with status {status}");
            return Err(ApiError::Rejected {
                status,
                message: text,
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| ApiError::Decode(format!("{e}\nResponse body: {text}")))
    }

    impl CommerceApi for HttpCommerceApi {
        fn add_to_cart(
            &self,
            token: &str,
            request: AddToCart,
        ) -> LocalBoxFuture<'static, Result<Cart, ApiError>> {
            post(
                self.config.cart_items_url(),
                token.to_string(),
                request,
            )
            .boxed_local()
        }

        fn set_favorite(
            &self,
            token: &str,
            product_id: &str,
            favorited: bool,
        ) -> LocalBoxFuture<'static, Result<Favorite, ApiError>> {
            let product_id = String::from(js_sys::encode_uri_component(product_id));
            post(
                self.config.favorite_url(&product_id),
                token.to_string(),
                SetFavorite { favorited },
            )
            .boxed_local()
        }

        fn pay_with_balance(
            &self,
            token: &str,
            request: PaymentRequest,
        ) -> LocalBoxFuture<'static, Result<PaymentReceipt, ApiError>> {
            post(
                self.config.payments_url(),
                token.to_string(),
                request,
            )
            .boxed_local()
        }
    }
}
