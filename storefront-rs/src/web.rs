use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
    sync::LazyLock,
};

use tandem::{
    router::SubscriptionHandle,
    runtime::{BrowserSpawner, BrowserTimer, SystemClock},
    storage::{LocalStorage, MemoryStorage, StorageBackend},
    transport::{FallbackTransport, LongPollTransport, WebSocketTransport},
};
use wasm_bindgen::prelude::*;

use crate::{
    Services, Session, SessionScope, Storefront, StorefrontConfig, StorefrontError,
    api::{HttpCommerceApi, PaymentReceipt},
    entities::{Cart, Favorite},
    events::{ChatEvent, ChatTopic, CommerceTopic},
};

fn set_panic_hook() {
    // When the `console_error_panic_hook` feature is enabled, we can call the
    // `set_panic_hook` function at least once during initialization, and then
    // we will get better error messages if our code ever panics.
    //
    // For more details see
    // https://github.com/rustwasm/console_error_panic_hook#readme
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

// putting this inside LOGGER prevents us from accidentally initializing the logger more than once
#[allow(clippy::declare_interior_mutable_const)]
const LOGGER: LazyLock<()> = LazyLock::new(|| {
    set_panic_hook();

    wasm_logger::init(wasm_logger::Config::default());
    log::info!("Logging initialized");
});

fn js_error(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn to_js(value: &impl serde::Serialize) -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(value).map_err(JsValue::from)
}

/// The storefront as seen from JS.
// btw, we should never hold a borrow across an .await. by avoiding this, we guarantee the absence of "borrow while locked" panics
#[wasm_bindgen(js_name = Storefront)]
pub struct StorefrontHandle {
    inner: Storefront,
    subscriptions: RefCell<BTreeMap<u32, SubscriptionHandle>>,
    next_subscription: Cell<u32>,
}

#[wasm_bindgen(js_class = Storefront)]
impl StorefrontHandle {
    #[wasm_bindgen(constructor)]
    pub fn new(config: Option<StorefrontConfig>) -> Self {
        // used to only initialize the logger once
        #[allow(clippy::borrow_interior_mutable_const)]
        *LOGGER;

        let config = config.unwrap_or_else(StorefrontConfig::from_env);
        let storage: Rc<dyn StorageBackend> = match LocalStorage::open() {
            Ok(storage) => Rc::new(storage),
            Err(e) => {
                log::warn!("localStorage unavailable, caching in memory only: {e}");
                Rc::new(MemoryStorage::default())
            }
        };
        let services = Services {
            transport: Rc::new(FallbackTransport::new(WebSocketTransport, LongPollTransport)),
            timer: Rc::new(BrowserTimer),
            spawner: Rc::new(BrowserSpawner),
            clock: Rc::new(SystemClock),
            storage,
            api: Rc::new(HttpCommerceApi::new(config.clone())),
        };

        Self {
            inner: Storefront::new(config, services),
            subscriptions: RefCell::new(BTreeMap::new()),
            next_subscription: Cell::new(0),
        }
    }

    pub async fn login(&self, user_id: String, token: String) -> Result<JsValue, JsValue> {
        let states = self.inner.login(Session::new(user_id, token)).await;
        to_js(&states)
    }

    pub fn logout(&self) {
        self.subscriptions.borrow_mut().clear();
        self.inner.logout();
    }

    #[wasm_bindgen(js_name = refreshToken)]
    pub async fn refresh_token(&self, token: String) -> Result<JsValue, JsValue> {
        let states = self.inner.refresh_token(&token).await.map_err(js_error)?;
        to_js(&states)
    }

    pub async fn reconnect(&self) -> Result<JsValue, JsValue> {
        let states = self.inner.reconnect().await.map_err(js_error)?;
        to_js(&states)
    }

    #[wasm_bindgen(js_name = connectionStates)]
    pub fn connection_states(&self) -> Result<JsValue, JsValue> {
        to_js(&self.inner.connection_states())
    }

    /// `callback(channel, state)` on every state change of either channel.
    #[wasm_bindgen(js_name = onConnectionChange)]
    pub fn on_connection_change(&self, callback: js_sys::Function) {
        self.inner.on_connection_change(move |channel, state| {
            let Ok(state) = serde_wasm_bindgen::to_value(&state) else {
                return;
            };
            let channel = JsValue::from_str(channel.0);
            if let Err(e) = callback.call2(&JsValue::NULL, &channel, &state) {
                log::error!("Connection listener threw: {e:?}");
            }
        });
    }

    /// `callback(kind, change)` whenever a cached entity changes. Lasts until logout.
    #[wasm_bindgen(js_name = onEntityChange)]
    pub fn on_entity_change(&self, callback: js_sys::Function) -> Result<(), JsValue> {
        let scope = self.scope()?;
        let callback = Rc::new(callback);

        fn forward<E: tandem::Entity>(
            callback: &Rc<js_sys::Function>,
        ) -> impl Fn(&tandem::mutation::EntityChange<E>) + 'static {
            let callback = callback.clone();
            move |change| {
                let Ok(change) = serde_wasm_bindgen::to_value(change) else {
                    return;
                };
                let kind = JsValue::from_str(E::KIND);
                if let Err(e) = callback.call2(&JsValue::NULL, &kind, &change) {
                    log::error!("Entity listener threw: {e:?}");
                }
            }
        }

        scope.cart.subscribe(forward(&callback));
        scope.favorites.subscribe(forward(&callback));
        scope.balance.subscribe(forward(&callback));
        scope.orders.subscribe(forward(&callback));
        Ok(())
    }

    /// `callback(event)` for every commerce push on `topic`. Returns an id for `unsubscribe`.
    #[wasm_bindgen(js_name = subscribeCommerce)]
    pub fn subscribe_commerce(&self, topic: CommerceTopic, callback: js_sys::Function) -> u32 {
        let handle = self.inner.subscribe_commerce(topic, move |event| {
            let event = serde_wasm_bindgen::to_value(event)?;
            callback
                .call1(&JsValue::NULL, &event)
                .map_err(|e| format!("{e:?}"))?;
            Ok(())
        });
        self.remember(handle)
    }

    #[wasm_bindgen(js_name = subscribeChat)]
    pub fn subscribe_chat(&self, topic: ChatTopic, callback: js_sys::Function) -> u32 {
        let handle = self.inner.subscribe_chat(topic, move |event| {
            let event = serde_wasm_bindgen::to_value(event)?;
            callback
                .call1(&JsValue::NULL, &event)
                .map_err(|e| format!("{e:?}"))?;
            Ok(())
        });
        self.remember(handle)
    }

    pub fn unsubscribe(&self, id: u32) -> bool {
        let handle = self.subscriptions.borrow_mut().remove(&id);
        handle.is_some_and(|handle| self.inner.unsubscribe(handle))
    }

    #[wasm_bindgen(js_name = sendChat)]
    pub fn send_chat(&self, event: ChatEvent) -> Result<(), JsValue> {
        self.inner.send_chat(&event).map_err(js_error)
    }

    pub fn cart(&self) -> Result<JsValue, JsValue> {
        let scope = self.scope()?;
        to_js(&scope.cart.current())
    }

    pub fn favorite(&self, product_id: String) -> Result<JsValue, JsValue> {
        let scope = self.scope()?;
        to_js(&scope.favorites.current(&product_id))
    }

    pub fn balance(&self) -> Result<JsValue, JsValue> {
        let scope = self.scope()?;
        to_js(&scope.balance.current())
    }

    pub fn order(&self, order_id: String) -> Result<JsValue, JsValue> {
        let scope = self.scope()?;
        to_js(&scope.orders.current(&order_id))
    }

    #[wasm_bindgen(js_name = addToCart)]
    pub async fn add_to_cart(&self, item_id: String, qty: u32) -> Result<Cart, JsValue> {
        self.inner
            .add_to_cart(&item_id, qty)
            .await
            .inspect_err(|e| log::error!("Add to cart failed: {e}"))
            .map_err(js_error)
    }

    #[wasm_bindgen(js_name = toggleFavorite)]
    pub async fn toggle_favorite(&self, product_id: String) -> Result<Favorite, JsValue> {
        self.inner
            .toggle_favorite(&product_id)
            .await
            .inspect_err(|e| log::error!("Toggling favorite failed: {e}"))
            .map_err(js_error)
    }

    #[wasm_bindgen(js_name = payWithBalance)]
    pub async fn pay_with_balance(
        &self,
        order_id: String,
        amount_cents: i64,
    ) -> Result<PaymentReceipt, JsValue> {
        self.inner
            .pay_with_balance(&order_id, amount_cents)
            .await
            .inspect_err(|e| log::error!("Payment failed: {e}"))
            .map_err(js_error)
    }
}

impl StorefrontHandle {
    fn scope(&self) -> Result<Rc<SessionScope>, JsValue> {
        self.inner
            .session_scope()
            .ok_or_else(|| js_error(StorefrontError::NotLoggedIn))
    }

    fn remember(&self, handle: SubscriptionHandle) -> u32 {
        let id = self.next_subscription.get();
        self.next_subscription.set(id.wrapping_add(1));
        self.subscriptions.borrow_mut().insert(id, handle);
        id
    }
}
