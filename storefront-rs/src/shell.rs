//! # Storefront
//! The application shell: owns the session, both channel connections and the cache, and wires
//! commerce pushes to the entity reconcilers. Everything environment-specific comes in through
//! [`Services`], so the same shell runs in the browser and in tests.

use std::{cell::RefCell, rc::Rc};

use futures::task::LocalSpawn;
use tandem::{
    ChannelId,
    cache::CacheStore,
    connection::{ConnectionError, ConnectionManager, ConnectionState, StateListenerKey},
    router::{HandlerResult, SubscriptionHandle},
    runtime::{Clock, Timer},
    storage::StorageBackend,
    transport::Transport,
};

use crate::{
    api::{CommerceApi, PaymentReceipt},
    config::StorefrontConfig,
    entities::{Cart, Favorite},
    events::{CHAT, COMMERCE, ChatEvent, ChatTopic, CommerceEvent, CommerceTopic},
    reconcile::{
        BalanceReconciler, CartReconciler, FavoriteReconciler, MutationFailure, OrdersReconciler,
        ReconcilerContext,
    },
    session::Session,
};

/// The environment the shell runs in.
#[derive(Clone)]
pub struct Services {
    pub transport: Rc<dyn Transport>,
    pub timer: Rc<dyn Timer>,
    pub spawner: Rc<dyn LocalSpawn>,
    pub clock: Rc<dyn Clock>,
    pub storage: Rc<dyn StorageBackend>,
    pub api: Rc<dyn CommerceApi>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorefrontError {
    #[error("not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Mutation(#[from] MutationFailure),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStates {
    pub commerce: ConnectionState,
    pub chat: ConnectionState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionListener {
    commerce: StateListenerKey,
    chat: StateListenerKey,
}

/// Everything that lives exactly as long as a login.
pub struct SessionScope {
    session: RefCell<Session>,
    pub cart: Rc<CartReconciler>,
    pub favorites: Rc<FavoriteReconciler>,
    pub balance: Rc<BalanceReconciler>,
    pub orders: Rc<OrdersReconciler>,
}

impl SessionScope {
    pub fn user_id(&self) -> String {
        self.session.borrow().user_id.clone()
    }

    fn token(&self) -> String {
        self.session.borrow().token().to_string()
    }
}

pub struct Storefront {
    config: StorefrontConfig,
    services: Services,
    cache: Rc<CacheStore>,
    commerce: Rc<ConnectionManager<CommerceEvent>>,
    chat: Rc<ConnectionManager<ChatEvent>>,
    scope: RefCell<Option<Rc<SessionScope>>>,
}

impl Storefront {
    pub fn new(config: StorefrontConfig, services: Services) -> Self {
        let sync = config.sync_config();
        let cache = Rc::new(CacheStore::new(
            Box::new(services.storage.clone()),
            services.clock.clone(),
            sync.cache_prefix.clone(),
        ));
        let commerce = ConnectionManager::new(
            COMMERCE,
            config.events_url(),
            services.transport.clone(),
            services.timer.clone(),
            services.spawner.clone(),
            sync.retry.clone(),
        );
        let chat = ConnectionManager::new(
            CHAT,
            config.chat_url(),
            services.transport.clone(),
            services.timer.clone(),
            services.spawner.clone(),
            sync.retry,
        );
        Self {
            config,
            services,
            cache,
            commerce,
            chat,
            scope: RefCell::new(None),
        }
    }

    pub fn config(&self) -> &StorefrontConfig {
        &self.config
    }

    pub fn session_scope(&self) -> Option<Rc<SessionScope>> {
        self.scope.borrow().clone()
    }

    fn require_scope(&self) -> Result<Rc<SessionScope>, StorefrontError> {
        self.session_scope().ok_or(StorefrontError::NotLoggedIn)
    }

    pub fn connection_states(&self) -> ChannelStates {
        ChannelStates {
            commerce: self.commerce.state(),
            chat: self.chat.state(),
        }
    }

    /// Starts a session: builds the reconcilers, routes commerce pushes to them and connects both channels.
    /// Logging in while someone else is logged in logs them out first.
    pub async fn login(&self, session: Session) -> ChannelStates {
        if self.scope.borrow().is_some() {
            self.logout();
        }
        log::info!("Logging in {}", session.user_id);

        let scope = Rc::new(self.open_scope(session));
        self.route_commerce(&scope);
        let token = scope.token();
        *self.scope.borrow_mut() = Some(scope);

        self.connect_all(&token).await
    }

    /// Ends the session. Both channels close and every subscription on them is dropped.
    pub fn logout(&self) {
        let scope = self.scope.borrow_mut().take();
        if let Some(scope) = scope {
            log::info!("Logging out {}", scope.user_id());
        }
        self.commerce.disconnect();
        self.chat.disconnect();
    }

    /// Swaps in a fresh token, e.g. after a channel failed with `AuthRejected`, and reconnects.
    pub async fn refresh_token(&self, token: &str) -> Result<ChannelStates, StorefrontError> {
        let scope = self.require_scope()?;
        {
            let mut session = scope.session.borrow_mut();
            *session = Session::new(session.user_id.clone(), token);
        }
        Ok(self.connect_all(token).await)
    }

    /// Tries again after the channels gave up (`RetriesExhausted`). Connected channels are left alone.
    pub async fn reconnect(&self) -> Result<ChannelStates, StorefrontError> {
        let scope = self.require_scope()?;
        Ok(self.connect_all(&scope.token()).await)
    }

    pub async fn add_to_cart(&self, item_id: &str, qty: u32) -> Result<Cart, StorefrontError> {
        let scope = self.require_scope()?;
        let token = scope.token();
        Ok(scope.cart.add_item(&token, item_id, qty).await?)
    }

    pub async fn toggle_favorite(&self, product_id: &str) -> Result<Favorite, StorefrontError> {
        let scope = self.require_scope()?;
        let token = scope.token();
        Ok(scope.favorites.toggle(&token, product_id).await?)
    }

    pub async fn pay_with_balance(
        &self,
        order_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentReceipt, StorefrontError> {
        let scope = self.require_scope()?;
        let token = scope.token();
        let receipt = scope.balance.pay(&token, order_id, amount_cents).await?;
        if let Err(e) = scope.orders.apply_push(&receipt.order) {
            log::error!("Payment receipt carried an unusable order: {e}");
        }
        Ok(receipt)
    }

    pub fn subscribe_commerce(
        &self,
        topic: CommerceTopic,
        handler: impl Fn(&CommerceEvent) -> HandlerResult + 'static,
    ) -> SubscriptionHandle {
        self.commerce.router().subscribe(topic, handler)
    }

    pub fn subscribe_chat(
        &self,
        topic: ChatTopic,
        handler: impl Fn(&ChatEvent) -> HandlerResult + 'static,
    ) -> SubscriptionHandle {
        self.chat.router().subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        match handle.channel {
            COMMERCE => self.commerce.router().unsubscribe(handle),
            CHAT => self.chat.router().unsubscribe(handle),
            other => {
                log::warn!("Unsubscribe for unknown channel {other}");
                false
            }
        }
    }

    pub fn send_chat(&self, event: &ChatEvent) -> Result<(), StorefrontError> {
        self.require_scope()?;
        Ok(self.chat.send(event)?)
    }

    pub fn on_connection_change(
        &self,
        listener: impl Fn(ChannelId, ConnectionState) + 'static,
    ) -> ConnectionListener {
        let listener = Rc::new(listener);
        let commerce = self.commerce.on_state_change({
            let listener = listener.clone();
            move |state| listener(COMMERCE, state)
        });
        let chat = self
            .chat
            .on_state_change(move |state| listener(CHAT, state));
        ConnectionListener { commerce, chat }
    }

    pub fn remove_connection_listener(&self, listener: ConnectionListener) {
        self.commerce.remove_state_listener(listener.commerce);
        self.chat.remove_state_listener(listener.chat);
    }

    async fn connect_all(&self, token: &str) -> ChannelStates {
        let (commerce, chat) =
            futures::join!(self.commerce.connect(token), self.chat.connect(token));
        ChannelStates { commerce, chat }
    }

    fn open_scope(&self, session: Session) -> SessionScope {
        let context = ReconcilerContext {
            cache: self.cache.clone(),
            api: self.services.api.clone(),
            timer: self.services.timer.clone(),
            user_id: session.user_id.clone(),
            request_timeout: self.config.request_timeout(),
            cache_ttl: self.config.cache_ttl(),
            push_queue_limit: self.config.push_queue_limit,
        };
        SessionScope {
            session: RefCell::new(session),
            cart: Rc::new(CartReconciler::new(context.clone())),
            favorites: Rc::new(FavoriteReconciler::new(context.clone())),
            balance: Rc::new(BalanceReconciler::new(context.clone())),
            orders: Rc::new(OrdersReconciler::new(context)),
        }
    }

    /// These subscriptions go away with the channel's other subscriptions on logout.
    fn route_commerce(&self, scope: &SessionScope) {
        let router = self.commerce.router();

        let cart = scope.cart.clone();
        router.subscribe(CommerceTopic::CartUpdated, move |event| {
            if let CommerceEvent::CartUpdated(update) = event {
                cart.apply_push(update)?;
            }
            Ok(())
        });

        let favorites = scope.favorites.clone();
        router.subscribe(CommerceTopic::FavoriteUpdated, move |event| {
            if let CommerceEvent::FavoriteUpdated(update) = event {
                favorites.apply_push(update)?;
            }
            Ok(())
        });

        let balance = scope.balance.clone();
        router.subscribe(CommerceTopic::BalanceUpdated, move |event| {
            if let CommerceEvent::BalanceUpdated(update) = event {
                balance.apply_push(update)?;
            }
            Ok(())
        });

        let orders = scope.orders.clone();
        router.subscribe(CommerceTopic::OrderUpdated, move |event| {
            if let CommerceEvent::OrderUpdated(order) = event {
                orders.apply_push(order)?;
            }
            Ok(())
        });
    }
}

impl Drop for Storefront {
    fn drop(&mut self) {
        self.logout();
    }
}
