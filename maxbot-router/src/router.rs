//! # Router tree
//!
//! A [`Router`] holds handlers per update kind plus shared filters, middleware,
//! metadata and error handlers, and owns child routers. Dispatch walks the tree
//! depth-first: local handlers first, then children in inclusion order. The first
//! handler whose filters all accept runs; nothing else does.
//!
//! Routers are shared handles; registering on a clone registers on the same node.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::BoxFuture;
use maxbot_core::{MaxbotError, Result, UpdateType};
use tracing::{debug, info, instrument, warn};

use crate::context::{Context, Meta};
use crate::filters::{self, Filter};
use crate::handler::{self, ErrorHandler, Handler, MetaResolver, Middleware};

/// Which updates a handler observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observer {
    Any,
    Kind(UpdateType),
}

impl Observer {
    pub fn matches(&self, update_type: UpdateType) -> bool {
        match self {
            Observer::Any => true,
            Observer::Kind(kind) => *kind == update_type,
        }
    }
}

impl From<UpdateType> for Observer {
    fn from(kind: UpdateType) -> Self {
        Observer::Kind(kind)
    }
}

struct Route {
    observer: Observer,
    filters: Vec<Filter>,
    handler: Handler,
}

#[derive(Clone)]
struct RouterState {
    name: String,
    routes: Vec<Arc<Route>>,
    middlewares: Vec<Middleware>,
    filters: Vec<Filter>,
    meta: Meta,
    meta_resolvers: Vec<MetaResolver>,
    error_handlers: Vec<ErrorHandler>,
    children: Vec<Router>,
}

/// Middleware, filters and error handlers accumulated from the root down.
#[derive(Clone, Default)]
struct Layers {
    middlewares: Vec<Middleware>,
    filters: Vec<Filter>,
    error_handlers: Vec<ErrorHandler>,
}

impl Layers {
    fn extend(&self, state: &RouterState) -> Layers {
        let mut layers = self.clone();
        layers.middlewares.extend(state.middlewares.iter().cloned());
        layers.filters.extend(state.filters.iter().cloned());
        layers
            .error_handlers
            .extend(state.error_handlers.iter().cloned());
        layers
    }
}

#[derive(Clone)]
pub struct Router {
    state: Arc<RwLock<RouterState>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("name", &self.name()).finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::named("router")
    }
}

macro_rules! observer_methods {
    ($($kind:expr => $plain:ident, $with:ident, $first:ident, $first_with:ident;)*) => {
        $(
            pub fn $plain<F, Fut>(&self, f: F) -> &Self
            where
                F: Fn(Context) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<()>> + Send + 'static,
            {
                self.register($kind, Vec::new(), handler::handler(f), false)
            }

            pub fn $with<F, Fut>(&self, filters: impl IntoIterator<Item = Filter>, f: F) -> &Self
            where
                F: Fn(Context) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<()>> + Send + 'static,
            {
                self.register($kind, filters.into_iter().collect(), handler::handler(f), false)
            }

            pub fn $first<F, Fut>(&self, f: F) -> &Self
            where
                F: Fn(Context) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<()>> + Send + 'static,
            {
                self.register($kind, Vec::new(), handler::handler(f), true)
            }

            pub fn $first_with<F, Fut>(
                &self,
                filters: impl IntoIterator<Item = Filter>,
                f: F,
            ) -> &Self
            where
                F: Fn(Context) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<()>> + Send + 'static,
            {
                self.register($kind, filters.into_iter().collect(), handler::handler(f), true)
            }
        )*
    };
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with a name used in logs.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RouterState {
                name: name.into(),
                routes: Vec::new(),
                middlewares: Vec::new(),
                filters: Vec::new(),
                meta: Meta::new(),
                meta_resolvers: Vec::new(),
                error_handlers: Vec::new(),
                children: Vec::new(),
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RouterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    /// True when both handles point at the same router.
    pub fn same_as(&self, other: &Router) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn children(&self) -> Vec<Router> {
        self.read().children.clone()
    }

    /// True when `target` is somewhere below this router.
    pub fn has_descendant(&self, target: &Router) -> bool {
        self.children()
            .iter()
            .any(|child| child.same_as(target) || child.has_descendant(target))
    }

    /// Appends middleware; earlier (and ancestor) middleware wraps later middleware.
    pub fn use_middleware(&self, middleware: Middleware) -> &Self {
        self.write().middlewares.push(middleware);
        self
    }

    /// Filters checked before every handler in this router and its descendants.
    pub fn use_filter(&self, filters: impl IntoIterator<Item = Filter>) -> &Self {
        self.write().filters.extend(filters);
        self
    }

    /// Static metadata merged into the context when dispatch enters this router.
    pub fn set_meta(&self, patch: Meta) -> &Self {
        self.write().meta.extend(patch);
        self
    }

    /// Dynamic metadata; resolvers run in registration order after static metadata,
    /// later keys overriding earlier ones.
    pub fn use_meta<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Meta>> + Send + 'static,
    {
        let resolver: MetaResolver =
            Arc::new(move |ctx: Context| -> BoxFuture<'static, Result<Meta>> { Box::pin(f(ctx)) });
        self.write().meta_resolvers.push(resolver);
        self
    }

    /// Error handlers are consulted newest first.
    pub fn on_error<F>(&self, f: F) -> &Self
    where
        F: for<'a> Fn(&'a MaxbotError, Context) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        self.write().error_handlers.push(Arc::new(f));
        self
    }

    /// Inserts at the front of the list, so this handler is consulted last.
    pub fn on_error_first<F>(&self, f: F) -> &Self
    where
        F: for<'a> Fn(&'a MaxbotError, Context) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        self.write().error_handlers.insert(0, Arc::new(f));
        self
    }

    /// Attaches `child`. Including a router into itself or into one of its own
    /// descendants is an error; including an attached child again does nothing.
    pub fn include_router(&self, child: &Router) -> Result<&Self> {
        if self.same_as(child) {
            return Err(MaxbotError::Router(
                "cannot include router into itself".to_string(),
            ));
        }
        if self.children().iter().any(|c| c.same_as(child)) {
            return Ok(self);
        }
        if child.has_descendant(self) {
            return Err(MaxbotError::Router(
                "cyclic router include detected".to_string(),
            ));
        }
        debug!(parent = %self.name(), child = %child.name(), "Router included");
        self.write().children.push(child.clone());
        Ok(self)
    }

    /// Registers a prepared handler for `observer`. `first` puts it ahead of the
    /// handlers already registered.
    pub fn register(
        &self,
        observer: impl Into<Observer>,
        filters: Vec<Filter>,
        handler: Handler,
        first: bool,
    ) -> &Self {
        let route = Arc::new(Route {
            observer: observer.into(),
            filters,
            handler,
        });
        let mut state = self.write();
        if first {
            state.routes.insert(0, route);
        } else {
            state.routes.push(route);
        }
        drop(state);
        self
    }

    observer_methods! {
        Observer::Any => any, any_with, any_first, any_first_with;
        UpdateType::Message => message, message_with, message_first, message_first_with;
        UpdateType::EditedMessage => edited_message, edited_message_with, edited_message_first, edited_message_first_with;
        UpdateType::ChannelPost => channel_post, channel_post_with, channel_post_first, channel_post_first_with;
        UpdateType::EditedChannelPost => edited_channel_post, edited_channel_post_with, edited_channel_post_first, edited_channel_post_first_with;
        UpdateType::InlineQuery => inline_query, inline_query_with, inline_query_first, inline_query_first_with;
        UpdateType::ChosenInlineResult => chosen_inline_result, chosen_inline_result_with, chosen_inline_result_first, chosen_inline_result_first_with;
        UpdateType::CallbackQuery => callback_query, callback_query_with, callback_query_first, callback_query_first_with;
        UpdateType::ShippingQuery => shipping_query, shipping_query_with, shipping_query_first, shipping_query_first_with;
        UpdateType::PreCheckoutQuery => pre_checkout_query, pre_checkout_query_with, pre_checkout_query_first, pre_checkout_query_first_with;
        UpdateType::Poll => poll, poll_with, poll_first, poll_first_with;
        UpdateType::PollAnswer => poll_answer, poll_answer_with, poll_answer_first, poll_answer_first_with;
        UpdateType::MyChatMember => my_chat_member, my_chat_member_with, my_chat_member_first, my_chat_member_first_with;
        UpdateType::ChatMember => chat_member, chat_member_with, chat_member_first, chat_member_first_with;
        UpdateType::ChatJoinRequest => chat_join_request, chat_join_request_with, chat_join_request_first, chat_join_request_first_with;
    }

    /// Routes one update through this tree. Returns whether a handler (or an error
    /// handler) took it; unhandled errors are returned to the caller.
    #[instrument(skip(self, ctx), fields(update_id = ctx.update_id(), update_type = %ctx.update_type()))]
    pub async fn dispatch(&self, ctx: Context) -> Result<bool> {
        self.dispatch_scoped(ctx, &Layers::default()).await
    }

    fn dispatch_scoped<'a>(
        &'a self,
        ctx: Context,
        inherited: &'a Layers,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let state = self.read().clone();
            let layers = inherited.extend(&state);

            let scoped = match resolve_meta(&state, &ctx).await {
                Ok(meta) => ctx.with_meta(meta),
                Err(e) => return recover(&state.name, e, &layers, &ctx).await,
            };

            match run_local(&state, &layers, &scoped).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => return recover(&state.name, e, &layers, &scoped).await,
            }

            // Errors from children were already offered to every handler in `layers`.
            for child in &state.children {
                if child.dispatch_scoped(scoped.clone(), &layers).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }
}

async fn resolve_meta(state: &RouterState, ctx: &Context) -> Result<Meta> {
    let mut meta = state.meta.clone();
    for resolver in &state.meta_resolvers {
        meta.extend(resolver(ctx.clone()).await?);
    }
    Ok(meta)
}

async fn run_local(state: &RouterState, layers: &Layers, ctx: &Context) -> Result<bool> {
    let update_type = ctx.update_type();
    for (index, route) in state.routes.iter().enumerate() {
        if !route.observer.matches(update_type) {
            continue;
        }
        if !filters::run_all(&layers.filters, ctx).await? {
            continue;
        }
        if !filters::run_all(&route.filters, ctx).await? {
            continue;
        }

        debug!(
            router = %state.name,
            route = index,
            update_id = ctx.update_id(),
            chat_id = ?ctx.chat_id(),
            "step: handler matched"
        );
        let handler = handler::chain(route.handler.clone(), &layers.middlewares);
        handler(ctx.clone()).await?;
        return Ok(true);
    }
    Ok(false)
}

/// Offers `error` to the error handlers, innermost and newest first.
async fn recover(router: &str, error: MaxbotError, layers: &Layers, ctx: &Context) -> Result<bool> {
    for error_handler in layers.error_handlers.iter().rev() {
        if error_handler(&error, ctx.clone()).await {
            info!(
                router = %router,
                update_id = ctx.update_id(),
                error = %error,
                "step: error handled"
            );
            return Ok(true);
        }
    }
    warn!(
        router = %router,
        update_id = ctx.update_id(),
        error = %error,
        "step: error not handled"
    );
    Err(error)
}
