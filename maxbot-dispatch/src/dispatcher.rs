//! # Dispatcher
//!
//! Orchestration root: owns the router tree, the FSM store and the processing
//! policy, runs the long-polling loop and the startup/shutdown lifecycle.
//!
//! An update passes through, in order: the stopping check, the per-key ordering
//! queue, the `max_in_flight` semaphore, router dispatch (under the optional
//! handler timeout) and finally the unhandled-update hooks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use maxbot_core::{
    Bot, FsmData, FsmStorage, GetUpdatesRequest, MaxbotError, MemoryStorage, Result, Update,
};
use maxbot_router::{Context, Router};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, warn, Instrument};

use crate::config::DispatcherConfig;
use crate::gate::{OrderingGate, Tracker, TrackerGuard, Turn};

/// Fallback for updates no router handler took. Returns `true` to claim the update.
pub type UnhandledHandler = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

pub type LifecycleHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How to stop: immediately, or after draining in-flight work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownOptions {
    pub graceful: bool,
    /// Drain limit; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ShutdownOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn graceful(timeout: Option<Duration>) -> Self {
        Self {
            graceful: true,
            timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub handled: usize,
    pub total: usize,
}

#[derive(Default)]
struct Hooks {
    startup: Vec<LifecycleHook>,
    shutdown: Vec<LifecycleHook>,
    unhandled: Vec<UnhandledHandler>,
}

struct PollingHandle {
    cancel: CancellationToken,
    done: watch::Receiver<()>,
    requested: Option<ShutdownOptions>,
}

/// Clears the polling slot when the loop exits; dropping the sender then wakes
/// `stop_long_polling`.
struct PollingGuard<'a> {
    slot: &'a Mutex<Option<PollingHandle>>,
    _done: watch::Sender<()>,
}

impl Drop for PollingGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

/// Resources an admitted update holds until it finishes.
struct Admission {
    fsm_key: Option<String>,
    order_key: Option<String>,
    turn: Option<Turn>,
    _pending: TrackerGuard,
}

struct Inner {
    bot: Arc<dyn Bot>,
    router: Router,
    storage: Arc<dyn FsmStorage>,
    config: DispatcherConfig,
    slots: Semaphore,
    ordering: Arc<OrderingGate>,
    tracker: Arc<Tracker>,
    stopping: AtomicBool,
    started: tokio::sync::Mutex<bool>,
    hooks: RwLock<Hooks>,
    polling: Mutex<Option<PollingHandle>>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Next polling offset after seeing `update_id`.
fn next_offset(offset: i64, update_id: i64) -> i64 {
    if update_id >= offset {
        update_id + 1
    } else {
        offset
    }
}

/// Sleeps for `duration`; returns false if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl Dispatcher {
    /// Dispatcher with an in-memory FSM store.
    pub fn new(bot: Arc<dyn Bot>, config: DispatcherConfig) -> Result<Self> {
        Self::with_storage(bot, Arc::new(MemoryStorage::new()), config)
    }

    pub fn with_storage(
        bot: Arc<dyn Bot>,
        storage: Arc<dyn FsmStorage>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            max_in_flight = config.processing.max_in_flight,
            ordered_by = %config.processing.ordered_by,
            fsm_strategy = %config.fsm_strategy,
            handler_timeout_ms = ?config.processing.handler_timeout_ms,
            "Dispatcher created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                bot,
                router: Router::named("root"),
                storage,
                slots: Semaphore::new(config.processing.max_in_flight),
                ordering: Arc::new(OrderingGate::default()),
                tracker: Arc::new(Tracker::default()),
                stopping: AtomicBool::new(false),
                started: tokio::sync::Mutex::new(false),
                hooks: RwLock::new(Hooks::default()),
                polling: Mutex::new(None),
                config,
            }),
        })
    }

    /// Root of the router tree; register handlers and include routers here.
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn include_router(&self, child: &Router) -> Result<&Self> {
        self.inner.router.include_router(child)?;
        Ok(self)
    }

    pub fn bot(&self) -> &Arc<dyn Bot> {
        &self.inner.bot
    }

    pub fn storage(&self) -> &Arc<dyn FsmStorage> {
        &self.inner.storage
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    fn hooks(&self) -> RwLockReadGuard<'_, Hooks> {
        self.inner.hooks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn hooks_mut(&self) -> RwLockWriteGuard<'_, Hooks> {
        self.inner.hooks.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_startup<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: LifecycleHook =
            Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(f()) });
        self.hooks_mut().startup.push(hook);
        self
    }

    pub fn on_shutdown<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: LifecycleHook =
            Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(f()) });
        self.hooks_mut().shutdown.push(hook);
        self
    }

    fn unhandled_handler<F, Fut>(f: F) -> UnhandledHandler
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        Arc::new(move |ctx: Context| -> BoxFuture<'static, Result<bool>> { Box::pin(f(ctx)) })
    }

    /// Appends a fallback for unhandled updates.
    pub fn on_unhandled<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.hooks_mut().unhandled.push(Self::unhandled_handler(f));
        self
    }

    /// Puts a fallback ahead of all registered ones.
    pub fn on_unhandled_first<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.hooks_mut()
            .unhandled
            .insert(0, Self::unhandled_handler(f));
        self
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.inner.polling).is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Updates currently holding a processing slot.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.in_flight()
    }

    /// Admitted updates not yet finished, including those still queued.
    pub fn pending(&self) -> usize {
        self.inner.tracker.pending()
    }

    /// FSM session key the configured strategy gives `update`.
    pub fn session_key(&self, update: &Update) -> Option<String> {
        self.inner.config.fsm_strategy.key_for(update)
    }

    fn admit(&self, update: &Update) -> Option<Admission> {
        if self.is_stopping() {
            debug!(update_id = update.update_id, "step: update rejected, dispatcher stopping");
            return None;
        }
        let pending = self.inner.tracker.pending_guard();
        let fsm_key = self.session_key(update);
        let order_key = self
            .inner
            .config
            .processing
            .ordered_by
            .key_for(update, fsm_key.as_deref());
        let turn = order_key.as_deref().map(|key| self.inner.ordering.enqueue(key));
        Some(Admission {
            fsm_key,
            order_key,
            turn,
            _pending: pending,
        })
    }

    /// Routes one update. Resolves to whether a handler or an unhandled hook took
    /// it; `false` as well when the dispatcher is stopping.
    ///
    /// The update takes its place in the ordering queue when this is called, not
    /// when the returned future is first polled.
    pub fn handle_update(&self, update: Update) -> impl Future<Output = Result<bool>> + Send + 'static {
        let dispatcher = self.clone();
        let admission = self.admit(&update);
        let span = debug_span!(
            "handle_update",
            update_id = update.update_id,
            update_type = %update.update_type()
        );
        async move {
            match admission {
                Some(admission) => dispatcher.process(update, admission).await,
                None => Ok(false),
            }
        }
        .instrument(span)
    }

    async fn process(&self, update: Update, mut admission: Admission) -> Result<bool> {
        if let Some(turn) = admission.turn.as_mut() {
            turn.wait().await;
        }
        let _permit = self
            .inner
            .slots
            .acquire()
            .await
            .map_err(|_| MaxbotError::Bot("dispatcher semaphore closed".to_string()))?;
        let _in_flight = self.inner.tracker.in_flight_guard();

        let ctx = Context::new(self.inner.bot.clone(), update)
            .with_session_key(self.inner.storage.clone(), admission.fsm_key.take());
        debug!(
            chat_id = ?ctx.chat_id(),
            user_id = ?ctx.user_id(),
            order_key = ?admission.order_key,
            in_flight = self.in_flight(),
            "step: dispatching update"
        );

        if self.dispatch_with_timeout(ctx.clone()).await? {
            return Ok(true);
        }
        self.run_unhandled(ctx).await
    }

    /// Router dispatch under `handler_timeout_ms`. On expiry the dispatch future
    /// is dropped, which cancels the handler at its next await point.
    async fn dispatch_with_timeout(&self, ctx: Context) -> Result<bool> {
        let dispatch = self.inner.router.dispatch(ctx);
        match self.inner.config.processing.handler_timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), dispatch).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(timeout_ms, "step: dispatch timed out");
                        Err(MaxbotError::DispatchTimeout { timeout_ms })
                    }
                }
            }
            None => dispatch.await,
        }
    }

    async fn run_unhandled(&self, ctx: Context) -> Result<bool> {
        let handlers = self.hooks().unhandled.clone();
        for handler in handlers {
            if handler(ctx.clone()).await? {
                debug!("step: unhandled update claimed by fallback");
                return Ok(true);
            }
        }
        debug!("step: update not handled");
        Ok(false)
    }

    /// Handles a batch one after another, or all at once when `concurrent`.
    ///
    /// Sequentially, the first error stops the batch. Concurrently, every update
    /// runs to completion and the first error in batch order is returned.
    pub async fn handle_updates(&self, updates: Vec<Update>, concurrent: bool) -> Result<BatchResult> {
        let total = updates.len();
        let handled = if concurrent {
            let pending: Vec<_> = updates.into_iter().map(|u| self.handle_update(u)).collect();
            let mut handled = 0;
            let mut first_error = None;
            for result in join_all(pending).await {
                match result {
                    Ok(true) => handled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "step: update in batch failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
            handled
        } else {
            let mut handled = 0;
            for update in updates {
                if self.handle_update(update).await? {
                    handled += 1;
                }
            }
            handled
        };
        debug!(handled, total, concurrent, "step: batch handled");
        Ok(BatchResult { handled, total })
    }

    /// Rejects new updates, then waits for admitted ones to finish. Returns
    /// whether everything drained before `timeout`.
    ///
    /// Awaiting this from inside a handler waits on that handler itself.
    pub async fn graceful_stop(&self, timeout: Option<Duration>) -> bool {
        self.inner.stopping.store(true, Ordering::SeqCst);
        info!(
            pending = self.pending(),
            in_flight = self.in_flight(),
            timeout_ms = ?timeout.map(|t| t.as_millis() as u64),
            "step: graceful stop requested"
        );
        let deadline = timeout.map(|t| Instant::now() + t);
        let drained = self.inner.tracker.wait_idle(deadline).await;
        if drained {
            info!("step: graceful stop drained");
        } else {
            warn!(
                pending = self.pending(),
                in_flight = self.in_flight(),
                "step: graceful stop timed out"
            );
        }
        drained
    }

    /// Runs startup hooks once. Calling again before [`Dispatcher::shutdown`]
    /// does nothing. Clears the stopping flag.
    pub async fn startup(&self) -> Result<()> {
        let mut started = self.inner.started.lock().await;
        if *started {
            return Ok(());
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        let hooks = self.hooks().startup.clone();
        for hook in &hooks {
            hook().await?;
        }
        *started = true;
        info!(hooks = hooks.len(), "step: dispatcher started");
        Ok(())
    }

    /// Runs shutdown hooks once per startup, after draining when `graceful`.
    /// Every hook runs; the first hook error is returned. Resolves to the drain
    /// result (`true` when not graceful or not started).
    pub async fn shutdown(&self, options: ShutdownOptions) -> Result<bool> {
        let mut started = self.inner.started.lock().await;
        if !*started {
            return Ok(true);
        }
        let drained = if options.graceful {
            self.graceful_stop(options.timeout).await
        } else {
            true
        };
        *started = false;

        let hooks = self.hooks().shutdown.clone();
        let mut first_error = None;
        for hook in &hooks {
            if let Err(e) = hook().await {
                error!(error = %e, "step: shutdown hook failed");
                first_error.get_or_insert(e);
            }
        }
        info!(hooks = hooks.len(), drained, "step: dispatcher shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(drained),
        }
    }

    fn default_shutdown(&self) -> ShutdownOptions {
        match self.inner.config.processing.graceful_shutdown_ms {
            Some(ms) => ShutdownOptions::graceful(Some(Duration::from_millis(ms))),
            None => ShutdownOptions::immediate(),
        }
    }

    /// Runs the long-polling loop until `cancel` fires, [`stop_long_polling`] is
    /// called, or a fetch fails with `recover_errors` off. Startup hooks run
    /// before the first fetch and shutdown hooks after the loop ends.
    ///
    /// Fails with [`MaxbotError::AlreadyRunning`] while another loop is active.
    ///
    /// [`stop_long_polling`]: Dispatcher::stop_long_polling
    pub async fn start_long_polling(&self, cancel: Option<CancellationToken>) -> Result<()> {
        let token = cancel.map(|c| c.child_token()).unwrap_or_default();
        let (done_tx, done_rx) = watch::channel(());
        {
            let mut slot = lock(&self.inner.polling);
            if slot.is_some() {
                return Err(MaxbotError::AlreadyRunning);
            }
            *slot = Some(PollingHandle {
                cancel: token.clone(),
                done: done_rx,
                requested: None,
            });
        }
        let _guard = PollingGuard {
            slot: &self.inner.polling,
            _done: done_tx,
        };

        self.startup().await?;
        info!(
            offset = self.inner.config.polling.offset,
            limit = self.inner.config.polling.limit,
            timeout_seconds = self.inner.config.polling.timeout_seconds,
            "step: long polling started"
        );
        let result = self.poll_loop(&token).await;

        let requested = lock(&self.inner.polling)
            .as_mut()
            .and_then(|handle| handle.requested.take());
        let shutdown = self
            .shutdown(requested.unwrap_or_else(|| self.default_shutdown()))
            .await;
        match &result {
            Ok(()) => info!("step: long polling stopped"),
            Err(e) => error!(error = %e, "step: long polling failed"),
        }
        result?;
        shutdown.map(|_| ())
    }

    /// Cancels the running loop and waits for it to finish, including its
    /// shutdown step run with `options`. Returns false when no loop is running.
    ///
    /// Must not be awaited from a handler the loop is running; cancel the token
    /// passed to [`Dispatcher::start_long_polling`] instead.
    pub async fn stop_long_polling(&self, options: ShutdownOptions) -> bool {
        let mut done = {
            let mut slot = lock(&self.inner.polling);
            let Some(handle) = slot.as_mut() else {
                return false;
            };
            handle.requested = Some(options);
            handle.cancel.cancel();
            handle.done.clone()
        };
        info!(graceful = options.graceful, "step: stopping long polling");
        // Only ever closed, never written: resolves when the loop drops its sender.
        let _ = done.changed().await;
        true
    }

    async fn poll_loop(&self, cancel: &CancellationToken) -> Result<()> {
        let polling = &self.inner.config.polling;
        let mut offset = polling.offset;
        if polling.drop_pending_updates {
            match self.drop_pending(offset, cancel).await? {
                Some(next) => offset = next,
                None => return Ok(()),
            }
        }

        let idle_delay = Duration::from_millis(polling.idle_delay_ms);
        let mut error_delay_ms = polling.error_delay_ms;
        loop {
            if cancel.is_cancelled() || self.is_stopping() {
                break;
            }
            let request = GetUpdatesRequest {
                offset,
                limit: polling.limit,
                timeout: polling.timeout_seconds,
            };
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.inner.bot.get_updates(&request) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => {
                    error_delay_ms = polling.error_delay_ms;
                    batch
                }
                Err(e) if polling.recover_errors => {
                    warn!(error = %e, retry_in_ms = error_delay_ms, "step: fetching updates failed, retrying");
                    if !sleep_or_cancel(Duration::from_millis(error_delay_ms), cancel).await {
                        break;
                    }
                    error_delay_ms = error_delay_ms
                        .saturating_mul(2)
                        .min(polling.max_error_delay_ms);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if batch.is_empty() {
                if !sleep_or_cancel(idle_delay, cancel).await {
                    break;
                }
                continue;
            }

            debug!(
                count = batch.updates.len(),
                skipped = batch.skipped.len(),
                offset,
                "step: updates received"
            );
            for update_id in &batch.skipped {
                offset = next_offset(offset, *update_id);
            }
            for update in batch.updates {
                offset = next_offset(offset, update.update_id);
                self.handle_update(update).await?;
            }
        }
        Ok(())
    }

    /// Skips the backlog: fetches with a zero timeout until an empty batch and
    /// returns the offset past it. `None` when cancelled meanwhile.
    async fn drop_pending(&self, mut offset: i64, cancel: &CancellationToken) -> Result<Option<i64>> {
        let polling = &self.inner.config.polling;
        let mut dropped = 0usize;
        loop {
            let request = GetUpdatesRequest {
                offset,
                limit: polling.limit,
                timeout: 0,
            };
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                fetched = self.inner.bot.get_updates(&request) => fetched?,
            };
            if batch.is_empty() {
                info!(dropped, offset, "step: pending updates dropped");
                return Ok(Some(offset));
            }
            dropped += batch.len();
            let ids = batch.updates.iter().map(|u| u.update_id).chain(batch.skipped);
            for update_id in ids {
                offset = next_offset(offset, update_id);
            }
        }
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        self.inner.storage.get(key).await
    }

    pub async fn set_state(&self, key: &str, state: &str) -> Result<()> {
        self.inner.storage.set(key, state).await
    }

    pub async fn clear_state(&self, key: &str) -> Result<()> {
        self.inner.storage.clear(key).await
    }

    pub async fn get_data(&self, key: &str) -> Result<FsmData> {
        self.inner.storage.get_data(key).await
    }

    pub async fn set_data(&self, key: &str, data: FsmData) -> Result<()> {
        self.inner.storage.set_data(key, data).await
    }

    pub async fn update_data(&self, key: &str, patch: FsmData) -> Result<FsmData> {
        self.inner.storage.update_data(key, patch).await
    }

    pub async fn clear_data(&self, key: &str) -> Result<()> {
        self.inner.storage.clear_data(key).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("polling", &self.is_polling())
            .field("stopping", &self.is_stopping())
            .field("pending", &self.pending())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
