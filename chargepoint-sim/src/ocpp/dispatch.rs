//! Dispatch of central-system initiated calls
//!
//! The [`Registry`] maps each inbound [`Action`] to a handler and an optional
//! async payload transform. `TriggerMessage` and `ExtendedTriggerMessage` go
//! through a second table keyed by their `requestedMessage`; when that lookup
//! fails the registry answers `{"status": "NotImplemented"}` itself.
//!
//! Handlers run in their own task. Errors and panics are logged there and
//! never reach the transport loop.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::messages::{Action, Call, OcppError};
use super::types::MessageTrigger;

/// Error type returned by handlers and transforms
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), BoxError>;

/// Context handed to every handler; it can answer the call it received
pub trait Responder: Clone + Send + Sync + 'static {
    fn identity(&self) -> &str;

    fn send_result(&self, message_id: &str, payload: Value) -> Result<(), OcppError>;
}

/// Stored form of a handler
pub trait CallHandler<C>: Send + Sync + 'static {
    fn call(&self, ctx: C, call: Call) -> BoxFuture<'static, HandlerResult>;
}

impl<C, F, Fut> CallHandler<C> for F
where
    F: Fn(C, Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: C, call: Call) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(ctx, call))
    }
}

/// Rewrites a payload before the handler sees it
#[async_trait]
pub trait PayloadTransform: Send + Sync + 'static {
    async fn transform(&self, action: Action, payload: Value) -> Result<Value, BoxError>;
}

struct HandlerEntry<C> {
    handler: Arc<dyn CallHandler<C>>,
    transform: Option<Arc<dyn PayloadTransform>>,
}

impl<C> Clone for HandlerEntry<C> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            transform: self.transform.clone(),
        }
    }
}

/// Outcome of [`Registry::dispatch`]
#[derive(Debug)]
pub enum Dispatch {
    /// A handler was found and is running in this task
    Spawned(JoinHandle<()>),
    /// Nothing registered for the action; no reply was sent
    Unregistered,
    /// Trigger with no matching sub-handler; `NotImplemented` was sent
    TriggerFallback,
}

/// Action → handler table for one charge point
pub struct Registry<C> {
    handlers: RwLock<HashMap<Action, HandlerEntry<C>>>,
    triggers: RwLock<HashMap<(Action, MessageTrigger), Arc<dyn CallHandler<C>>>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            triggers: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Responder> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an inbound action; the last registration wins
    pub fn register<F, Fut>(
        &self,
        action: Action,
        handler: F,
        transform: Option<Arc<dyn PayloadTransform>>,
    ) -> Result<(), OcppError>
    where
        F: Fn(C, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if action.is_trigger() {
            return Err(OcppError::InvalidRegistration(format!(
                "{} handlers are registered per requested message",
                action
            )));
        }
        if !action.is_inbound() {
            return Err(OcppError::UnexpectedDirection(action));
        }

        let replaced = self
            .handlers
            .write()
            .insert(
                action,
                HandlerEntry {
                    handler: Arc::new(handler),
                    transform,
                },
            )
            .is_some();
        debug!("Registered handler for {} (replaced: {})", action, replaced);
        Ok(())
    }

    /// Register the handler for one requested message of a trigger action
    pub fn register_trigger<F, Fut>(
        &self,
        trigger: Action,
        requested: MessageTrigger,
        handler: F,
    ) -> Result<(), OcppError>
    where
        F: Fn(C, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if !trigger.is_trigger() {
            return Err(OcppError::InvalidRegistration(format!(
                "{} is not a trigger action",
                trigger
            )));
        }

        self.triggers
            .write()
            .insert((trigger, requested), Arc::new(handler));
        debug!("Registered {} handler for {}", trigger, requested);
        Ok(())
    }

    pub fn is_registered(&self, action: Action) -> bool {
        self.handlers.read().contains_key(&action)
    }

    pub fn is_trigger_registered(&self, trigger: Action, requested: MessageTrigger) -> bool {
        self.triggers.read().contains_key(&(trigger, requested))
    }

    /// Route an inbound call to its handler
    pub fn dispatch(&self, ctx: C, call: Call) -> Dispatch {
        if call.action.is_trigger() {
            return self.dispatch_trigger(ctx, call);
        }

        let entry = self.handlers.read().get(&call.action).cloned();
        match entry {
            Some(entry) => Dispatch::Spawned(spawn_handler(ctx, call, entry.handler, entry.transform)),
            None => Dispatch::Unregistered,
        }
    }

    fn dispatch_trigger(&self, ctx: C, call: Call) -> Dispatch {
        let requested = call
            .payload
            .get("requestedMessage")
            .and_then(Value::as_str)
            .and_then(|name| name.parse::<MessageTrigger>().ok());

        let handler = requested.and_then(|requested| {
            self.triggers
                .read()
                .get(&(call.action, requested))
                .cloned()
        });

        if let Some(handler) = handler {
            return Dispatch::Spawned(spawn_handler(ctx, call, handler, None));
        }

        warn!(
            "[{}] No {} handler for {}, answering NotImplemented",
            ctx.identity(),
            call.action,
            call.payload.get("requestedMessage").unwrap_or(&serde_json::Value::Null)
        );
        if let Err(e) = ctx.send_result(&call.message_id, json!({"status": "NotImplemented"})) {
            warn!(
                "[{}] Could not answer {} ({}): {}",
                ctx.identity(),
                call.action,
                call.message_id,
                e
            );
        }
        Dispatch::TriggerFallback
    }
}

fn spawn_handler<C: Responder>(
    ctx: C,
    call: Call,
    handler: Arc<dyn CallHandler<C>>,
    transform: Option<Arc<dyn PayloadTransform>>,
) -> JoinHandle<()> {
    let identity = ctx.identity().to_string();
    let action = call.action;
    let message_id = call.message_id.clone();

    tokio::spawn(async move {
        let work = async move {
            let mut call = call;
            if let Some(transform) = transform {
                let payload = std::mem::take(&mut call.payload);
                call.payload = transform.transform(call.action, payload).await?;
            }
            handler.call(ctx, call).await
        };

        // catch_unwind: a panicking handler must not take the connection down
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => debug!("[{}] Handled {} ({})", identity, action, message_id),
            Ok(Err(e)) => error!(
                "[{}] Handler for {} ({}) failed: {}",
                identity, action, message_id, e
            ),
            Err(_) => error!(
                "[{}] Handler for {} ({}) panicked",
                identity, action, message_id
            ),
        }
    })
}
