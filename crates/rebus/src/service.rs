//! The RES service: handler registration, serving, and the system lifecycle.
//!
//! A [`Service`] is configured during a setup phase (`handle`, `set_reset`)
//! and then connected to a bus with [`serve`](Service::serve) or
//! [`listen_and_serve`](Service::listen_and_serve). Once serving, the
//! routing table is immutable; runtime operations (`with`, `token_event`,
//! `reset`) enqueue work through the running engine.
//!
//! All outbound traffic flows through a single outbox channel drained by one
//! writer task, so the relative order in which a handler emits pre-responses,
//! events and its terminal response is exactly the order they reach the bus.

use crate::bus::{Bus, BusError, BusMessage};
use crate::error::{panic_message, Error, RegistrationError, ServeError, ServiceError};
use crate::handler::{
    AccessHandlerFn, AuthHandlerFn, CallHandlerFn, GetHandlerFn, Handler, HandlerSet,
};
use crate::pattern::PatternMap;
use crate::request::{
    encode_error, AccessRequest, AuthRequest, CallRequest, GetRequest, RequestCore,
    RequestEnvelope, Resource, TokenPayload,
};
use crate::subject::{self, RequestKind};
use crate::worker::{Unit, WorkerPool};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default idle interval after which a worker retires.
pub const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// An outbound bus message queued on the service outbox.
pub(crate) struct Outgoing {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Sending half of the service outbox.
pub(crate) type Outbox = mpsc::UnboundedSender<Outgoing>;

#[derive(Default)]
struct ResetConfig {
    resources: Option<Vec<String>>,
    access: Option<Vec<String>>,
}

struct RunState {
    outbox: Outbox,
    pool: WorkerPool,
    shutdown: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Serialize)]
struct ResetPayload {
    resources: Option<Vec<String>>,
    access: Option<Vec<String>>,
}

#[derive(Serialize)]
struct TokenResetPayload<'a> {
    tids: &'a [&'a str],
    subject: &'a str,
}

/// A RES service exposing resources over a message bus.
///
/// # Example
///
/// ```no_run
/// use rebus::{Handler, Service};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut service = Service::new("example")?;
/// service.handle(
///     "greeting",
///     Handler::new()
///         .access_granted()
///         .model_get(|r| r.model(&json!({"message": "Hello, world"}))),
/// )?;
/// service.listen_and_serve("nats://127.0.0.1:4222").await?;
/// # Ok(())
/// # }
/// ```
pub struct Service {
    name: Arc<str>,
    patterns: PatternMap,
    has_access: bool,
    worker_idle_timeout: Duration,
    reset: Mutex<ResetConfig>,
    run: Mutex<Option<RunState>>,
}

impl Service {
    /// Create a service with the given name. The name is used as the
    /// implicit prefix of every registered pattern and of the subjects the
    /// service subscribes to.
    pub fn new(name: &str) -> Result<Self, RegistrationError> {
        if !subject::is_valid_service_name(name) {
            return Err(RegistrationError::InvalidServiceName(name.to_string()));
        }
        Ok(Self {
            name: Arc::from(name),
            patterns: PatternMap::default(),
            has_access: false,
            worker_idle_timeout: DEFAULT_WORKER_IDLE_TIMEOUT,
            reset: Mutex::new(ResetConfig::default()),
            run: Mutex::new(None),
        })
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler under a pattern. The service name is prepended,
    /// so `handle("model", ...)` on service `test` serves `test.model`.
    ///
    /// All registration errors, including deferred builder errors, are
    /// surfaced here, before the service starts serving.
    pub fn handle(&mut self, pattern: &str, handler: Handler) -> Result<(), RegistrationError> {
        let full = format!("{}.{}", self.name, pattern);
        let set = HandlerSet::build(handler, &full)?;
        if set.access.is_some() {
            self.has_access = true;
        }
        self.patterns.add(set)
    }

    /// Set the idle interval after which a worker with no queued work
    /// retires.
    pub fn set_worker_idle_timeout(&mut self, timeout: Duration) {
        self.worker_idle_timeout = timeout;
    }

    /// Set the resource and access patterns announced in the `system.reset`
    /// broadcast. `None` falls back to the defaults: `["<name>.>"]` for
    /// resources, and the same for access when any access handler is
    /// registered.
    ///
    /// When the service is serving, a new `system.reset` is published
    /// immediately.
    pub fn set_reset(&self, resources: Option<Vec<String>>, access: Option<Vec<String>>) {
        {
            let mut cfg = self.reset.lock().unwrap();
            cfg.resources = resources;
            cfg.access = access;
        }
        if let Some(outbox) = self.outbox() {
            self.send_reset(&outbox);
        }
    }

    /// Republish the current `system.reset` broadcast.
    pub fn reset(&self) -> Result<(), ServiceError> {
        let outbox = self.outbox().ok_or(ServiceError::NotServing)?;
        self.send_reset(&outbox);
        Ok(())
    }

    /// Publish a connection token event on `conn.<cid>.token`, setting or
    /// clearing (`None`) the connection's access token.
    ///
    /// # Panics
    ///
    /// Panics if `cid` is not a valid connection ID.
    pub fn token_event(&self, cid: &str, token: Option<Value>) -> Result<(), ServiceError> {
        if !subject::is_valid_cid(cid) {
            panic!("invalid connection ID: {}", cid);
        }
        let outbox = self.outbox().ok_or(ServiceError::NotServing)?;
        send(
            &outbox,
            format!("conn.{}.token", cid),
            encode(&TokenPayload { token: &token }),
        );
        Ok(())
    }

    /// Publish a `system.tokenReset` event, requesting new auth requests on
    /// `subject` for every connection whose token ID is in `tids`.
    pub fn token_reset(&self, subject: &str, tids: &[&str]) -> Result<(), ServiceError> {
        let outbox = self.outbox().ok_or(ServiceError::NotServing)?;
        if tids.is_empty() {
            return Ok(());
        }
        send(
            &outbox,
            "system.tokenReset".to_string(),
            encode(&TokenResetPayload { tids, subject }),
        );
        Ok(())
    }

    /// Run `f` with a [`Resource`] handle for `rid`, on the worker owning
    /// the resource. The task is enqueued after all currently queued work
    /// for the same affinity key, which keeps event order consistent with
    /// in-flight requests. Calling `with` from a handler that owns the same
    /// key does not deadlock; the task runs when the current unit completes.
    pub fn with(
        &self,
        rid: &str,
        f: impl FnOnce(Resource) + Send + 'static,
    ) -> Result<(), ServiceError> {
        let (outbox, pool) = {
            let run = self.run.lock().unwrap();
            match &*run {
                Some(rs) => (rs.outbox.clone(), rs.pool.clone()),
                None => return Err(ServiceError::NotServing),
            }
        };
        let (name, query) = subject::split_query(rid);
        let Some(matched) = self.patterns.get(name) else {
            return Err(ServiceError::NoMatchingPattern(rid.to_string()));
        };
        let key = match &matched.handlers.group {
            Some(template) => template.apply(&matched.params),
            None => name.to_string(),
        };
        let resource = Resource {
            service: Arc::clone(&self.name),
            name: name.to_string(),
            query: query.map(str::to_string),
            params: matched.params,
            handlers: matched.handlers,
            outbox,
        };
        pool.enqueue(&key, Box::new(move || f(resource)));
        Ok(())
    }

    /// Connect to a NATS server and serve until stopped or until the
    /// connection fails.
    pub async fn listen_and_serve(&self, url: &str) -> Result<(), ServeError> {
        let bus = crate::nats::NatsBus::connect(url).await?;
        self.serve(Arc::new(bus)).await
    }

    /// Serve on an existing bus connection. Subscribes to the service's
    /// request subjects, publishes the `system.reset` broadcast, and blocks
    /// until [`stop`](Service::stop) is called or the bus fails.
    pub async fn serve(&self, bus: Arc<dyn Bus>) -> Result<(), ServeError> {
        if self.run.lock().unwrap().is_some() {
            return Err(ServeError::AlreadyServing);
        }

        let mut streams = Vec::with_capacity(4);
        for kind in ["access", "get", "call", "auth"] {
            let subj = format!("{}.{}.>", kind, self.name);
            streams.push(bus.subscribe(&subj).await?);
        }

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Outgoing>();
        let shutdown = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let pool = WorkerPool::new(self.worker_idle_timeout);

        {
            let mut run = self.run.lock().unwrap();
            if run.is_some() {
                return Err(ServeError::AlreadyServing);
            }
            *run = Some(RunState {
                outbox: outbox_tx.clone(),
                pool: pool.clone(),
                shutdown: shutdown.clone(),
                done: done_rx,
            });
        }

        // The reset broadcast is queued before any inbound message is read,
        // making it the first message the service publishes.
        self.send_reset(&outbox_tx);

        // A single writer drains the outbox, preserving emission order of
        // pre-responses, events and terminal responses on the bus.
        let writer_bus = Arc::clone(&bus);
        let writer_shutdown = shutdown.clone();
        let writer = tokio::spawn(async move {
            while let Some(out) = outbox_rx.recv().await {
                if let Err(err) = writer_bus.publish(&out.subject, out.payload).await {
                    error!(subject = %out.subject, "failed to publish: {}", err);
                    writer_shutdown.cancel();
                    return Err(err);
                }
            }
            Ok(())
        });

        info!(service = %self.name, "service started");

        let mut inbound = stream::select_all(streams);
        let mut bus_closed = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbound.next() => match msg {
                    Some(msg) => self.dispatch(msg, &outbox_tx, &pool),
                    None => {
                        bus_closed = true;
                        break;
                    }
                },
            }
        }

        // Drain: close the subscriptions, finish in-flight work, flush the
        // outbox, then report how serving ended.
        drop(inbound);
        self.run.lock().unwrap().take();
        pool.stop().await;
        drop(outbox_tx);
        let writer_result = writer.await;
        let _ = done_tx.send(true);
        info!(service = %self.name, "service stopped");

        match writer_result {
            Ok(Ok(())) if bus_closed => Err(ServeError::Bus(BusError::Connection(
                "connection closed".to_string(),
            ))),
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ServeError::Bus(err)),
            Err(err) => Err(ServeError::Bus(BusError::Connection(err.to_string()))),
        }
    }

    /// Stop the service: stop accepting requests, wait for in-flight
    /// handlers to complete, flush pending outbound messages and return once
    /// [`serve`](Service::serve) has finished. A no-op when not serving.
    ///
    /// Must not be called from inside a handler; the drain would wait for
    /// that handler to complete.
    pub async fn stop(&self) {
        let (shutdown, mut done) = {
            match &*self.run.lock().unwrap() {
                Some(rs) => (rs.shutdown.clone(), rs.done.clone()),
                None => return,
            }
        };
        shutdown.cancel();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn outbox(&self) -> Option<Outbox> {
        self.run.lock().unwrap().as_ref().map(|rs| rs.outbox.clone())
    }

    fn reset_payload(&self) -> ResetPayload {
        let cfg = self.reset.lock().unwrap();
        let default = || vec![format!("{}.>", self.name)];
        ResetPayload {
            resources: Some(cfg.resources.clone().unwrap_or_else(default)),
            access: match &cfg.access {
                Some(access) => Some(access.clone()),
                None if self.has_access => Some(default()),
                None => None,
            },
        }
    }

    fn send_reset(&self, outbox: &Outbox) {
        send(outbox, "system.reset".to_string(), encode(&self.reset_payload()));
    }

    fn dispatch(&self, msg: BusMessage, outbox: &Outbox, pool: &WorkerPool) {
        let Some(inbound) = subject::parse_inbound(&msg.subject) else {
            debug!(subject = %msg.subject, "ignoring message with unexpected subject");
            return;
        };
        let Some(reply) = msg.reply else {
            warn!(subject = %msg.subject, "ignoring request without reply subject");
            return;
        };

        let env: RequestEnvelope = if msg.payload.is_empty() {
            RequestEnvelope::default()
        } else {
            match serde_json::from_slice(&msg.payload) {
                Ok(env) => env,
                Err(err) => {
                    debug!(subject = %msg.subject, "malformed request payload: {}", err);
                    send(
                        outbox,
                        reply,
                        encode_error(&Error::internal_error(&err.to_string())),
                    );
                    return;
                }
            }
        };

        let Some(matched) = self.patterns.get(&inbound.rid) else {
            send(outbox, reply, encode_error(&Error::not_found()));
            return;
        };

        // Route to the concrete callback up front; the unit still goes
        // through the worker so replies keep per-resource order even for
        // unknown methods.
        let routed = match inbound.kind {
            RequestKind::Access => match &matched.handlers.access {
                Some(h) => Routed::Access(Arc::clone(h)),
                None => Routed::Error(Error::not_found()),
            },
            RequestKind::Get => match &matched.handlers.get {
                Some(h) => Routed::Get(Arc::clone(h)),
                None => Routed::Error(Error::not_found()),
            },
            RequestKind::Call => {
                let method = inbound.method.as_deref().unwrap_or_default();
                match matched.handlers.calls.get(method) {
                    Some(h) => Routed::Call(Arc::clone(h)),
                    None => Routed::Error(Error::method_not_found()),
                }
            }
            RequestKind::Auth => {
                let method = inbound.method.as_deref().unwrap_or_default();
                match matched.handlers.auths.get(method) {
                    Some(h) => Routed::Auth(Arc::clone(h)),
                    None => Routed::Error(Error::method_not_found()),
                }
            }
        };

        let key = match &matched.handlers.group {
            Some(template) => template.apply(&matched.params),
            None => inbound.rid.clone(),
        };

        let resource = Resource {
            service: Arc::clone(&self.name),
            name: inbound.rid,
            query: env.query.clone(),
            params: matched.params,
            handlers: matched.handlers,
            outbox: outbox.clone(),
        };

        pool.enqueue(&key, request_unit(resource, reply, env, inbound.method, routed));
    }
}

enum Routed {
    Access(AccessHandlerFn),
    Get(GetHandlerFn),
    Call(CallHandlerFn),
    Auth(AuthHandlerFn),
    Error(Error),
}

/// Build the worker unit executing one inbound request: invoke the handler,
/// convert panics to `system.internalError`, and guarantee exactly one
/// terminal response.
fn request_unit(
    resource: Resource,
    reply: String,
    env: RequestEnvelope,
    method: Option<String>,
    routed: Routed,
) -> Unit {
    Box::new(move || {
        let responded = Arc::new(AtomicBool::new(false));
        let rid = resource.rid();
        let reply_subject = reply.clone();
        let out = resource.clone();
        let core = RequestCore {
            resource,
            reply,
            env,
            method,
            responded: Arc::clone(&responded),
        };

        let result = catch_unwind(AssertUnwindSafe(move || match routed {
            Routed::Access(h) => h(AccessRequest { core }),
            Routed::Get(h) => h(GetRequest { core }),
            Routed::Call(h) => h(CallRequest { core }),
            Routed::Auth(h) => h(AuthRequest { core }),
            Routed::Error(err) => core.reply_error(err),
        }));

        match result {
            Ok(()) => {
                if !responded.load(Ordering::SeqCst) {
                    error!(%rid, "handler returned without a response");
                    out.send_raw(
                        reply_subject,
                        encode_error(&Error::internal_error("no response from handler")),
                    );
                }
            }
            Err(payload) => {
                let message = panic_message(payload);
                error!(%rid, "handler failed: {}", message);
                if !responded.load(Ordering::SeqCst) {
                    out.send_raw(reply_subject, encode_error(&Error::internal_error(&message)));
                }
            }
        }
    })
}

fn send(outbox: &Outbox, subject: String, payload: Vec<u8>) {
    if outbox.send(Outgoing { subject, payload }).is_err() {
        debug!("dropping outbound message, service is shutting down");
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("payload serialization failed")
}
