//! The user-facing handle.
//!
//! A [`Handle`] composes one [`Connection`], one reactor, the watcher and
//! future tables, the service registry and an attribute cache. Everything is
//! owned by a single reference-counted [`HandleInner`]; watchers and futures
//! only hold weak references back to it, so dropping the last `Handle`
//! releases the whole graph.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::builder::{Config, HandleBuilder};
use crate::codec::{self, MATCHTAG_NONE, Message, MessageType, NODEID_ANY};
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, FutureError, ReactorError, Result, SendError};
use crate::future::table::{Completion, FutureTable};
use crate::future::{Future, RpcFlags, Timeout};
use crate::reactor::event::Interest;
use crate::reactor::guard::{DepthGuard, InterruptGuard};
use crate::reactor::{Reactor, RunFlags, RunOutcome, StopKind, core, signal};
use crate::service::{ServiceHook, ServiceRegistry, ServiceState};
use crate::watcher::table::WatcherTable;
use crate::watcher::{MessageFilter, Watcher, WatcherEvent, WatcherId, WatcherKind, WatcherState};

const TOPIC_SUBSCRIBE: &str = "event.subscribe";
const TOPIC_UNSUBSCRIBE: &str = "event.unsubscribe";
const TOPIC_SERVICE_ADD: &str = "service.add";
const TOPIC_SERVICE_REMOVE: &str = "service.remove";
const TOPIC_ATTR_GET: &str = "attr.get";
const TOPIC_SUBMIT: &str = "job-ingest.submit";
const TOPIC_LOG: &str = "log.append";
const TOPIC_BARRIER: &str = "barrier.enter";

/// Shared state behind every clone of a [`Handle`].
pub(crate) struct HandleInner {
    pub(crate) config: Config,
    pub(crate) connection: RefCell<Connection>,
    pub(crate) reactor: Reactor,
    pub(crate) watchers: RefCell<WatcherTable>,
    pub(crate) futures: RefCell<FutureTable>,
    services: RefCell<ServiceRegistry>,
    attrs: RefCell<HashMap<String, String>>,
    /// Received but not yet routed.
    inbound: RefCell<VecDeque<Message>>,
}

impl HandleInner {
    pub(crate) fn start_watcher(&self, id: WatcherId) -> Result<()> {
        self.watchers.borrow_mut().start(id, &self.reactor)
    }

    pub(crate) fn stop_watcher(&self, id: WatcherId) -> Result<()> {
        self.watchers.borrow_mut().stop(id, &self.reactor)
    }

    pub(crate) fn destroy_watcher(&self, id: WatcherId) -> Result<()> {
        self.watchers.borrow_mut().remove(id, &self.reactor)
    }

    pub(crate) fn watcher_state(&self, id: WatcherId) -> WatcherState {
        self.watchers.borrow().state(id)
    }

    pub(crate) fn has_inbound(&self) -> bool {
        !self.inbound.borrow().is_empty()
    }

    /// Reads from a readable connection into the inbound queue.
    pub(crate) fn receive_ready(&self) {
        let received = self.connection.borrow_mut().receive();
        match received {
            Ok(messages) => self.inbound.borrow_mut().extend(messages),
            Err(e) => {
                tracing::warn!(error = %e, "connection to broker lost");
                self.connection_lost();
            }
        }
    }

    /// Delivers queued messages: first matching watcher in registration
    /// order, then the future owning the match-tag, else dropped.
    pub(crate) fn route_inbound(&self) {
        loop {
            let next = self.inbound.borrow_mut().pop_front();
            let Some(message) = next else {
                break;
            };

            let offered = self.watchers.borrow_mut().offer_message(message);
            let message = match offered {
                Ok(_) => continue,
                Err(message) => message,
            };

            if message.kind == MessageType::Response && message.matchtag != MATCHTAG_NONE {
                let tag = message.matchtag;
                let response = if message.is_error() {
                    Err(FutureError::Broker {
                        errnum: message.errnum,
                        message: message.payload_str(),
                    })
                } else {
                    Ok(message.payload)
                };

                let completion = self.futures.borrow_mut().complete(tag, response);
                match completion {
                    Some(completion) => self.apply_completion(completion),
                    None => tracing::debug!(tag, "dropping response with no outstanding request"),
                }
                continue;
            }

            tracing::trace!(topic = %message.topic, kind = ?message.kind, "dropping unmatched message");
        }
    }

    fn apply_completion(&self, completion: Completion) {
        if let Some((hook, ok)) = completion.hook {
            self.services.borrow_mut().apply(hook, ok);
        }
        if let Some(continuation) = completion.continuation {
            self.reactor.defer(continuation);
        }
    }

    fn connection_lost(&self) {
        let completions = self.futures.borrow_mut().fail_all(FutureError::ConnectionLost);
        for completion in completions {
            self.apply_completion(completion);
        }
    }

    /// Waits at most `timeout` for the connection and routes what arrives.
    ///
    /// Returns `false` if the connection can no longer deliver anything.
    pub(crate) fn pump(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.has_inbound() {
            self.route_inbound();
            return Ok(true);
        }

        let readable = {
            let connection = self.connection.borrow();
            if connection.pollable_fd().is_none() {
                return Ok(false);
            }
            connection.wait_readable(timeout)?
        };

        if readable {
            self.receive_ready();
            self.route_inbound();
        }
        Ok(true)
    }

    /// Releases everything that depends on the connection.
    fn shutdown(&self) {
        {
            let mut watchers = self.watchers.borrow_mut();
            for id in watchers.ids() {
                if let Err(e) = watchers.remove(id, &self.reactor) {
                    tracing::trace!(watcher = %id, error = %e, "watcher already gone at shutdown");
                }
            }
        }

        self.connection_lost();
        self.inbound.borrow_mut().clear();
        self.services.borrow_mut().clear();
    }
}

/// Handle to a broker: connection, reactor, pub/sub, RPC and services.
///
/// Cloning is cheap and yields another reference to the same handle. A handle
/// is confined to the thread that created it.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

impl Handle {
    /// Connects to `uri` with default settings. See [`HandleBuilder`] for
    /// the tunable ones.
    pub fn open(uri: &str) -> Result<Handle> {
        HandleBuilder::new().uri(uri).open()
    }

    /// Wraps an already connected stream with default settings.
    pub fn from_stream(stream: UnixStream) -> Handle {
        HandleBuilder::new().from_stream(stream)
    }

    pub(crate) fn new(connection: Connection, config: Config) -> Handle {
        Handle {
            inner: Rc::new(HandleInner {
                config,
                connection: RefCell::new(connection),
                reactor: Reactor::new(),
                watchers: RefCell::new(WatcherTable::new()),
                futures: RefCell::new(FutureTable::new()),
                services: RefCell::new(ServiceRegistry::new()),
                attrs: RefCell::new(HashMap::new()),
                inbound: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<HandleInner>) -> Handle {
        Handle { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<HandleInner> {
        &self.inner
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.borrow().state()
    }

    /// Closes the connection and destroys every watcher.
    ///
    /// Outstanding futures fail with `ConnectionLost`. Closing twice fails
    /// with [`Error::DoubleClose`].
    pub fn close(&self) -> Result<()> {
        self.inner.connection.borrow_mut().close()?;
        self.inner.shutdown();
        Ok(())
    }

    // ---- messaging ----

    /// Sends a message as is.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.transmit(message)
    }

    /// Answers `request` with `payload`.
    pub fn respond(&self, request: &Message, payload: impl Into<Bytes>) -> Result<()> {
        self.transmit(&Message::response_to(request, payload))
    }

    /// Answers `request` with an error.
    pub fn respond_error(&self, request: &Message, errnum: u32, message: &str) -> Result<()> {
        self.transmit(&Message::error_response_to(request, errnum, message))
    }

    fn transmit(&self, message: &Message) -> Result<()> {
        let sent = self.inner.connection.borrow_mut().send(message);
        if let Err(e) = sent {
            if self.connection_state() == ConnectionState::Failed {
                self.inner.connection_lost();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Blocks until a message matching `filter` arrives and returns it.
    ///
    /// Messages that do not match are kept and dispatched to watchers and
    /// futures on the next reactor iteration.
    pub fn recv(&self, filter: &MessageFilter) -> Result<Message> {
        loop {
            {
                let mut inbound = self.inner.inbound.borrow_mut();
                let position = inbound.iter().position(|message| filter.matches(message));
                if let Some(message) = position.and_then(|pos| inbound.remove(pos)) {
                    return Ok(message);
                }
            }

            let readable = {
                let connection = self.inner.connection.borrow();
                if connection.pollable_fd().is_none() {
                    return Err(FutureError::ConnectionLost.into());
                }
                connection.wait_readable(None)?
            };
            if readable {
                self.inner.receive_ready();
            }
        }
    }

    // ---- requests ----

    /// Sends a request for `topic` and returns the future of its response.
    pub fn rpc(&self, topic: &str, payload: impl Into<Bytes>) -> Result<Future> {
        self.rpc_with(topic, payload, NODEID_ANY, RpcFlags::NONE)
    }

    /// Like [`Handle::rpc`], addressed to `nodeid` and with `flags`.
    pub fn rpc_with(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        nodeid: u32,
        flags: RpcFlags,
    ) -> Result<Future> {
        let message = Message::request(topic, payload).with_nodeid(nodeid);
        self.request(message, flags, None)
    }

    /// Submits an already encoded job.
    pub fn submit(&self, encoded: impl Into<Bytes>, flags: RpcFlags) -> Result<Future> {
        self.rpc_with(TOPIC_SUBMIT, encoded, NODEID_ANY, flags)
    }

    fn request(&self, message: Message, flags: RpcFlags, hook: Option<ServiceHook>) -> Result<Future> {
        if !self.inner.connection.borrow().is_open() {
            return Err(SendError::ConnectionClosed.into());
        }

        if flags.contains(RpcFlags::NORESPONSE) {
            self.transmit(&message.with_flags(codec::flags::NORESPONSE))?;
            let tag = self.inner.futures.borrow_mut().allocate_fulfilled(Bytes::new());
            return Ok(Future::new(tag, Rc::downgrade(&self.inner)));
        }

        let streaming = flags.contains(RpcFlags::STREAMING);
        let tag = self.inner.futures.borrow_mut().allocate(streaming, hook);

        let wire_flags = if streaming { codec::flags::STREAMING } else { 0 };
        if let Err(e) = self.transmit(&message.with_matchtag(tag).with_flags(wire_flags)) {
            // Never sent, so no answer will come to free the tag.
            let unsent = self.inner.futures.borrow_mut().discard(tag);
            drop(unsent);
            return Err(e);
        }

        tracing::trace!(tag, streaming, "request outstanding");
        Ok(Future::new(tag, Rc::downgrade(&self.inner)))
    }

    // ---- events ----

    /// Publishes an event. Nothing is returned to wait on.
    pub fn event_publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.transmit(&Message::event(topic, payload))
    }

    /// Subscribes to events matching the glob `topic` and starts a watcher
    /// delivering them to `callback`.
    pub fn event_subscribe<F>(&self, topic: &str, callback: F) -> Result<Watcher>
    where
        F: FnMut(&Handle, &Watcher, WatcherEvent) -> Result<()> + 'static,
    {
        let filter = MessageFilter::events(topic)?;
        let watcher = self.msg_watcher_create(filter, callback)?;
        watcher.start()?;

        let subscribe = Message::request(TOPIC_SUBSCRIBE, topic.to_owned()).with_flags(codec::flags::NORESPONSE);
        if let Err(e) = self.transmit(&subscribe) {
            if let Err(destroy) = self.inner.destroy_watcher(watcher.id()) {
                tracing::trace!(watcher = %watcher.id(), error = %destroy, "subscription watcher already gone");
            }
            return Err(e);
        }

        tracing::debug!(topic, watcher = %watcher.id(), "subscribed");
        Ok(watcher)
    }

    /// Cancels the subscription to `topic` and destroys its watchers.
    pub fn event_unsubscribe(&self, topic: &str) -> Result<()> {
        let subscribed: Vec<WatcherId> = {
            let watchers = self.inner.watchers.borrow();
            watchers
                .ids()
                .into_iter()
                .filter(|id| {
                    matches!(
                        watchers.kind(*id),
                        Some(WatcherKind::Message(filter))
                            if filter.type_mask == codec::TypeMask::EVENT && filter.topic.as_str() == topic
                    )
                })
                .collect()
        };
        if subscribed.is_empty() {
            return Err(Error::NotFound(format!("subscription {topic}")));
        }

        self.transmit(&Message::request(TOPIC_UNSUBSCRIBE, topic.to_owned()).with_flags(codec::flags::NORESPONSE))?;
        for id in subscribed {
            self.inner.destroy_watcher(id)?;
        }
        tracing::debug!(topic, "unsubscribed");
        Ok(())
    }

    /// Builds an event message without sending it.
    pub fn event_create(&self, topic: &str, payload: impl Into<Bytes>) -> Message {
        Message::event(topic, payload)
    }

    /// Blocks until an event matching the glob `topic` (any event if `None`)
    /// arrives. Needs no watcher, but the handle must be subscribed.
    pub fn event_recv(&self, topic: Option<&str>) -> Result<Message> {
        let filter = MessageFilter::events(topic.unwrap_or("*"))?;
        self.recv(&filter)
    }

    // ---- watchers ----

    /// Creates a watcher of any kind. It does nothing until started.
    pub fn watcher_create<F>(&self, kind: WatcherKind, callback: F) -> Result<Watcher>
    where
        F: FnMut(&Handle, &Watcher, WatcherEvent) -> Result<()> + 'static,
    {
        if self.connection_state() == ConnectionState::Closed {
            return Err(SendError::ConnectionClosed.into());
        }

        match kind {
            WatcherKind::Signal(signum) if !(1..64).contains(&signum) || !signal::is_catchable(signum) => {
                return Err(invalid_input(format!("invalid signal number {signum}")));
            }
            WatcherKind::Fd { fd, .. } if fd < 0 => {
                return Err(invalid_input(format!("invalid descriptor {fd}")));
            }
            _ => {}
        }

        let id = self.inner.watchers.borrow_mut().insert(kind, Box::new(callback));
        Ok(Watcher::new(id, Rc::downgrade(&self.inner)))
    }

    pub fn msg_watcher_create<F>(&self, filter: MessageFilter, callback: F) -> Result<Watcher>
    where
        F: FnMut(&Handle, &Watcher, WatcherEvent) -> Result<()> + 'static,
    {
        self.watcher_create(WatcherKind::Message(filter), callback)
    }

    /// Timer firing `after` its start, then every `repeat` (zero: once).
    pub fn timer_watcher_create<F>(&self, after: Duration, repeat: Duration, callback: F) -> Result<Watcher>
    where
        F: FnMut(&Handle, &Watcher, WatcherEvent) -> Result<()> + 'static,
    {
        self.watcher_create(WatcherKind::Timer { after, repeat }, callback)
    }

    pub fn signal_watcher_create<F>(&self, signum: i32, callback: F) -> Result<Watcher>
    where
        F: FnMut(&Handle, &Watcher, WatcherEvent) -> Result<()> + 'static,
    {
        self.watcher_create(WatcherKind::Signal(signum), callback)
    }

    pub fn fd_watcher_create<F>(&self, fd: RawFd, interest: Interest, callback: F) -> Result<Watcher>
    where
        F: FnMut(&Handle, &Watcher, WatcherEvent) -> Result<()> + 'static,
    {
        self.watcher_create(WatcherKind::Fd { fd, interest }, callback)
    }

    pub(crate) fn set_watcher_counted(&self, watcher: &Watcher, counted: bool) {
        self.inner
            .watchers
            .borrow_mut()
            .set_counted(watcher.id(), counted, &self.inner.reactor);
    }

    // ---- reactor ----

    /// Runs the reactor.
    ///
    /// At the top level (and unless `NO_INTERRUPT` is given) the handle's
    /// interrupt signal is watched for the duration of the run, provided this
    /// thread owns signal handling. Nested calls are allowed up to the
    /// configured depth; the depth is restored however the run ends.
    pub fn run_reactor(&self, flags: RunFlags) -> Result<RunOutcome> {
        let reactor = self.reactor();
        let depth = reactor.depth();
        if depth >= self.inner.config.max_reactor_depth {
            return Err(ReactorError::AlreadyRunning { depth }.into());
        }
        if depth == 0 {
            reactor.clear_interrupted();
        }

        let _depth = DepthGuard::enter(reactor);
        let _interrupt = if depth == 0
            && !flags.contains(RunFlags::NO_INTERRUPT)
            && self.inner.config.owns_signals()
        {
            Some(InterruptGuard::install(self, self.inner.config.interrupt_signal)?)
        } else {
            None
        };

        tracing::debug!(depth = depth + 1, active = reactor.active(), "reactor entered");
        let outcome = core::run(self, flags);
        match &outcome {
            Ok(outcome) => tracing::debug!(depth = depth + 1, ?outcome, "reactor exited"),
            Err(e) => tracing::debug!(depth = depth + 1, error = %e, "reactor exited with error"),
        }
        outcome
    }

    /// Makes the innermost running reactor return [`RunOutcome::Stopped`].
    pub fn reactor_stop(&self) {
        self.reactor().stop(StopKind::Normal);
    }

    /// Makes the innermost running reactor return [`RunOutcome::StoppedError`].
    pub fn reactor_stop_error(&self) {
        self.reactor().stop(StopKind::Error);
    }

    /// Keeps the reactor running without an active watcher.
    pub fn reactor_incref(&self) {
        self.reactor().incref();
    }

    pub fn reactor_decref(&self) {
        self.reactor().decref();
    }

    pub fn reactor_running(&self) -> bool {
        self.reactor().depth() > 0
    }

    /// True if the last top-level run ended because of the interrupt signal.
    pub fn reactor_interrupted(&self) -> bool {
        self.reactor().is_interrupted()
    }

    pub fn reactor_depth(&self) -> usize {
        self.reactor().depth()
    }

    pub fn reactor_active(&self) -> usize {
        self.reactor().active()
    }

    // ---- services ----

    /// Asks the broker to route requests for `name` to this handle.
    pub fn service_register(&self, name: &str) -> Result<Future> {
        self.inner.services.borrow().check_register(name)?;

        let message = Message::request(TOPIC_SERVICE_ADD, name.to_owned());
        let future = self.request(message, RpcFlags::NONE, Some(ServiceHook::Register(name.to_owned())))?;
        self.inner.services.borrow_mut().mark_pending(name);
        Ok(future)
    }

    /// Withdraws an active service registration.
    pub fn service_unregister(&self, name: &str) -> Result<Future> {
        self.inner.services.borrow().check_unregister(name)?;

        let message = Message::request(TOPIC_SERVICE_REMOVE, name.to_owned());
        self.request(message, RpcFlags::NONE, Some(ServiceHook::Unregister(name.to_owned())))
    }

    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.inner.services.borrow().state(name)
    }

    // ---- attributes ----

    /// Looks up a broker attribute, asking the broker on a cache miss.
    pub fn attr_get(&self, name: &str) -> Result<String> {
        let cached = self.inner.attrs.borrow().get(name).cloned();
        if let Some(value) = cached {
            return Ok(value);
        }

        let future = self.rpc(TOPIC_ATTR_GET, name.to_owned())?;
        match future.wait(Timeout::Forever) {
            Ok(payload) => {
                let value = String::from_utf8(payload.to_vec())
                    .map_err(|e| Error::Protocol(format!("attribute {name} is not UTF-8: {e}")))?;
                self.inner
                    .attrs
                    .borrow_mut()
                    .insert(name.to_owned(), value.clone());
                Ok(value)
            }
            Err(Error::Future(FutureError::Broker { errnum, .. })) if errnum == libc::ENOENT as u32 => {
                Err(Error::NotFound(format!("attribute {name}")))
            }
            Err(e) => Err(e),
        }
    }

    /// Sets an attribute in the local cache only.
    pub fn attr_set_cacheonly(&self, name: &str, value: &str) {
        self.inner
            .attrs
            .borrow_mut()
            .insert(name.to_owned(), value.to_owned());
    }

    /// This broker's rank in the instance.
    pub fn get_rank(&self) -> Result<u32> {
        let rank = self.attr_get("rank")?;
        rank.trim()
            .parse()
            .map_err(|e| Error::Protocol(format!("invalid rank {rank:?}: {e}")))
    }

    // ---- broker services ----

    /// Appends `message` to the broker log at syslog `level` (`LOG_EMERG`
    /// through `LOG_DEBUG`). Nothing is returned to wait on.
    pub fn log(&self, level: i32, message: &str) -> Result<()> {
        if !(libc::LOG_EMERG..=libc::LOG_DEBUG).contains(&level) {
            return Err(invalid_input(format!("invalid log level {level}")));
        }

        let entry = format!("<{level}>{message}");
        self.rpc_with(TOPIC_LOG, entry, NODEID_ANY, RpcFlags::NORESPONSE)?;
        Ok(())
    }

    /// Enters the barrier `name`, which completes once `nprocs` processes
    /// have entered it.
    ///
    /// The request payload is `nprocs` as a big-endian u32 followed by the
    /// barrier name.
    pub fn barrier(&self, name: &str, nprocs: u32) -> Result<Future> {
        if name.is_empty() || nprocs == 0 {
            return Err(invalid_input(format!("invalid barrier {name:?} for {nprocs} processes")));
        }

        let mut payload = BytesMut::with_capacity(4 + name.len());
        payload.put_u32(nprocs);
        payload.put_slice(name.as_bytes());
        self.rpc(TOPIC_BARRIER, payload.freeze())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("connection", &self.connection_state())
            .field("depth", &self.inner.reactor.depth())
            .field("active", &self.inner.reactor.active())
            .field("outstanding", &self.inner.futures.try_borrow().map(|futures| futures.outstanding()).ok())
            .finish()
    }
}

fn invalid_input(reason: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidInput, reason))
}
