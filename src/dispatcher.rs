// Copyright 2020 Joyent, Inc.

//! Routing of TCF traffic for one connection.
//!
//! The dispatcher assigns tokens to outbound commands, keeps the table of
//! commands awaiting a result, and routes each inbound frame: results to
//! the waiting caller, events to the handler registered for their service,
//! progress and flow-control frames to every registered listener.
//!
//! Handlers and listeners are called with no internal lock held, so they
//! are free to issue further commands.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};

use crate::config::DispatcherConfig;
use crate::error::{CommandError, DispatchError};
use crate::pending::{PendingTable, Reply, Token, TokenSource};
use crate::protocol::{self, escape_for_log, Message};

/// Receives `E` frames for one service.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &str, args: &[Value]);
}

impl<F> EventHandler for F
where
    F: Fn(&str, &[Value]) + Send + Sync,
{
    fn handle_event(&self, event: &str, args: &[Value]) {
        self(event, args)
    }
}

pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, token: Token, progress: &Progress);
}

impl<F> ProgressListener for F
where
    F: Fn(Token, &Progress) + Send + Sync,
{
    fn on_progress(&self, token: Token, progress: &Progress) {
        self(token, progress)
    }
}

pub trait CongestionListener: Send + Sync {
    fn on_congestion(&self, level: i64);
}

impl<F> CongestionListener for F
where
    F: Fn(i64) + Send + Sync,
{
    fn on_congestion(&self, level: i64) {
        self(level)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Progress {
    pub progress_complete: Option<u64>,
    pub progress_total: Option<u64>,
    pub description: Option<String>,
}

struct State {
    tokens: TokenSource,
    pending: PendingTable,
    event_handlers: HashMap<String, Arc<dyn EventHandler>>,
    progress_listeners: Vec<Arc<dyn ProgressListener>>,
    congestion_listeners: Vec<Arc<dyn CongestionListener>>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    outbound: mpsc::UnboundedSender<String>,
    command_timeout: Option<Duration>,
    reject_pending_on_close: bool,
    log: Logger,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Frames produced by the dispatcher are written to `outbound` in the
    /// order they are sent.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        config: &DispatcherConfig,
        log: Option<&Logger>,
    ) -> Dispatcher {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        Dispatcher {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tokens: TokenSource::new(),
                    pending: PendingTable::new(),
                    event_handlers: HashMap::new(),
                    progress_listeners: Vec::new(),
                    congestion_listeners: Vec::new(),
                    closed: false,
                }),
                outbound,
                command_timeout: config.command_timeout,
                reject_pending_on_close: config.reject_pending_on_close,
                log,
            }),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.log
    }

    pub fn log(&self, message: &str) {
        info!(self.inner.log, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        debug!(self.inner.log, "{}", message);
    }

    /// Send a command and return a future for its result. The future
    /// resolves once the matching `R` frame has been handled.
    pub fn send_command(
        &self,
        service: &str,
        command: &str,
        args: &[Value],
    ) -> Result<PendingCommand, DispatchError> {
        let args = protocol::stringify(args)?;
        let mut state = self.inner.state();
        if state.closed {
            return Err(DispatchError::ConnectionClosed);
        }

        let token = state.tokens.allocate();
        let receiver = state.pending.insert(token, service, command);
        let frame = Message::Command {
            token,
            service: service.to_string(),
            command: command.to_string(),
            args,
        };

        // Transmit under the lock so frames leave in token order.
        if let Err(e) = self.transmit(frame.encode()) {
            state.pending.remove(token);
            return Err(e);
        }

        Ok(PendingCommand {
            token,
            receiver,
            timeout: self
                .inner
                .command_timeout
                .map(|d| (Instant::now() + d, None)),
            dispatcher: Arc::downgrade(&self.inner),
        })
    }

    /// Send a command whose result nobody waits for. The token is consumed
    /// but no pending entry is created.
    pub fn send_command_no_reply(
        &self,
        service: &str,
        command: &str,
        args: &[Value],
    ) -> Result<Token, DispatchError> {
        let args = protocol::stringify(args)?;
        let mut state = self.inner.state();
        if state.closed {
            return Err(DispatchError::ConnectionClosed);
        }

        let token = state.tokens.allocate();
        let frame = Message::Command {
            token,
            service: service.to_string(),
            command: command.to_string(),
            args,
        };
        self.transmit(frame.encode())?;
        Ok(token)
    }

    pub fn send_event(
        &self,
        service: &str,
        event: &str,
        args: &[Value],
    ) -> Result<(), DispatchError> {
        let frame = Message::event(service, event, args)?;
        let state = self.inner.state();
        if state.closed {
            return Err(DispatchError::ConnectionClosed);
        }
        self.transmit(frame.encode())
    }

    fn transmit(&self, frame: String) -> Result<(), DispatchError> {
        debug!(self.inner.log, ">> {}", escape_for_log(&frame));
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| DispatchError::ConnectionClosed)
    }

    /// Register the handler for `service`, replacing any earlier one.
    /// Returns true if a handler was replaced.
    pub fn register_event_handler<H>(&self, service: &str, handler: H) -> bool
    where
        H: EventHandler + 'static,
    {
        let mut state = self.inner.state();
        if state.closed {
            warn!(self.inner.log, "dispatcher closed, handler not registered";
                "service" => service);
            return false;
        }
        info!(self.inner.log, "registering event handler"; "service" => service);
        state
            .event_handlers
            .insert(service.to_string(), Arc::new(handler))
            .is_some()
    }

    pub fn register_progress_listener<L>(&self, listener: L)
    where
        L: ProgressListener + 'static,
    {
        let mut state = self.inner.state();
        if state.closed {
            warn!(self.inner.log, "dispatcher closed, progress listener not registered");
            return;
        }
        state.progress_listeners.push(Arc::new(listener));
    }

    pub fn register_congestion_listener<L>(&self, listener: L)
    where
        L: CongestionListener + 'static,
    {
        let mut state = self.inner.state();
        if state.closed {
            warn!(self.inner.log, "dispatcher closed, congestion listener not registered");
            return;
        }
        state.congestion_listeners.push(Arc::new(listener));
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Handle one complete inbound frame. An error means the framing of
    /// the stream can no longer be trusted.
    pub fn handle_message(&self, data: &str) -> Result<(), DispatchError> {
        debug!(self.inner.log, "<< {}", escape_for_log(data));

        match Message::parse(data)? {
            Message::Event {
                service,
                name,
                args,
            } => self.handle_event(&service, &name, &args),
            Message::Result {
                token,
                error,
                payload,
            } => self.handle_result(token, &error, &payload),
            Message::Progress { token, payload } => {
                self.handle_progress(token, &payload)
            }
            Message::FlowControl { congestion } => {
                self.handle_congestion(congestion)
            }
            Message::Unknown { fields } => {
                info!(self.inner.log, "unknown message"; "fields" => ?fields);
            }
            other => {
                info!(self.inner.log, "unrecognized TCF message";
                    "kind" => other.kind());
            }
        }

        Ok(())
    }

    fn handle_event(&self, service: &str, name: &str, args: &[String]) {
        let handler = self.inner.state().event_handlers.get(service).cloned();
        let handler = match handler {
            Some(h) => h,
            None => {
                debug!(self.inner.log, "no event handler registered";
                    "service" => service, "event" => name);
                return;
            }
        };

        match protocol::unstringify(args) {
            Ok(values) => handler.handle_event(name, &values),
            Err(e) => {
                warn!(self.inner.log, "dropping event with invalid arguments";
                    "service" => service, "event" => name, "err" => %e);
            }
        }
    }

    fn handle_result(&self, token: Token, error: &str, payload: &str) {
        if !error.is_empty() {
            warn!(self.inner.log, "response error";
                "token" => token, "report" => error);
        }

        let entry = match self.inner.state().pending.remove(token) {
            Some(entry) => entry,
            None => {
                warn!(self.inner.log, "no pending command for result";
                    "token" => token);
                return;
            }
        };

        let reply: Reply = if error.is_empty() {
            protocol::parse_field(payload).map_err(DispatchError::from)
        } else {
            Err(DispatchError::Command(CommandError::from_report(
                &entry.service,
                &entry.command,
                token,
                error,
            )))
        };

        if !entry.complete(reply) {
            debug!(self.inner.log, "caller no longer waiting"; "token" => token);
        }
    }

    fn handle_progress(&self, token: Token, payload: &str) {
        let progress: Progress = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(self.inner.log, "dropping invalid progress report";
                    "token" => token, "err" => %e);
                return;
            }
        };
        debug!(self.inner.log, "progress"; "token" => token,
            "complete" => ?progress.progress_complete,
            "total" => ?progress.progress_total);

        let listeners = self.inner.state().progress_listeners.clone();
        for listener in listeners {
            listener.on_progress(token, &progress);
        }
    }

    fn handle_congestion(&self, level: i64) {
        debug!(self.inner.log, "congestion"; "level" => level);

        let listeners = self.inner.state().congestion_listeners.clone();
        for listener in listeners {
            listener.on_congestion(level);
        }
    }

    /// Stop accepting traffic. Handlers, listeners and pending commands are
    /// discarded; pending commands are either rejected explicitly or dropped,
    /// and both surface as `ConnectionClosed`. Calling this more than once
    /// has no further effect.
    pub fn close(&self) {
        let (drained, handlers) = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.progress_listeners.clear();
            state.congestion_listeners.clear();
            let handlers: Vec<_> = state.event_handlers.drain().collect();
            (state.pending.drain(), handlers)
        };

        info!(self.inner.log, "dispatcher closed";
            "pending" => drained.len(),
            "reject" => self.inner.reject_pending_on_close);
        drop(handlers);
        for (token, entry) in drained {
            if self.inner.reject_pending_on_close {
                entry.complete(Err(DispatchError::ConnectionClosed));
            } else {
                debug!(self.inner.log, "dropping pending command";
                    "token" => token,
                    "service" => &entry.service,
                    "command" => &entry.command);
            }
        }
    }
}

/// The eventual result of a command.
pub struct PendingCommand {
    token: Token,
    receiver: oneshot::Receiver<Reply>,
    // Deadline, and the timer once first polled.
    timeout: Option<(Instant, Option<Pin<Box<Sleep>>>)>,
    dispatcher: Weak<Inner>,
}

impl PendingCommand {
    pub fn token(&self) -> Token {
        self.token
    }
}

impl Future for PendingCommand {
    type Output = Result<Value, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(reply) = Pin::new(&mut this.receiver).poll(cx) {
            return Poll::Ready(match reply {
                Ok(reply) => reply,
                Err(_) => Err(DispatchError::ConnectionClosed),
            });
        }

        if let Some((deadline, timer)) = this.timeout.as_mut() {
            let timer = timer
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(*deadline)));
            if timer.as_mut().poll(cx).is_ready() {
                let taken = match this.dispatcher.upgrade() {
                    Some(inner) => inner.state().pending.remove(this.token).is_none(),
                    None => false,
                };
                // Whoever took the entry is about to resolve the receiver,
                // which was polled above and will wake this task.
                if taken {
                    return Poll::Pending;
                }
                return Poll::Ready(Err(DispatchError::Timeout {
                    token: this.token,
                }));
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    fn dispatcher(
        config: &DispatcherConfig,
    ) -> (Dispatcher, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(tx, config, None), rx)
    }

    #[tokio::test]
    async fn breakpoint_add_scenario() {
        let (disp, mut rx) = dispatcher(&DispatcherConfig::default());
        let pending = disp
            .send_command(
                "Breakpoints",
                "add",
                &[json!({"File": "main.c", "Line": 29})],
            )
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            "C\x001\x00Breakpoints\x00add\x00{\"File\":\"main.c\",\"Line\":29}\x00\x03\x01"
        );
        assert_eq!(disp.pending_count(), 1);

        disp.handle_message("R\x001\x00\x00\"bp_1\"\x00\x03\x01")
            .unwrap();
        assert_eq!(disp.pending_count(), 0);
        assert_eq!(pending.await.unwrap(), json!("bp_1"));
    }

    #[test]
    fn tokens_are_strictly_increasing() {
        let (disp, mut rx) = dispatcher(&DispatcherConfig::default());
        let tokens: Vec<Token> = (0..20)
            .map(|_| disp.send_command("Locator", "sync", &[]).unwrap().token())
            .collect();
        assert_eq!(tokens, (1..=20).collect::<Vec<Token>>());

        let first = rx.try_recv().unwrap();
        assert!(first.starts_with("C\x001\x00"));
    }

    #[tokio::test]
    async fn results_out_of_order() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let first = disp.send_command("Registers", "get", &[json!("r0")]).unwrap();
        let second = disp.send_command("Registers", "get", &[json!("r1")]).unwrap();

        disp.handle_message("R\x002\x00\x00\"0x20\"\x00\x03\x01")
            .unwrap();
        disp.handle_message("R\x001\x00\x00\"0x10\"\x00\x03\x01")
            .unwrap();

        assert_eq!(first.await.unwrap(), json!("0x10"));
        assert_eq!(second.await.unwrap(), json!("0x20"));
    }

    #[tokio::test]
    async fn duplicate_result_is_ignored() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let pending = disp.send_command("RunControl", "resume", &[]).unwrap();

        disp.handle_message("R\x001\x00\x00null\x00\x03\x01").unwrap();
        disp.handle_message("R\x001\x00\x00\"again\"\x00\x03\x01")
            .unwrap();

        assert_eq!(pending.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn empty_payload_is_null_success() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let pending = disp.send_command("RunControl", "suspend", &[]).unwrap();
        disp.handle_message("R\x001\x00\x00\x00\x03\x01").unwrap();
        assert_eq!(pending.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn error_report_rejects_only_its_command() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let failing = disp.send_command("Breakpoints", "add", &[]).unwrap();
        let other = disp.send_command("Breakpoints", "getIDs", &[]).unwrap();

        disp.handle_message(
            "R\x001\x00{\"Code\":1,\"Format\":\"bad location\"}\x00\x00\x03\x01",
        )
        .unwrap();
        disp.handle_message("R\x002\x00\x00[]\x00\x03\x01").unwrap();

        match failing.await {
            Err(DispatchError::Command(e)) => {
                assert_eq!(e.service, "Breakpoints");
                assert_eq!(e.command, "add");
                assert_eq!(e.message, "bad location");
            }
            other => panic!("expected command error, got {:?}", other),
        }
        assert_eq!(other.await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn invalid_payload_rejects_command() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let pending = disp.send_command("Memory", "get", &[]).unwrap();
        disp.handle_message("R\x001\x00\x00{oops\x00\x03\x01").unwrap();
        assert!(matches!(pending.await, Err(DispatchError::Json(_))));
    }

    #[test]
    fn fire_and_forget_creates_no_entry() {
        let (disp, mut rx) = dispatcher(&DispatcherConfig::default());
        let token = disp
            .send_command_no_reply("RunControl", "resume", &[json!("ctx-1"), json!(0), json!(0)])
            .unwrap();
        assert_eq!(token, 1);
        assert_eq!(disp.pending_count(), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            "C\x001\x00RunControl\x00resume\x00\"ctx-1\"\x000\x000\x00\x03\x01"
        );

        disp.handle_message("R\x001\x00\x00null\x00\x03\x01").unwrap();
        assert_eq!(disp.send_command("A", "b", &[]).unwrap().token(), 2);
    }

    #[test]
    fn events_reach_only_their_service() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let run_control = Arc::new(Mutex::new(Vec::new()));
        let breakpoints = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&run_control);
        disp.register_event_handler("RunControl", move |event: &str, args: &[Value]| {
            seen.lock().unwrap().push((event.to_string(), args.to_vec()));
        });
        let count = Arc::clone(&breakpoints);
        disp.register_event_handler("Breakpoints", move |_: &str, _: &[Value]| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        disp.handle_message(
            "E\x00RunControl\x00contextSuspended\x00\"ctx-1\"\x00\x00\x03\x01",
        )
        .unwrap();
        disp.handle_message("E\x00Memory\x00memoryChanged\x00\x03\x01")
            .unwrap();

        let events = run_control.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "contextSuspended");
        assert_eq!(events[0].1, vec![json!("ctx-1"), Value::Null]);
        assert_eq!(breakpoints.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&first);
        assert!(!disp.register_event_handler("Locator", move |_: &str, _: &[Value]| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = Arc::clone(&second);
        assert!(disp.register_event_handler("Locator", move |_: &str, _: &[Value]| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        disp.handle_message("E\x00Locator\x00Hello\x00[]\x00\x03\x01")
            .unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_send_commands() {
        let (disp, mut rx) = dispatcher(&DispatcherConfig::default());
        let inner = disp.clone();
        disp.register_event_handler("RunControl", move |_: &str, args: &[Value]| {
            inner
                .send_command_no_reply("RunControl", "getState", args)
                .unwrap();
        });

        disp.handle_message("E\x00RunControl\x00contextSuspended\x00\"c\"\x00\x03\x01")
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            "C\x001\x00RunControl\x00getState\x00\"c\"\x00\x03\x01"
        );
    }

    #[tokio::test]
    async fn congestion_notifies_listeners() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let levels = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let levels = Arc::clone(&levels);
            disp.register_congestion_listener(move |level: i64| {
                levels.lock().unwrap().push(level);
            });
        }
        let pending = disp.send_command("Locator", "sync", &[]).unwrap();

        disp.handle_message("F\x003\x00\x03\x01").unwrap();

        assert_eq!(*levels.lock().unwrap(), vec![3, 3]);
        assert_eq!(disp.pending_count(), 1);
        drop(pending);
    }

    #[tokio::test]
    async fn progress_does_not_complete_command() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&reports);
        disp.register_progress_listener(move |token: Token, p: &Progress| {
            r.lock().unwrap().push((token, p.clone()));
        });

        let pending = disp.send_command("Tools", "program", &[]).unwrap();
        disp.handle_message(
            "P\x001\x00{\"ProgressComplete\":5,\"ProgressTotal\":10,\"Description\":\"Erasing\"}\x00\x03\x01",
        )
        .unwrap();
        assert_eq!(disp.pending_count(), 1);

        disp.handle_message("R\x001\x00\x00true\x00\x03\x01").unwrap();
        assert_eq!(pending.await.unwrap(), json!(true));

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, 1);
        assert_eq!(
            reports[0].1,
            Progress {
                progress_complete: Some(5),
                progress_total: Some(10),
                description: Some(String::from("Erasing")),
            }
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        assert!(matches!(
            disp.handle_message("R\x00\x03\x01"),
            Err(DispatchError::Parse(_))
        ));
        assert!(matches!(
            disp.handle_message("R\x001\x00\x00null\x00"),
            Err(DispatchError::Parse(_))
        ));
    }

    #[test]
    fn unknown_kinds_are_ignored() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        assert!(disp.handle_message("N\x007\x00\x03\x01").is_ok());
        assert!(disp.handle_message("Z\x00what\x00\x03\x01").is_ok());
        assert!(disp.handle_message("R\x0099\x00\x00null\x00\x03\x01").is_ok());
    }

    #[tokio::test]
    async fn close_rejects_pending() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        let pending = disp.send_command("RunControl", "resume", &[]).unwrap();

        disp.close();
        assert!(disp.is_closed());
        assert!(matches!(pending.await, Err(DispatchError::ConnectionClosed)));
        assert!(matches!(
            disp.send_command("RunControl", "resume", &[]),
            Err(DispatchError::ConnectionClosed)
        ));
        assert!(matches!(
            disp.send_event("Locator", "Hello", &[]),
            Err(DispatchError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn close_without_rejection_drops_pending() {
        let config = DispatcherConfig::default().with_reject_pending_on_close(false);
        let (disp, _rx) = dispatcher(&config);
        let pending = disp.send_command("RunControl", "resume", &[]).unwrap();
        disp.close();
        assert_eq!(disp.pending_count(), 0);

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("pending command hung after close");
        assert!(matches!(result, Err(DispatchError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn timeout_yields_reply_that_already_arrived() {
        let config = DispatcherConfig::default()
            .with_command_timeout(Duration::from_millis(20));
        let (disp, _rx) = dispatcher(&config);
        let mut pending = disp.send_command("Expressions", "evaluate", &[]).unwrap();

        // Arm the timer, then let it expire before the reply is observed.
        assert!(futures::poll!(&mut pending).is_pending());
        tokio::time::sleep(Duration::from_millis(50)).await;
        disp.handle_message("R\x001\x00\x00\"late\"\x00\x03\x01").unwrap();

        assert_eq!(pending.await.unwrap(), json!("late"));
    }

    #[tokio::test]
    async fn timeout_waits_for_reply_in_flight() {
        let config = DispatcherConfig::default()
            .with_command_timeout(Duration::from_millis(20));
        let (disp, _rx) = dispatcher(&config);
        let mut pending = disp.send_command("Expressions", "evaluate", &[]).unwrap();

        // The entry is claimed by a result being delivered.
        let entry = disp.inner.state().pending.remove(1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(futures::poll!(&mut pending).is_pending());

        assert!(entry.complete(Ok(json!(7))));
        assert_eq!(pending.await.unwrap(), json!(7));
    }

    #[test]
    fn registration_after_close_is_refused() {
        let (disp, _rx) = dispatcher(&DispatcherConfig::default());
        disp.close();

        let held = disp.clone();
        assert!(!disp.register_event_handler("RunControl", move |_: &str, _: &[Value]| {
            let _ = held.pending_count();
        }));
        disp.register_progress_listener(|_: Token, _: &Progress| {});
        disp.register_congestion_listener(|_: i64| {});

        // Only the test's own handle remains; nothing captured a clone.
        assert_eq!(Arc::strong_count(&disp.inner), 1);
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let config = DispatcherConfig::default()
            .with_command_timeout(Duration::from_millis(20));
        let (disp, _rx) = dispatcher(&config);
        let pending = disp.send_command("Expressions", "evaluate", &[]).unwrap();

        assert!(matches!(
            pending.await,
            Err(DispatchError::Timeout { token: 1 })
        ));
        assert_eq!(disp.pending_count(), 0);
        assert!(disp.handle_message("R\x001\x00\x00null\x00\x03\x01").is_ok());
    }

    #[test]
    fn send_fails_when_transport_gone() {
        let (disp, rx) = dispatcher(&DispatcherConfig::default());
        drop(rx);
        assert!(matches!(
            disp.send_command("Locator", "sync", &[]),
            Err(DispatchError::ConnectionClosed)
        ));
        assert_eq!(disp.pending_count(), 0);
    }
}
