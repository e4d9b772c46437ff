use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use super::range::Effect;
use super::state::ReadStreamState;
use super::ReadTransport;
use crate::{
    BidiError, BidiResult, ErrorDetail, ObjectResource, ReadRequest, RetryContext,
    RetryDecision, RetryPolicy, SessionId, StatusCode, StreamEvent, TransportError,
};

/// Instructions from the session to a stream driver
#[derive(Debug)]
pub(crate) enum ReadCommand {
    /// Send a newly registered or backed-off read if it is still unsent
    Send(u64),
    Close,
}

/// Settings shared by every stream of a session
pub(crate) struct StreamContext {
    pub(crate) session: SessionId,
    pub(crate) transport: Arc<ReadTransport>,
    pub(crate) policy: Arc<dyn RetryPolicy>,
    pub(crate) max_redirects: u32,
}

/// A running physical stream and the reads registered on it
pub(crate) struct ReadStreamHandle {
    pub(crate) state: Arc<Mutex<ReadStreamState>>,
    commands: mpsc::UnboundedSender<ReadCommand>,
    task: JoinHandle<()>,
}

impl ReadStreamHandle {
    /// Start a driver for `state`. With `ready`, the caller learns when the first metadata
    /// arrives; with `retire_when_idle`, the driver exits once no reads remain.
    pub(crate) fn spawn(
        ctx: Arc<StreamContext>,
        state: ReadStreamState,
        ready: Option<oneshot::Sender<BidiResult<ObjectResource>>>,
        retire_when_idle: bool,
    ) -> Self {
        let state = Arc::new(Mutex::new(state));
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            ctx,
            state.clone(),
            commands.clone(),
            rx,
            ready,
            retire_when_idle,
        ));
        Self {
            state,
            commands,
            task,
        }
    }

    /// Ask the driver to send a registered read
    pub(crate) fn send(&self, read_id: u64) -> bool {
        self.commands.send(ReadCommand::Send(read_id)).is_ok()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Fail every read with `err` and stop the driver
    pub(crate) fn shutdown(&self, err: BidiError) {
        let effects = self.state.lock().fail_all(err);
        for effect in effects {
            effect.apply_now();
        }
        let _ = self.commands.send(ReadCommand::Close);
        self.task.abort();
    }
}

enum StreamExit {
    Closed,
    Reconnect,
    Failed(BidiError),
}

#[instrument(skip_all, fields(session = %ctx.session))]
async fn run(
    ctx: Arc<StreamContext>,
    state: Arc<Mutex<ReadStreamState>>,
    commands_tx: mpsc::UnboundedSender<ReadCommand>,
    mut commands: mpsc::UnboundedReceiver<ReadCommand>,
    mut ready: Option<oneshot::Sender<BidiResult<ObjectResource>>>,
    retire_when_idle: bool,
) {
    let mut retry = RetryContext::new(ctx.policy.clone());
    let mut redirects = 0u32;
    loop {
        let (params, open) = {
            let mut state = state.lock();
            if state.failure().is_some() {
                return;
            }
            state.open_request()
        };

        debug!(params = %params.request_params(), ranges = open.ranges.len(), "Opening read stream");
        let exit = match ctx.transport.open(params).await {
            Ok(stream) => {
                let mut conn = Connection {
                    ctx: &ctx,
                    state: &state,
                    commands_tx: &commands_tx,
                    ready: &mut ready,
                    retry: &mut retry,
                    redirects: &mut redirects,
                    retire_when_idle,
                };
                conn.pump(stream, open, &mut commands).await
            }
            Err(err) => StreamExit::Failed(err),
        };

        let failure = match exit {
            StreamExit::Closed => return,
            StreamExit::Reconnect => continue,
            StreamExit::Failed(err) => err,
        };

        match retry.record_error(failure) {
            RetryDecision::Retry { backoff, attempt } => {
                warn!(attempt, ?backoff, "Read stream failed, reconnecting");
                tokio::time::sleep(backoff).await;
            }
            RetryDecision::GiveUp(err) => {
                error!(%err, "Read stream failed");
                fail_stream(&state, &mut ready, err);
                return;
            }
        }
    }
}

fn fail_stream(
    state: &Mutex<ReadStreamState>,
    ready: &mut Option<oneshot::Sender<BidiResult<ObjectResource>>>,
    err: BidiError,
) {
    if let Some(ready) = ready.take() {
        let _ = ready.send(Err(err.clone()));
    }
    let effects = state.lock().fail_all(err);
    for effect in effects {
        effect.apply_now();
    }
}

struct Connection<'a> {
    ctx: &'a StreamContext,
    state: &'a Mutex<ReadStreamState>,
    commands_tx: &'a mpsc::UnboundedSender<ReadCommand>,
    ready: &'a mut Option<oneshot::Sender<BidiResult<ObjectResource>>>,
    retry: &'a mut RetryContext,
    redirects: &'a mut u32,
    retire_when_idle: bool,
}

impl Connection<'_> {
    async fn pump(
        &mut self,
        mut stream: crate::BidiStream<ReadRequest, crate::ReadResponse>,
        open: ReadRequest,
        commands: &mut mpsc::UnboundedReceiver<ReadCommand>,
    ) -> StreamExit {
        if let Err(err) = stream.send(open) {
            return StreamExit::Failed(err);
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ReadCommand::Send(read_id)) => {
                        let request = self.state.lock().take_request(read_id);
                        if let Some(request) = request {
                            if let Err(err) = stream.send(ReadRequest::ranges(vec![request])) {
                                return StreamExit::Failed(err);
                            }
                        }
                    }
                    Some(ReadCommand::Close) | None => return StreamExit::Closed,
                },
                event = stream.recv() => match event {
                    Some(StreamEvent::Message(response)) => {
                        let routed = self.state.lock().on_response(response);
                        let effects = match routed {
                            Ok(effects) => effects,
                            Err(err) => {
                                error!(%err, "Rejecting read response");
                                fail_stream(self.state, self.ready, err);
                                return StreamExit::Closed;
                            }
                        };
                        self.retry.reset();
                        *self.redirects = 0;

                        if let Some(ready) = self.ready.take() {
                            let metadata = self.state.lock().metadata().cloned();
                            match metadata {
                                Some(metadata) => {
                                    let _ = ready.send(Ok(metadata));
                                }
                                None => *self.ready = Some(ready),
                            }
                        }

                        self.apply(effects).await;
                        if self.retire_when_idle && self.state.lock().is_idle() {
                            debug!("Read stream idle, retiring");
                            return StreamExit::Closed;
                        }
                    }
                    Some(StreamEvent::Error(err)) => return self.on_error(err),
                    Some(StreamEvent::Complete) | None => {
                        return StreamExit::Failed(BidiError::transport(
                            StatusCode::Unavailable,
                            "read stream ended with reads outstanding",
                        ));
                    }
                },
            }
        }
    }

    fn on_error(&mut self, err: TransportError) -> StreamExit {
        match err.detail {
            Some(ErrorDetail::Redirect(info)) => {
                *self.redirects += 1;
                if *self.redirects > self.ctx.max_redirects {
                    let max = self.ctx.max_redirects;
                    error!(max, "Redirect limit exceeded");
                    fail_stream(self.state, self.ready, BidiError::RedirectLimit { max });
                    return StreamExit::Closed;
                }
                let redirected = self.state.lock().on_redirect(info);
                if let Err(err) = redirected {
                    fail_stream(self.state, self.ready, err);
                    return StreamExit::Closed;
                }
                debug!(redirects = *self.redirects, "Read stream redirected");
                StreamExit::Reconnect
            }
            Some(ErrorDetail::ReadRangeErrors(errors)) => {
                let effects = self.state.lock().on_range_errors(errors);
                for effect in effects {
                    effect.apply_now();
                }
                if self.retire_when_idle && self.state.lock().is_idle() {
                    return StreamExit::Closed;
                }
                StreamExit::Reconnect
            }
            None => StreamExit::Failed(BidiError::transport(err.code, err.message)),
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Deliver { tx, frame } => {
                    if tx.send(frame).await.is_err() {
                        debug!("Streaming consumer went away");
                    }
                }
                Effect::Resend { read_id, after } => {
                    let commands = self.commands_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = commands.send(ReadCommand::Send(read_id));
                    });
                }
                resolve @ Effect::Resolve { .. } => resolve.apply_now(),
            }
        }
    }
}
