// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher: one build task on one worker, always ending in exactly one
//! [`ResultRecord`].
//!
//! The protocol runs raced against the deadline and the caller's
//! cancellation token. Whichever way the race ends, the worker process is
//! killed if still running, the session is closed, and the log relay is
//! drained before the record is sealed.

use crate::classify::{classify, Attempt};
use crate::config::DispatchConfig;
use crate::protocol::{
    run_build, BuildReport, Phase, ProtocolFailure, ServeClient, SSH_CONNECTION_LOST,
};
use crate::relay::LogRelay;
use futures_util::FutureExt;
use rbd_adapters::{ProcessControl, RemoteProcess, Session, Store, Transport};
use rbd_core::{
    BuildTask, Clock, LogDestination, MachineDescriptor, ResultBuilder, ResultRecord, SystemClock,
};
use rbd_wire::ProtocolError;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Stand-in deadline for durations too large to add to an instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Resources one dispatch holds. Released by [`Connection::teardown`] on
/// every exit path.
struct Connection<S> {
    phase: Phase,
    session: Option<S>,
    control: Option<Box<dyn ProcessControl>>,
    relay: Option<LogRelay>,
}

impl<S: Session> Connection<S> {
    fn new() -> Self {
        Self { phase: Phase::Submit, session: None, control: None, relay: None }
    }

    async fn teardown(&mut self, drain_timeout: Duration) {
        if let Some(mut control) = self.control.take() {
            control.kill().await;
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                tracing::warn!(machine = session.machine(), error = %e, "failed to close session");
            }
        }
        if let Some(relay) = self.relay.take() {
            let report = relay.finish(drain_timeout).await;
            if let Some(error) = report.error {
                tracing::warn!(error, bytes_written = report.bytes_written, "build log incomplete");
            }
        }
    }
}

enum Race {
    Finished(std::thread::Result<Result<BuildReport, ProtocolFailure>>),
    Deadline,
    Cancelled,
}

/// Sends build tasks to workers.
pub struct Dispatcher<T, S, C = SystemClock> {
    transport: T,
    store: S,
    clock: C,
    config: DispatchConfig,
}

impl<T: Transport, S: Store> Dispatcher<T, S, SystemClock> {
    pub fn new(transport: T, store: S, config: DispatchConfig) -> Self {
        Self::with_clock(transport, store, SystemClock, config)
    }
}

impl<T: Transport, S: Store, C: Clock> Dispatcher<T, S, C> {
    pub fn with_clock(transport: T, store: S, clock: C, config: DispatchConfig) -> Self {
        Self { transport, store, clock, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Build `task` on `machine`, streaming its log to `log`.
    ///
    /// `deadline` bounds the whole dispatch from entry: connecting, input
    /// transfer, the build and output retrieval.
    pub async fn dispatch(
        &self,
        machine: &MachineDescriptor,
        task: &BuildTask,
        log: &LogDestination,
        deadline: Duration,
    ) -> ResultRecord {
        self.dispatch_with_cancel(machine, task, log, deadline, &CancellationToken::new()).await
    }

    /// Like [`Dispatcher::dispatch`], ending early with MiscFailure when
    /// `cancel` fires.
    pub async fn dispatch_with_cancel(
        &self,
        machine: &MachineDescriptor,
        task: &BuildTask,
        log: &LogDestination,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> ResultRecord {
        let span =
            tracing::info_span!("dispatch", machine = %machine.ssh_name, drv = %task.drv_path);
        self.run(machine, task, log, deadline, cancel).instrument(span).await
    }

    async fn run(
        &self,
        machine: &MachineDescriptor,
        task: &BuildTask,
        log: &LogDestination,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> ResultRecord {
        let mut builder = ResultBuilder::start(self.clock.epoch_ms());
        builder.log_file(log.path());
        let started = Instant::now();
        let deadline_at = started.checked_add(deadline).unwrap_or(started + FAR_FUTURE);
        let mut conn = Connection::new();

        let race = {
            let attempt =
                AssertUnwindSafe(self.attempt(&mut conn, machine, task, log)).catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Race::Cancelled,
                result = attempt => Race::Finished(result),
                _ = tokio::time::sleep_until(deadline_at) => Race::Deadline,
            }
        };
        let elapsed = started.elapsed();
        let phase = conn.phase;

        let attempt = match race {
            Race::Finished(Ok(result)) => Attempt::Completed { phase, result, elapsed },
            Race::Finished(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(%phase, panic = %message, "dispatch panicked");
                Attempt::Crashed { phase, message }
            }
            Race::Deadline => Attempt::DeadlineExceeded { phase, elapsed },
            Race::Cancelled => Attempt::Cancelled { phase },
        };

        conn.teardown(self.config.log_drain_timeout()).await;

        let (outcome, message) = classify(&attempt, deadline);
        builder.classify(outcome, message);
        if outcome.is_success() {
            if let Some(report) = attempt.report() {
                builder.outputs(report.outputs.clone());
                if let Some(timings) = report.timings {
                    builder.remote_timings(timings);
                }
            }
        }
        let record = builder.finish(self.clock.epoch_ms());

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if record.outcome().is_success() {
            tracing::info!(outcome = %record.outcome(), elapsed_ms, "dispatch finished");
        } else {
            tracing::info!(
                outcome = %record.outcome(),
                elapsed_ms,
                error = record.error_msg(),
                "dispatch finished"
            );
        }
        record
    }

    /// Connect, build and close. Everything acquired is parked in `conn`
    /// so it can be released even if this future is dropped midway.
    async fn attempt(
        &self,
        conn: &mut Connection<T::Session>,
        machine: &MachineDescriptor,
        task: &BuildTask,
        log: &LogDestination,
    ) -> Result<BuildReport, ProtocolFailure> {
        conn.phase = Phase::Submit;
        task.drv.validate()?;

        conn.phase = Phase::Connect;
        tracing::info!(phase = %conn.phase, "entering phase");
        let session = conn.session.insert(self.transport.open(machine).await?);
        let RemoteProcess { stdin, stdout, stderr, control } =
            session.run_command(&self.config.remote_command()).await?;
        conn.relay = Some(LogRelay::start(stderr, log));
        let control = conn.control.insert(control);

        let mut client = ServeClient::handshake(stdout, stdin).await?;
        let options = self.config.build_options();
        let result = run_build(&mut client, &self.store, task, options, &mut conn.phase).await;

        match result {
            Ok(report) => {
                client.close().await;
                match control.wait().await? {
                    Some(0) => Ok(report),
                    Some(SSH_CONNECTION_LOST) => Err(ProtocolFailure::ConnectionLost),
                    code => Err(ProtocolFailure::RemoteExit(code)),
                }
            }
            Err(ProtocolFailure::Protocol(ProtocolError::ConnectionClosed)) => {
                client.close().await;
                match control.wait().await? {
                    Some(SSH_CONNECTION_LOST) => Err(ProtocolFailure::ConnectionLost),
                    _ => Err(ProtocolFailure::Protocol(ProtocolError::ConnectionClosed)),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
