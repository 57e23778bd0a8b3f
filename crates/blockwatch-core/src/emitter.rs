//! Budgeted event delivery and the exit policy.
//!
//! At most `max_blocked_events` events leave the process. The send that
//! exhausts the budget schedules process termination after a grace period,
//! on the assumption that a process blocked that often is unrecoverable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{WatchdogConfig, duration_ms};
use crate::event::DiagnosticEvent;
use crate::transport::{Envelope, Transport};

/// Terminates the process on behalf of the emitter.
pub trait ProcessController: Send + Sync {
    /// Arrange for the process to end after `delay`. Must not block.
    fn schedule_exit(&self, delay: Duration);
}

/// [`ProcessController`] that calls [`std::process::exit`] from a detached
/// thread once the delay has elapsed.
#[derive(Debug, Clone, Copy)]
pub struct ExitProcess {
    code: i32,
}

impl ExitProcess {
    #[must_use]
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    #[must_use]
    pub fn code(&self) -> i32 {
        self.code
    }
}

impl ProcessController for ExitProcess {
    fn schedule_exit(&self, delay: Duration) {
        let code = self.code;
        let spawned = std::thread::Builder::new()
            .name("blockwatch-exit".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                error!(exit_code = code, "Exiting after repeated blocked-unit events");
                std::process::exit(code);
            });
        if let Err(e) = spawned {
            error!(error = %e, exit_code = code, "Failed to spawn exit thread; exiting now");
            std::process::exit(code);
        }
    }
}

/// Result of one [`BoundedEmitter::emit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Delivered to the transport.
    Sent {
        /// Whether the flush confirmed delivery before its timeout.
        flushed: bool,
        /// Whether this send exhausted the budget and scheduled exit.
        exit_scheduled: bool,
    },
    /// Budget already exhausted.
    Dropped,
    /// The transport refused the event; the budget slot was released.
    SendFailed,
}

/// Caps the number of emitted events and triggers the exit policy.
///
/// A send first reserves a slot so concurrent episodes cannot overshoot the
/// cap. Only a send that returns `Ok` moves the reservation into `emitted`;
/// a failed or cancelled send hands its slot back.
pub struct BoundedEmitter {
    max_events: u32,
    reserved: AtomicU32,
    emitted: AtomicU32,
    exit_scheduled: AtomicBool,
    flush_timeout: Duration,
    exit_grace: Duration,
    transport: Arc<dyn Transport>,
    exit: Arc<dyn ProcessController>,
}

impl std::fmt::Debug for BoundedEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedEmitter")
            .field("max_events", &self.max_events)
            .field("reserved", &self.reserved.load(Ordering::SeqCst))
            .field("emitted", &self.emitted())
            .field("exit_scheduled", &self.exit_scheduled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// A reserved budget slot, released on drop unless committed.
struct SlotReservation<'a> {
    reserved: &'a AtomicU32,
    committed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl BoundedEmitter {
    #[must_use]
    pub fn new(
        config: &WatchdogConfig,
        transport: Arc<dyn Transport>,
        exit: Arc<dyn ProcessController>,
    ) -> Self {
        Self {
            max_events: config.max_blocked_events,
            reserved: AtomicU32::new(0),
            emitted: AtomicU32::new(0),
            exit_scheduled: AtomicBool::new(false),
            flush_timeout: config.flush_timeout(),
            exit_grace: config.exit_grace(),
            transport,
            exit,
        }
    }

    /// Events successfully handed to the transport so far.
    #[must_use]
    pub fn emitted(&self) -> u32 {
        self.emitted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn max_events(&self) -> u32 {
        self.max_events
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.emitted() >= self.max_events
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn reserve(&self) -> Option<SlotReservation<'_>> {
        let max = self.max_events;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| SlotReservation {
                reserved: &self.reserved,
                committed: false,
            })
    }

    /// Emit `event` if budget remains.
    ///
    /// Cancelling the returned future before the send completes releases
    /// the reserved slot.
    pub async fn emit(&self, event: DiagnosticEvent) -> EmitOutcome {
        let max = self.max_events;
        let Some(reservation) = self.reserve() else {
            return EmitOutcome::Dropped;
        };
        let unit_id = event.blocked_unit();
        let event_id = event.event_id.clone();

        if let Err(e) = self.transport.send(Envelope::Event(Box::new(event))).await {
            drop(reservation);
            warn!(
                unit_id = %unit_id,
                error = %e,
                "Failed to send blocked-unit event; dropping it"
            );
            return EmitOutcome::SendFailed;
        }
        reservation.commit();
        let count = self.emitted.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            unit_id = %unit_id,
            event_id = %event_id,
            emitted = count,
            max = max,
            "Blocked-unit event sent"
        );

        // Scheduled before the flush so a cancelled flush cannot skip it.
        let exit_scheduled = count >= max && !self.exit_scheduled.swap(true, Ordering::SeqCst);
        if exit_scheduled {
            warn!(
                emitted = count,
                max = max,
                grace_ms = duration_ms(self.exit_grace),
                "Blocked-event budget exhausted; scheduling process exit"
            );
            self.exit.schedule_exit(self.exit_grace);
        }

        let flushed = match tokio::time::timeout(
            self.flush_timeout,
            self.transport.flush(self.flush_timeout),
        )
        .await
        {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                warn!(timeout_ms = duration_ms(self.flush_timeout), "Transport flush incomplete");
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Transport flush failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = duration_ms(self.flush_timeout), "Transport flush timed out");
                false
            }
        };

        EmitOutcome::Sent {
            flushed,
            exit_scheduled,
        }
    }
}
