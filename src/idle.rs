//! Caller-registered idle work run once per scheduler tick.

use std::time::Duration;

use flume::Receiver;

use crate::error::ControlError;

/// Identity of a registered idle function, handed out at registration time.
/// Iteration order inside the scheduler is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleFnId(pub(crate) u64);

/// Wake handle an idle function may contribute to the scheduler's
/// multiplexed wait. One message on the channel ends the current wait early;
/// the token itself is consumed by the scheduler.
pub type WakeHandle = Receiver<()>;

/// What an idle function asks of the scheduler for the current tick.
pub enum IdleStatus {
    /// Deregister this function; the scheduler re-polls immediately.
    Finished,
    /// Keep the function registered; the scheduler re-polls immediately.
    Ready,
    /// Nothing to do for up to this long.
    SleepFor(Duration),
    /// Sleep, but wake early if any of these handles becomes ready.
    Watch(Vec<WakeHandle>),
}

/// An idle function is called once per tick with `is_final_call` (always
/// `false` from the running loop). An `Err` return is fatal to the worker:
/// the function is deregistered and shutdown begins. Return
/// [`ControlError::Handled`] to skip the error log when the failure was
/// already reported at the point it occurred.
pub type IdleFn = Box<dyn FnMut(bool) -> Result<IdleStatus, ControlError> + Send>;

pub(crate) struct IdleEntry {
    pub id: IdleFnId,
    pub func: IdleFn,
}
