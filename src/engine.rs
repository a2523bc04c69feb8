//! Seam between the scheduler and the thing that actually computes work.

use crate::bus::{Command, Response};
use crate::error::ControlError;
use crate::event::EventSink;

/// The externally-constructed engine that executes build commands.
///
/// Command-level failures belong inside the [`Response`]; an `Err` return
/// means the engine itself misbehaved and is caught at the tick level
/// without stopping the worker loop. Events emitted during execution go
/// through the sink, which never fails the caller.
pub trait WorkEngine: Send {
    fn run_command(
        &mut self,
        command: &Command,
        events: &EventSink,
    ) -> Result<Response, ControlError>;

    /// Final shutdown. `force` is set on the quit path.
    fn shutdown(&mut self, force: bool);
}
