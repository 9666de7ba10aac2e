//! Reader-tracking strategies.
//!
//! The set of flavors is closed: [`Sched`] treats every context switch as a
//! quiescent state and needs no read markers, while [`Marked`] counts
//! explicit read-side nesting and refuses quiescent notes while nested.

mod sealed {
    pub trait Sealed {}
}

/// How a flavor recognizes that a context is outside read-side code.
pub trait ReadSide: sealed::Sealed + Send + Sync + 'static {
    /// Flavor name used in diagnostics.
    const NAME: &'static str;
    /// Read markers maintain a per-context nesting count.
    const TRACKS_READERS: bool;
}

/// Any context switch, idle period or quiescent note ends all readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sched;

/// Readers bracket their sections with explicit enter/exit markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Marked;

impl sealed::Sealed for Sched {}
impl sealed::Sealed for Marked {}

impl ReadSide for Sched {
    const NAME: &'static str = "sched";
    const TRACKS_READERS: bool = false;
}

impl ReadSide for Marked {
    const NAME: &'static str = "marked";
    const TRACKS_READERS: bool = true;
}
