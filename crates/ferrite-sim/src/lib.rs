//! Interface to the discrete-event kernel hosting the platform.
//!
//! The core never owns the event loop; it only needs a handful of services
//! from whatever kernel drives the simulation: the global time stamp, the
//! global quantum bounding temporal decoupling, a way to consume a local
//! time offset (`sync`), and process identity for re-entrant serialization.
//! [`Scheduler`] bundles those services. The bundled implementation is a
//! plain single-threaded clock, which is all the transport layer requires;
//! a fuller kernel can drive the same handle.
//!
//! Local time offsets are passed explicitly as `&mut SimTime` through every
//! transport call, so there is no per-process offset table here.

mod clock;
mod scheduler;

pub use clock::clock_cycles;
pub use scheduler::{ProcessGuard, ProcessId, Scheduler};
