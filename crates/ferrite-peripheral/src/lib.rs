//! The register abstraction and the peripheral host binding it to the
//! transport fabric.
//!
//! A device model embeds a [`Peripheral`], registers its [`Register`]s with
//! it and forwards its `TlmDevice` implementation to the glue functions in
//! this crate:
//!
//! ```ignore
//! impl TlmDevice for MyDevice {
//!     fn b_transport(&mut self, s: usize, tx: &mut Transaction, dt: &mut SimTime) {
//!         ferrite_peripheral::b_transport(self, s, tx, dt);
//!     }
//!     // transport_dbg / get_direct_mem_ptr / register_upstream /
//!     // socket_width forward the same way.
//! }
//! ```

mod peripheral;
mod register;

pub use peripheral::{
    b_transport, get_direct_mem_ptr, register_upstream, socket_width, transport_dbg, Peripheral,
    PeripheralDevice, RegisterError, DEFAULT_CLOCK_HZ,
};
pub use register::{ReadFn, RegCells, Register, TaggedReadFn, TaggedWriteFn, WriteFn};
