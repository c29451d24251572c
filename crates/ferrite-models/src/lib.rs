//! Reference device models built on the peripheral core.

mod irq;
mod ram;
mod rng;
mod rtc;

pub use irq::IrqLine;
pub use ram::Ram;
pub use rng::Rng;
pub use rtc::Rtc;
