use std::cell::Cell;
use std::rc::Rc;

/// A level-sensitive interrupt line, shared between the raising device and
/// whatever samples it (an interrupt controller model or a testbench).
#[derive(Clone, Default)]
pub struct IrqLine {
    level: Rc<Cell<bool>>,
}

impl IrqLine {
    pub fn new() -> IrqLine {
        IrqLine::default()
    }

    pub fn set(&self, level: bool) {
        self.level.set(level);
    }

    pub fn is_raised(&self) -> bool {
        self.level.get()
    }
}
