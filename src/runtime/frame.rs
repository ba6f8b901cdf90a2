use std::rc::Rc;

use crate::bytecode::op::Instructions;
use crate::lang::value::Closure;

/// One active function invocation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub closure: Rc<Closure>,
    pub ip: usize,
    /// Stack index of the first argument/local slot.
    pub base_pointer: usize,
}

impl Frame {
    pub fn new(closure: Rc<Closure>, base_pointer: usize) -> Self {
        Self {
            closure,
            ip: 0,
            base_pointer,
        }
    }

    pub fn instructions(&self) -> &Instructions {
        &self.closure.function.instructions
    }
}
