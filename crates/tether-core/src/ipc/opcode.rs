//! Op-code table: the only call target that survives a process boundary.

use super::message::{Ipc, IpcFn};
use crate::error::{Result, TetherError};
use crate::reactor::Reactor;
use std::collections::HashMap;
use std::sync::Arc;

/// Op-codes from here up are reserved for internal use.
pub const RESERVED_FROM: u32 = 0xFFFF_0000;

/// Call, reply and done handlers registered for one op-code.
#[derive(Clone)]
pub struct OpcodeHandlers {
    pub(crate) call: IpcFn,
    pub(crate) on_reply: Option<IpcFn>,
    pub(crate) on_done: Option<IpcFn>,
}

impl OpcodeHandlers {
    pub fn new<F>(call: F) -> Self
    where
        F: Fn(&mut Reactor, &Ipc) + Send + Sync + 'static,
    {
        Self {
            call: Arc::new(call),
            on_reply: None,
            on_done: None,
        }
    }

    /// Default reply handler for replies no pending caller claims.
    pub fn on_reply<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Reactor, &Ipc) + Send + Sync + 'static,
    {
        self.on_reply = Some(Arc::new(f));
        self
    }

    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Reactor, &Ipc) + Send + Sync + 'static,
    {
        self.on_done = Some(Arc::new(f));
        self
    }
}

#[derive(Default)]
pub(crate) struct OpcodeTable {
    handlers: HashMap<u32, OpcodeHandlers>,
}

impl OpcodeTable {
    pub(crate) fn register(&mut self, opcode: u32, handlers: OpcodeHandlers) -> Result<()> {
        if opcode == 0 || opcode >= RESERVED_FROM {
            return Err(TetherError::OpcodeReserved(opcode));
        }
        if self.handlers.contains_key(&opcode) {
            return Err(TetherError::OpcodeInUse(opcode));
        }
        self.handlers.insert(opcode, handlers);
        Ok(())
    }

    pub(crate) fn unregister(&mut self, opcode: u32) -> bool {
        self.handlers.remove(&opcode).is_some()
    }

    pub(crate) fn get(&self, opcode: u32) -> Option<&OpcodeHandlers> {
        self.handlers.get(&opcode)
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl Reactor {
    /// Register handlers for `opcode`. Register before [`Reactor::start`] so
    /// forked workers inherit the table.
    pub fn opcode_register(&mut self, opcode: u32, handlers: OpcodeHandlers) -> Result<()> {
        self.ipc.opcodes.register(opcode, handlers)
    }

    pub fn opcode_unregister(&mut self, opcode: u32) -> bool {
        self.ipc.opcodes.unregister(opcode)
    }

    pub fn opcode_count(&self) -> usize {
        self.ipc.opcodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_conflicts() {
        let mut table = OpcodeTable::default();
        table.register(7, OpcodeHandlers::new(|_, _| {})).unwrap();
        assert!(matches!(
            table.register(7, OpcodeHandlers::new(|_, _| {})),
            Err(TetherError::OpcodeInUse(7))
        ));
        assert!(table.get(7).is_some());
        assert!(table.get(8).is_none());
        assert!(table.unregister(7));
        assert!(!table.unregister(7));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_reserved_opcodes() {
        let mut table = OpcodeTable::default();
        for opcode in [0, RESERVED_FROM, u32::MAX] {
            assert!(matches!(
                table.register(opcode, OpcodeHandlers::new(|_, _| {})),
                Err(TetherError::OpcodeReserved(_))
            ));
        }
    }
}
