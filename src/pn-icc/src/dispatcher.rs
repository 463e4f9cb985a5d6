//! A typed dispatch table mapping [`IccMessageType`] to handler objects, replacing the original's
//! `icc_register(type, fn_ptr)` global function-pointer array (see `main.c`'s
//! `icc_register(ICC_TYPE_STARTED, icc_started)` and friends). The "one handler per type" rule the
//! original enforced implicitly (the second `icc_register` call for a type just overwrites the
//! first) is made an explicit error here.

use std::sync::Arc;

use newt::NumEnumMap;
use parking_lot::RwLock;

use crate::{
    error::IccError,
    message::{IccMessage, IccMessageType},
};

pub trait IccHandler: Send + Sync {
    fn handle(&self, msg: IccMessage);
}

impl<F: Fn(IccMessage) + Send + Sync> IccHandler for F {
    fn handle(&self, msg: IccMessage) {
        self(msg)
    }
}

pub struct IccHandlerTable {
    handlers: RwLock<NumEnumMap<IccMessageType, Option<Arc<dyn IccHandler>>>>,
}

impl Default for IccHandlerTable {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(NumEnumMap::from_fn(|_| None)),
        }
    }
}

impl IccHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `ty`. Errors if a handler is already registered for that type,
    /// rather than silently replacing it.
    pub fn register(
        &self,
        ty: IccMessageType,
        handler: Arc<dyn IccHandler>,
    ) -> Result<(), IccError> {
        let mut handlers = self.handlers.write();
        if handlers[ty].is_some() {
            return Err(IccError::HandlerAlreadyRegistered(ty));
        }
        handlers[ty] = Some(handler);
        Ok(())
    }

    pub fn dispatch(&self, msg: IccMessage) -> Result<(), IccError> {
        let ty = msg.ty();
        let handler = self.handlers.read()[ty].clone();

        match handler {
            Some(handler) => {
                handler.handle(msg);
                Ok(())
            }
            None => Err(IccError::NoHandler(ty)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::message::IccPayload;

    #[test]
    fn dispatches_to_registered_handler() {
        let table = IccHandlerTable::new();
        let seen = Arc::new(AtomicU32::new(0));

        let seen2 = seen.clone();
        table
            .register(
                IccMessageType::Paused,
                Arc::new(move |msg: IccMessage| {
                    seen2.store(msg.sender, Ordering::SeqCst);
                }),
            )
            .unwrap();

        table
            .dispatch(IccMessage::new(7, IccPayload::Paused))
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn dispatch_without_handler_errors() {
        let table = IccHandlerTable::new();
        assert_eq!(
            table.dispatch(IccMessage::new(0, IccPayload::Stop)),
            Err(IccError::NoHandler(IccMessageType::Stop))
        );
    }

    #[test]
    fn double_registration_errors() {
        let table = IccHandlerTable::new();
        table
            .register(IccMessageType::Start, Arc::new(|_: IccMessage| {}))
            .unwrap();

        assert_eq!(
            table.register(IccMessageType::Start, Arc::new(|_: IccMessage| {})),
            Err(IccError::HandlerAlreadyRegistered(IccMessageType::Start))
        );
    }
}
