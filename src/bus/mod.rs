//! Typed command/query bus and DI-style handler registry (spec §4.1).
//!
//! Registration is by static type: exactly one handler per `Command` or
//! `Query` type. Handlers are resolved lazily from the registry, so
//! registration order doesn't matter as long as every handler is registered
//! before the first dispatch.

pub mod single_flight;

use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BrokerError, Result};

/// Marker for a write-side operation. `Output` is whatever the one
/// registered handler returns.
pub trait Command: Send + 'static {
    type Output: Send + 'static;
}

/// Marker for a read-side operation.
pub trait Query: Send + 'static {
    type Output: Send + 'static;
}

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: C) -> Result<C::Output>;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: Q) -> Result<Q::Output>;
}

/// The dispatcher. `dispatch`/`query` are synchronous from the caller's
/// point of view even though the handler may suspend on I/O (spec §4.1).
#[derive(Default)]
pub struct Bus {
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register_command<C>(&mut self, handler: impl CommandHandler<C> + 'static)
    where
        C: Command,
    {
        let boxed: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.handlers.insert(TypeId::of::<C>(), Box::new(boxed));
    }

    pub fn register_query<Q>(&mut self, handler: impl QueryHandler<Q> + 'static)
    where
        Q: Query,
    {
        let boxed: Arc<dyn QueryHandler<Q>> = Arc::new(handler);
        self.handlers.insert(TypeId::of::<Q>(), Box::new(boxed));
    }

    pub async fn dispatch<C>(&self, command: C) -> Result<C::Output>
    where
        C: Command,
    {
        let handler = self
            .handlers
            .get(&TypeId::of::<C>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<dyn CommandHandler<C>>>())
            .ok_or_else(|| BrokerError::HandlerNotFound(std::any::type_name::<C>()))?;
        handler.handle(command).await
    }

    pub async fn query<Q>(&self, query: Q) -> Result<Q::Output>
    where
        Q: Query,
    {
        let handler = self
            .handlers
            .get(&TypeId::of::<Q>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<dyn QueryHandler<Q>>>())
            .ok_or_else(|| BrokerError::HandlerNotFound(std::any::type_name::<Q>()))?;
        handler.handle(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(String);
    impl Command for Ping {
        type Output = String;
    }

    struct PingHandler;
    #[async_trait]
    impl CommandHandler<Ping> for PingHandler {
        async fn handle(&self, command: Ping) -> Result<String> {
            Ok(format!("pong:{}", command.0))
        }
    }

    struct CountMachines;
    impl Query for CountMachines {
        type Output = u32;
    }

    struct CountMachinesHandler;
    #[async_trait]
    impl QueryHandler<CountMachines> for CountMachinesHandler {
        async fn handle(&self, _query: CountMachines) -> Result<u32> {
            Ok(3)
        }
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_handler() {
        let mut bus = Bus::new();
        bus.register_command::<Ping>(PingHandler);

        let result = bus.dispatch(Ping("hi".to_string())).await.unwrap();
        assert_eq!(result, "pong:hi");
    }

    #[tokio::test]
    async fn query_dispatches_to_the_registered_handler() {
        let mut bus = Bus::new();
        bus.register_query::<CountMachines>(CountMachinesHandler);

        let result = bus.query(CountMachines).await.unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn missing_handler_fails_with_handler_not_found() {
        let bus = Bus::new();
        let result = bus.dispatch(Ping("hi".to_string())).await;
        assert!(matches!(result, Err(BrokerError::HandlerNotFound(_))));
    }
}
