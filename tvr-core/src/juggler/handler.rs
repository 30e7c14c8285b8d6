use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RemoteError;

/// Handler for one inbound request opcode.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Run the operation. `Ok(Some(payload))` is echoed in the `OK`
    /// response; an error becomes an `ERR` response with a JSON body.
    async fn handle(&self, extra: Option<String>) -> Result<Option<String>, RemoteError>;

    /// Whether a failure of this handler ends the connection.
    fn fatal_on_failure(&self) -> bool {
        false
    }
}

/// Opcode → handler registry for one connection.
#[derive(Clone, Default)]
pub struct OperationTable {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `opcode`, returning any handler it replaced.
    pub fn register(
        &mut self,
        opcode: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        self.handlers.insert(opcode.into(), handler)
    }

    pub fn get(&self, opcode: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(opcode).cloned()
    }

    pub fn contains(&self, opcode: &str) -> bool {
        self.handlers.contains_key(opcode)
    }

    pub fn opcodes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<&str> = self.opcodes().collect();
        opcodes.sort_unstable();
        f.debug_struct("OperationTable")
            .field("opcodes", &opcodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl EventHandler for Echo {
        async fn handle(&self, extra: Option<String>) -> Result<Option<String>, RemoteError> {
            Ok(extra)
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let mut table = OperationTable::new();
        assert!(table.register("ECHO", Arc::new(Echo)).is_none());
        assert!(table.register("ECHO", Arc::new(Echo)).is_some());
        assert_eq!(table.len(), 1);
        assert!(table.contains("ECHO"));
        assert!(table.get("NOPE").is_none());

        let handler = table.get("ECHO").unwrap();
        assert!(!handler.fatal_on_failure());
        assert_eq!(
            handler.handle(Some("hi".into())).await.unwrap().as_deref(),
            Some("hi")
        );
    }
}
