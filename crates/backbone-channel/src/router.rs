//! Dispatch by operation signature.

use std::{collections::HashMap, sync::Arc};

use backbone_core::Announcement;

use crate::dispatch::{AnnouncementHandler, ConsumerContext};

/// Lookup table from operation signature to handler.
///
/// Announcements whose operation has no route are reported as not handled,
/// so the router composes with fallbacks and partial behaviors like any
/// other handler.
#[derive(Clone, Default)]
pub struct OperationRouter {
    routes: HashMap<String, Arc<dyn AnnouncementHandler>>,
}

impl std::fmt::Debug for OperationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        operations.sort_unstable();
        f.debug_struct("OperationRouter").field("operations", &operations).finish()
    }
}

impl OperationRouter {
    /// Creates a router without routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `operation` to `handler`, replacing an earlier route.
    #[must_use]
    pub fn route(mut self, operation: impl Into<String>, handler: Arc<dyn AnnouncementHandler>) -> Self {
        self.routes.insert(operation.into(), handler);
        self
    }

    /// Returns true when `operation` has a route.
    pub fn handles(&self, operation: &str) -> bool {
        self.routes.contains_key(operation)
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true when no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait::async_trait]
impl AnnouncementHandler for OperationRouter {
    async fn handle(&self, announcement: &Announcement, context: &ConsumerContext) -> anyhow::Result<bool> {
        match self.routes.get(announcement.operation()) {
            Some(handler) => handler.handle(announcement, context).await,
            None => Ok(false),
        }
    }
}
