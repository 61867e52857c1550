//! The behavior contract every hosted entity implements. One instance is
//! constructed lazily per `EntityAddress` the first time a message for it
//! arrives, and lives inside that entity's mailbox task until evicted.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::Reply;

/// A stateful handler for one entity. `handle` may emit any number of
/// `Chunk` replies on `replies` before a terminal `WithExit`; the mailbox
/// persists and forwards each one as it arrives.
#[async_trait]
pub trait EntityBehavior: Send {
    async fn handle(&mut self, request_id: i64, tag: String, payload: serde_json::Value, replies: mpsc::Sender<Reply>);
}

/// Builds a fresh `EntityBehavior` for a given entity id. Implemented as a
/// blanket impl over closures so `registerEntity` can take `|id| Box::new(...)`
/// directly, the way the grounding codebase's config loaders take plain
/// closures rather than requiring a named factory type.
pub trait EntityFactory: Send + Sync {
    fn create(&self, entity_id: &str) -> Box<dyn EntityBehavior>;
}

impl<F> EntityFactory for F
where
    F: Fn(&str) -> Box<dyn EntityBehavior> + Send + Sync,
{
    fn create(&self, entity_id: &str) -> Box<dyn EntityBehavior> {
        self(entity_id)
    }
}
