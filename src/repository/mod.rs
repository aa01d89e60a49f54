//! Persistence ports for Template, Request, and Machine (spec §4.6).
//!
//! One port, three interchangeable backends: [`in_memory`] for tests and
//! dev, [`file_backed`] (single-file JSON, atomic write-then-rename) for
//! single-process deployments, and [`dynamodb`] for a managed KV store.
//! None of the backends enforce business rules — they persist exactly what
//! the aggregate hands them.

pub mod dynamodb;
pub mod file_backed;
pub mod in_memory;
pub mod migration;

use async_trait::async_trait;

use crate::domain::{Machine, Request, Template};
use crate::error::Result;

/// Anything with a stable string id, keyed for repository storage.
pub trait Identifiable {
    fn entity_id(&self) -> String;
}

impl Identifiable for Template {
    fn entity_id(&self) -> String {
        self.template_id.clone()
    }
}

impl Identifiable for Request {
    fn entity_id(&self) -> String {
        self.request_id.clone()
    }
}

impl Identifiable for Machine {
    fn entity_id(&self) -> String {
        self.machine_id.clone()
    }
}

/// The common port every backend implements for every entity type (spec
/// §4.6): `save` upserts, `delete` of a missing id returns `false` without
/// error, `get_by_id` returns `None` for a miss, finders return an empty
/// list for no match.
#[async_trait]
pub trait Repository<T>: Send + Sync
where
    T: Identifiable + Clone + Send + Sync,
{
    async fn get_by_id(&self, id: &str) -> Result<Option<T>>;

    /// `offset`/`limit` bound an in-memory-equivalent page; backends that
    /// support a native continuation token (DynamoDB) still honor this
    /// contract at the port boundary.
    async fn get_all(&self, limit: Option<usize>, offset: usize) -> Result<Vec<T>>;

    async fn save(&self, item: T) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get_by_id(id).await?.is_some())
    }

    /// Domain-specific finders are expressed as predicates over the full
    /// collection; each backend decides how to execute them (in-memory scan,
    /// file scan, or a DynamoDB filter expression where the predicate is
    /// cheap to translate, falling back to scan-then-filter otherwise).
    async fn find(&self, predicate: &(dyn Fn(&T) -> bool + Send + Sync)) -> Result<Vec<T>>;
}

pub type TemplateRepository = dyn Repository<Template>;
pub type RequestRepository = dyn Repository<Request>;
pub type MachineRepository = dyn Repository<Machine>;
