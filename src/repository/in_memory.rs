//! In-memory repository backend: maps under a mutex, pagination in memory
//! (spec §4.6). Primarily for tests and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::repository::{Identifiable, Repository};

pub struct InMemoryRepository<T> {
    items: Arc<Mutex<HashMap<String, T>>>,
}

impl<T> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for InMemoryRepository<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

#[async_trait]
impl<T> Repository<T> for InMemoryRepository<T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    async fn get_by_id(&self, id: &str) -> Result<Option<T>> {
        Ok(self.items.lock().await.get(id).cloned())
    }

    async fn get_all(&self, limit: Option<usize>, offset: usize) -> Result<Vec<T>> {
        let items = self.items.lock().await;
        let mut all: Vec<T> = items.values().cloned().collect();
        all.sort_by_key(|item| item.entity_id());
        let page = all.into_iter().skip(offset);
        Ok(match limit {
            Some(n) => page.take(n).collect(),
            None => page.collect(),
        })
    }

    async fn save(&self, item: T) -> Result<()> {
        self.items.lock().await.insert(item.entity_id(), item);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.items.lock().await.remove(id).is_some())
    }

    async fn find(&self, predicate: &(dyn Fn(&T) -> bool + Send + Sync)) -> Result<Vec<T>> {
        let items = self.items.lock().await;
        Ok(items.values().filter(|item| predicate(item)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Machine, MachineStatus};

    #[tokio::test]
    async fn save_then_get_by_id_round_trips() {
        let repo = InMemoryRepository::<Machine>::new();
        let machine = Machine::new("m-1".into(), "req-1".into(), "t1".into());
        repo.save(machine.clone()).await.unwrap();

        let fetched = repo.get_by_id("m-1").await.unwrap().unwrap();
        assert_eq!(fetched.machine_id, machine.machine_id);
    }

    #[tokio::test]
    async fn delete_of_missing_id_returns_false_without_error() {
        let repo = InMemoryRepository::<Machine>::new();
        assert!(!repo.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn get_by_id_returns_none_for_missing() {
        let repo = InMemoryRepository::<Machine>::new();
        assert!(repo.get_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_filters_by_predicate() {
        let repo = InMemoryRepository::<Machine>::new();
        let mut running = Machine::new("m-1".into(), "req-1".into(), "t1".into());
        running.assign_provider_instance("i-1".into()).unwrap();
        running.transition_to(MachineStatus::Running).unwrap();
        repo.save(running).await.unwrap();
        repo.save(Machine::new("m-2".into(), "req-1".into(), "t1".into())).await.unwrap();

        let found = repo.find(&|m: &Machine| m.status == MachineStatus::Running).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].machine_id, "m-1");
    }

    #[tokio::test]
    async fn get_all_respects_limit_and_offset() {
        let repo = InMemoryRepository::<Machine>::new();
        for i in 0..5 {
            repo.save(Machine::new(format!("m-{i}"), "req-1".into(), "t1".into())).await.unwrap();
        }
        let page = repo.get_all(Some(2), 1).await.unwrap();
        assert_eq!(page.len(), 2);
    }
}
