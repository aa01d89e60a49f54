//! Repository migration utility (spec §4.6): copies every entity from a
//! source backend to a target backend in batches, upserting idempotently.

use tracing::info;

use crate::error::Result;
use crate::repository::{Identifiable, Repository};

#[derive(Debug, Clone, Copy)]
pub struct MigrationProgress {
    pub total: usize,
    pub migrated: usize,
}

/// Copy every entity of type `T` from `source` to `target`, `batch_size` at
/// a time, reporting progress after each batch. `save` is upsert on both
/// sides, so re-running a migration after a partial failure is safe.
pub async fn migrate<T>(
    source: &(dyn Repository<T> + Send + Sync),
    target: &(dyn Repository<T> + Send + Sync),
    batch_size: usize,
    mut on_progress: impl FnMut(MigrationProgress),
) -> Result<MigrationProgress>
where
    T: Identifiable + Clone + Send + Sync,
{
    let all = source.get_all(None, 0).await?;
    let total = all.len();
    info!("migration starting: {total} entities to copy");

    let mut migrated = 0;
    for batch in all.chunks(batch_size.max(1)) {
        for item in batch {
            target.save(item.clone()).await?;
            migrated += 1;
        }
        on_progress(MigrationProgress { total, migrated });
    }

    Ok(MigrationProgress { total, migrated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Machine;
    use crate::repository::in_memory::InMemoryRepository;

    #[tokio::test]
    async fn migrates_every_entity_and_reports_final_progress() {
        let source = InMemoryRepository::<Machine>::new();
        for i in 0..5 {
            source.save(Machine::new(format!("m-{i}"), "req-1".into(), "t1".into())).await.unwrap();
        }
        let target = InMemoryRepository::<Machine>::new();

        let mut batches_seen = 0;
        let progress = migrate(&source, &target, 2, |_| batches_seen += 1).await.unwrap();

        assert_eq!(progress.total, 5);
        assert_eq!(progress.migrated, 5);
        assert_eq!(batches_seen, 3);
        assert_eq!(target.get_all(None, 0).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn rerunning_a_migration_is_idempotent() {
        let source = InMemoryRepository::<Machine>::new();
        source.save(Machine::new("m-1".into(), "req-1".into(), "t1".into())).await.unwrap();
        let target = InMemoryRepository::<Machine>::new();

        migrate(&source, &target, 10, |_| {}).await.unwrap();
        migrate(&source, &target, 10, |_| {}).await.unwrap();

        assert_eq!(target.get_all(None, 0).await.unwrap().len(), 1);
    }
}
