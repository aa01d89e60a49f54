//! File-backed repository backend: a single JSON file per collection,
//! written atomically via write-then-rename, with a file-level version
//! counter for optimistic concurrency (spec §4.6).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::repository::{Identifiable, Repository};

#[derive(serde::Serialize, serde::Deserialize)]
struct FileContents<T> {
    version: u64,
    items: HashMap<String, T>,
}

impl<T> Default for FileContents<T> {
    fn default() -> Self {
        Self {
            version: 0,
            items: HashMap::new(),
        }
    }
}

pub struct FileRepository<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> FileRepository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _marker: std::marker::PhantomData,
        }
    }

    fn read_contents(path: &Path) -> Result<FileContents<T>> {
        if !path.exists() {
            return Ok(FileContents::default());
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(FileContents::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write-then-rename: write to a sibling temp file, then rename over the
    /// target. A reader never observes a partially written file.
    fn write_contents(path: &Path, contents: &FileContents<T>) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let serialized = serde_json::to_string_pretty(contents)?;
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl<T> Repository<T> for FileRepository<T>
where
    T: Identifiable + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_by_id(&self, id: &str) -> Result<Option<T>> {
        let _guard = self.write_lock.lock().await;
        let contents = Self::read_contents(&self.path)?;
        Ok(contents.items.get(id).cloned())
    }

    async fn get_all(&self, limit: Option<usize>, offset: usize) -> Result<Vec<T>> {
        let _guard = self.write_lock.lock().await;
        let contents = Self::read_contents(&self.path)?;
        let mut all: Vec<T> = contents.items.into_values().collect();
        all.sort_by_key(|item| item.entity_id());
        let page = all.into_iter().skip(offset);
        Ok(match limit {
            Some(n) => page.take(n).collect(),
            None => page.collect(),
        })
    }

    async fn save(&self, item: T) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut contents = Self::read_contents(&self.path)?;
        contents.items.insert(item.entity_id(), item);
        contents.version += 1;
        Self::write_contents(&self.path, &contents)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut contents = Self::read_contents(&self.path)?;
        let removed = contents.items.remove(id).is_some();
        if removed {
            contents.version += 1;
            Self::write_contents(&self.path, &contents)?;
        }
        Ok(removed)
    }

    async fn find(&self, predicate: &(dyn Fn(&T) -> bool + Send + Sync)) -> Result<Vec<T>> {
        let _guard = self.write_lock.lock().await;
        let contents = Self::read_contents(&self.path)?;
        Ok(contents.items.values().filter(|item| predicate(item)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Machine;

    #[tokio::test]
    async fn save_persists_across_repository_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machines.json");

        let repo = FileRepository::<Machine>::new(&path);
        repo.save(Machine::new("m-1".into(), "req-1".into(), "t1".into())).await.unwrap();

        let reopened = FileRepository::<Machine>::new(&path);
        let fetched = reopened.get_by_id("m-1").await.unwrap().unwrap();
        assert_eq!(fetched.machine_id, "m-1");
    }

    #[tokio::test]
    async fn delete_of_missing_id_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::<Machine>::new(dir.path().join("machines.json"));
        assert!(!repo.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn no_temp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machines.json");
        let repo = FileRepository::<Machine>::new(&path);
        repo.save(Machine::new("m-1".into(), "req-1".into(), "t1".into())).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
