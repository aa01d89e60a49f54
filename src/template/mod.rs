//! Template configuration manager (spec §4.2): discovers template files,
//! merges them by priority, normalizes fields through the remap registry,
//! caches with a TTL, and validates on request. This is the single source
//! of truth for template data.

pub mod discovery;
pub mod remap;
pub mod validation;

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::domain::{Template, TemplateBuilder};
use crate::error::{BrokerError, Result, ValidationError};
use crate::template::validation::ValidationReport;

struct CacheEntry {
    template: Template,
    cached_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

/// Discovers, caches, and resolves templates for one scheduler
/// (`hostfactory`) against possibly many provider APIs.
pub struct TemplateConfigManager {
    scan_dir: PathBuf,
    extra_paths: Vec<PathBuf>,
    default_ttl: Duration,
    scheduler: String,
    cache: DashMap<String, CacheEntry>,
    refresh_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl TemplateConfigManager {
    pub fn new(scan_dir: PathBuf, extra_paths: Vec<PathBuf>, default_ttl: Duration) -> Self {
        Self {
            scan_dir,
            extra_paths,
            default_ttl,
            scheduler: "hostfactory".to_string(),
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
        }
    }

    fn cache_key(provider_api: &str, template_id: &str) -> String {
        format!("{provider_api}:{template_id}")
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.refresh_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Load (or refresh, on TTL expiry) a single template by id. A refresh
    /// in flight for this key blocks concurrent refreshes for the same key;
    /// other readers keep seeing the stale entry until it completes (spec
    /// §4.2 caching, §5 "single-flighted per template_id").
    pub async fn get_template(&self, provider_api: &str, template_id: &str) -> Result<Template> {
        let key = Self::cache_key(provider_api, template_id);

        if let Some(mut entry) = self.cache.get_mut(&key) {
            if entry.cached_at.elapsed() <= entry.ttl {
                entry.hit_count += 1;
                return Ok(entry.template.clone());
            }
        }

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Re-check: another task may have refreshed while we waited for the lock.
        if let Some(entry) = self.cache.get(&key) {
            if entry.cached_at.elapsed() <= entry.ttl {
                return Ok(entry.template.clone());
            }
        }

        self.refresh_provider(provider_api)?;

        self.cache
            .get(&key)
            .map(|e| e.template.clone())
            .ok_or_else(|| BrokerError::not_found("Template", template_id))
    }

    /// Rescan disk for `provider_api` and repopulate the cache for every
    /// template found (§4.2's "record source_file and file_priority").
    fn refresh_provider(&self, provider_api: &str) -> Result<()> {
        let files = discovery::discover_files(provider_api, &self.scan_dir, &self.extra_paths)?;
        let merged = discovery::merge_by_priority(files);

        for (template_id, (object, source_file, file_priority)) in merged {
            let internal = remap::remap_object(&self.scheduler, provider_api, &object);
            match build_template_from_internal(&template_id, provider_api, &internal, &source_file, file_priority) {
                Ok(template) => {
                    let key = Self::cache_key(provider_api, &template_id);
                    self.cache.insert(
                        key,
                        CacheEntry {
                            template,
                            cached_at: Instant::now(),
                            ttl: self.default_ttl,
                            hit_count: 0,
                        },
                    );
                }
                Err(e) => {
                    warn!("skipping malformed template '{template_id}' in {source_file}: {e}");
                }
            }
        }
        Ok(())
    }

    /// List every currently-valid template for a provider, forcing a fresh
    /// scan (used by `ListTemplates`/`getAvailableTemplates`).
    pub async fn list_templates(&self, provider_api: &str) -> Result<Vec<Template>> {
        self.refresh_provider(provider_api)?;
        let prefix = format!("{provider_api}:");
        Ok(self
            .cache
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.template.clone())
            .collect())
    }

    pub fn validate(&self, template: &Template) -> ValidationReport {
        validation::validate_template(template)
    }

    pub fn cache_hit_count(&self, provider_api: &str, template_id: &str) -> u64 {
        self.cache
            .get(&Self::cache_key(provider_api, template_id))
            .map(|e| e.hit_count)
            .unwrap_or(0)
    }

}

fn build_template_from_internal(
    template_id: &str,
    provider_api: &str,
    internal: &serde_json::Map<String, serde_json::Value>,
    source_file: &str,
    file_priority: u32,
) -> Result<Template> {
    let mut builder = TemplateBuilder::new(template_id, provider_api);
    builder.source_file = Some(source_file.to_string());
    builder.file_priority = file_priority;

    if let Some(v) = internal.get("image_id").and_then(|v| v.as_str()) {
        builder.image_id = v.to_string();
    }
    if let Some(v) = internal
        .get("max_instances")
        .or_else(|| internal.get("max_number"))
        .and_then(|v| v.as_u64())
    {
        builder.max_number = v as u32;
    }
    if let Some(v) = internal.get("instance_type").and_then(|v| v.as_str()) {
        builder.instance_type = Some(v.to_string());
    }
    if let Some(v) = internal.get("instance_types").and_then(|v| v.as_object()) {
        // `v` iterates in the source file's key order (serde_json's
        // `preserve_order` feature); collecting into an `IndexMap` carries
        // that order through to `Template::build`'s first-key derivation
        // (spec §3: "stable iteration order over the input").
        let map = v
            .iter()
            .filter_map(|(k, val)| val.as_u64().map(|n| (k.clone(), n as u32)))
            .collect();
        builder.instance_types = Some(map);
    }
    if let Some(v) = internal.get("subnet_ids").and_then(|v| v.as_array()) {
        builder.subnet_ids = v.iter().filter_map(|x| x.as_str().map(String::from)).collect();
    }
    if let Some(v) = internal.get("security_group_ids").and_then(|v| v.as_array()) {
        builder.security_group_ids = v.iter().filter_map(|x| x.as_str().map(String::from)).collect();
    }
    if let Some(v) = internal.get("price_type").and_then(|v| v.as_str()) {
        builder.price_type = match v {
            "spot" => crate::domain::PriceType::Spot,
            "heterogeneous" => crate::domain::PriceType::Heterogeneous,
            _ => crate::domain::PriceType::OnDemand,
        };
    }
    if let Some(v) = internal.get("percent_on_demand").and_then(|v| v.as_u64()) {
        builder.spot.percent_on_demand = Some(v as u32);
    }
    if let Some(v) = internal.get("instance_types_ondemand").and_then(|v| v.as_object()) {
        let map = v
            .iter()
            .filter_map(|(k, val)| val.as_u64().map(|n| (k.clone(), n as u32)))
            .collect();
        builder.spot.instance_types_ondemand = Some(map);
    }
    if let Some(v) = internal.get("fleet_role").and_then(|v| v.as_str()) {
        builder.spot.fleet_role = Some(v.to_string());
    }
    if let Some(v) = internal.get("use_spot_instances").and_then(|v| v.as_bool()) {
        builder.use_spot_instances = v;
    }
    if let Some(v) = internal.get("use_auto_scaling").and_then(|v| v.as_bool()) {
        builder.use_auto_scaling = v;
    }
    if let Some(v) = internal.get("use_fleet").and_then(|v| v.as_bool()) {
        builder.use_fleet = v;
    }
    if let Some(v) = internal.get("tags").and_then(|v| v.as_object()) {
        builder.tags = v
            .iter()
            .filter_map(|(k, val)| val.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
    }

    if builder.image_id.is_empty() {
        return Err(ValidationError::MissingField("image_id".to_string()).into());
    }

    Template::build(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_template_file(dir: &std::path::Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        write!(f, "{contents}").unwrap();
    }

    #[tokio::test]
    async fn loads_and_caches_a_template_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        write_template_file(
            dir.path(),
            "templates.json",
            r#"[{"templateId": "t1", "image_id": "ami-0abc1234def567890",
                "subnet_ids": "subnet-aaaa1111bbbb2222c", "instance_type": "t3.medium",
                "max_number": 5}]"#,
        );

        let manager = TemplateConfigManager::new(dir.path().to_path_buf(), vec![], Duration::from_secs(60));
        let template = manager.get_template("aws", "t1").await.unwrap();
        assert_eq!(template.max_number, 5);
        assert_eq!(template.subnet_ids, vec!["subnet-aaaa1111bbbb2222c".to_string()]);
    }

    #[tokio::test]
    async fn stale_entry_is_returned_before_ttl_and_refreshed_after() {
        let dir = tempfile::tempdir().unwrap();
        write_template_file(
            dir.path(),
            "templates.json",
            r#"[{"templateId": "t1", "image_id": "ami-0abc1234def567890",
                "subnet_ids": "subnet-aaaa1111bbbb2222c", "instance_type": "t3.medium",
                "max_number": 1}]"#,
        );

        let manager = TemplateConfigManager::new(dir.path().to_path_buf(), vec![], Duration::from_millis(20));
        let first = manager.get_template("aws", "t1").await.unwrap();
        assert_eq!(first.max_number, 1);

        write_template_file(
            dir.path(),
            "templates.json",
            r#"[{"templateId": "t1", "image_id": "ami-0abc1234def567890",
                "subnet_ids": "subnet-aaaa1111bbbb2222c", "instance_type": "t3.medium",
                "max_number": 9}]"#,
        );

        let still_stale = manager.get_template("aws", "t1").await.unwrap();
        assert_eq!(still_stale.max_number, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let refreshed = manager.get_template("aws", "t1").await.unwrap();
        assert_eq!(refreshed.max_number, 9);
    }

    #[tokio::test]
    async fn missing_template_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TemplateConfigManager::new(dir.path().to_path_buf(), vec![], Duration::from_secs(60));
        let result = manager.get_template("aws", "nonexistent").await;
        assert!(matches!(result, Err(BrokerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_templates_returns_every_resolved_template() {
        let dir = tempfile::tempdir().unwrap();
        write_template_file(
            dir.path(),
            "templates.json",
            r#"[
                {"templateId": "t1", "image_id": "ami-0abc1234def567890", "subnet_ids": "subnet-aaaa1111bbbb2222c", "instance_type": "t3.medium", "max_number": 1},
                {"templateId": "t2", "image_id": "ami-0abc1234def567891", "subnet_ids": "subnet-aaaa1111bbbb2222c", "instance_type": "t3.large", "max_number": 2}
            ]"#,
        );

        let manager = TemplateConfigManager::new(dir.path().to_path_buf(), vec![], Duration::from_secs(60));
        let templates = manager.list_templates("aws").await.unwrap();
        assert_eq!(templates.len(), 2);
    }
}
