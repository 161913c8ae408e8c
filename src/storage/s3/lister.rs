use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, trace, warn};

use crate::storage::checksum::ContentAttributes;
use crate::storage::filter::{PathFilter, compile_glob, has_wildcard, split_at_wildcard};
use crate::storage::s3::{generate_full_key, remove_s3_prefix};
use crate::storage::{ListRequest, ObjectStore, SyncInventory};
use crate::types::error::S3mirrorError;
use crate::types::token::SyncCancellationToken;
use crate::types::{ContentHash, HashOutcome, RemoteObjectEntry};

const DELIMITER: &str = "/";

pub struct RemoteInventoryBuilder {
    pub store: ObjectStore,
    /// Key prefix, possibly containing `*`, `?` or `[`.
    pub prefix: String,
    pub recursive: bool,
    pub max_keys: i32,
    pub filter: PathFilter,
    /// HEAD an exactly named object to pick up its attribute blob.
    pub head_single_object: bool,
    pub cancellation_token: SyncCancellationToken,
}

struct ListingPlan {
    list_prefix: String,
    root: String,
    delimiter: Option<String>,
    pattern: Option<Regex>,
}

impl RemoteInventoryBuilder {
    pub fn new(store: ObjectStore, prefix: &str, cancellation_token: SyncCancellationToken) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            recursive: true,
            max_keys: 1000,
            filter: PathFilter::default(),
            head_single_object: false,
            cancellation_token,
        }
    }

    pub async fn build(&self) -> Result<RemoteInventory> {
        let plan = self.plan_listing()?;
        debug!(
            prefix = plan.list_prefix,
            root = plan.root,
            delimiter = plan.delimiter,
            "listing remote objects."
        );

        let mut objects = BTreeMap::new();
        let mut common_prefixes = Vec::new();
        let mut continuation = None;
        let mut page_count = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                trace!("remote listing cancelled.");
                return Err(anyhow!(S3mirrorError::Cancelled));
            }

            let request = ListRequest {
                prefix: plan.list_prefix.clone(),
                delimiter: plan.delimiter.clone(),
                continuation: continuation.clone(),
                max_keys: self.max_keys,
            };
            let page = self
                .store
                .list_page(&request)
                .await
                .context("failed to list remote objects.")?;
            page_count += 1;

            let last_key = page
                .objects
                .last()
                .map(|object| object.key.clone())
                .or_else(|| page.common_prefixes.last().cloned());

            for object in page.objects {
                if !self.is_in_scope(&plan, &object.key) {
                    continue;
                }

                let relative_key = relative_key_of(&plan.root, &object.key);
                if relative_key.is_empty() || relative_key.ends_with(DELIMITER) {
                    trace!(key = object.key, "directory marker skipped.");
                    continue;
                }
                if self.filter.is_excluded_with_parents(&relative_key) {
                    continue;
                }

                objects.insert(
                    relative_key.clone(),
                    RemoteObjectEntry {
                        relative_key,
                        key: object.key,
                        size: object.size,
                        last_modified: object.last_modified,
                        e_tag: object.e_tag,
                        storage_class: object.storage_class,
                        attributes_hash: None,
                    },
                );
            }
            common_prefixes.extend(page.common_prefixes);

            if !page.is_truncated {
                break;
            }

            continuation = page.next_continuation.or(last_key);
            if continuation.is_none() {
                warn!(
                    prefix = plan.list_prefix,
                    "truncated listing without a continuation marker."
                );
                break;
            }
        }

        let mut inventory = RemoteInventory {
            root: plan.root,
            objects,
            common_prefixes,
        };

        if self.head_single_object && plan.pattern.is_none() {
            inventory.head_exact_object(&self.store, &self.prefix).await?;
        }

        info!(
            prefix = self.prefix,
            objects = inventory.len(),
            pages = page_count,
            "remote inventory built."
        );

        Ok(inventory)
    }

    fn plan_listing(&self) -> Result<ListingPlan> {
        if has_wildcard(&self.prefix) {
            let (literal, remainder) = split_at_wildcard(&self.prefix);
            let recursive = remainder.contains(DELIMITER);

            return Ok(ListingPlan {
                list_prefix: literal.to_string(),
                root: parent_prefix(literal),
                delimiter: (!recursive).then(|| DELIMITER.to_string()),
                pattern: Some(compile_glob(&self.prefix, true)?),
            });
        }

        let root = if self.prefix.is_empty() || self.prefix.ends_with(DELIMITER) {
            self.prefix.clone()
        } else {
            parent_prefix(&self.prefix)
        };

        Ok(ListingPlan {
            list_prefix: self.prefix.clone(),
            root,
            delimiter: (!self.recursive).then(|| DELIMITER.to_string()),
            pattern: None,
        })
    }

    /// A prefix without a trailing `/` names an object or a directory, not a key stem.
    fn is_in_scope(&self, plan: &ListingPlan, key: &str) -> bool {
        if let Some(pattern) = &plan.pattern {
            return pattern.is_match(key);
        }

        if self.prefix.is_empty() || self.prefix.ends_with(DELIMITER) {
            return true;
        }

        key == self.prefix || key.starts_with(&format!("{}{DELIMITER}", self.prefix))
    }
}

fn parent_prefix(prefix: &str) -> String {
    match prefix.rfind(DELIMITER) {
        Some(index) => prefix[..=index].to_string(),
        None => "".to_string(),
    }
}

fn relative_key_of(root: &str, key: &str) -> String {
    remove_s3_prefix(key, root)
}

/// Remote side of a sync, keyed by key relative to the listing root.
#[derive(Debug, Clone, Default)]
pub struct RemoteInventory {
    root: String,
    objects: BTreeMap<String, RemoteObjectEntry>,
    common_prefixes: Vec<String>,
}

impl RemoteInventory {
    pub fn new(root: &str, objects: Vec<RemoteObjectEntry>) -> Self {
        Self {
            root: root.to_string(),
            objects: objects
                .into_iter()
                .map(|object| (object.relative_key.clone(), object))
                .collect(),
            common_prefixes: vec![],
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, relative_key: &str) -> Option<&RemoteObjectEntry> {
        self.objects.get(relative_key)
    }

    pub fn objects(&self) -> impl Iterator<Item = &RemoteObjectEntry> {
        self.objects.values()
    }

    pub fn common_prefixes(&self) -> &[String] {
        &self.common_prefixes
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Maps an object to another relative key without changing its full key.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(mut object) = self.objects.remove(from) {
            object.relative_key = to.to_string();
            self.objects.insert(to.to_string(), object);
        }
    }

    pub fn retain(&mut self, mut f: impl FnMut(&str) -> bool) {
        self.objects.retain(|relative_key, _| f(relative_key));
    }

    pub fn full_key(&self, relative_key: &str) -> String {
        generate_full_key(&self.root, relative_key)
    }

    /// Looks up the attribute blob of objects whose ETag is a composite multipart value.
    ///
    /// The carried hash is trusted only when the recorded size matches the object size.
    pub async fn resolve_composite_hashes(
        &mut self,
        store: &ObjectStore,
        cancellation_token: &SyncCancellationToken,
    ) -> Result<usize> {
        let composite_keys = self
            .objects
            .values()
            .filter(|object| object.has_composite_e_tag() && object.attributes_hash.is_none())
            .map(|object| object.relative_key.clone())
            .collect::<Vec<_>>();

        let mut resolved = 0;
        for relative_key in composite_keys {
            if cancellation_token.is_cancelled() {
                return Err(anyhow!(S3mirrorError::Cancelled));
            }

            let Some(object) = self.objects.get_mut(&relative_key) else {
                continue;
            };
            let Some(metadata) = store
                .head_object(&object.key)
                .await
                .with_context(|| format!("failed to head object: {}", object.key))?
            else {
                continue;
            };

            if let Some(hash) = trusted_hash_from_attributes(metadata.attributes.as_deref(), object.size)
            {
                trace!(key = object.key, hash = hash, "composite e_tag resolved.");
                object.attributes_hash = Some(hash);
                resolved += 1;
            }
        }

        debug!(resolved = resolved, "composite e_tags resolved.");

        Ok(resolved)
    }

    async fn head_exact_object(&mut self, store: &ObjectStore, key: &str) -> Result<()> {
        let Some(object) = self.objects.values_mut().find(|object| object.key == key) else {
            return Ok(());
        };

        if let Some(metadata) = store
            .head_object(key)
            .await
            .with_context(|| format!("failed to head object: {key}"))?
        {
            object.attributes_hash =
                trusted_hash_from_attributes(metadata.attributes.as_deref(), object.size);
        }

        Ok(())
    }
}

fn trusted_hash_from_attributes(attributes: Option<&str>, size: u64) -> Option<ContentHash> {
    let attributes = ContentAttributes::parse(attributes?);
    match attributes.size {
        Some(recorded_size) if recorded_size != size => None,
        _ => attributes.md5,
    }
}

#[async_trait]
impl SyncInventory for RemoteInventory {
    fn keys(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    fn size(&self, relative_path: &str) -> Option<u64> {
        self.objects.get(relative_path).map(|object| object.size)
    }

    fn known_hash(&self, relative_path: &str) -> Option<ContentHash> {
        self.objects.get(relative_path)?.comparable_hash()
    }

    async fn content_hash(&self, relative_path: &str) -> Result<HashOutcome> {
        let Some(object) = self.objects.get(relative_path) else {
            return Ok(HashOutcome::Vanished);
        };

        Ok(match object.comparable_hash() {
            Some(hash) => HashOutcome::Trusted(hash),
            None => HashOutcome::Untrusted,
        })
    }

    fn remove(&mut self, relative_path: &str) {
        self.objects.remove(relative_path);
    }

    fn hashes_are_free(&self) -> bool {
        true
    }
}
