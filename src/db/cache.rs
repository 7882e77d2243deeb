use super::types::UserAgentId;
use std::collections::HashMap;

/// Raw user-agent string to stored identity id, scoped to one ingestion run.
///
/// Ids handed out inside an open transaction are staged: they only become
/// permanent on [`UserAgentCache::commit`], and [`UserAgentCache::rollback`]
/// forgets them so the cache never points at rows that were rolled back.
#[derive(Debug, Default)]
pub struct UserAgentCache {
    useragents_cache: HashMap<String, UserAgentId>,
    staged: Vec<String>,
}

impl UserAgentCache {
    pub fn new() -> Self {
        UserAgentCache::default()
    }

    pub fn get(&self, raw: &str) -> Option<UserAgentId> {
        self.useragents_cache.get(raw).copied()
    }

    pub fn stage(&mut self, raw: &str, id: UserAgentId) {
        if self
            .useragents_cache
            .insert(raw.to_owned(), id)
            .is_none()
        {
            self.staged.push(raw.to_owned());
        }
    }

    pub fn commit(&mut self) {
        self.staged.clear();
    }

    pub fn rollback(&mut self) {
        for raw in self.staged.drain(..) {
            self.useragents_cache.remove(&raw);
        }
    }

    pub fn len(&self) -> usize {
        self.useragents_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.useragents_cache.is_empty()
    }
}
