//! Free-text department names → organization ids.

use std::collections::HashMap;
use std::sync::Mutex;

use jobfeed_core::{Organization, OrganizationId};
use jobfeed_storage::{OrganizationStore, StoreError};
use strsim::jaro_winkler;
use tracing::{debug, warn};

/// Id of the generic, unaffiliated organization.
pub const DEFAULT_ORGANIZATION_ID: OrganizationId = 1;

const FUZZY_THRESHOLD: f64 = 0.92;
const MIN_PARTIAL_LEN: usize = 3;

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
struct Candidate {
    id: OrganizationId,
    names: Vec<String>,
}

/// Resolves department text against the organization catalogue.
///
/// Matching runs in passes, each scanning organizations in id order so the lowest id wins:
/// exact name, a name containing the text, the text containing a name as a whole phrase, then
/// a Jaro-Winkler fallback. Anything else maps to the default id.
#[derive(Debug)]
pub struct OrganizationResolver {
    candidates: Vec<Candidate>,
    default_id: OrganizationId,
    memo: Mutex<HashMap<String, OrganizationId>>,
}

impl OrganizationResolver {
    pub fn new(organizations: &[Organization], default_id: OrganizationId) -> Self {
        let mut candidates: Vec<Candidate> = organizations
            .iter()
            .map(|org| {
                let names = [
                    Some(org.code.as_str()),
                    Some(org.name.as_str()),
                    org.short_name.as_deref(),
                    org.long_name.as_deref(),
                ]
                .into_iter()
                .flatten()
                .map(normalize_key_fragment)
                .filter(|n| !n.is_empty())
                .collect();
                Candidate { id: org.id, names }
            })
            .collect();
        candidates.sort_by_key(|c| c.id);
        Self {
            candidates,
            default_id,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(
        store: &dyn OrganizationStore,
        default_id: OrganizationId,
    ) -> Result<Self, StoreError> {
        let organizations = store.organizations().await?;
        debug!(count = organizations.len(), "loaded organization catalogue");
        Ok(Self::new(&organizations, default_id))
    }

    pub fn default_id(&self) -> OrganizationId {
        self.default_id
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Always returns an id; unmatched text falls back to the default with a warning.
    pub fn resolve(&self, department: &str) -> OrganizationId {
        let key = normalize_key_fragment(department);
        if let Some(id) = self.memo_get(&key) {
            return id;
        }
        let id = match self.lookup(&key) {
            Some(id) => id,
            None => {
                warn!(
                    department,
                    default_id = self.default_id,
                    "no organization matched; using default"
                );
                self.default_id
            }
        };
        self.memo_put(key, id);
        id
    }

    fn lookup(&self, key: &str) -> Option<OrganizationId> {
        if key.is_empty() {
            return None;
        }
        let padded = format!(" {key} ");
        let passes: [&dyn Fn(&str) -> bool; 3] = [
            &|name: &str| name == key,
            &|name: &str| key.len() >= MIN_PARTIAL_LEN && name.contains(key),
            &|name: &str| padded.contains(&format!(" {name} ")),
        ];
        for pass in passes {
            if let Some(found) = self
                .candidates
                .iter()
                .find(|c| c.names.iter().any(|n| pass(n.as_str())))
            {
                return Some(found.id);
            }
        }

        let mut best: Option<(OrganizationId, f64)> = None;
        for candidate in &self.candidates {
            for name in &candidate.names {
                let score = jaro_winkler(key, name);
                if score >= FUZZY_THRESHOLD && best.map_or(true, |(_, b)| score > b) {
                    best = Some((candidate.id, score));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    fn memo_get(&self, key: &str) -> Option<OrganizationId> {
        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
    }

    fn memo_put(&self, key: String, id: OrganizationId) {
        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, id);
    }
}
