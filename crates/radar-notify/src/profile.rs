//! Alert profiles as loaded from the subscriber store, and their compiled
//! in-memory form used to match claimed bids.

use std::collections::HashSet;

use crate::store::ClaimedBid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub id: i64,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertProfile {
    pub id: i64,
    pub name: String,
    pub owner: Subscriber,
    pub push_enabled: bool,
    pub email_enabled: bool,
    pub include_terms: Vec<String>,
    pub exclude_terms: Vec<String>,
    pub ufs: Vec<String>,
    pub municipalities: Vec<String>,
    pub categories: Vec<i32>,
}

/// Terms are lower-cased and filters turned into sets once per cycle. An empty
/// filter set places no restriction.
#[derive(Debug, Clone)]
pub struct CompiledProfile {
    pub id: i64,
    pub name: String,
    pub owner: Subscriber,
    pub push_enabled: bool,
    pub email_enabled: bool,
    include_terms: Vec<String>,
    exclude_terms: Vec<String>,
    ufs: HashSet<String>,
    municipalities: HashSet<String>,
    categories: HashSet<i32>,
}

fn normalized_terms(terms: Vec<String>) -> Vec<String> {
    terms
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl CompiledProfile {
    pub fn compile(profile: AlertProfile) -> Self {
        Self {
            id: profile.id,
            name: profile.name,
            owner: profile.owner,
            push_enabled: profile.push_enabled,
            email_enabled: profile.email_enabled,
            include_terms: normalized_terms(profile.include_terms),
            exclude_terms: normalized_terms(profile.exclude_terms),
            ufs: profile
                .ufs
                .iter()
                .map(|uf| uf.trim().to_uppercase())
                .collect(),
            municipalities: profile
                .municipalities
                .iter()
                .map(|m| m.trim().to_lowercase())
                .collect(),
            categories: profile.categories.into_iter().collect(),
        }
    }

    pub fn matches(&self, bid: &ClaimedBid) -> bool {
        if !self.ufs.is_empty() {
            let uf = bid.uf.as_deref().unwrap_or_default().trim().to_uppercase();
            if !self.ufs.contains(&uf) {
                return false;
            }
        }
        if !self.municipalities.is_empty() {
            let municipality = bid
                .municipality
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            if !self.municipalities.contains(&municipality) {
                return false;
            }
        }
        if !self.categories.is_empty()
            && !bid.category_id.is_some_and(|c| self.categories.contains(&c))
        {
            return false;
        }

        let description = bid.description.as_deref().unwrap_or_default().to_lowercase();
        self.include_terms.iter().any(|t| description.contains(t.as_str()))
            && !self.exclude_terms.iter().any(|t| description.contains(t.as_str()))
    }
}

pub fn compile_profiles(profiles: Vec<AlertProfile>) -> Vec<CompiledProfile> {
    profiles.into_iter().map(CompiledProfile::compile).collect()
}
