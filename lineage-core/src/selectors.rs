//! Which resource owners and categories an operation covers.

use crate::path::{Category, Reason, Service};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Owner wildcard. Matches any owner when filtering, but cannot be expanded
/// into backup reasons.
pub const ANY_OWNER: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub service: Service,
    #[serde(default)]
    pub resource_owners: BTreeSet<String>,
    /// Empty means every category of the service.
    #[serde(default)]
    pub categories: BTreeSet<Category>,
}

impl Selector {
    /// A selector for `service` that matches nothing until owners are added.
    pub fn new(service: Service) -> Self {
        Self {
            service,
            resource_owners: BTreeSet::new(),
            categories: BTreeSet::new(),
        }
    }

    pub fn with_owners<I, S>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_owners.extend(owners.into_iter().map(Into::into));
        self
    }

    pub fn with_categories<I>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = Category>,
    {
        self.categories.extend(categories);
        self
    }

    fn categories_or_all(&self) -> Vec<Category> {
        if self.categories.is_empty() {
            Category::for_service(self.service).to_vec()
        } else {
            self.categories.iter().copied().collect()
        }
    }

    /// Concrete lineages covered: explicit owners x categories.
    pub fn reasons(&self) -> Vec<Reason> {
        let categories = self.categories_or_all();
        self.resource_owners
            .iter()
            .filter(|o| o.as_str() != ANY_OWNER)
            .flat_map(|owner| {
                categories
                    .iter()
                    .map(move |c| Reason::new(owner.clone(), self.service, *c))
            })
            .collect()
    }

    pub fn matches(&self, reason: &Reason) -> bool {
        if reason.service != self.service {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&reason.category) {
            return false;
        }
        self.resource_owners.contains(ANY_OWNER)
            || self.resource_owners.contains(&reason.resource_owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_selector_matches_nothing() {
        let sel = Selector::new(Service::Exchange);
        assert!(sel.reasons().is_empty());
        assert!(!sel.matches(&Reason::new("user1", Service::Exchange, Category::Email)));
    }

    #[test]
    fn test_wildcard_matches_but_does_not_expand() {
        let sel = Selector::new(Service::Exchange).with_owners([ANY_OWNER]);
        assert!(sel.reasons().is_empty());
        assert!(sel.matches(&Reason::new("anyone", Service::Exchange, Category::Events)));
        assert!(!sel.matches(&Reason::new("anyone", Service::OneDrive, Category::Files)));
    }

    #[test]
    fn test_reasons_cross_product() {
        let sel = Selector::new(Service::Exchange)
            .with_owners(["user1", "user2"])
            .with_categories([Category::Email, Category::Contacts]);

        let reasons = sel.reasons();
        assert_eq!(reasons.len(), 4);
        assert!(reasons.contains(&Reason::new("user2", Service::Exchange, Category::Contacts)));
    }

    #[test]
    fn test_no_categories_means_all_for_service() {
        let sel = Selector::new(Service::OneDrive).with_owners(["user1"]);
        assert_eq!(
            sel.reasons(),
            vec![Reason::new("user1", Service::OneDrive, Category::Files)]
        );
    }
}
