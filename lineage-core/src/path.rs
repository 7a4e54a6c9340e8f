//! Lineage identifiers: the service, category and resource owner a backup
//! stream belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Exchange,
    OneDrive,
    SharePoint,
    Groups,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::OneDrive => "onedrive",
            Self::SharePoint => "sharepoint",
            Self::Groups => "groups",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Email,
    Contacts,
    Events,
    Files,
    Libraries,
    Lists,
    Pages,
    Channels,
    Conversations,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Contacts => "contacts",
            Self::Events => "events",
            Self::Files => "files",
            Self::Libraries => "libraries",
            Self::Lists => "lists",
            Self::Pages => "pages",
            Self::Channels => "channels",
            Self::Conversations => "conversations",
        }
    }

    /// Categories a service backs up.
    pub fn for_service(service: Service) -> &'static [Category] {
        match service {
            Service::Exchange => &[Self::Email, Self::Contacts, Self::Events],
            Service::OneDrive => &[Self::Files],
            Service::SharePoint => &[Self::Libraries, Self::Lists, Self::Pages],
            Service::Groups => &[Self::Libraries, Self::Channels, Self::Conversations],
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one lineage. Two backups belong to the same lineage iff their
/// reasons are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reason {
    pub resource_owner: String,
    pub service: Service,
    pub category: Category,
}

impl Reason {
    pub fn new(resource_owner: impl Into<String>, service: Service, category: Category) -> Self {
        Self {
            resource_owner: resource_owner.into(),
            service,
            category,
        }
    }

    /// Service and category joined, e.g. `exchangeemail`. Used as a tag key
    /// and as the merge key when resource owners differ.
    pub fn service_cat(&self) -> String {
        service_cat(self.service, self.category)
    }

    /// Full lineage key.
    pub fn key(&self) -> String {
        format!("{}{}", self.service_cat(), self.resource_owner)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_owner, self.service, self.category)
    }
}

pub fn service_cat(service: Service, category: Category) -> String {
    format!("{}{}", service.as_str(), category.as_str())
}

/// Merge key that ignores the resource owner.
pub fn service_cat_key(reason: &Reason) -> String {
    reason.service_cat()
}
