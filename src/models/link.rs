//! Link (requisition) models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkStatus {
    Created,
    AwaitingAuthorization,
    Linked,
    Expired,
    Rejected,
}

impl LinkStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkStatus::Linked | LinkStatus::Expired | LinkStatus::Rejected
        )
    }
}

/// Authorization grant connecting this installation to accounts at one institution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub institution_id: String,
    /// Unknown for requisitions adopted from the remote listing.
    pub country_code: Option<String>,
    pub status: LinkStatus,
    #[serde(default)]
    pub account_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Reference echoed back on the authorization redirect.
    pub reference: Option<String>,
    pub auth_url: Option<String>,
}

impl Link {
    pub fn is_linked(&self) -> bool {
        self.status == LinkStatus::Linked
    }
}
