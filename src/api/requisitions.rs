//! Requisition (link) and institution endpoints

use serde::{Deserialize, Serialize};

use super::client::{Endpoint, RemoteClient};
use crate::error::{SyncError, SyncResult};

/// Requisition as returned by the API. Only the fields the core needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Requisition {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub institution_id: String,
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Authorization URL for the end user.
    pub link: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequisitionPage {
    #[serde(default)]
    results: Vec<Requisition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institution {
    pub id: String,
    pub name: String,
    pub bic: Option<String>,
    #[serde(default)]
    pub countries: Vec<String>,
}

impl RemoteClient {
    pub async fn list_requisitions(&self) -> SyncResult<Vec<Requisition>> {
        let value = self.call(&Endpoint::ListRequisitions).await?;
        let page: RequisitionPage = serde_json::from_value(value)?;
        tracing::debug!("Listed {} requisitions", page.results.len());
        Ok(page.results)
    }

    pub async fn get_requisition(&self, id: &str) -> SyncResult<Requisition> {
        let value = self
            .call(&Endpoint::GetRequisition(id.to_string()))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn create_requisition(
        &self,
        institution_id: &str,
        redirect: &str,
        reference: &str,
    ) -> SyncResult<Requisition> {
        let value = self
            .call(&Endpoint::CreateRequisition {
                institution_id: institution_id.to_string(),
                redirect: redirect.to_string(),
                reference: reference.to_string(),
            })
            .await?;
        let requisition: Requisition = serde_json::from_value(value)?;
        if requisition.link.is_none() {
            return Err(SyncError::Decode(
                "requisition response missing 'link'".to_string(),
            ));
        }
        Ok(requisition)
    }

    pub async fn delete_requisition(&self, id: &str) -> SyncResult<()> {
        self.call(&Endpoint::DeleteRequisition(id.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn list_institutions(&self, country: &str) -> SyncResult<Vec<Institution>> {
        let value = self
            .call(&Endpoint::Institutions {
                country: country.to_ascii_uppercase(),
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_institution(&self, id: &str) -> SyncResult<Institution> {
        let value = self.call(&Endpoint::Institution(id.to_string())).await?;
        Ok(serde_json::from_value(value)?)
    }
}
