//! Link state machine
//!
//! ```text
//! Created -> AwaitingAuthorization -> { Linked | Expired | Rejected }
//!                                       Linked -> { Expired | Rejected }
//! ```
//!
//! Remote status codes are parsed into a closed enumeration and applied
//! through one exhaustive transition function, whether they arrive from a
//! direct poll, the periodic requisition listing, or an authorization
//! callback. Expired and Rejected never change. Polling a terminal link
//! costs no remote call; a Linked link only leaves Linked when the
//! requisition listing reports its consent expired or revoked.

use std::sync::Arc;

use chrono::Utc;

use crate::api::{RemoteClient, Requisition};
use crate::error::{SyncError, SyncResult};
use crate::models::{Account, Link, LinkStatus};
use crate::store::{StateDocument, StateStore};

/// Requisition status codes reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// `CR`
    Created,
    /// `ID`
    InstitutionSelected,
    /// `GC`
    GivingConsent,
    /// `UA`
    UndergoingAuthentication,
    /// `SA`
    SelectingAccounts,
    /// `GA`
    GrantingAccess,
    /// `LN`
    Linked,
    /// `EX`
    Expired,
    /// `RJ`
    Rejected,
    /// `SU`
    Suspended,
    Unknown(String),
}

impl RemoteStatus {
    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "CR" => RemoteStatus::Created,
            "ID" => RemoteStatus::InstitutionSelected,
            "GC" => RemoteStatus::GivingConsent,
            "UA" => RemoteStatus::UndergoingAuthentication,
            "SA" => RemoteStatus::SelectingAccounts,
            "GA" => RemoteStatus::GrantingAccess,
            "LN" => RemoteStatus::Linked,
            "EX" => RemoteStatus::Expired,
            "RJ" => RemoteStatus::Rejected,
            "SU" => RemoteStatus::Suspended,
            _ => RemoteStatus::Unknown(code.to_string()),
        }
    }

    /// Local status this code corresponds to, if it is known.
    fn local(&self) -> Option<LinkStatus> {
        match self {
            RemoteStatus::Created => Some(LinkStatus::Created),
            RemoteStatus::InstitutionSelected
            | RemoteStatus::GivingConsent
            | RemoteStatus::UndergoingAuthentication
            | RemoteStatus::SelectingAccounts
            | RemoteStatus::GrantingAccess => Some(LinkStatus::AwaitingAuthorization),
            RemoteStatus::Linked => Some(LinkStatus::Linked),
            RemoteStatus::Expired => Some(LinkStatus::Expired),
            RemoteStatus::Rejected | RemoteStatus::Suspended => Some(LinkStatus::Rejected),
            RemoteStatus::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Advance(LinkStatus),
    Unknown(String),
}

/// The only place link status changes are decided. Never moves backwards.
pub fn transition(current: LinkStatus, observed: &RemoteStatus) -> Transition {
    let Some(next) = observed.local() else {
        return match observed {
            RemoteStatus::Unknown(code) => Transition::Unknown(code.clone()),
            _ => Transition::Unchanged,
        };
    };

    match (current, next) {
        (LinkStatus::Expired | LinkStatus::Rejected, _) => Transition::Unchanged,
        (LinkStatus::Linked, LinkStatus::Expired | LinkStatus::Rejected) => {
            Transition::Advance(next)
        }
        (LinkStatus::Linked, _) => Transition::Unchanged,
        (LinkStatus::Created, LinkStatus::Created) => Transition::Unchanged,
        (LinkStatus::AwaitingAuthorization, LinkStatus::Created)
        | (LinkStatus::AwaitingAuthorization, LinkStatus::AwaitingAuthorization) => {
            Transition::Unchanged
        }
        (LinkStatus::Created | LinkStatus::AwaitingAuthorization, next) => {
            Transition::Advance(next)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged(LinkStatus),
    Advanced {
        from: LinkStatus,
        to: LinkStatus,
        /// Accounts materialized by this step.
        new_accounts: Vec<String>,
    },
}

impl PollOutcome {
    pub fn status(&self) -> LinkStatus {
        match self {
            PollOutcome::Unchanged(status) => *status,
            PollOutcome::Advanced { to, .. } => *to,
        }
    }
}

pub struct LinkStateMachine {
    client: Arc<RemoteClient>,
    store: Arc<StateStore>,
    redirect_url: String,
}

impl LinkStateMachine {
    pub fn new(client: Arc<RemoteClient>, store: Arc<StateStore>, redirect_url: String) -> Self {
        Self {
            client,
            store,
            redirect_url,
        }
    }

    /// Start a linking attempt. Returns the new link and its authorization URL.
    ///
    /// A still-pending link for the same institution and country is superseded.
    pub async fn create(&self, institution_id: &str, country: &str) -> SyncResult<(Link, String)> {
        let country = country.to_ascii_uppercase();
        let reference = uuid::Uuid::new_v4().to_string();

        let requisition = self
            .client
            .create_requisition(institution_id, &self.redirect_url, &reference)
            .await?;
        let auth_url = requisition.link.clone().unwrap_or_default();

        let link = Link {
            id: requisition.id.clone(),
            institution_id: institution_id.to_string(),
            country_code: Some(country.clone()),
            status: LinkStatus::Created,
            account_ids: Vec::new(),
            created_at: Utc::now(),
            reference: Some(reference),
            auth_url: Some(auth_url.clone()),
        };

        let superseded = self.store.update(|doc| {
            let superseded: Vec<String> = doc
                .links
                .values()
                .filter(|existing| {
                    !existing.status.is_terminal()
                        && existing.institution_id == link.institution_id
                        && existing.country_code.as_deref() == Some(country.as_str())
                })
                .map(|existing| existing.id.clone())
                .collect();
            for id in &superseded {
                doc.links.remove(id);
            }
            doc.links.insert(link.id.clone(), link.clone());
            superseded
        })?;

        for id in superseded {
            tracing::info!("Link {} superseded by {}", id, link.id);
            if let Err(e) = self.client.delete_requisition(&id).await {
                tracing::warn!("Failed to delete superseded requisition {}: {}", id, e);
            }
        }

        tracing::info!(
            "Created link {} for institution {} ({})",
            link.id,
            institution_id,
            country
        );
        Ok((link, auth_url))
    }

    /// Query the remote status of a link and apply it.
    ///
    /// Terminal links return immediately without a remote call.
    pub async fn poll(&self, link_id: &str) -> SyncResult<PollOutcome> {
        let status = self
            .store
            .read(|doc| doc.links.get(link_id).map(|link| link.status))
            .ok_or_else(|| SyncError::UnknownLink(link_id.to_string()))?;
        if status.is_terminal() {
            return Ok(PollOutcome::Unchanged(status));
        }

        let requisition = self
            .client
            .get_requisition(link_id)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    SyncError::TransientLinkError(e.to_string())
                } else {
                    e
                }
            })?;

        self.store
            .update(|doc| apply_requisition(doc, link_id, &requisition))?
    }

    /// Apply a status seen in the requisition listing. No remote call.
    ///
    /// Requisitions not known locally are adopted as links.
    pub fn observe(&self, requisition: &Requisition) -> SyncResult<PollOutcome> {
        let observed = RemoteStatus::parse(&requisition.status);
        let local = match observed.local() {
            Some(status) => status,
            None => return Err(SyncError::UnknownStatus(requisition.status.clone())),
        };

        self.store.update(|doc| {
            if !doc.links.contains_key(&requisition.id) {
                // Nothing to adopt from a requisition that is already dead.
                if matches!(local, LinkStatus::Expired | LinkStatus::Rejected) {
                    return Ok(PollOutcome::Unchanged(local));
                }
                tracing::info!(
                    "Adopting requisition {} ({}) from listing",
                    requisition.id,
                    requisition.status
                );
                doc.links.insert(
                    requisition.id.clone(),
                    Link {
                        id: requisition.id.clone(),
                        institution_id: requisition.institution_id.clone(),
                        country_code: None,
                        status: LinkStatus::Created,
                        account_ids: Vec::new(),
                        created_at: Utc::now(),
                        reference: requisition.reference.clone(),
                        auth_url: requisition.link.clone(),
                    },
                );
            }
            apply_requisition(doc, &requisition.id, requisition)
        })?
    }

    /// Delete the remote requisition and forget the link and its accounts.
    pub async fn unlink(&self, link_id: &str) -> SyncResult<()> {
        if self.store.read(|doc| !doc.links.contains_key(link_id)) {
            return Err(SyncError::UnknownLink(link_id.to_string()));
        }

        match self.client.delete_requisition(link_id).await {
            Ok(()) => {}
            // Already gone remotely
            Err(SyncError::RemoteError { status: 404, .. }) => {}
            Err(e) => return Err(e),
        }

        self.store.update(|doc| {
            if let Some(link) = doc.links.remove(link_id) {
                for account_id in &link.account_ids {
                    doc.remove_account(account_id);
                }
            }
        })?;
        tracing::info!("Unlinked {}", link_id);
        Ok(())
    }

    /// Resolve a callback argument that may be a link id or its reference.
    pub fn resolve(&self, id_or_reference: &str) -> Option<String> {
        self.store.read(|doc| {
            if doc.links.contains_key(id_or_reference) {
                return Some(id_or_reference.to_string());
            }
            doc.links
                .values()
                .find(|link| link.reference.as_deref() == Some(id_or_reference))
                .map(|link| link.id.clone())
        })
    }
}

fn apply_requisition(
    doc: &mut StateDocument,
    link_id: &str,
    requisition: &Requisition,
) -> SyncResult<PollOutcome> {
    let observed = RemoteStatus::parse(&requisition.status);
    let link = doc
        .links
        .get_mut(link_id)
        .ok_or_else(|| SyncError::UnknownLink(link_id.to_string()))?;

    let from = link.status;
    let to = match transition(from, &observed) {
        Transition::Unchanged => return Ok(PollOutcome::Unchanged(from)),
        Transition::Unknown(code) => {
            tracing::warn!("Link {} reported unknown status '{}'", link_id, code);
            return Err(SyncError::UnknownStatus(code));
        }
        Transition::Advance(to) => to,
    };

    link.status = to;
    if to == LinkStatus::Linked {
        for account_id in &requisition.accounts {
            if !link.account_ids.contains(account_id) {
                link.account_ids.push(account_id.clone());
            }
        }
        if link.institution_id.is_empty() {
            link.institution_id = requisition.institution_id.clone();
        }
    }
    let institution_id = link.institution_id.clone();
    let account_ids = link.account_ids.clone();

    let mut new_accounts = Vec::new();
    match to {
        LinkStatus::Linked => {
            for account_id in account_ids {
                if doc.accounts.contains_key(&account_id) {
                    continue;
                }
                doc.accounts.insert(
                    account_id.clone(),
                    Account {
                        id: account_id.clone(),
                        link_id: link_id.to_string(),
                        institution_id: institution_id.clone(),
                    },
                );
                new_accounts.push(account_id);
            }
        }
        LinkStatus::Expired | LinkStatus::Rejected => {
            for account_id in &account_ids {
                doc.remove_account(account_id);
            }
        }
        LinkStatus::Created | LinkStatus::AwaitingAuthorization => {}
    }

    tracing::info!(
        "Link {} moved {:?} -> {:?} ({} new accounts)",
        link_id,
        from,
        to,
        new_accounts.len()
    );
    Ok(PollOutcome::Advanced {
        from,
        to,
        new_accounts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialVault;
    use crate::budget::{BudgetPolicy, RateBudgetTracker};
    use crate::store::MemoryBackend;
    use crate::testing::{valid_tokens, Reply, ScriptedTransport};
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;

    const REQ_PATH: &str = "/api/v2/requisitions/req-1/";

    fn pending_link(status: LinkStatus) -> Link {
        Link {
            id: "req-1".into(),
            institution_id: "SANDBOXFINANCE_SFIN0000".into(),
            country_code: Some("GB".into()),
            status,
            account_ids: Vec::new(),
            created_at: Utc::now(),
            reference: Some("ref-1".into()),
            auth_url: None,
        }
    }

    fn machine_with(
        transport: Arc<ScriptedTransport>,
        links: Vec<Link>,
    ) -> (LinkStateMachine, Arc<StateStore>) {
        let mut doc = StateDocument {
            tokens: Some(valid_tokens()),
            ..Default::default()
        };
        for link in links {
            doc.links.insert(link.id.clone(), link);
        }
        let store = Arc::new(StateStore::open(MemoryBackend::with_document(doc)).unwrap());
        let vault = Arc::new(CredentialVault::new(
            transport.clone(),
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let tracker = Arc::new(RateBudgetTracker::new(store.clone(), BudgetPolicy::default()));
        let client = Arc::new(RemoteClient::new(
            transport,
            vault,
            tracker,
            Duration::from_secs(5),
        ));
        (
            LinkStateMachine::new(client, store.clone(), "https://host/callback".into()),
            store,
        )
    }

    fn requisition(status: &str, accounts: &[&str]) -> serde_json::Value {
        json!({
            "id": "req-1",
            "status": status,
            "institution_id": "SANDBOXFINANCE_SFIN0000",
            "accounts": accounts,
            "link": "https://bank/auth",
            "reference": "ref-1"
        })
    }

    #[test]
    fn test_transition_table() {
        use LinkStatus::*;

        assert_eq!(
            transition(Created, &RemoteStatus::parse("UA")),
            Transition::Advance(AwaitingAuthorization)
        );
        assert_eq!(transition(Created, &RemoteStatus::parse("CR")), Transition::Unchanged);
        assert_eq!(
            transition(AwaitingAuthorization, &RemoteStatus::parse("CR")),
            Transition::Unchanged
        );
        assert_eq!(
            transition(AwaitingAuthorization, &RemoteStatus::parse("LN")),
            Transition::Advance(Linked)
        );
        assert_eq!(
            transition(Created, &RemoteStatus::parse("RJ")),
            Transition::Advance(Rejected)
        );
        assert_eq!(
            transition(AwaitingAuthorization, &RemoteStatus::parse("SU")),
            Transition::Advance(Rejected)
        );
        assert_eq!(
            transition(Created, &RemoteStatus::parse("EX")),
            Transition::Advance(Expired)
        );
        for code in ["CR", "UA", "LN"] {
            assert_eq!(transition(Linked, &RemoteStatus::parse(code)), Transition::Unchanged);
        }
        assert_eq!(
            transition(Linked, &RemoteStatus::parse("EX")),
            Transition::Advance(Expired)
        );
        assert_eq!(
            transition(Linked, &RemoteStatus::parse("SU")),
            Transition::Advance(Rejected)
        );
        for terminal in [Expired, Rejected] {
            for code in ["CR", "UA", "LN", "EX", "RJ"] {
                assert_eq!(
                    transition(terminal, &RemoteStatus::parse(code)),
                    Transition::Unchanged
                );
            }
        }
        assert_eq!(
            transition(Created, &RemoteStatus::parse("ZZ")),
            Transition::Unknown("ZZ".into())
        );
    }

    #[tokio::test]
    async fn test_poll_terminal_link_makes_no_calls() {
        let transport = ScriptedTransport::new();
        let (machine, _) = machine_with(
            transport.clone(),
            vec![pending_link(LinkStatus::Rejected)],
        );

        let outcome = machine.poll("req-1").await.unwrap();
        assert_eq!(outcome, PollOutcome::Unchanged(LinkStatus::Rejected));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_linked_materializes_accounts_once() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, REQ_PATH, |_, _| {
            Reply::json(200, requisition("LN", &["acc-1", "acc-2"]))
        });
        let (machine, store) = machine_with(
            transport.clone(),
            vec![pending_link(LinkStatus::AwaitingAuthorization)],
        );

        let outcome = machine.poll("req-1").await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Advanced {
                from: LinkStatus::AwaitingAuthorization,
                to: LinkStatus::Linked,
                new_accounts: vec!["acc-1".into(), "acc-2".into()],
            }
        );

        // Idempotent: terminal now, so no further call and no duplicates.
        assert_eq!(
            machine.poll("req-1").await.unwrap(),
            PollOutcome::Unchanged(LinkStatus::Linked)
        );
        assert_eq!(transport.call_count(), 1);
        store.read(|doc| {
            assert_eq!(doc.accounts.len(), 2);
            assert_eq!(doc.links["req-1"].account_ids, vec!["acc-1", "acc-2"]);
            assert_eq!(doc.accounts["acc-1"].link_id, "req-1");
        });
    }

    #[tokio::test]
    async fn test_transport_error_leaves_state_unchanged() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, REQ_PATH, |_, _| {
            Reply::Fail(SyncError::Transport("connection reset".into()))
        });
        let (machine, store) = machine_with(
            transport.clone(),
            vec![pending_link(LinkStatus::AwaitingAuthorization)],
        );

        let err = machine.poll("req-1").await.unwrap_err();
        assert!(matches!(err, SyncError::TransientLinkError(_)));
        assert_eq!(
            store.read(|doc| doc.links["req-1"].status),
            LinkStatus::AwaitingAuthorization
        );
    }

    #[tokio::test]
    async fn test_unknown_code_is_reported_not_ignored() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, REQ_PATH, |_, _| Reply::json(200, requisition("XX", &[])));
        let (machine, store) = machine_with(transport, vec![pending_link(LinkStatus::Created)]);

        assert_eq!(
            machine.poll("req-1").await,
            Err(SyncError::UnknownStatus("XX".into()))
        );
        assert_eq!(store.read(|doc| doc.links["req-1"].status), LinkStatus::Created);
    }

    #[tokio::test]
    async fn test_expired_link_removes_accounts() {
        let transport = ScriptedTransport::new();
        let (machine, store) = machine_with(
            transport.clone(),
            vec![pending_link(LinkStatus::AwaitingAuthorization)],
        );
        let linked: Requisition =
            serde_json::from_value(requisition("LN", &["acc-1"])).unwrap();
        machine.observe(&linked).unwrap();
        assert_eq!(store.read(|doc| doc.accounts.len()), 1);

        // Consent lapsed after the link was established.
        let expired: Requisition = serde_json::from_value(requisition("EX", &[])).unwrap();
        assert_eq!(
            machine.observe(&expired).unwrap(),
            PollOutcome::Advanced {
                from: LinkStatus::Linked,
                to: LinkStatus::Expired,
                new_accounts: Vec::new(),
            }
        );
        store.read(|doc| {
            assert!(doc.accounts.is_empty());
            assert!(doc.linked_accounts().is_empty());
            assert_eq!(doc.links["req-1"].status, LinkStatus::Expired);
        });

        // Expired is final, even if the listing later claims otherwise.
        assert_eq!(
            machine.observe(&linked).unwrap(),
            PollOutcome::Unchanged(LinkStatus::Expired)
        );
        assert!(store.read(|doc| doc.accounts.is_empty()));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_observe_adopts_remote_requisition() {
        let transport = ScriptedTransport::new();
        let (machine, store) = machine_with(transport.clone(), vec![]);
        let linked: Requisition =
            serde_json::from_value(requisition("LN", &["acc-1"])).unwrap();

        let outcome = machine.observe(&linked).unwrap();

        assert_eq!(outcome.status(), LinkStatus::Linked);
        assert_eq!(transport.call_count(), 0);
        store.read(|doc| {
            assert_eq!(doc.links["req-1"].institution_id, "SANDBOXFINANCE_SFIN0000");
            assert!(doc.accounts.contains_key("acc-1"));
        });
    }

    #[tokio::test]
    async fn test_create_supersedes_pending_link() {
        let transport = ScriptedTransport::new();
        transport.on(Method::POST, "/api/v2/requisitions/", |req, _| {
            let body = req.body.as_ref().unwrap();
            assert_eq!(body["redirect"], "https://host/callback");
            Reply::json(
                201,
                json!({
                    "id": "req-new",
                    "status": "CR",
                    "institution_id": body["institution_id"],
                    "link": "https://bank/auth/new",
                    "reference": body["reference"],
                }),
            )
        });
        transport.on(Method::DELETE, REQ_PATH, |_, _| Reply::status(200, ""));
        let (machine, store) =
            machine_with(transport.clone(), vec![pending_link(LinkStatus::Created)]);

        let (link, url) = machine
            .create("SANDBOXFINANCE_SFIN0000", "gb")
            .await
            .unwrap();

        assert_eq!(url, "https://bank/auth/new");
        assert_eq!(link.status, LinkStatus::Created);
        assert_eq!(link.country_code.as_deref(), Some("GB"));
        assert_eq!(transport.calls_to(REQ_PATH), 1);
        store.read(|doc| {
            assert_eq!(doc.links.len(), 1);
            assert!(doc.links.contains_key("req-new"));
        });
        assert_eq!(
            machine.resolve(link.reference.as_deref().unwrap()),
            Some("req-new".into())
        );
    }

    #[tokio::test]
    async fn test_unlink_removes_link_and_accounts() {
        let transport = ScriptedTransport::new();
        transport.on(Method::DELETE, REQ_PATH, |_, _| Reply::status(404, "not found"));
        let (machine, store) = machine_with(
            transport,
            vec![pending_link(LinkStatus::AwaitingAuthorization)],
        );
        let linked: Requisition =
            serde_json::from_value(requisition("LN", &["acc-1"])).unwrap();
        machine.observe(&linked).unwrap();

        machine.unlink("req-1").await.unwrap();

        store.read(|doc| {
            assert!(doc.links.is_empty());
            assert!(doc.accounts.is_empty());
        });
        assert_eq!(
            machine.unlink("req-1").await,
            Err(SyncError::UnknownLink("req-1".into()))
        );
    }
}
