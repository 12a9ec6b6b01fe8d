//! Mailing list lifecycle

use crate::chain::ChainRegistry;
use crate::context::Context;
use crate::membership::canonical_email;
use listrust_common::{Error, Result};
use listrust_storage::{ListSettings, MailingList};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct ListManager {
    ctx: Context,
    registry: Arc<ChainRegistry>,
}

impl ListManager {
    pub fn new(ctx: Context, registry: Arc<ChainRegistry>) -> Self {
        Self { ctx, registry }
    }

    fn check_settings(&self, settings: &ListSettings) -> Result<()> {
        if self.registry.chain(&settings.posting_chain).is_none() {
            return Err(Error::UnknownChain(settings.posting_chain.clone()));
        }
        if self.registry.pipeline(&settings.posting_pipeline).is_none() {
            return Err(Error::Config(format!(
                "Unknown pipeline {}",
                settings.posting_pipeline
            )));
        }
        Ok(())
    }

    /// Create a list under its posting address
    pub async fn create(&self, fqdn_listname: &str, settings: ListSettings) -> Result<MailingList> {
        let list_id = canonical_email(fqdn_listname)?;
        self.check_settings(&settings)?;

        let list = self.ctx.repos.lists.create(&list_id, settings).await?;
        info!(list_id = %list.list_id, "Mailing list created");
        Ok(list)
    }

    /// Create the list, or bring an existing one in line with `settings`
    pub async fn ensure(&self, fqdn_listname: &str, settings: ListSettings) -> Result<MailingList> {
        let list_id = canonical_email(fqdn_listname)?;
        self.check_settings(&settings)?;

        if self.ctx.repos.lists.get(&list_id).await?.is_none() {
            return self.create(&list_id, settings).await;
        }
        let list = self.ctx.repos.lists.update_settings(&list_id, settings).await?;
        info!(list_id = %list.list_id, "Mailing list updated");
        Ok(list)
    }

    pub async fn get(&self, list_id: &str) -> Result<Option<MailingList>> {
        self.ctx.repos.lists.get(&list_id.to_lowercase()).await
    }

    pub async fn lists(&self) -> Result<Vec<MailingList>> {
        self.ctx.repos.lists.list().await
    }

    /// Drop a list with its members and held requests
    pub async fn remove(&self, list_id: &str) -> Result<()> {
        let list = self
            .get(list_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Mailing list {}", list_id)))?;

        let ledger = self.ctx.requests.for_list(&list.list_id);
        for request in ledger.held_requests().await? {
            ledger.resolve(request.id).await?;
        }
        let members = self.ctx.repos.members.delete_all(&list.list_id).await?;
        self.ctx.repos.lists.delete(&list.list_id).await?;

        info!(list_id = %list.list_id, members, "Mailing list removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::membership::{add_member, NewMember};
    use crate::pending::Pendable;
    use listrust_common::types::RequestType;
    use pretty_assertions::assert_eq;

    fn manager() -> (Context, ListManager) {
        let ctx = context();
        let manager = ListManager::new(ctx.clone(), Arc::new(ChainRegistry::builtin().unwrap()));
        (ctx, manager)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_, manager) = manager();
        let list = manager
            .create("Test@Example.com", ListSettings::with_display_name("Test"))
            .await
            .unwrap();
        assert_eq!(list.list_id, "test@example.com");
        assert_eq!(list.owner_address(), "test-owner@example.com");
        assert!(manager.get("test@example.com").await.unwrap().is_some());
        assert_eq!(manager.lists().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names_and_duplicates() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.create("not-an-address", ListSettings::with_display_name("X")).await,
            Err(Error::InvalidEmail(_))
        ));

        manager
            .create("test@example.com", ListSettings::with_display_name("Test"))
            .await
            .unwrap();
        assert!(matches!(
            manager.create("test@example.com", ListSettings::with_display_name("Test")).await,
            Err(Error::ListAlreadyExists(_))
        ));

        let mut settings = ListSettings::with_display_name("Other");
        settings.posting_chain = "missing".to_string();
        assert!(matches!(
            manager.create("other@example.com", settings).await,
            Err(Error::UnknownChain(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_updates_existing_list() {
        let (_, manager) = manager();
        manager
            .ensure("test@example.com", ListSettings::with_display_name("Test"))
            .await
            .unwrap();

        let mut settings = ListSettings::with_display_name("Renamed");
        settings.send_welcome_message = false;
        let list = manager.ensure("test@example.com", settings).await.unwrap();

        assert_eq!(list.display_name, "Renamed");
        assert!(!list.send_welcome_message);
        assert_eq!(manager.lists().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_drops_members_and_requests() {
        let (ctx, manager) = manager();
        let list = manager
            .create("test@example.com", ListSettings::with_display_name("Test"))
            .await
            .unwrap();
        add_member(&ctx, &list, NewMember::member("anne@example.com")).await.unwrap();
        ctx.requests
            .for_list(&list.list_id)
            .hold(RequestType::HeldMessage, "<msg-1@example.com>", Some(Pendable::new()))
            .await
            .unwrap();

        manager.remove("test@example.com").await.unwrap();

        assert!(manager.get("test@example.com").await.unwrap().is_none());
        assert!(ctx.repos.members.list(&list.list_id, None).await.unwrap().is_empty());
        assert_eq!(ctx.requests.for_list(&list.list_id).count().await.unwrap(), 0);
        assert_eq!(ctx.pendings.count().await.unwrap(), 0);
        assert!(matches!(
            manager.remove("test@example.com").await,
            Err(Error::NotFound(_))
        ));
    }
}
