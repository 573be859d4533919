//! Platform credentials for post owners
//!
//! Tokens are written by the account-linking flow, which lives outside this
//! crate. The queue only reads them, one owner at a time, right before a
//! publish attempt.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::db::Database;
use crate::error::Result;

/// Access token and linked account ids for one owner
#[derive(Debug)]
pub struct MetaCredentials {
    pub access_token: SecretString,
    pub page_id: Option<String>,
    pub instagram_business_account_id: Option<String>,
}

impl MetaCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            page_id: None,
            instagram_business_account_id: None,
        }
    }

    pub fn with_page(mut self, page_id: impl Into<String>) -> Self {
        self.page_id = Some(page_id.into());
        self
    }

    pub fn with_instagram(mut self, account_id: impl Into<String>) -> Self {
        self.instagram_business_account_id = Some(account_id.into());
        self
    }
}

/// Source of owner credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` when the owner has not linked an account
    async fn credentials(&self, owner_id: &str) -> Result<Option<MetaCredentials>>;
}

/// Reads the `owner_credentials` table
pub struct DbCredentialProvider {
    db: Database,
}

impl DbCredentialProvider {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialProvider for DbCredentialProvider {
    async fn credentials(&self, owner_id: &str) -> Result<Option<MetaCredentials>> {
        let row = self.db.get_credentials(owner_id).await?;
        Ok(row.map(|r| MetaCredentials {
            access_token: SecretString::from(r.access_token),
            page_id: r.page_id,
            instagram_business_account_id: r.instagram_business_account_id,
        }))
    }
}

#[derive(Debug, Clone, Default)]
struct StaticEntry {
    access_token: String,
    page_id: Option<String>,
    instagram_business_account_id: Option<String>,
}

/// In-memory provider, for tests and one-off tooling
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    entries: HashMap<String, StaticEntry>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(
        mut self,
        owner_id: impl Into<String>,
        access_token: impl Into<String>,
        page_id: Option<&str>,
        instagram_business_account_id: Option<&str>,
    ) -> Self {
        self.entries.insert(
            owner_id.into(),
            StaticEntry {
                access_token: access_token.into(),
                page_id: page_id.map(str::to_string),
                instagram_business_account_id: instagram_business_account_id.map(str::to_string),
            },
        );
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(&self, owner_id: &str) -> Result<Option<MetaCredentials>> {
        Ok(self.entries.get(owner_id).map(|e| MetaCredentials {
            access_token: SecretString::from(e.access_token.clone()),
            page_id: e.page_id.clone(),
            instagram_business_account_id: e.instagram_business_account_id.clone(),
        }))
    }
}
