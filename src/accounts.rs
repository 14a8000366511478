//! Account class detection and the persisted account-class map.
//!
//! Personal Microsoft accounts (outlook.com, hotmail.com, live.com) have
//! limited search API support compared to work/school accounts, so the
//! search router needs to know which dialect an account speaks. Detection is
//! performed once by an injected collaborator and the result is persisted in
//! the shared store.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::storage::{unix_now, ConnectionPool};

/// Issuer tenant id shared by all consumer (personal) Microsoft accounts.
const CONSUMERS_TENANT: &str = "9188040d-6c67-4c5b-b112-36a304b66dad";

/// Domains that always denote personal accounts.
const PERSONAL_DOMAINS: &[&str] = &["outlook.com", "hotmail.com", "live.com", "msn.com"];

/// Detected class of a Microsoft account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountClass {
    Personal,
    WorkSchool,
    Unknown,
}

impl AccountClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountClass::Personal => "personal",
            AccountClass::WorkSchool => "work_school",
            AccountClass::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "personal" => Some(AccountClass::Personal),
            "work_school" => Some(AccountClass::WorkSchool),
            "unknown" => Some(AccountClass::Unknown),
            _ => None,
        }
    }
}

/// Detects the class of an account, typically by inspecting its access token
/// or profile. Supplied by the authentication layer.
#[async_trait]
pub trait AccountClassDetector: Send + Sync {
    async fn detect(
        &self,
        account_id: &str,
    ) -> Result<AccountClass, Box<dyn std::error::Error + Send + Sync>>;
}

/// A persisted detection result.
#[derive(Debug, Clone, Serialize)]
pub struct AccountClassRecord {
    pub account_id: String,
    pub class: AccountClass,
    pub detected_at: f64,
}

/// Persisted account-id → class map over the shared store.
pub struct AccountClassCache {
    pool: Arc<ConnectionPool>,
}

impl AccountClassCache {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Stored record for an account, if any. Read failures downgrade to a
    /// miss.
    pub fn get(&self, account_id: &str) -> Option<AccountClassRecord> {
        let result = self.pool.with_conn(|tx| {
            tx.query_row(
                "SELECT account_class, detected_at FROM account_classes WHERE account_id = ?1",
                params![account_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()
        });

        match result {
            Ok(Some((raw, detected_at))) => AccountClass::parse(&raw).map(|class| {
                AccountClassRecord {
                    account_id: account_id.to_string(),
                    class,
                    detected_at,
                }
            }),
            Ok(None) => None,
            Err(e) => {
                log::error!("Account class lookup failed: {}", e);
                None
            }
        }
    }

    /// Persist a detection result. Write failures are logged and dropped.
    pub fn put(&self, account_id: &str, class: AccountClass) {
        let result = self.pool.with_conn(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO account_classes (account_id, account_class, detected_at) \
                 VALUES (?1, ?2, ?3)",
                params![account_id, class.as_str(), unix_now()],
            )
            .map(|_| ())
        });

        if let Err(e) = result {
            log::error!("Account class store failed: {}", e);
        }
    }

    /// Class for an account, detecting and persisting on a miss.
    ///
    /// Failed detection yields [`AccountClass::Unknown`] without persisting,
    /// so a later call retries detection.
    pub async fn resolve(
        &self,
        account_id: &str,
        detector: &dyn AccountClassDetector,
    ) -> AccountClass {
        if let Some(record) = self.get(account_id) {
            return record.class;
        }

        match detector.detect(account_id).await {
            Ok(class) => {
                log::info!("Account class detected: {}", class.as_str());
                self.put(account_id, class);
                class
            }
            Err(e) => {
                log::warn!("Account class detection failed, assuming unknown: {}", e);
                AccountClass::Unknown
            }
        }
    }
}

/// Classify an account from its access token and user principal name.
///
/// The JWT issuer claim is checked first (most reliable); the UPN domain is
/// the fallback. Returns `None` when neither signal is usable.
pub fn detect_account_class(access_token: &str, upn: Option<&str>) -> Option<AccountClass> {
    if let Some(class) = classify_token_issuer(access_token) {
        log::debug!("Account class detected via JWT issuer");
        return Some(class);
    }

    upn.and_then(classify_upn_domain)
}

/// Classify by the `iss` claim of an access token.
///
/// The payload is decoded without signature verification: the token was
/// already validated during authentication and is only inspected for
/// metadata here.
pub fn classify_token_issuer(access_token: &str) -> Option<AccountClass> {
    let payload_segment = access_token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_segment).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    let issuer = claims.get("iss")?.as_str()?;

    if issuer.contains(CONSUMERS_TENANT) {
        Some(AccountClass::Personal)
    } else if issuer.contains("login.microsoftonline.com") {
        Some(AccountClass::WorkSchool)
    } else {
        None
    }
}

/// Classify by the registrable domain of a user principal name.
pub fn classify_upn_domain(upn: &str) -> Option<AccountClass> {
    let domain = upn.rsplit('@').next().filter(|d| *d != upn)?.to_lowercase();

    // Collapse subdomains: mail.outlook.com -> outlook.com
    let parts: Vec<&str> = domain.split('.').collect();
    let registrable = if parts.len() >= 2 {
        parts[parts.len() - 2..].join(".")
    } else {
        domain
    };

    if PERSONAL_DOMAINS.contains(&registrable.as_str()) {
        Some(AccountClass::Personal)
    } else {
        Some(AccountClass::WorkSchool)
    }
}
