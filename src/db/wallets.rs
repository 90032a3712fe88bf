use super::{get_ts, Datastore};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub address: String,
    pub label: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SS58 coldkey shape: 46-48 chars from the base58 alphabet.
pub fn is_valid_wallet_address(address: &str) -> bool {
    (46..=48).contains(&address.len())
        && address.chars().all(|c| {
            c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
        })
}

impl Datastore {
    pub async fn upsert_wallet(&self, address: &str, label: Option<&str>) -> Result<()> {
        if !is_valid_wallet_address(address) {
            bail!("invalid wallet address: {address}");
        }
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO wallets (address, label, is_active, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?3)
             ON CONFLICT(address) DO UPDATE SET
                label = COALESCE(excluded.label, wallets.label),
                is_active = 1,
                updated_at = excluded.updated_at",
            params![address, label, now],
        )?;
        Ok(())
    }

    /// Soft-deactivate. Historical rows keep referencing the address.
    pub async fn deactivate_wallet(&self, address: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE wallets SET is_active = 0, updated_at = ?2 WHERE address = ?1",
            params![address, now],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_wallet(&self, address: &str) -> Result<Option<WalletRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT address, label, is_active, created_at, updated_at
             FROM wallets WHERE address = ?1",
        )?;
        let mut rows = stmt.query(params![address])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(WalletRecord {
            address: row.get(0)?,
            label: row.get(1)?,
            is_active: row.get::<_, i64>(2)? != 0,
            created_at: get_ts(row, 3)?,
            updated_at: get_ts(row, 4)?,
        }))
    }

    pub async fn list_active_wallets(&self) -> Result<Vec<String>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT address FROM wallets WHERE is_active = 1 ORDER BY address ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "5FHneW46xGXgs5mUiveU4sbTyGBzmstUspZC92UhjJM694ty";
    const BOB: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";

    #[test]
    fn address_validation() {
        assert!(is_valid_wallet_address(ALICE));
        assert!(!is_valid_wallet_address("5short"));
        // 0, O, I and l are outside the base58 alphabet.
        assert!(!is_valid_wallet_address(
            "5FHneW46xGXgs5mUiveU4sbTyGBzmstUspZC92UhjJM694t0"
        ));
    }

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let store = Datastore::open_in_memory().unwrap();
        assert!(store.upsert_wallet("not-a-coldkey", None).await.is_err());
    }

    #[tokio::test]
    async fn wallet_lifecycle() {
        let store = Datastore::open_in_memory().unwrap();
        store.upsert_wallet(ALICE, Some("main")).await.unwrap();
        store.upsert_wallet(BOB, None).await.unwrap();
        assert_eq!(store.list_active_wallets().await.unwrap().len(), 2);

        assert!(store.deactivate_wallet(BOB).await.unwrap());
        let active = store.list_active_wallets().await.unwrap();
        assert_eq!(active, vec![ALICE.to_string()]);

        // Deactivated wallet still readable, just inactive.
        let bob = store.get_wallet(BOB).await.unwrap().unwrap();
        assert!(!bob.is_active);

        // Re-upserting reactivates and keeps the label.
        store.upsert_wallet(BOB, None).await.unwrap();
        assert_eq!(store.list_active_wallets().await.unwrap().len(), 2);
    }
}
