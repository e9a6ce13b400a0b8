use crate::amount::Amount;
use crate::error::BountyError;
use crate::identity::derive_address;
use crate::types::Token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Spent-but-retained token kept for forensic recovery. Never spendable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedToken {
    pub token: Token,
    pub reason: String,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TokenFile {
    owned: BTreeMap<String, Token>,
    archived: BTreeMap<String, ArchivedToken>,
}

/// File-backed token collection for one owner identity.
///
/// The file on disk is the source of truth: every read path can reload it and
/// every mutation reloads, applies, then persists via write-temp-then-rename,
/// so another process spending from the same wallet is observed before the
/// next selection. A token id is never in `owned` and `archived` at once, and
/// an archived id is never re-admitted.
#[derive(Debug)]
pub struct TokenStore {
    owner: String,
    path: PathBuf,
    data: Mutex<TokenFile>,
}

impl TokenStore {
    /// Open `<root>/<owner>/tokens.json`, creating an empty store if missing.
    pub fn open(root: impl AsRef<Path>, owner_pubkey: impl Into<String>) -> Result<Self, BountyError> {
        let owner = owner_pubkey.into();
        let path = root.as_ref().join(&owner).join("tokens.json");
        let data = read_file(&path)?;
        Ok(Self {
            owner,
            path,
            data: Mutex::new(data),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn address(&self) -> String {
        derive_address(&self.owner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the token file.
    pub fn reload(&self) -> Result<(), BountyError> {
        let fresh = read_file(&self.path)?;
        let mut data = self.lock()?;
        *data = fresh;
        Ok(())
    }

    /// Add a token to the owned set. Returns `false` when the id is already
    /// owned or was archived before.
    pub fn add(&self, token: Token) -> Result<bool, BountyError> {
        self.mutate(|data| {
            if data.archived.contains_key(&token.id) || data.owned.contains_key(&token.id) {
                debug!(token_id = %token.id, "token already known, not re-added");
                return Ok(false);
            }
            data.owned.insert(token.id.clone(), token);
            Ok(true)
        })
    }

    /// Owned tokens in iteration order.
    pub fn list(&self) -> Result<Vec<Token>, BountyError> {
        Ok(self.lock()?.owned.values().cloned().collect())
    }

    /// Owned tokens holding a non-zero balance of `coin`.
    pub fn candidates(&self, coin: &str) -> Result<Vec<Token>, BountyError> {
        Ok(self
            .lock()?
            .owned
            .values()
            .filter(|token| token.holds(coin))
            .cloned()
            .collect())
    }

    /// Move a token from owned to archived. Returns the archived token, or
    /// `None` when it was not owned.
    pub fn archive(&self, token_id: &str, reason: &str) -> Result<Option<Token>, BountyError> {
        let archived = self.mutate(|data| {
            let Some(token) = data.owned.remove(token_id) else {
                return Ok(None);
            };
            data.archived.insert(
                token_id.to_string(),
                ArchivedToken {
                    token: token.clone(),
                    reason: reason.to_string(),
                    archived_at: Utc::now(),
                },
            );
            Ok(Some(token))
        })?;

        if archived.is_some() {
            info!(owner = %self.owner, token_id, reason, "token archived");
        }
        Ok(archived)
    }

    pub fn archived(&self) -> Result<Vec<ArchivedToken>, BountyError> {
        Ok(self.lock()?.archived.values().cloned().collect())
    }

    pub fn is_archived(&self, token_id: &str) -> Result<bool, BountyError> {
        Ok(self.lock()?.archived.contains_key(token_id))
    }

    /// Sum of owned balances per coin.
    pub fn balances(&self) -> Result<BTreeMap<String, Amount>, BountyError> {
        let data = self.lock()?;
        let mut totals: BTreeMap<String, Amount> = BTreeMap::new();
        for token in data.owned.values() {
            for (coin, amount) in &token.coins {
                *totals.entry(coin.clone()).or_default() += amount;
            }
        }
        Ok(totals)
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut TokenFile) -> Result<T, BountyError>,
    ) -> Result<T, BountyError> {
        let mut data = self.lock()?;
        *data = read_file(&self.path)?;
        let result = apply(&mut data)?;
        write_file(&self.path, &data)?;
        Ok(result)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TokenFile>, BountyError> {
        self.data
            .lock()
            .map_err(|_| BountyError::Storage("token store lock poisoned".to_string()))
    }
}

fn read_file(path: &Path) -> Result<TokenFile, BountyError> {
    if !path.exists() {
        return Ok(TokenFile::default());
    }
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Ok(TokenFile::default());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_file(path: &Path, data: &TokenFile) -> Result<(), BountyError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(data)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}
