//! Application-side user profiles: the `users` table holding role and
//! approval state keyed by the identity provider's user id.
//! The repository trait is the seam the auth core depends on; the bundled
//! implementation stores rows in `users.parquet` through the shared store.

use async_trait::async_trait;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{SharedStore, bool_at, find_row, i64_at, mask_not_equal, str_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self { Role::Admin => "admin", Role::User => "user" }
    }

    /// Unknown strings degrade to the non-privileged role.
    pub fn parse(s: &str) -> Role {
        if s.eq_ignore_ascii_case("admin") { Role::Admin } else { Role::User }
    }
}

/// One row of the `users` table. Exactly one row exists per identity-provider
/// user id; the id is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub is_approved: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update applied by `ProfileRepository::update`.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub name: Option<String>,
    pub role: Option<Role>,
    pub is_approved: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Insert collided with an existing row for the same id. Recoverable:
    /// callers fall back to `upsert`.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for RepoError {
    fn from(e: anyhow::Error) -> Self { RepoError::Storage(e.to_string()) }
}

/// Remote-table contract for the `users` table, extended with the
/// listing/approval operations the admin surface needs.
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn count(&self) -> Result<usize, RepoError>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, RepoError>;
    async fn get_by_email(&self, email: &str) -> Result<Option<Profile>, RepoError>;
    /// Strict insert: a same-id row yields `RepoError::DuplicateKey`.
    async fn insert(&self, profile: Profile) -> Result<Profile, RepoError>;
    async fn update(&self, id: Uuid, changes: ProfileChanges) -> Result<Profile, RepoError>;
    /// Insert-or-update with conflict target `id`, in one repository call so
    /// there is no second race between a failed insert and a fallback
    /// update. Returns true when an existing row was replaced.
    async fn upsert(&self, profile: Profile) -> Result<bool, RepoError>;
    async fn list(&self) -> Result<Vec<Profile>, RepoError>;
    async fn delete(&self, id: Uuid) -> Result<(), RepoError>;
}

const TABLE: &str = "users";

fn mk_schema_df() -> DataFrame {
    DataFrame::new(vec![
        Series::new("id".into(), Vec::<String>::new()).into(),
        Series::new("email".into(), Vec::<String>::new()).into(),
        Series::new("name".into(), Vec::<String>::new()).into(),
        Series::new("role".into(), Vec::<String>::new()).into(),
        Series::new("is_approved".into(), Vec::<bool>::new()).into(),
        Series::new("created_at".into(), Vec::<i64>::new()).into(),
        Series::new("updated_at".into(), Vec::<i64>::new()).into(),
    ]).unwrap()
}

fn row_df(p: &Profile) -> Result<DataFrame, RepoError> {
    DataFrame::new(vec![
        Series::new("id".into(), vec![p.id.to_string()]).into(),
        Series::new("email".into(), vec![p.email.clone()]).into(),
        Series::new("name".into(), vec![p.name.clone()]).into(),
        Series::new("role".into(), vec![p.role.as_str().to_string()]).into(),
        Series::new("is_approved".into(), vec![p.is_approved]).into(),
        Series::new("created_at".into(), vec![p.created_at]).into(),
        Series::new("updated_at".into(), vec![p.updated_at]).into(),
    ]).map_err(|e| RepoError::Storage(e.to_string()))
}

fn profile_at(df: &DataFrame, i: usize) -> Option<Profile> {
    Some(Profile {
        id: str_at(df, "id", i)?.parse::<Uuid>().ok()?,
        email: str_at(df, "email", i)?,
        name: str_at(df, "name", i).unwrap_or_default(),
        role: Role::parse(&str_at(df, "role", i)?),
        is_approved: bool_at(df, "is_approved", i).unwrap_or(false),
        created_at: i64_at(df, "created_at", i).unwrap_or(0),
        updated_at: i64_at(df, "updated_at", i).unwrap_or(0),
    })
}

/// Parquet-backed profile repository. Every mutation is a read-modify-rewrite
/// of `users.parquet` while holding the store mutex, so count-then-upsert
/// sequences inside one lock scope observe a stable table.
pub struct ParquetProfileRepository {
    store: SharedStore,
}

impl ParquetProfileRepository {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    fn replace_row(&self, df: DataFrame, p: &Profile) -> Result<DataFrame, RepoError> {
        let id = p.id.to_string();
        let mask = mask_not_equal(&df, "id", &id)?;
        let kept = df.filter(&mask).map_err(|e| RepoError::Storage(e.to_string()))?;
        let row = row_df(p)?;
        if kept.height() == 0 { Ok(row) } else {
            kept.vstack(&row).map_err(|e| RepoError::Storage(e.to_string()))
        }
    }
}

#[async_trait]
impl ProfileRepository for ParquetProfileRepository {
    async fn count(&self) -> Result<usize, RepoError> {
        let guard = self.store.0.lock();
        Ok(guard.row_count(TABLE, mk_schema_df)?)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, RepoError> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        Ok(find_row(&df, "id", &id.to_string()).and_then(|i| profile_at(&df, i)))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Profile>, RepoError> {
        let needle = email.trim().to_lowercase();
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        for i in 0..df.height() {
            if str_at(&df, "email", i).map(|e| e.to_lowercase()).as_deref() == Some(needle.as_str()) {
                return Ok(profile_at(&df, i));
            }
        }
        Ok(None)
    }

    async fn insert(&self, profile: Profile) -> Result<Profile, RepoError> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        if find_row(&df, "id", &profile.id.to_string()).is_some() {
            return Err(RepoError::DuplicateKey(profile.id.to_string()));
        }
        let row = row_df(&profile)?;
        let stacked = if df.height() == 0 { row } else {
            df.vstack(&row).map_err(|e| RepoError::Storage(e.to_string()))?
        };
        guard.write_table(TABLE, stacked)?;
        Ok(profile)
    }

    async fn update(&self, id: Uuid, changes: ProfileChanges) -> Result<Profile, RepoError> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let Some(i) = find_row(&df, "id", &id.to_string()) else {
            return Err(RepoError::NotFound(id.to_string()));
        };
        let mut current = profile_at(&df, i)
            .ok_or_else(|| RepoError::Storage(format!("corrupt profile row for {}", id)))?;
        if let Some(name) = changes.name { current.name = name; }
        if let Some(role) = changes.role { current.role = role; }
        if let Some(approved) = changes.is_approved { current.is_approved = approved; }
        current.updated_at = chrono::Utc::now().timestamp_millis();
        let stacked = self.replace_row(df, &current)?;
        guard.write_table(TABLE, stacked)?;
        Ok(current)
    }

    async fn upsert(&self, profile: Profile) -> Result<bool, RepoError> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let replaced = find_row(&df, "id", &profile.id.to_string()).is_some();
        let stacked = self.replace_row(df, &profile)?;
        guard.write_table(TABLE, stacked)?;
        Ok(replaced)
    }

    async fn list(&self) -> Result<Vec<Profile>, RepoError> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            if let Some(p) = profile_at(&df, i) { out.push(p); }
        }
        Ok(out)
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        if find_row(&df, "id", &id.to_string()).is_none() {
            return Err(RepoError::NotFound(id.to_string()));
        }
        let mask = mask_not_equal(&df, "id", &id.to_string())?;
        let kept = df.filter(&mask).map_err(|e| RepoError::Storage(e.to_string()))?;
        guard.write_table(TABLE, kept)?;
        Ok(())
    }
}

pub fn new_profile(id: Uuid, email: &str, name: &str, role: Role, is_approved: bool) -> Profile {
    let now = chrono::Utc::now().timestamp_millis();
    Profile {
        id,
        email: email.trim().to_lowercase(),
        name: name.to_string(),
        role,
        is_approved,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, ParquetProfileRepository) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        (tmp, ParquetProfileRepository::new(store))
    }

    #[tokio::test]
    async fn insert_get_count_roundtrip() {
        let (_tmp, r) = repo();
        assert_eq!(r.count().await.unwrap(), 0);
        let p = new_profile(Uuid::new_v4(), "A@X.com", "Alice", Role::Admin, true);
        r.insert(p.clone()).await.unwrap();
        assert_eq!(r.count().await.unwrap(), 1);

        let got = r.get_by_id(p.id).await.unwrap().unwrap();
        assert_eq!(got.email, "a@x.com");
        assert_eq!(got.role, Role::Admin);
        assert!(got.is_approved);
        assert!(r.get_by_email("a@x.com").await.unwrap().is_some());
        assert!(r.get_by_email("b@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_classified() {
        let (_tmp, r) = repo();
        let p = new_profile(Uuid::new_v4(), "a@x.com", "Alice", Role::User, false);
        r.insert(p.clone()).await.unwrap();
        let dup = r.insert(p.clone()).await;
        assert!(matches!(dup, Err(RepoError::DuplicateKey(_))));
        // the table still holds exactly one row
        assert_eq!(r.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_in_place() {
        let (_tmp, r) = repo();
        let mut p = new_profile(Uuid::new_v4(), "a@x.com", "Alice", Role::User, false);
        assert!(!r.upsert(p.clone()).await.unwrap());
        p.is_approved = true;
        assert!(r.upsert(p.clone()).await.unwrap());
        assert_eq!(r.count().await.unwrap(), 1);
        assert!(r.get_by_id(p.id).await.unwrap().unwrap().is_approved);
    }

    #[tokio::test]
    async fn update_applies_partial_changes() {
        let (_tmp, r) = repo();
        let p = new_profile(Uuid::new_v4(), "a@x.com", "Alice", Role::User, false);
        r.insert(p.clone()).await.unwrap();
        let updated = r.update(p.id, ProfileChanges { is_approved: Some(true), ..Default::default() }).await.unwrap();
        assert!(updated.is_approved);
        assert_eq!(updated.name, "Alice");
        assert_eq!(updated.role, Role::User);

        let missing = r.update(Uuid::new_v4(), ProfileChanges::default()).await;
        assert!(matches!(missing, Err(RepoError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let (_tmp, r) = repo();
        let p = new_profile(Uuid::new_v4(), "a@x.com", "Alice", Role::User, false);
        r.insert(p.clone()).await.unwrap();
        r.delete(p.id).await.unwrap();
        assert!(r.get_by_id(p.id).await.unwrap().is_none());
        assert!(matches!(r.delete(p.id).await, Err(RepoError::NotFound(_))));
    }
}
