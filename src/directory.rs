//! Client directory: the agencies' customers and prospects. Plain table
//! CRUD over `clients.parquet`.

use anyhow::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{SharedStore, find_row, i64_at, mask_not_equal, str_at};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

const TABLE: &str = "clients";

fn mk_schema_df() -> DataFrame {
    DataFrame::new(vec![
        Series::new("id".into(), Vec::<String>::new()).into(),
        Series::new("name".into(), Vec::<String>::new()).into(),
        Series::new("email".into(), Vec::<String>::new()).into(),
        Series::new("phone".into(), Vec::<String>::new()).into(),
        Series::new("created_at".into(), Vec::<i64>::new()).into(),
    ]).unwrap()
}

fn row_df(c: &Client) -> Result<DataFrame> {
    Ok(DataFrame::new(vec![
        Series::new("id".into(), vec![c.id.to_string()]).into(),
        Series::new("name".into(), vec![c.name.clone()]).into(),
        Series::new("email".into(), vec![c.email.clone()]).into(),
        Series::new("phone".into(), vec![c.phone.clone()]).into(),
        Series::new("created_at".into(), vec![c.created_at]).into(),
    ])?)
}

fn client_at(df: &DataFrame, i: usize) -> Option<Client> {
    Some(Client {
        id: str_at(df, "id", i)?.parse::<Uuid>().ok()?,
        name: str_at(df, "name", i)?,
        email: str_at(df, "email", i).unwrap_or_default(),
        phone: str_at(df, "phone", i).unwrap_or_default(),
        created_at: i64_at(df, "created_at", i).unwrap_or(0),
    })
}

#[derive(Clone)]
pub struct ClientStore {
    store: SharedStore,
}

impl ClientStore {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    pub fn list(&self) -> Result<Vec<Client>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            if let Some(c) = client_at(&df, i) { out.push(c); }
        }
        Ok(out)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Client>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        Ok(find_row(&df, "id", &id.to_string()).and_then(|i| client_at(&df, i)))
    }

    pub fn insert(&self, new: NewClient) -> Result<Client> {
        let client = Client {
            id: Uuid::new_v4(),
            name: new.name,
            email: new.email,
            phone: new.phone,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let guard = self.store.0.lock();
        guard.append_rows(TABLE, mk_schema_df, row_df(&client)?)?;
        Ok(client)
    }

    /// Replace the mutable fields; `None` when the id is unknown.
    pub fn update(&self, id: Uuid, new: NewClient) -> Result<Option<Client>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let Some(i) = find_row(&df, "id", &id.to_string()) else { return Ok(None); };
        let mut current = match client_at(&df, i) { Some(c) => c, None => return Ok(None) };
        current.name = new.name;
        current.email = new.email;
        current.phone = new.phone;
        let mask = mask_not_equal(&df, "id", &id.to_string())?;
        let kept = df.filter(&mask)?;
        let row = row_df(&current)?;
        let stacked = if kept.height() == 0 { row } else { kept.vstack(&row)? };
        guard.write_table(TABLE, stacked)?;
        Ok(Some(current))
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        if find_row(&df, "id", &id.to_string()).is_none() { return Ok(false); }
        let mask = mask_not_equal(&df, "id", &id.to_string())?;
        let kept = df.filter(&mask)?;
        guard.write_table(TABLE, kept)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ClientStore) {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedStore::new(tmp.path()).unwrap();
        (tmp, ClientStore::new(shared))
    }

    #[test]
    fn crud_roundtrip() {
        let (_tmp, s) = store();
        assert!(s.list().unwrap().is_empty());

        let c = s.insert(NewClient {
            name: "Empresa ABC Ltda".into(),
            email: "contato@empresaabc.com.br".into(),
            phone: "(11) 98765-4321".into(),
        }).unwrap();
        assert_eq!(s.list().unwrap().len(), 1);
        assert_eq!(s.get(c.id).unwrap().unwrap().name, "Empresa ABC Ltda");

        let updated = s.update(c.id, NewClient {
            name: "Empresa ABC".into(),
            email: c.email.clone(),
            phone: c.phone.clone(),
        }).unwrap().unwrap();
        assert_eq!(updated.name, "Empresa ABC");
        assert_eq!(updated.id, c.id);

        assert!(s.delete(c.id).unwrap());
        assert!(!s.delete(c.id).unwrap());
        assert!(s.get(c.id).unwrap().is_none());
    }

    #[test]
    fn update_unknown_id_is_none() {
        let (_tmp, s) = store();
        let miss = s.update(Uuid::new_v4(), NewClient { name: "x".into(), email: String::new(), phone: String::new() }).unwrap();
        assert!(miss.is_none());
    }
}
