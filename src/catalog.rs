//! Service catalog: what the agency sells. Feature lists are persisted as a
//! JSON-encoded string column so the table stays flat.

use anyhow::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{SharedStore, f64_at, find_row, i64_at, mask_not_equal, str_at};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub category: String,
    pub features: Vec<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewService {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub features: Vec<String>,
}

const TABLE: &str = "services";

fn mk_schema_df() -> DataFrame {
    DataFrame::new(vec![
        Series::new("id".into(), Vec::<String>::new()).into(),
        Series::new("name".into(), Vec::<String>::new()).into(),
        Series::new("description".into(), Vec::<String>::new()).into(),
        Series::new("price".into(), Vec::<f64>::new()).into(),
        Series::new("category".into(), Vec::<String>::new()).into(),
        Series::new("features_json".into(), Vec::<String>::new()).into(),
        Series::new("created_at".into(), Vec::<i64>::new()).into(),
    ]).unwrap()
}

fn row_df(s: &Service) -> Result<DataFrame> {
    let features_json = serde_json::to_string(&s.features)?;
    Ok(DataFrame::new(vec![
        Series::new("id".into(), vec![s.id.to_string()]).into(),
        Series::new("name".into(), vec![s.name.clone()]).into(),
        Series::new("description".into(), vec![s.description.clone()]).into(),
        Series::new("price".into(), vec![s.price]).into(),
        Series::new("category".into(), vec![s.category.clone()]).into(),
        Series::new("features_json".into(), vec![features_json]).into(),
        Series::new("created_at".into(), vec![s.created_at]).into(),
    ])?)
}

fn service_at(df: &DataFrame, i: usize) -> Option<Service> {
    let features = str_at(df, "features_json", i)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .unwrap_or_default();
    Some(Service {
        id: str_at(df, "id", i)?.parse::<Uuid>().ok()?,
        name: str_at(df, "name", i)?,
        description: str_at(df, "description", i).unwrap_or_default(),
        price: f64_at(df, "price", i).unwrap_or(0.0),
        category: str_at(df, "category", i).unwrap_or_default(),
        features,
        created_at: i64_at(df, "created_at", i).unwrap_or(0),
    })
}

#[derive(Clone)]
pub struct ServiceStore {
    store: SharedStore,
}

impl ServiceStore {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    pub fn is_empty(&self) -> Result<bool> {
        let guard = self.store.0.lock();
        Ok(guard.row_count(TABLE, mk_schema_df)? == 0)
    }

    pub fn list(&self) -> Result<Vec<Service>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            if let Some(s) = service_at(&df, i) { out.push(s); }
        }
        Ok(out)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Service>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        Ok(find_row(&df, "id", &id.to_string()).and_then(|i| service_at(&df, i)))
    }

    pub fn insert(&self, new: NewService) -> Result<Service> {
        let service = Service {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            price: new.price,
            category: new.category,
            features: new.features,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let guard = self.store.0.lock();
        guard.append_rows(TABLE, mk_schema_df, row_df(&service)?)?;
        Ok(service)
    }

    pub fn update(&self, id: Uuid, new: NewService) -> Result<Option<Service>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let Some(i) = find_row(&df, "id", &id.to_string()) else { return Ok(None); };
        let mut current = match service_at(&df, i) { Some(s) => s, None => return Ok(None) };
        current.name = new.name;
        current.description = new.description;
        current.price = new.price;
        current.category = new.category;
        current.features = new.features;
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

/// First-run convenience: a small marketing-services catalog so a fresh
/// install has something to build proposals from. Returns how many services
/// were created; a non-empty catalog is left untouched.
pub fn seed_demo_catalog(services: &ServiceStore) -> Result<usize> {
    if !services.is_empty()? { return Ok(0); }
    let demo: Vec<NewService> = vec![
        NewService {
            name: "Google Ads Management".into(),
            description: "Full campaign management to grow qualified traffic and conversions.".into(),
            price: 2500.0,
            category: "Digital Marketing".into(),
            features: vec![
                "Campaign setup".into(),
                "Continuous optimization".into(),
                "Weekly reports".into(),
            ],
        },
        NewService {
            name: "Social Media Management".into(),
            description: "Content creation and community management across social channels.".into(),
            price: 1800.0,
            category: "Digital Marketing".into(),
            features: vec![
                "Editorial calendar".into(),
                "Content creation".into(),
                "Monthly report".into(),
            ],
        },
        NewService {
            name: "SEO".into(),
            description: "Search engine optimization for organic traffic and visibility.".into(),
            price: 2000.0,
            category: "Digital Marketing".into(),
            features: vec![
                "Keyword analysis".into(),
                "On-page optimization".into(),
                "Backlink building".into(),
            ],
        },
        NewService {
            name: "Brand Identity".into(),
            description: "Complete visual identity so the brand stands out.".into(),
            price: 4500.0,
            category: "Branding".into(),
            features: vec![
                "Logo and variations".into(),
                "Color palette".into(),
                "Brand manual".into(),
            ],
        },
    ];
    let n = demo.len();
    for svc in demo {
        services.insert(svc)?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ServiceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedStore::new(tmp.path()).unwrap();
        (tmp, ServiceStore::new(shared))
    }

    #[test]
    fn features_survive_the_table_roundtrip() {
        let (_tmp, s) = store();
        let created = s.insert(NewService {
            name: "SEO".into(),
            description: "Search optimization".into(),
            price: 2000.0,
            category: "Digital Marketing".into(),
            features: vec!["Keyword analysis".into(), "On-page optimization".into()],
        }).unwrap();

        let got = s.get(created.id).unwrap().unwrap();
        assert_eq!(got.features, vec!["Keyword analysis".to_string(), "On-page optimization".to_string()]);
        assert_eq!(got.price, 2000.0);
    }

    #[test]
    fn update_and_delete() {
        let (_tmp, s) = store();
        let created = s.insert(NewService {
            name: "SEO".into(), description: String::new(), price: 2000.0,
            category: String::new(), features: vec![],
        }).unwrap();
        let updated = s.update(created.id, NewService {
            name: "SEO Pro".into(), description: String::new(), price: 2400.0,
            category: String::new(), features: vec!["Backlinks".into()],
        }).unwrap().unwrap();
        assert_eq!(updated.name, "SEO Pro");
        assert_eq!(updated.price, 2400.0);
        assert!(s.delete(created.id).unwrap());
        assert!(s.get(created.id).unwrap().is_none());
    }

    #[test]
    fn demo_catalog_seeds_once() {
        let (_tmp, s) = store();
        let n = seed_demo_catalog(&s).unwrap();
        assert!(n > 0);
        assert_eq!(seed_demo_catalog(&s).unwrap(), 0);
        assert_eq!(s.list().unwrap().len(), n);
    }
}
