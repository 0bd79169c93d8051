//! Proposals: the documents an agency sends a client, assembled from
//! catalog services with a percentage discount. Totals are computed once at
//! creation and stored with the row, so a later price change in the catalog
//! does not rewrite a sent proposal.

use anyhow::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{SharedStore, f64_at, find_row, i64_at, mask_not_equal, str_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Draft,
    Pending,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<ProposalStatus> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Some(ProposalStatus::Draft),
            "pending" => Some(ProposalStatus::Pending),
            "accepted" => Some(ProposalStatus::Accepted),
            "rejected" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub client_id: Uuid,
    pub service_ids: Vec<Uuid>,
    pub discount_percent: f64,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub total: f64,
    pub status: ProposalStatus,
    pub created_by: Uuid,
    pub created_at: i64,
}

/// Price arithmetic for one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Totals {
    pub subtotal: f64,
    pub discount_amount: f64,
    pub total: f64,
}

/// Sum the selected service prices and apply a percentage discount.
/// The discount is clamped to [0, 100] so a malformed request can never
/// produce a negative or inflated total.
pub fn compute_totals(prices: &[f64], discount_percent: f64) -> Totals {
    let subtotal: f64 = prices.iter().sum();
    let discount = discount_percent.clamp(0.0, 100.0);
    let discount_amount = subtotal * discount / 100.0;
    Totals { subtotal, discount_amount, total: subtotal - discount_amount }
}

/// Aggregates behind the dashboard cards.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DashboardMetrics {
    pub total_proposals: usize,
    pub accepted: usize,
    pub pending: usize,
    pub rejected: usize,
    /// accepted / decided, in percent; 0 when nothing was decided yet.
    pub acceptance_rate: f64,
    pub average_value: f64,
    pub total_value: f64,
    /// Distinct clients with at least one proposal.
    pub active_clients: usize,
}

pub fn dashboard_metrics(proposals: &[Proposal]) -> DashboardMetrics {
    let total_proposals = proposals.len();
    let accepted = proposals.iter().filter(|p| p.status == ProposalStatus::Accepted).count();
    let pending = proposals.iter().filter(|p| p.status == ProposalStatus::Pending).count();
    let rejected = proposals.iter().filter(|p| p.status == ProposalStatus::Rejected).count();
    let decided = accepted + rejected;
    let acceptance_rate = if decided == 0 { 0.0 } else { accepted as f64 * 100.0 / decided as f64 };
    let total_value: f64 = proposals.iter().map(|p| p.total).sum();
    let average_value = if total_proposals == 0 { 0.0 } else { total_value / total_proposals as f64 };
    let mut clients: Vec<Uuid> = proposals.iter().map(|p| p.client_id).collect();
    clients.sort();
    clients.dedup();
    DashboardMetrics {
        total_proposals,
        accepted,
        pending,
        rejected,
        acceptance_rate,
        average_value,
        total_value,
        active_clients: clients.len(),
    }
}

const TABLE: &str = "proposals";

fn mk_schema_df() -> DataFrame {
    DataFrame::new(vec![
        Series::new("id".into(), Vec::<String>::new()).into(),
        Series::new("client_id".into(), Vec::<String>::new()).into(),
        Series::new("service_ids_json".into(), Vec::<String>::new()).into(),
        Series::new("discount_percent".into(), Vec::<f64>::new()).into(),
        Series::new("subtotal".into(), Vec::<f64>::new()).into(),
        Series::new("discount_amount".into(), Vec::<f64>::new()).into(),
        Series::new("total".into(), Vec::<f64>::new()).into(),
        Series::new("status".into(), Vec::<String>::new()).into(),
        Series::new("created_by".into(), Vec::<String>::new()).into(),
        Series::new("created_at".into(), Vec::<i64>::new()).into(),
    ]).unwrap()
}

fn row_df(p: &Proposal) -> Result<DataFrame> {
    let ids: Vec<String> = p.service_ids.iter().map(|u| u.to_string()).collect();
    let service_ids_json = serde_json::to_string(&ids)?;
    Ok(DataFrame::new(vec![
        Series::new("id".into(), vec![p.id.to_string()]).into(),
        Series::new("client_id".into(), vec![p.client_id.to_string()]).into(),
        Series::new("service_ids_json".into(), vec![service_ids_json]).into(),
        Series::new("discount_percent".into(), vec![p.discount_percent]).into(),
        Series::new("subtotal".into(), vec![p.subtotal]).into(),
        Series::new("discount_amount".into(), vec![p.discount_amount]).into(),
        Series::new("total".into(), vec![p.total]).into(),
        Series::new("status".into(), vec![p.status.as_str().to_string()]).into(),
        Series::new("created_by".into(), vec![p.created_by.to_string()]).into(),
        Series::new("created_at".into(), vec![p.created_at]).into(),
    ])?)
}

fn proposal_at(df: &DataFrame, i: usize) -> Option<Proposal> {
    let service_ids = str_at(df, "service_ids_json", i)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .map(|ids| ids.iter().filter_map(|s| s.parse::<Uuid>().ok()).collect())
        .unwrap_or_default();
    Some(Proposal {
        id: str_at(df, "id", i)?.parse::<Uuid>().ok()?,
        client_id: str_at(df, "client_id", i)?.parse::<Uuid>().ok()?,
        service_ids,
        discount_percent: f64_at(df, "discount_percent", i).unwrap_or(0.0),
        subtotal: f64_at(df, "subtotal", i).unwrap_or(0.0),
        discount_amount: f64_at(df, "discount_amount", i).unwrap_or(0.0),
        total: f64_at(df, "total", i).unwrap_or(0.0),
        status: ProposalStatus::parse(&str_at(df, "status", i)?).unwrap_or(ProposalStatus::Draft),
        created_by: str_at(df, "created_by", i)?.parse::<Uuid>().ok()?,
        created_at: i64_at(df, "created_at", i).unwrap_or(0),
    })
}

#[derive(Clone)]
pub struct ProposalStore {
    store: SharedStore,
}

impl ProposalStore {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    pub fn list(&self) -> Result<Vec<Proposal>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            if let Some(p) = proposal_at(&df, i) { out.push(p); }
        }
        Ok(out)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Proposal>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        Ok(find_row(&df, "id", &id.to_string()).and_then(|i| proposal_at(&df, i)))
    }

    pub fn insert(&self, proposal: Proposal) -> Result<Proposal> {
        let guard = self.store.0.lock();
        guard.append_rows(TABLE, mk_schema_df, row_df(&proposal)?)?;
        Ok(proposal)
    }

    pub fn set_status(&self, id: Uuid, status: ProposalStatus) -> Result<Option<Proposal>> {
        let guard = self.store.0.lock();
        let df = guard.read_table(TABLE, mk_schema_df)?;
        let Some(i) = find_row(&df, "id", &id.to_string()) else { return Ok(None); };
        let mut current = match proposal_at(&df, i) { Some(p) => p, None => return Ok(None) };
        current.status = status;
        let mask = mask_not_equal(&df, "id", &id.to_string())?;
        let kept = df.filter(&mask)?;
        let row = row_df(&current)?;
        let stacked = if kept.height() == 0 { row } else { kept.vstack(&row)? };
        guard.write_table(TABLE, stacked)?;
        Ok(Some(current))
    }

    pub fn count_for_client(&self, client_id: Uuid) -> Result<usize> {
        Ok(self.list()?.iter().filter(|p| p.client_id == client_id).count())
    }
}
