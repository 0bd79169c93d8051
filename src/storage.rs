//!
//! pitchdesk storage module
//! ------------------------
//! On-disk table store for pitchdesk. Every logical table is a single
//! Parquet file named `<table>.parquet` under the configured data root.
//! Tables are small (profiles, clients, services, proposals), so writes are
//! whole-file rewrites: read the frame, filter/append rows, write it back.
//! Callers serialize access through `SharedStore`, which wraps the `Store`
//! in an `Arc<Mutex<..>>` so a count-then-write sequence observes a stable
//! frame.
//!
//! Key responsibilities:
//! - Parquet read/rewrite with a caller-supplied empty schema frame.
//! - Row-mask helpers shared by the per-table repositories.
//! - `AnyValue` extraction helpers for string/bool/number columns.

use std::{fs, path::{Path, PathBuf}};
use anyhow::{Result, Context};
use parking_lot::Mutex;
use std::sync::Arc;
use polars::prelude::*;
use tracing::debug;

/// Filesystem handle for the pitchdesk table files.
///
/// Store does not interpret rows; the typed repositories in `profiles`,
/// `directory`, `catalog` and `proposals` own their column layouts and use
/// Store only for IO.
#[derive(Clone)]
pub struct Store {
    /// Root folder holding one `<table>.parquet` file per table.
    root: PathBuf,
}

impl Store {
    /// Create a new Store rooted at the given filesystem path.
    /// The directory is created if it does not already exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create or access data root: {}", root.display()))?;
        Ok(Self { root })
    }

    /// Return the configured root folder for this Store.
    pub fn root_path(&self) -> &PathBuf { &self.root }

    fn table_path(&self, table: &str) -> PathBuf { self.root.join(format!("{}.parquet", table)) }

    /// True if the table file exists on disk (a never-written table reads as
    /// its empty schema frame either way).
    pub fn table_exists(&self, table: &str) -> bool { self.table_path(table).exists() }

    /// Read a table, returning `empty()` when the file has not been written yet.
    pub fn read_table(&self, table: &str, empty: impl Fn() -> DataFrame) -> Result<DataFrame> {
        let p = self.table_path(table);
        if !p.exists() { return Ok(empty()); }
        let file = fs::File::open(&p)
            .with_context(|| format!("While opening table file: {}", p.display()))?;
        let df = ParquetReader::new(file).finish()
            .with_context(|| format!("While reading parquet table: {}", p.display()))?;
        Ok(df)
    }

    /// Rewrite a table file from the given frame.
    pub fn write_table(&self, table: &str, mut df: DataFrame) -> Result<()> {
        let p = self.table_path(table);
        if let Some(dir) = p.parent() { fs::create_dir_all(dir).ok(); }
        let mut f = fs::File::create(&p)
            .with_context(|| format!("While creating table file: {}", p.display()))?;
        ParquetWriter::new(&mut f).finish(&mut df)
            .with_context(|| format!("While writing parquet table: {}", p.display()))?;
        debug!(target: "pitchdesk::storage", "write_table: table='{}' rows={}", table, df.height());
        Ok(())
    }

    /// Append rows to a table, creating it when absent.
    pub fn append_rows(&self, table: &str, empty: impl Fn() -> DataFrame, rows: DataFrame) -> Result<()> {
        let df = self.read_table(table, empty)?;
        if df.height() == 0 {
            self.write_table(table, rows)
        } else {
            let stacked = df.vstack(&rows)?;
            self.write_table(table, stacked)
        }
    }

    /// Row count without materializing typed rows.
    pub fn row_count(&self, table: &str, empty: impl Fn() -> DataFrame) -> Result<usize> {
        Ok(self.read_table(table, empty)?.height())
    }
}

/// Thread-safe handle shared across handlers and repositories.
#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<Store>>);

impl SharedStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Ok(SharedStore(Arc::new(Mutex::new(Store::new(root)?))))
    }
}

/// Build a keep-mask excluding rows where `col` equals `value`.
pub fn mask_not_equal(df: &DataFrame, col: &str, value: &str) -> Result<ChunkedArray<BooleanType>> {
    let s = df.column(col)?.clone();
    let series = s.as_series().cloned()
        .ok_or_else(|| anyhow::anyhow!("column '{}' is not a series", col))?;
    let mask: ChunkedArray<BooleanType> = series.iter().map(|av| match av {
        AnyValue::String(v) => v != value,
        AnyValue::StringOwned(v) => v.as_str() != value,
        _ => true,
    }).collect();
    Ok(mask)
}

/// String cell extraction tolerant of both borrowed and owned values.
pub fn str_at(df: &DataFrame, col: &str, i: usize) -> Option<String> {
    match df.column(col).ok()?.get(i).ok()? {
        AnyValue::String(s) => Some(s.to_string()),
        AnyValue::StringOwned(s) => Some(s.to_string()),
        _ => None,
    }
}

pub fn bool_at(df: &DataFrame, col: &str, i: usize) -> Option<bool> {
    df.column(col).ok()?.bool().ok()?.get(i)
}

pub fn i64_at(df: &DataFrame, col: &str, i: usize) -> Option<i64> {
    df.column(col).ok()?.i64().ok()?.get(i)
}

pub fn f64_at(df: &DataFrame, col: &str, i: usize) -> Option<f64> {
    df.column(col).ok()?.f64().ok()?.get(i)
}

/// Index of the first row where `col` equals `value`, if any.
pub fn find_row(df: &DataFrame, col: &str, value: &str) -> Option<usize> {
    for i in 0..df.height() {
        if str_at(df, col, i).as_deref() == Some(value) { return Some(i); }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataFrame {
        DataFrame::new(vec![
            Series::new("id".into(), vec!["a".to_string(), "b".to_string()]).into(),
            Series::new("n".into(), vec![1i64, 2i64]).into(),
        ]).unwrap()
    }

    #[test]
    fn read_missing_table_yields_empty_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let df = store.read_table("nope", || DataFrame::new(vec![
            Series::new("id".into(), Vec::<String>::new()).into(),
        ]).unwrap()).unwrap();
        assert_eq!(df.height(), 0);
        assert!(!store.table_exists("nope"));
    }

    #[test]
    fn rewrite_roundtrip_and_mask() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.write_table("t", sample()).unwrap();
        let df = store.read_table("t", sample).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(str_at(&df, "id", 0).as_deref(), Some("a"));
        assert_eq!(i64_at(&df, "n", 1), Some(2));

        let mask = mask_not_equal(&df, "id", "a").unwrap();
        let kept = df.filter(&mask).unwrap();
        assert_eq!(kept.height(), 1);
        assert_eq!(str_at(&kept, "id", 0).as_deref(), Some("b"));
        assert_eq!(find_row(&kept, "id", "b"), Some(0));
        assert_eq!(find_row(&kept, "id", "a"), None);
    }

    #[test]
    fn append_creates_then_stacks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.append_rows("t", sample, sample()).unwrap();
        store.append_rows("t", sample, sample()).unwrap();
        assert_eq!(store.row_count("t", sample).unwrap(), 4);
    }
}
