use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the log-density column carried alongside the parameters.
pub const LOG_PROB: &str = "log_prob";

/// A single row of named parameter values.
pub type Parameters = BTreeMap<String, f64>;

/// Columnar table of samples.
///
/// Rows are independent draws, columns are named parameters (and usually
/// `log_prob`). Column order is insertion order. Every column has exactly
/// `len` entries; row identity is never changed by a pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleTable {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    len: usize,
}

impl SampleTable {
    /// Empty table with a fixed row count and no columns.
    pub fn with_len(len: usize) -> Self {
        Self {
            names: Vec::new(),
            columns: Vec::new(),
            len,
        }
    }

    pub fn from_columns<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut table: Option<SampleTable> = None;
        for (name, values) in columns {
            let t = table.get_or_insert_with(|| SampleTable::with_len(values.len()));
            t.insert(name, values)?;
        }
        Ok(table.unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.position(name).map(|i| self.columns[i].as_slice())
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Vec<f64>> {
        self.position(name).map(move |i| &mut self.columns[i])
    }

    /// Like [`column`](Self::column) but a missing column is an error.
    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.column(name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut Vec<f64>> {
        let i = self
            .position(name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))?;
        Ok(&mut self.columns[i])
    }

    /// Insert a column, replacing an existing column of the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.len {
            return Err(Error::shape(format!("column `{name}`"), self.len, values.len()));
        }
        match self.position(&name) {
            Some(i) => self.columns[i] = values,
            None => {
                self.names.push(name);
                self.columns.push(values);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<f64>> {
        let i = self.position(name)?;
        self.names.remove(i);
        Some(self.columns.remove(i))
    }

    /// New table holding the named columns, in the requested order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<SampleTable> {
        let mut out = SampleTable::with_len(self.len);
        for name in names {
            let name = name.as_ref();
            out.insert(name, self.require(name)?.to_vec())?;
        }
        Ok(out)
    }

    /// New table holding the given rows, in the given order.
    pub fn take_rows(&self, rows: &[usize]) -> SampleTable {
        SampleTable {
            names: self.names.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| rows.iter().map(|&r| c[r]).collect())
                .collect(),
            len: rows.len(),
        }
    }

    pub fn row(&self, idx: usize) -> Parameters {
        self.names
            .iter()
            .zip(&self.columns)
            .map(|(n, c)| (n.clone(), c[idx]))
            .collect()
    }

    pub fn log_prob(&self) -> Option<&[f64]> {
        self.column(LOG_PROB)
    }

    /// Copy of the table without `log_prob`, i.e. the parameter values only.
    pub fn parameters(&self) -> SampleTable {
        let mut out = self.clone();
        out.remove(LOG_PROB);
        out
    }

    /// Column means, in column order.
    pub fn mean(&self) -> Vec<f64> {
        self.columns
            .iter()
            .map(|c| c.iter().sum::<f64>() / self.len as f64)
            .collect()
    }

    /// Column standard deviations (population), in column order.
    pub fn std(&self) -> Vec<f64> {
        self.columns
            .iter()
            .zip(self.mean())
            .map(|(c, m)| {
                let ss: f64 = c.iter().map(|v| (v - m) * (v - m)).sum();
                (ss / self.len as f64).sqrt()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SampleTable {
        SampleTable::from_columns([
            ("a", vec![1.0, 2.0, 3.0]),
            ("b", vec![4.0, 5.0, 6.0]),
        ])
        .unwrap()
    }

    #[test]
    fn test_insert_rejects_wrong_length() {
        let mut t = table();
        let err = t.insert("c", vec![1.0]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 3, got: 1, .. }));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut t = table();
        t.insert("a", vec![0.0; 3]).unwrap();
        assert_eq!(t.names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(t.column("a").unwrap(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_select_and_take_rows() {
        let t = table();
        let s = t.select(&["b"]).unwrap();
        assert_eq!(s.names(), &["b".to_string()]);
        assert!(t.select(&["zzz"]).is_err());

        let r = t.take_rows(&[2, 0]);
        assert_eq!(r.len(), 2);
        assert_eq!(r.column("a").unwrap(), &[3.0, 1.0]);
    }

    #[test]
    fn test_mean_std() {
        let t = table();
        assert_eq!(t.mean(), vec![2.0, 5.0]);
        let s = t.std();
        assert!((s[0] - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_parameters_drops_log_prob() {
        let mut t = table();
        t.insert(LOG_PROB, vec![-1.0; 3]).unwrap();
        assert!(t.log_prob().is_some());
        assert!(!t.parameters().contains(LOG_PROB));
        assert_eq!(t.row(1)["b"], 5.0);
    }
}
