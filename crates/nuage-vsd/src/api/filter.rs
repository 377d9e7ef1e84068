//! Builder for the `X-Nuage-Filter` request header.
//!
//! VSD list calls accept a filter expression of the form
//! `field IS 'value' and other IS 'x' or field IS 'y'`, where `and` binds
//! tighter than `or`.

use std::fmt;

/// Name of the header carrying the filter expression.
pub const FILTER_HEADER: &str = "X-Nuage-Filter";

/// A disjunction of conjunctions of `field IS 'value'` terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NuageFilter {
    clauses: Vec<Vec<(String, String)>>,
}

impl NuageFilter {
    /// A filter matching `field IS 'value'`.
    pub fn eq(field: impl Into<String>, value: impl ToString) -> Self {
        Self {
            clauses: vec![vec![(field.into(), value.to_string())]],
        }
    }

    /// A filter matching any of `values` on `field`.
    pub fn any_of<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        Self {
            clauses: values
                .into_iter()
                .map(|v| vec![(field.to_string(), v.to_string())])
                .collect(),
        }
    }

    /// Narrows the last clause with another term.
    pub fn and(mut self, field: impl Into<String>, value: impl ToString) -> Self {
        let term = (field.into(), value.to_string());
        match self.clauses.last_mut() {
            Some(clause) => clause.push(term),
            None => self.clauses.push(vec![term]),
        }
        self
    }

    /// Adds an alternative clause.
    pub fn or(mut self, field: impl Into<String>, value: impl ToString) -> Self {
        self.clauses.push(vec![(field.into(), value.to_string())]);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The clauses, each a list of `(field, value)` terms.
    pub fn clauses(&self) -> &[Vec<(String, String)>] {
        &self.clauses
    }
}

impl fmt::Display for NuageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .clauses
            .iter()
            .map(|clause| {
                clause
                    .iter()
                    .map(|(field, value)| format!("{} IS '{}'", field, value))
                    .collect::<Vec<_>>()
                    .join(" and ")
            })
            .collect();
        f.write_str(&rendered.join(" or "))
    }
}
