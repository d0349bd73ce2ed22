//! Row selection, projection and the clamping law for row ids.

/// Map a requested row id onto `1..=n`.
///
/// `k > n` → `n`, `k <= 0` → `n + k + 1` (so `-1` is the last row),
/// anything still below 1 → 1. Callers handle `n == 0`.
pub fn clamp_row_id(k: i64, n: i64) -> i64 {
    let k = if k <= 0 { n + k + 1 } else { k };
    k.clamp(1, n.max(1))
}

/// Which rows a multi-row read returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// Exact ids; ids with no row are skipped
    Ids(Vec<i64>),
    /// Inclusive range, both ends clamped
    Range(i64, i64),
}

impl Selection {
    /// Concrete ids for a table of `n` rows.
    pub fn resolve(&self, n: i64) -> Vec<i64> {
        if n <= 0 {
            return Vec::new();
        }
        match self {
            Selection::All => (1..=n).collect(),
            Selection::Ids(ids) => ids.iter().copied().filter(|id| (1..=n).contains(id)).collect(),
            Selection::Range(first, last) => {
                let first = clamp_row_id(*first, n);
                let last = clamp_row_id(*last, n);
                if last < first {
                    vec![first]
                } else {
                    (first..=last).collect()
                }
            }
        }
    }
}

/// Field filter and joins applied to materialized rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    fields: Option<Vec<String>>,
    joins: Vec<String>,
}

impl Projection {
    /// Every visible column, no joins.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the named fields (the id is always returned).
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Some(names.into_iter().map(Into::into).collect()),
            joins: Vec::new(),
        }
    }

    /// Follow the first reference column that targets `table`.
    pub fn join(mut self, table: impl Into<String>) -> Self {
        self.joins.push(table.into());
        self
    }

    pub fn includes(&self, name: &str) -> bool {
        self.fields
            .as_ref()
            .is_none_or(|fields| fields.iter().any(|f| f == name))
    }

    pub fn joins(&self) -> &[String] {
        &self.joins
    }

    /// Same field filter, no joins (joins are a single hop).
    pub(crate) fn flattened(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            joins: Vec::new(),
        }
    }
}
