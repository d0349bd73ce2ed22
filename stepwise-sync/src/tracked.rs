//! Names of tracked object tables: `<Kind>_<client>_<object>`.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Identity of one tracked object, as encoded in its table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedName {
    pub kind: String,
    pub client: i32,
    pub object: usize,
}

impl TrackedName {
    pub fn new(kind: &str, client: i32, object: usize) -> SyncResult<Self> {
        validate_kind(kind)?;
        Ok(Self {
            kind: kind.to_string(),
            client,
            object,
        })
    }

    /// Parse a table name. Tables that do not follow the pattern are not
    /// tracked objects and yield `None`.
    pub fn parse(table: &str) -> Option<Self> {
        let mut parts = table.split('_');
        let (Some(kind), Some(client), Some(object), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        if kind.is_empty() {
            return None;
        }
        Some(Self {
            kind: kind.to_string(),
            client: client.parse().ok()?,
            object: object.parse().ok()?,
        })
    }

    /// Table names keep only their first letter's case, so kinds compare
    /// case-insensitively.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }

    pub fn table_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TrackedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.kind, self.client, self.object)
    }
}

/// Order by client, then by creation order within the client.
impl Ord for TrackedName {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.client, self.object, &self.kind).cmp(&(other.client, other.object, &other.kind))
    }
}

impl PartialOrd for TrackedName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn validate_kind(kind: &str) -> SyncResult<()> {
    if kind.is_empty() || kind.contains('_') || kind.chars().any(char::is_whitespace) {
        return Err(SyncError::InvalidKind(kind.to_string()));
    }
    Ok(())
}

/// Tracked tables of a store, sorted, optionally restricted to one client.
pub fn tracked_tables(tables: impl IntoIterator<Item = String>, client: Option<i32>) -> Vec<TrackedName> {
    let mut names: Vec<TrackedName> = tables
        .into_iter()
        .filter_map(|t| TrackedName::parse(&t))
        .filter(|n| client.is_none_or(|c| n.client == c))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let name = TrackedName::new("Mesh", 0, 12).unwrap();
        assert_eq!(name.table_name(), "Mesh_0_12");
        assert_eq!(TrackedName::parse("Mesh_0_12"), Some(name));
    }

    #[test]
    fn test_parse_rejects_other_tables() {
        assert_eq!(TrackedName::parse("Stats"), None);
        assert_eq!(TrackedName::parse("Mesh_0"), None);
        assert_eq!(TrackedName::parse("Mesh_a_1"), None);
        assert_eq!(TrackedName::parse("Mesh_0_1_2"), None);
        assert_eq!(TrackedName::parse("_0_1"), None);
    }

    #[test]
    fn test_invalid_kinds() {
        assert!(matches!(TrackedName::new("", 0, 0), Err(SyncError::InvalidKind(_))));
        assert!(matches!(TrackedName::new("Point_Cloud", 0, 0), Err(SyncError::InvalidKind(_))));
    }

    #[test]
    fn test_kind_is_case_insensitive() {
        let name = TrackedName::parse("Pointcloud_1_0").unwrap();
        assert!(name.is_kind("PointCloud"));
        assert!(!name.is_kind("Mesh"));
    }

    #[test]
    fn test_tracked_tables_sorted_by_client_then_object() {
        let tables = ["Mesh_1_0", "Points_0_10", "Stats", "Mesh_0_2"].map(String::from);
        let all = tracked_tables(tables.clone(), None);
        let names: Vec<String> = all.iter().map(TrackedName::table_name).collect();
        assert_eq!(names, vec!["Mesh_0_2", "Points_0_10", "Mesh_1_0"]);

        let one = tracked_tables(tables, Some(1));
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].client, 1);
    }
}
