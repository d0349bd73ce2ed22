//! Generic row arena shared by every table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::{ColumnId, TableRole};

/// A row as stored: id plus encoded cells keyed by column id.
///
/// Cells of removed columns stay here; they are simply never looked up.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: i64,
    pub cells: BTreeMap<ColumnId, Vec<u8>>,
}

impl StoredRow {
    pub fn placeholder(id: i64) -> Self {
        Self {
            id,
            cells: BTreeMap::new(),
        }
    }

    fn byte_size(&self) -> usize {
        8 + self.cells.values().map(|c| c.len() + 4).sum::<usize>()
    }
}

/// Rows of one table. Storing tables keep `rows[i].id == i + 1`.
#[derive(Debug, Clone, Default)]
pub struct TableData {
    rows: Vec<StoredRow>,
}

impl TableData {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, id: i64) -> Option<&StoredRow> {
        if id < 1 {
            return None;
        }
        self.rows.get((id - 1) as usize)
    }

    pub fn rows(&self) -> &[StoredRow] {
        &self.rows
    }

    /// Id the next insert receives, given `planned` rows not yet applied.
    pub fn next_id(&self, role: TableRole, planned: i64) -> i64 {
        match role {
            TableRole::Storing => self.rows.len() as i64 + planned + 1,
            TableRole::Exchange => 1,
        }
    }

    pub fn insert(&mut self, role: TableRole, row: StoredRow) -> Result<(), String> {
        match role {
            TableRole::Storing => {
                let expected = self.rows.len() as i64 + 1;
                if row.id != expected {
                    return Err(format!("row id {} out of sequence (expected {expected})", row.id));
                }
            }
            TableRole::Exchange => {
                if row.id != 1 {
                    return Err(format!("exchange row id {} is not 1", row.id));
                }
                self.rows.clear();
            }
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn update(&mut self, id: i64, cells: &[(ColumnId, Option<Vec<u8>>)]) -> Result<(), String> {
        let row = match id {
            1.. => self.rows.get_mut((id - 1) as usize),
            _ => None,
        }
        .ok_or_else(|| format!("no row {id}"))?;
        for (column, cell) in cells {
            match cell {
                Some(bytes) => {
                    row.cells.insert(*column, bytes.clone());
                }
                None => {
                    row.cells.remove(column);
                }
            }
        }
        Ok(())
    }

    /// Approximate heap bytes held by the rows.
    pub fn byte_size(&self) -> usize {
        self.rows.iter().map(StoredRow::byte_size).sum()
    }
}
