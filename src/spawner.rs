//! Graph input: spawning a device population from node and arc files.
//!
//! The nodes file holds one device per line, whitespace-separated
//! attribute values in the column order declared by the caller; an
//! optional leading `start` column gives the spawn time, else the
//! configured default applies. The arcs file holds one `from to`
//! pair per line, producing a directed link (listed twice for an
//! undirected one).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::device::DeviceId;
use crate::error::{FieldcastError, FieldcastResult};
use crate::time::SimTime;

/// One parsed node line.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    /// Spawn time from the leading `start` column, if declared.
    pub start: Option<SimTime>,
    /// The remaining attribute values, in declared column order.
    pub values: Vec<f64>,
}

impl NodeRow {
    /// The value of a named column.
    pub fn get(&self, columns: &GraphSpawner, name: &str) -> Option<f64> {
        columns
            .attribute_columns()
            .iter()
            .position(|c| c == name)
            .map(|i| self.values[i])
    }
}

/// Declares the node-file schema and parses both graph files.
#[derive(Debug, Clone)]
pub struct GraphSpawner {
    columns: Vec<String>,
    has_start: bool,
}

impl GraphSpawner {
    /// Declare the column order of the nodes file. A first column
    /// named `start` is the spawn time; every other column is an
    /// attribute handed to the caller.
    pub fn new(columns: &[&str]) -> Self {
        let has_start = columns.first() == Some(&"start");
        GraphSpawner {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            has_start,
        }
    }

    /// The declared attribute columns (the `start` column excluded).
    pub fn attribute_columns(&self) -> &[String] {
        if self.has_start {
            &self.columns[1..]
        } else {
            &self.columns
        }
    }

    /// Parse a nodes file.
    pub fn read_nodes<R: BufRead>(&self, reader: R) -> FieldcastResult<Vec<NodeRow>> {
        let mut rows = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| FieldcastError::Io {
                path: "<nodes>".into(),
                source,
            })?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != self.columns.len() {
                return Err(FieldcastError::Config(format!(
                    "nodes line {}: expected {} fields, found {}",
                    lineno + 1,
                    self.columns.len(),
                    fields.len()
                )));
            }
            let mut values = Vec::with_capacity(fields.len());
            for (field, column) in fields.iter().zip(&self.columns) {
                let value: f64 = field.parse().map_err(|_| {
                    FieldcastError::Config(format!(
                        "nodes line {}: column {column} is not a number: {field:?}",
                        lineno + 1
                    ))
                })?;
                values.push(value);
            }
            let start = if self.has_start {
                Some(SimTime::new(values.remove(0)))
            } else {
                None
            };
            rows.push(NodeRow { start, values });
        }
        Ok(rows)
    }

    /// Parse a nodes file from a path.
    pub fn read_nodes_path(&self, path: &Path) -> FieldcastResult<Vec<NodeRow>> {
        let file = File::open(path).map_err(|source| FieldcastError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.read_nodes(BufReader::new(file))
    }
}

/// Parse an arcs file: one directed `from to` pair per line.
pub fn read_arcs<R: BufRead>(reader: R) -> FieldcastResult<Vec<(DeviceId, DeviceId)>> {
    let mut arcs = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| FieldcastError::Io {
            path: "<arcs>".into(),
            source,
        })?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 2 {
            return Err(FieldcastError::Config(format!(
                "arcs line {}: expected 2 fields, found {}",
                lineno + 1,
                fields.len()
            )));
        }
        let parse = |field: &str| -> FieldcastResult<DeviceId> {
            field.parse::<u32>().map(DeviceId::new).map_err(|_| {
                FieldcastError::Config(format!(
                    "arcs line {}: not a uid: {field:?}",
                    lineno + 1
                ))
            })
        };
        arcs.push((parse(fields[0])?, parse(fields[1])?));
    }
    Ok(arcs)
}

/// Parse an arcs file from a path.
pub fn read_arcs_path(path: &Path) -> FieldcastResult<Vec<(DeviceId, DeviceId)>> {
    let file = File::open(path).map_err(|source| FieldcastError::Io {
        path: path.display().to_string(),
        source,
    })?;
    read_arcs(BufReader::new(file))
}
