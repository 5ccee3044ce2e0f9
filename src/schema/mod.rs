//! Schema registry: table and column definitions with alias lists.
//!
//! The registry is read-only preloaded state shared by the slot extractor
//! (alias matching) and the query generator (prompt building, cache
//! fingerprint). Definitions are data: they can be loaded from TOML, and a
//! default registry for the municipal-traffic deployment ships in-crate.

use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use anyhow::{Context, Result};
use fxhash::FxHasher64;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Broad column type, used to decide which condition extractors may target
/// a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Timestamp,
}

impl ColumnKind {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Real)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    /// Natural-language aliases that resolve to this column.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Marks the column that location expressions ("in district X") target.
    #[serde(default)]
    pub location: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub columns: Vec<ColumnDef>,
    /// Rendered sample rows included in generation prompts.
    #[serde(default)]
    pub sample_rows: Vec<String>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// First column flagged as the location target.
    pub fn location_column(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.location)
    }

    /// First timestamp column, if any.
    pub fn temporal_column(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.kind == ColumnKind::Timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRegistry {
    tables: Vec<TableDef>,
    /// Fallback table when no alias matches the question.
    primary_table: String,
}

impl SchemaRegistry {
    pub fn new(tables: Vec<TableDef>, primary_table: impl Into<String>) -> Self {
        Self {
            tables,
            primary_table: primary_table.into(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parse schema registry TOML")
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn primary_table(&self) -> &TableDef {
        self.table(&self.primary_table)
            .or_else(|| self.tables.first())
            .expect("registry has at least one table")
    }

    /// Stable fingerprint over names and kinds; part of every generator
    /// cache key so schema changes invalidate cached queries.
    pub fn fingerprint(&self) -> String {
        let mut hasher = FxHasher64::default();
        for table in &self.tables {
            table.name.hash(&mut hasher);
            for col in &table.columns {
                col.name.hash(&mut hasher);
                (col.kind as u8).hash(&mut hasher);
            }
        }
        self.primary_table.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Plain-text description of the schema for generation prompts.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let cols = table
                .columns
                .iter()
                .map(|c| format!("{} {:?}", c.name, c.kind))
                .join(", ");
            let _ = writeln!(out, "TABLE {} ({cols})", table.name);
            for row in &table.sample_rows {
                let _ = writeln!(out, "  sample: {row}");
            }
        }
        out
    }

    /// Registry for the reference deployment: municipal traffic records.
    pub fn default_traffic() -> Self {
        let intersections = TableDef {
            name: "intersections".into(),
            aliases: vec![
                "intersection".into(),
                "intersections".into(),
                "junction".into(),
                "junctions".into(),
                "crossing".into(),
                "crossings".into(),
                "signal site".into(),
            ],
            columns: vec![
                ColumnDef {
                    name: "name".into(),
                    kind: ColumnKind::Text,
                    aliases: vec!["name".into(), "called".into()],
                    location: false,
                },
                ColumnDef {
                    name: "district".into(),
                    kind: ColumnKind::Text,
                    aliases: vec![
                        "district".into(),
                        "zone".into(),
                        "ward".into(),
                        "area".into(),
                        "region".into(),
                    ],
                    location: true,
                },
                ColumnDef {
                    name: "signal_type".into(),
                    kind: ColumnKind::Text,
                    aliases: vec![
                        "signal type".into(),
                        "signal".into(),
                        "traffic light".into(),
                        "light type".into(),
                    ],
                    location: false,
                },
                ColumnDef {
                    name: "approach_count".into(),
                    kind: ColumnKind::Integer,
                    aliases: vec![
                        "approach count".into(),
                        "approaches".into(),
                        "legs".into(),
                        "lanes".into(),
                    ],
                    location: false,
                },
                ColumnDef {
                    name: "daily_volume".into(),
                    kind: ColumnKind::Integer,
                    aliases: vec![
                        "daily volume".into(),
                        "volume".into(),
                        "traffic volume".into(),
                        "vehicles per day".into(),
                    ],
                    location: false,
                },
                ColumnDef {
                    name: "installed_at".into(),
                    kind: ColumnKind::Timestamp,
                    aliases: vec![
                        "installed".into(),
                        "installation date".into(),
                        "commissioned".into(),
                        "built".into(),
                    ],
                    location: false,
                },
                ColumnDef {
                    name: "status".into(),
                    kind: ColumnKind::Text,
                    aliases: vec!["status".into(), "state".into(), "condition".into()],
                    location: false,
                },
            ],
            sample_rows: vec![
                "name='5th & Main', district='Riverside', signal_type='protected-left', approach_count=4, daily_volume=18400, installed_at='2014-06-02 00:00:00', status='active'".into(),
                "name='Oak & Hill', district='Northgate', signal_type='flashing', approach_count=3, daily_volume=4200, installed_at='2009-11-20 00:00:00', status='maintenance'".into(),
            ],
        };

        let maintenance = TableDef {
            name: "maintenance_logs".into(),
            aliases: vec![
                "maintenance".into(),
                "maintenance log".into(),
                "maintenance logs".into(),
                "repair".into(),
                "repairs".into(),
                "work order".into(),
                "work orders".into(),
            ],
            columns: vec![
                ColumnDef {
                    name: "intersection_name".into(),
                    kind: ColumnKind::Text,
                    aliases: vec!["intersection name".into()],
                    location: false,
                },
                ColumnDef {
                    name: "district".into(),
                    kind: ColumnKind::Text,
                    aliases: vec!["district".into(), "zone".into(), "ward".into()],
                    location: true,
                },
                ColumnDef {
                    name: "crew".into(),
                    kind: ColumnKind::Text,
                    aliases: vec!["crew".into(), "team".into(), "contractor".into()],
                    location: false,
                },
                ColumnDef {
                    name: "cost".into(),
                    kind: ColumnKind::Real,
                    aliases: vec![
                        "cost".into(),
                        "price".into(),
                        "spend".into(),
                        "expense".into(),
                    ],
                    location: false,
                },
                ColumnDef {
                    name: "performed_at".into(),
                    kind: ColumnKind::Timestamp,
                    aliases: vec![
                        "performed".into(),
                        "repaired".into(),
                        "serviced".into(),
                        "date of work".into(),
                    ],
                    location: false,
                },
            ],
            sample_rows: vec![
                "intersection_name='5th & Main', district='Riverside', crew='Signal Crew B', cost=1420.50, performed_at='2023-03-14 09:30:00'".into(),
            ],
        };

        Self::new(vec![intersections, maintenance], "intersections")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_schema_sensitive() {
        let a = SchemaRegistry::default_traffic();
        let b = SchemaRegistry::default_traffic();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut tables = a.tables().to_vec();
        tables[0].columns.pop();
        let c = SchemaRegistry::new(tables, "intersections");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn primary_table_falls_back_to_first() {
        let reg = SchemaRegistry::new(
            vec![TableDef {
                name: "only".into(),
                aliases: vec![],
                columns: vec![],
                sample_rows: vec![],
            }],
            "missing",
        );
        assert_eq!(reg.primary_table().name, "only");
    }

    #[test]
    fn toml_round_trip() {
        let reg = SchemaRegistry::default_traffic();
        let raw = toml::to_string(&reg).unwrap();
        let parsed = SchemaRegistry::from_toml_str(&raw).unwrap();
        assert_eq!(parsed.fingerprint(), reg.fingerprint());
    }

    #[test]
    fn helper_columns_resolve() {
        let reg = SchemaRegistry::default_traffic();
        let table = reg.primary_table();
        assert_eq!(table.location_column().unwrap().name, "district");
        assert_eq!(table.temporal_column().unwrap().name, "installed_at");
    }
}
