//! Static invalidation rules.
//!
//! The rules are plain data: which columns of a table are watched, which of
//! them are high-impact (a change forces a full clear), which feed the
//! aggregate lookup endpoints, and which cached keys each column affects.
//! Keeping them in one table makes the mapping reviewable and testable
//! without a running change feed.

use std::collections::{HashMap, HashSet};

use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;

/// Pseudo-table owning the cross-entity aggregate endpoints.
pub const LOOKUPS_TABLE: &str = "lookups";

/// Tables cleared by [`crate::ResponseCache::clear_employment_status_cache`].
pub const EMPLOYMENT_STATUS_TABLES: &[&str] = &["students", LOOKUPS_TABLE];

/// Tables cleared by [`crate::ResponseCache::clear_visibility_cache`].
pub const VISIBILITY_TABLES: &[&str] = &["companies"];

/// A selector over cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Endpoint keys whose endpoint id equals this id or starts with it
    /// followed by a `.` (so `students` covers `students.list`).
    Endpoint(String),
    /// Entity field keys of this entity type.
    Entity(String),
}

impl KeyPattern {
    pub fn endpoint(id: impl Into<String>) -> Self {
        Self::Endpoint(id.into())
    }

    pub fn entity(kind: impl Into<String>) -> Self {
        Self::Entity(kind.into())
    }

    pub fn matches(&self, key: &CacheKey<'_>) -> bool {
        match (self, key) {
            (Self::Endpoint(prefix), CacheKey::Api { endpoint, .. }) => endpoint
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.')),
            (Self::Entity(kind), CacheKey::Entity { entity_type, .. }) => kind == entity_type,
            _ => false,
        }
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Endpoint(id) => write!(f, "endpoint:{id}"),
            Self::Entity(kind) => write!(f, "entity:{kind}"),
        }
    }
}

/// Keys affected in one table when a column changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTarget {
    pub table: String,
    pub patterns: Vec<KeyPattern>,
}

/// Rules for one watched table.
#[derive(Debug, Clone, Default)]
pub struct TableRules {
    pub watched: Vec<String>,
    pub high_impact: HashSet<String>,
    pub aggregate: HashSet<String>,
    /// Column name to the keys its change affects.
    pub column_targets: HashMap<String, Vec<ColumnTarget>>,
    /// Tables whose entries can embed rows of this table and are cleared
    /// comprehensively together with it.
    pub dependents: Vec<String>,
}

impl TableRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(mut self, columns: &[&str]) -> Self {
        self.watched.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn high_impact(mut self, columns: &[&str]) -> Self {
        self.high_impact.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn aggregate(mut self, columns: &[&str]) -> Self {
        self.aggregate.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    /// Maps each of `columns` to `patterns` within `table`.
    pub fn target(mut self, columns: &[&str], table: &str, patterns: &[KeyPattern]) -> Self {
        for column in columns {
            self.column_targets
                .entry(column.to_string())
                .or_default()
                .push(ColumnTarget {
                    table: table.to_string(),
                    patterns: patterns.to_vec(),
                });
        }
        self
    }

    pub fn dependents(mut self, tables: &[&str]) -> Self {
        self.dependents.extend(tables.iter().map(|t| t.to_string()));
        self
    }

    pub fn is_high_impact(&self, column: &str) -> bool {
        self.high_impact.contains(column)
    }

    pub fn feeds_aggregates(&self, column: &str) -> bool {
        self.aggregate.contains(column)
    }

    pub fn targets(&self, column: &str) -> Option<&[ColumnTarget]> {
        self.column_targets.get(column).map(Vec::as_slice)
    }
}

/// The full rule set: per-table column rules plus key ownership per table.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRules {
    tables: HashMap<String, TableRules>,
    ownership: HashMap<String, Vec<KeyPattern>>,
}

impl InvalidationRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the keys a table owns, i.e. everything its comprehensive
    /// clear removes.
    pub fn own(mut self, table: &str, patterns: &[KeyPattern]) -> Self {
        self.ownership
            .entry(table.to_string())
            .or_default()
            .extend(patterns.iter().cloned());
        self
    }

    pub fn table(mut self, table: &str, rules: TableRules) -> Self {
        self.tables.insert(table.to_string(), rules);
        self
    }

    pub fn table_rules(&self, table: &str) -> Option<&TableRules> {
        self.tables.get(table)
    }

    /// Key patterns owned by `table`, or `None` for an unknown table.
    pub fn owned_patterns(&self, table: &str) -> Option<&[KeyPattern]> {
        self.ownership.get(table).map(Vec::as_slice)
    }

    /// Entity types owned by `table`.
    pub fn entity_kinds<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.ownership
            .get(table)
            .into_iter()
            .flatten()
            .filter_map(|pattern| match pattern {
                KeyPattern::Entity(kind) => Some(kind.as_str()),
                KeyPattern::Endpoint(_) => None,
            })
    }

    /// Watched tables, i.e. tables with column rules.
    pub fn watched_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        tables.sort_unstable();
        tables
    }

    /// Checks internal consistency: high-impact, aggregate and mapped
    /// columns must be watched, and every referenced table must declare
    /// ownership.
    pub fn validate(&self) -> CacheResult<()> {
        for (table, rules) in &self.tables {
            if !self.ownership.contains_key(table) {
                return Err(CacheError::rules(format!(
                    "table '{table}' has column rules but owns no keys"
                )));
            }
            let watched: HashSet<&str> = rules.watched.iter().map(String::as_str).collect();
            let listed = rules
                .high_impact
                .iter()
                .chain(rules.aggregate.iter())
                .chain(rules.column_targets.keys());
            for column in listed {
                if !watched.contains(column.as_str()) {
                    return Err(CacheError::rules(format!(
                        "column '{table}.{column}' has rules but is not watched"
                    )));
                }
            }
            let referenced = rules
                .column_targets
                .values()
                .flatten()
                .map(|target| &target.table)
                .chain(rules.dependents.iter());
            for other in referenced {
                if !self.ownership.contains_key(other) {
                    return Err(CacheError::rules(format!(
                        "table '{table}' references '{other}' which owns no keys"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rules of the student/company matching backend.
    pub fn hirebridge() -> Self {
        let student_lists = [
            KeyPattern::endpoint("students.list"),
            KeyPattern::endpoint("students.search"),
            KeyPattern::endpoint("students.featured"),
        ];
        let student_profile = [
            KeyPattern::endpoint("students.profile"),
            KeyPattern::entity("student"),
        ];
        let company_lists = [
            KeyPattern::endpoint("companies.list"),
            KeyPattern::endpoint("companies.search"),
        ];
        let company_profile = [
            KeyPattern::endpoint("companies.profile"),
            KeyPattern::entity("company"),
        ];

        let students = TableRules::new()
            .watch(&[
                "first_name",
                "last_name",
                "university",
                "major",
                "graduation_year",
                "skills",
                "city",
                "bio",
                "avatar_url",
                "is_employed",
                "is_public",
            ])
            .high_impact(&["is_employed", "is_public"])
            .aggregate(&["university", "major", "skills", "city", "graduation_year"])
            .target(
                &[
                    "first_name",
                    "last_name",
                    "university",
                    "major",
                    "graduation_year",
                    "skills",
                    "city",
                    "avatar_url",
                ],
                "students",
                &student_lists,
            )
            .target(
                &[
                    "first_name",
                    "last_name",
                    "university",
                    "major",
                    "graduation_year",
                    "skills",
                    "city",
                    "bio",
                    "avatar_url",
                ],
                "students",
                &student_profile,
            )
            .dependents(&[LOOKUPS_TABLE]);

        let companies = TableRules::new()
            .watch(&[
                "name",
                "industry",
                "city",
                "description",
                "logo_url",
                "website",
                "size",
                "is_public",
            ])
            .high_impact(&["is_public"])
            .aggregate(&["industry", "city"])
            .target(
                &["name", "industry", "city", "logo_url", "size"],
                "companies",
                &company_lists,
            )
            .target(
                &[
                    "name",
                    "industry",
                    "city",
                    "description",
                    "logo_url",
                    "website",
                    "size",
                ],
                "companies",
                &company_profile,
            )
            .dependents(&[LOOKUPS_TABLE]);

        Self::new()
            .own("students", &student_lists)
            .own("students", &student_profile)
            .own("companies", &company_lists)
            .own("companies", &company_profile)
            .own(
                LOOKUPS_TABLE,
                &[
                    KeyPattern::endpoint("lookups.universities"),
                    KeyPattern::endpoint("lookups.majors"),
                    KeyPattern::endpoint("lookups.skills"),
                    KeyPattern::endpoint("lookups.cities"),
                    KeyPattern::endpoint("lookups.industries"),
                    KeyPattern::endpoint("stats.overview"),
                ],
            )
            .table("students", students)
            .table("companies", companies)
    }
}
