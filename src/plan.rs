//! Log plan compiler - from declarative route configs to compiled routes
//!
//! The plan is compiled once per process and shared read-only after that.
//! Route 0 is always the firehose: every request, full master schema. User
//! routes follow in declaration order, each with its own column subset,
//! filter predicate, schema fingerprint, and retention policy.

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::error::ConfigError;
use crate::filter::{compile_filter, FilterGroup, Predicate};
use crate::schema::{self, Column};

/// Declarative description of one destination table.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogRouteConfig {
    pub table_name: Option<String>,
    #[serde(default)]
    pub filter: Option<Vec<FilterGroup>>,
    /// Column subset; `None` means the full master schema.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub pruning_interval_days: Option<u32>,
}

/// A compiled route: where matching records go and what they carry.
#[derive(Clone)]
pub struct CompiledLogRoute {
    pub table_name: String,
    pub predicate: Predicate,
    /// Subset of the master schema, in master order.
    pub schema: Vec<Column>,
    /// 16-char fingerprint of the ordered schema.
    pub schema_hash: String,
    pub retention_days: Option<u32>,
    pub pruning_interval_days: Option<u32>,
}

impl fmt::Debug for CompiledLogRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledLogRoute")
            .field("table_name", &self.table_name)
            .field("columns", &self.schema.len())
            .field("schema_hash", &self.schema_hash)
            .field("retention_days", &self.retention_days)
            .field("pruning_interval_days", &self.pruning_interval_days)
            .finish()
    }
}

/// The immutable, ordered list of compiled routes.
#[derive(Debug, Clone)]
pub struct LogPlan {
    routes: Vec<CompiledLogRoute>,
}

impl LogPlan {
    pub fn routes(&self) -> &[CompiledLogRoute] {
        &self.routes
    }

    pub fn route(&self, table_name: &str) -> Option<&CompiledLogRoute> {
        self.routes.iter().find(|r| r.table_name == table_name)
    }

    /// The firehose is always route 0.
    pub fn firehose(&self) -> &CompiledLogRoute {
        &self.routes[0]
    }

    pub fn is_firehose(&self, table_name: &str) -> bool {
        self.routes[0].table_name == table_name
    }
}

/// Table names end up inside DDL, so they are restricted to plain SQL
/// identifiers up front rather than quoted into whatever the config says.
fn valid_table_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Compile the filter for one route, degrading to deny-all on failure so a
/// single bad filter cannot take the whole plan down. The flag reports the
/// degradation so the plan summary can surface it.
fn compile_route_filter(table_name: &str, filter: Option<&[FilterGroup]>) -> (Predicate, bool) {
    match compile_filter(filter) {
        Ok(predicate) => (predicate, false),
        Err(e) => {
            tracing::error!(
                table = %table_name,
                error = %e,
                "[FilterCompiler] FATAL: filter rejected, no requests will route to this table"
            );
            (Arc::new(|_| false), true)
        }
    }
}

fn compile_route(
    index: usize,
    route: &LogRouteConfig,
) -> Result<(CompiledLogRoute, bool), ConfigError> {
    let table_name = route
        .table_name
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or(ConfigError::MissingTableName { index })?;

    if !valid_table_ident(&table_name) {
        return Err(ConfigError::InvalidTableName { table: table_name });
    }

    let schema = match &route.columns {
        Some(columns) => {
            schema::subset(columns).map_err(|column| ConfigError::UnknownColumn {
                table: table_name.clone(),
                column,
            })?
        }
        None => schema::MASTER_SCHEMA.to_vec(),
    };

    let schema_hash = schema::schema_hash(&schema);
    let (predicate, degraded) = compile_route_filter(&table_name, route.filter.as_deref());

    Ok((
        CompiledLogRoute {
            table_name,
            predicate,
            schema,
            schema_hash,
            retention_days: route.retention_days,
            pruning_interval_days: route.pruning_interval_days,
        },
        degraded,
    ))
}

/// Compile the full plan: firehose first, then user routes in declaration
/// order. Any `ConfigError` fails the whole compilation; the worker must not
/// serve requests with a broken plan.
pub fn compile_plan(config: &Config) -> Result<LogPlan, ConfigError> {
    let firehose = LogRouteConfig {
        table_name: Some(config.firehose_table.clone()),
        filter: config.firehose_filters.clone(),
        columns: None,
        retention_days: config.retention_days,
        pruning_interval_days: config.pruning_interval_days,
    };

    let mut routes = Vec::with_capacity(1 + config.routes.len());
    let mut filtered = 0usize;
    let mut degraded = 0usize;
    for (index, route_config) in std::iter::once(&firehose)
        .chain(config.routes.iter())
        .enumerate()
    {
        if route_config.filter.as_ref().is_some_and(|f| !f.is_empty()) {
            filtered += 1;
        }
        let (route, was_degraded) = compile_route(index, route_config)?;
        if was_degraded {
            degraded += 1;
        }
        routes.push(route);
    }

    let plan = LogPlan { routes };
    let tables: Vec<&str> = plan.routes.iter().map(|r| r.table_name.as_str()).collect();
    let retention = plan
        .routes
        .iter()
        .filter(|r| r.retention_days.is_some() && r.pruning_interval_days.is_some())
        .count();
    tracing::info!(
        tables = ?tables,
        filtered,
        degraded,
        retention,
        "log plan compiled"
    );
    Ok(plan)
}
