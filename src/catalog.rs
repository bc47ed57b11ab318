//! Schema catalog for the queryable dashboard domains.
//!
//! Each [`Domain`] owns a set of [`TableDescriptor`]s and the refinement
//! parameters its query function accepts. The catalog is built once at
//! startup and is read-only afterwards. It is used to:
//!
//! - **Describe** one callable function per domain to the language model
//! - **Validate** model-produced query arguments (see [`crate::query`])

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde_json::{Value, json};
use thiserror::Error;

use crate::llm::FunctionSpec;
use crate::query::FilterOperator;

/// Column that holds the owning identity on every table.
pub const OWNER_COLUMN: &str = "user_id";

// ============================================================================
// Catalog Data Model
// ============================================================================

/// A business area grouping related tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    Budget,
    Workout,
    Nutrition,
    Habits,
    Todos,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Budget,
        Domain::Workout,
        Domain::Nutrition,
        Domain::Habits,
        Domain::Todos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Budget => "budget",
            Domain::Workout => "workout",
            Domain::Nutrition => "nutrition",
            Domain::Habits => "habits",
            Domain::Todos => "todos",
        }
    }

    /// Name of the function offered to the model for this domain.
    pub fn function_name(&self) -> &'static str {
        match self {
            Domain::Budget => "query_budget",
            Domain::Workout => "query_workout",
            Domain::Nutrition => "query_nutrition",
            Domain::Habits => "query_habits",
            Domain::Todos => "query_todos",
        }
    }

    pub fn from_function_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.function_name() == name)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A table name plus its ordered columns.
///
/// `common_fields` are the numeric columns a range refinement may target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: IndexSet<String>,
    pub common_fields: IndexSet<String>,
}

impl TableDescriptor {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            common_fields: IndexSet::new(),
        }
    }

    pub fn with_common_fields(mut self, fields: &[&str]) -> Self {
        self.common_fields = fields.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }
}

/// Completion state refinement for todo-like tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Pending,
    All,
}

impl CompletionStatus {
    pub const VALUES: [&'static str; 3] = ["completed", "pending", "all"];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "pending" => Some(Self::Pending),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// A domain-specific refinement parameter accepted by a query function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinementSpec {
    /// `{ <start_key>, <end_key> }` object bounding a date column.
    DateRange {
        param: &'static str,
        column: &'static str,
        start_key: &'static str,
        end_key: &'static str,
    },
    /// `{ field, min, max }` object bounding one of the table's common fields.
    NumericRange {
        param: &'static str,
        fields: &'static [&'static str],
    },
    /// `"completed" | "pending" | "all"` on a boolean column.
    Completion {
        param: &'static str,
        column: &'static str,
    },
}

impl RefinementSpec {
    pub fn param(&self) -> &'static str {
        match self {
            Self::DateRange { param, .. }
            | Self::NumericRange { param, .. }
            | Self::Completion { param, .. } => param,
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            Self::DateRange {
                start_key, end_key, ..
            } => {
                let mut properties = serde_json::Map::new();
                for key in [start_key, end_key] {
                    properties.insert(
                        key.to_string(),
                        json!({ "type": "string", "format": "date" }),
                    );
                }
                json!({ "type": "object", "properties": properties })
            }
            Self::NumericRange { fields, .. } => json!({
                "type": "object",
                "properties": {
                    "field": { "type": "string", "enum": fields },
                    "min": { "type": "number" },
                    "max": { "type": "number" },
                },
                "required": ["field"],
            }),
            Self::Completion { .. } => json!({
                "type": "string",
                "enum": CompletionStatus::VALUES,
            }),
        }
    }
}

/// A business domain with its tables and refinements.
#[derive(Debug, Clone)]
pub struct DomainSchema {
    pub domain: Domain,
    pub description: String,
    pub tables: IndexMap<String, TableDescriptor>,
    pub refinements: Vec<RefinementSpec>,
}

impl DomainSchema {
    pub fn new(domain: Domain, description: &str, tables: Vec<TableDescriptor>) -> Self {
        Self {
            domain,
            description: description.to_string(),
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            refinements: Vec::new(),
        }
    }

    pub fn with_refinement(mut self, refinement: RefinementSpec) -> Self {
        self.refinements.push(refinement);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn refinement(&self, param: &str) -> Option<&RefinementSpec> {
        self.refinements.iter().find(|r| r.param() == param)
    }

    /// Union of all column names across the domain's tables, in order.
    pub fn all_columns(&self) -> IndexSet<&str> {
        self.tables
            .values()
            .flat_map(|t| t.columns.iter().map(String::as_str))
            .collect()
    }

    /// The function offered to the model for this domain.
    pub fn function_spec(&self) -> FunctionSpec {
        let tables: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        let fields: Vec<&str> = self.all_columns().into_iter().collect();
        let operators: Vec<&str> = FilterOperator::ALL.iter().map(|o| o.as_str()).collect();

        let mut properties = serde_json::Map::new();
        properties.insert(
            "table".into(),
            json!({
                "type": "string",
                "enum": tables,
                "description": format!("The {} table to query", self.domain),
            }),
        );
        properties.insert(
            "select".into(),
            json!({
                "type": "string",
                "description": "Comma-separated columns to select, or * for all",
                "default": "*",
            }),
        );
        properties.insert(
            "filters".into(),
            json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "field": { "type": "string", "enum": fields },
                        "operator": { "type": "string", "enum": operators },
                        "value": {
                            "description": "Comparison value. For between, a two-element array [start, end]; for like, a pattern using % and _",
                            "type": ["string", "number", "boolean", "array"],
                        },
                    },
                    "required": ["field", "operator", "value"],
                },
            }),
        );
        for refinement in &self.refinements {
            properties.insert(refinement.param().into(), refinement.json_schema());
        }

        FunctionSpec {
            name: self.domain.function_name().to_string(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": ["table"],
            }),
        }
    }
}

// ============================================================================
// Schema Catalog
// ============================================================================

/// Errors detected while assembling a catalog.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("table '{0}' has no 'user_id' column")]
    MissingOwnerColumn(String),

    #[error("table '{table}' lists common field '{field}' that is not a column")]
    UnknownCommonField { table: String, field: String },

    #[error("domain '{0}' is defined twice")]
    DuplicateDomain(Domain),
}

/// Process-wide, read-only description of every queryable domain.
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    domains: IndexMap<Domain, DomainSchema>,
}

impl SchemaCatalog {
    /// Build a catalog, checking that every table is owner-scoped.
    pub fn new(domains: Vec<DomainSchema>) -> Result<Self, CatalogError> {
        let mut map = IndexMap::new();
        for schema in domains {
            for table in schema.tables.values() {
                if !table.has_column(OWNER_COLUMN) {
                    return Err(CatalogError::MissingOwnerColumn(table.name.clone()));
                }
                if let Some(field) = table.common_fields.iter().find(|f| !table.has_column(f)) {
                    return Err(CatalogError::UnknownCommonField {
                        table: table.name.clone(),
                        field: field.clone(),
                    });
                }
            }
            let domain = schema.domain;
            if map.insert(domain, schema).is_some() {
                return Err(CatalogError::DuplicateDomain(domain));
            }
        }
        Ok(Self { domains: map })
    }

    pub fn domain(&self, domain: Domain) -> Option<&DomainSchema> {
        self.domains.get(&domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainSchema> {
        self.domains.values()
    }

    /// One function per domain, in catalog order.
    pub fn function_specs(&self) -> Vec<FunctionSpec> {
        self.domains.values().map(DomainSchema::function_spec).collect()
    }

    /// The catalog of the personal dashboard. Its tables are fixed, so it is
    /// assembled without the checks `new` applies to caller-supplied schemas.
    pub fn dashboard() -> Self {
        Self {
            domains: dashboard_domains()
                .into_iter()
                .map(|schema| (schema.domain, schema))
                .collect(),
        }
    }
}

fn dashboard_domains() -> Vec<DomainSchema> {
    vec![budget(), workout(), nutrition(), habits(), todos()]
}

const NUTRITION_FIELDS: &[&str] = &["calories", "protein", "carbs", "fat"];
const HABIT_STATS_FIELDS: &[&str] = &["current_streak", "longest_streak", "total_completions"];

fn budget() -> DomainSchema {
    DomainSchema::new(
        Domain::Budget,
        "Query budget related data including transactions, categories, and savings goals",
        vec![
            TableDescriptor::new(
                "transactions",
                &[
                    "id",
                    "user_id",
                    "category_id",
                    "category",
                    "type",
                    "amount",
                    "description",
                    "date",
                    "created_at",
                    "updated_at",
                ],
            ),
            TableDescriptor::new(
                "budget_categories",
                &["id", "user_id", "name", "type", "budget_limit", "color", "created_at"],
            ),
            TableDescriptor::new(
                "savings_goals",
                &[
                    "id",
                    "user_id",
                    "name",
                    "target_amount",
                    "current_amount",
                    "target_date",
                    "created_at",
                    "updated_at",
                ],
            ),
        ],
    )
    .with_refinement(RefinementSpec::DateRange {
        param: "timeRange",
        column: "date",
        start_key: "start_date",
        end_key: "end_date",
    })
}

fn workout() -> DomainSchema {
    DomainSchema::new(
        Domain::Workout,
        "Query workout related data including logs, exercises, and templates",
        vec![
            TableDescriptor::new(
                "exercises",
                &["id", "user_id", "name", "category", "muscle_group", "equipment", "created_at"],
            ),
            TableDescriptor::new(
                "workout_logs",
                &[
                    "id",
                    "user_id",
                    "template_id",
                    "name",
                    "date",
                    "duration_minutes",
                    "notes",
                    "created_at",
                ],
            ),
            TableDescriptor::new(
                "workout_log_exercises",
                &[
                    "id",
                    "user_id",
                    "workout_log_id",
                    "exercise_id",
                    "sets",
                    "reps",
                    "weight",
                    "notes",
                ],
            ),
            TableDescriptor::new(
                "workout_templates",
                &["id", "user_id", "name", "description", "created_at"],
            ),
            TableDescriptor::new(
                "workout_template_exercises",
                &[
                    "id",
                    "user_id",
                    "template_id",
                    "exercise_id",
                    "sets",
                    "reps",
                    "order_index",
                ],
            ),
        ],
    )
}

fn nutrition() -> DomainSchema {
    DomainSchema::new(
        Domain::Nutrition,
        "Query nutrition related data including meals and food items",
        vec![
            TableDescriptor::new(
                "nutri_common_foods",
                &[
                    "id",
                    "user_id",
                    "name",
                    "calories",
                    "protein",
                    "carbs",
                    "fat",
                    "serving_size",
                    "created_at",
                ],
            )
            .with_common_fields(NUTRITION_FIELDS),
            TableDescriptor::new(
                "nutrition_food_items",
                &[
                    "id",
                    "user_id",
                    "meal_id",
                    "name",
                    "calories",
                    "protein",
                    "carbs",
                    "fat",
                    "serving_size",
                    "created_at",
                ],
            )
            .with_common_fields(NUTRITION_FIELDS),
            TableDescriptor::new(
                "nutrition_meals",
                &["id", "user_id", "meal_type", "date", "notes", "created_at"],
            ),
        ],
    )
    .with_refinement(RefinementSpec::NumericRange {
        param: "nutritionRange",
        fields: NUTRITION_FIELDS,
    })
}

fn habits() -> DomainSchema {
    DomainSchema::new(
        Domain::Habits,
        "Query habits and habit tracking records",
        vec![
            TableDescriptor::new(
                "habits",
                &[
                    "id",
                    "user_id",
                    "name",
                    "description",
                    "frequency",
                    "current_streak",
                    "longest_streak",
                    "total_completions",
                    "created_at",
                ],
            )
            .with_common_fields(HABIT_STATS_FIELDS),
            TableDescriptor::new(
                "habit_records",
                &["id", "user_id", "habit_id", "date", "completed", "notes", "created_at"],
            ),
        ],
    )
    .with_refinement(RefinementSpec::NumericRange {
        param: "statsFilter",
        fields: HABIT_STATS_FIELDS,
    })
}

fn todos() -> DomainSchema {
    DomainSchema::new(
        Domain::Todos,
        "Query todo items and their status",
        vec![TableDescriptor::new(
            "todos",
            &[
                "id",
                "user_id",
                "title",
                "completed",
                "priority",
                "due_date",
                "created_at",
                "updated_at",
            ],
        )],
    )
    .with_refinement(RefinementSpec::Completion {
        param: "completionStatus",
        column: "completed",
    })
    .with_refinement(RefinementSpec::DateRange {
        param: "dueDateRange",
        column: "due_date",
        start_key: "start",
        end_key: "end",
    })
}

// ============================================================================
// Tests
// ============================================================================
