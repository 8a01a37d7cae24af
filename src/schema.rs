use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use schemars::gen::SchemaSettings;
use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;

/// Name under which the combined structured output is registered with the
/// remote agent.
pub const SCHEMA_NAME: &str = "financial_reports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    IncomeStatement,
    CashFlow,
    ExpenseBreakdown,
}

impl ReportKind {
    pub const ALL: [ReportKind; 3] = [
        ReportKind::IncomeStatement,
        ReportKind::CashFlow,
        ReportKind::ExpenseBreakdown,
    ];

    /// Top-level key of this report inside the structured output.
    pub fn key(&self) -> &'static str {
        match self {
            ReportKind::IncomeStatement => "income_statement",
            ReportKind::CashFlow => "cash_flow",
            ReportKind::ExpenseBreakdown => "expense_breakdown",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ReportKind::IncomeStatement => "Income Statement",
            ReportKind::CashFlow => "Cash Flow",
            ReportKind::ExpenseBreakdown => "Expense Breakdown",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Margins {
    #[schemars(description = "Gross profit divided by revenue")]
    pub gross: f64,

    #[schemars(description = "Operating income divided by revenue")]
    pub operating: f64,

    #[schemars(description = "Net income divided by revenue")]
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IncomePeriod {
    #[schemars(description = "Period label as it appears in the source, e.g. '2024-03' or 'FY2023'")]
    pub label: String,

    pub revenue: f64,

    #[schemars(description = "Cost of goods sold for the period")]
    pub cogs: f64,

    pub gross_profit: f64,

    pub operating_expenses: f64,

    pub operating_income: f64,

    #[schemars(description = "Net of other income and other expenses (interest, FX, one-offs)")]
    pub other_net: f64,

    #[schemars(description = "Income tax expense for the period as a positive number")]
    pub taxes: f64,

    pub net_income: f64,

    pub margins: Margins,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IncomeStatement {
    #[schemars(description = "One entry per reporting period in chronological order")]
    #[schemars(length(min = 1))]
    pub periods: Vec<IncomePeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CashFlow {
    #[schemars(description = "Net cash from operating activities")]
    pub operating: f64,

    #[schemars(description = "Net cash from investing activities")]
    pub investing: f64,

    #[schemars(description = "Net cash from financing activities")]
    pub financing: f64,

    #[schemars(description = "Net change in cash across the covered period")]
    pub net_change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LabeledTotal {
    pub label: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExpenseBreakdown {
    #[schemars(description = "Total spend per expense category; labels must be unique")]
    pub by_category: Vec<LabeledTotal>,

    #[schemars(description = "Total spend per vendor or payee; labels must be unique")]
    pub by_vendor: Vec<LabeledTotal>,

    #[schemars(description = "Total spend per calendar month (YYYY-MM); labels must be unique")]
    pub by_month: Vec<LabeledTotal>,
}

impl ExpenseBreakdown {
    pub fn collections(&self) -> [(&'static str, &[LabeledTotal]); 3] {
        [
            ("by_category", &self.by_category),
            ("by_vendor", &self.by_vendor),
            ("by_month", &self.by_month),
        ]
    }
}

/// One decoded, schema-conformant report section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "report", rename_all = "snake_case")]
pub enum Report {
    IncomeStatement(IncomeStatement),
    CashFlow(CashFlow),
    ExpenseBreakdown(ExpenseBreakdown),
}

impl Report {
    pub fn kind(&self) -> ReportKind {
        match self {
            Report::IncomeStatement(_) => ReportKind::IncomeStatement,
            Report::CashFlow(_) => ReportKind::CashFlow,
            Report::ExpenseBreakdown(_) => ReportKind::ExpenseBreakdown,
        }
    }

    pub(crate) fn decode(kind: ReportKind, value: Value) -> std::result::Result<Self, serde_json::Error> {
        Ok(match kind {
            ReportKind::IncomeStatement => Report::IncomeStatement(serde_json::from_value(value)?),
            ReportKind::CashFlow => Report::CashFlow(serde_json::from_value(value)?),
            ReportKind::ExpenseBreakdown => Report::ExpenseBreakdown(serde_json::from_value(value)?),
        })
    }
}

/// Holds the structured-output schema of every report kind. Prompt
/// construction and response validation read from the same registry.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<ReportKind, RootSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        let schemas = ReportKind::ALL
            .into_iter()
            .map(|kind| {
                let schema = match kind {
                    ReportKind::IncomeStatement => generate::<IncomeStatement>(),
                    ReportKind::CashFlow => generate::<CashFlow>(),
                    ReportKind::ExpenseBreakdown => generate::<ExpenseBreakdown>(),
                };
                (kind, schema)
            })
            .collect();

        Self { schemas }
    }

    pub fn schema_name(&self) -> &'static str {
        SCHEMA_NAME
    }

    pub fn schema(&self, kind: ReportKind) -> &RootSchema {
        // Every kind is generated in `new`.
        &self.schemas[&kind]
    }

    pub fn schema_json(&self, kind: ReportKind) -> Result<Value> {
        Ok(serde_json::to_value(&self.schema(kind).schema)?)
    }

    /// Builds the combined `response_format` payload for the requested
    /// report kinds. Every requested kind is required; nothing else is
    /// permitted at the top level.
    pub fn response_format(&self, kinds: &BTreeSet<ReportKind>) -> Result<Value> {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for kind in kinds {
            let mut schema = self.schema_json(*kind)?;
            strip_keyword(&mut schema, "format");
            properties.insert(kind.key().to_string(), schema);
            required.push(Value::String(kind.key().to_string()));
        }

        Ok(json!({
            "type": "json_schema",
            "json_schema": {
                "name": SCHEMA_NAME,
                "strict": true,
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "required": required,
                    "properties": properties,
                },
            },
        }))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Strict structured-output mode rejects annotation keywords such as `format`.
fn strip_keyword(value: &mut Value, keyword: &str) {
    match value {
        Value::Object(map) => {
            map.remove(keyword);
            for child in map.values_mut() {
                strip_keyword(child, keyword);
            }
        }
        Value::Array(items) => {
            for child in items {
                strip_keyword(child, keyword);
            }
        }
        _ => {}
    }
}

fn generate<T: JsonSchema>() -> RootSchema {
    SchemaSettings::draft07()
        .with(|settings| {
            settings.inline_subschemas = true;
        })
        .into_generator()
        .into_root_schema_for::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_generation() {
        let registry = SchemaRegistry::new();
        let income = serde_json::to_string_pretty(&registry.schema_json(ReportKind::IncomeStatement).unwrap()).unwrap();
        assert!(income.contains("periods"));
        assert!(income.contains("net_income"));
        assert!(income.contains("margins"));

        let cash = registry.schema_json(ReportKind::CashFlow).unwrap();
        let required = cash["required"].as_array().unwrap();
        assert_eq!(required.len(), 4);
        assert_eq!(cash["additionalProperties"], Value::Bool(false));
    }

    #[test]
    fn test_periods_require_at_least_one_entry() {
        let registry = SchemaRegistry::new();
        let income = registry.schema_json(ReportKind::IncomeStatement).unwrap();
        assert_eq!(income["properties"]["periods"]["minItems"], json!(1));
    }

    #[test]
    fn test_response_format_only_covers_requested_kinds() {
        let registry = SchemaRegistry::new();
        let kinds: BTreeSet<_> = [ReportKind::CashFlow].into_iter().collect();
        let format = registry.response_format(&kinds).unwrap();

        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["name"], SCHEMA_NAME);
        assert_eq!(format["json_schema"]["strict"], true);

        let schema = &format["json_schema"]["schema"];
        assert_eq!(schema["required"], json!(["cash_flow"]));
        assert!(schema["properties"].get("income_statement").is_none());
        assert!(schema["properties"]["cash_flow"]["properties"]["operating"]
            .get("format")
            .is_none());
    }

    #[test]
    fn test_report_kind_keys_round_trip() {
        for kind in ReportKind::ALL {
            assert_eq!(ReportKind::from_key(kind.key()), Some(kind));
        }
        assert_eq!(ReportKind::from_key("balance_sheet"), None);
    }
}
