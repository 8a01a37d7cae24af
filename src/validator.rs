//! Independent re-validation of structured agent output.
//!
//! The remote service claims strict schema adherence; nothing here relies on
//! that claim. Raw text is parsed strictly, walked against the registry's
//! schemas and only then decoded into report types. Numbers must already be
//! JSON numbers: a numeral inside a string is reported, never parsed.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use log::debug;
use schemars::schema::{InstanceType, Schema, SchemaObject, SingleOrVec};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::schema::{CashFlow, ExpenseBreakdown, IncomeStatement, Report, ReportKind, SchemaRegistry};

type Definitions = schemars::Map<String, Schema>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON pointer into the raw result; empty for the document root.
    pub path: String,
    pub expected: String,
    pub found: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{}: expected {}, found {}", path, self.expected, self.found)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationFailure {
    pub(crate) fn single(path: impl Into<String>, expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self {
            issues: vec![issue(path, expected, found)],
        }
    }

    /// True when any issue sits at `path` or below it.
    pub fn touches(&self, path: &str) -> bool {
        self.issues.iter().any(|issue| issue.path.starts_with(path))
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} issue(s)", self.issues.len())?;
        for (idx, issue) in self.issues.iter().enumerate() {
            let sep = if idx == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationFailure {}

/// Advisory finding attached to an otherwise valid report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedReport {
    /// One entry per requested kind, in `ReportKind` order.
    pub reports: Vec<Report>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidatedReport {
    pub fn get(&self, kind: ReportKind) -> Option<&Report> {
        self.reports.iter().find(|report| report.kind() == kind)
    }

    pub fn kinds(&self) -> BTreeSet<ReportKind> {
        self.reports.iter().map(Report::kind).collect()
    }

    pub fn income_statement(&self) -> Option<&IncomeStatement> {
        match self.get(ReportKind::IncomeStatement) {
            Some(Report::IncomeStatement(statement)) => Some(statement),
            _ => None,
        }
    }

    pub fn cash_flow(&self) -> Option<&CashFlow> {
        match self.get(ReportKind::CashFlow) {
            Some(Report::CashFlow(cash_flow)) => Some(cash_flow),
            _ => None,
        }
    }

    pub fn expense_breakdown(&self) -> Option<&ExpenseBreakdown> {
        match self.get(ReportKind::ExpenseBreakdown) {
            Some(Report::ExpenseBreakdown(breakdown)) => Some(breakdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputValidator {
    registry: SchemaRegistry,
}

impl OutputValidator {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Validates a raw agent result against the requested report kinds.
    /// Deterministic and side-effect free, so it can be re-run against a
    /// cached result at any time.
    pub fn validate(
        &self,
        raw: &str,
        expected: &BTreeSet<ReportKind>,
    ) -> Result<ValidatedReport, ValidationFailure> {
        if expected.is_empty() {
            return Err(ValidationFailure::single(
                "",
                "at least one requested report kind",
                "none",
            ));
        }

        let root = parse_strict(raw)?;
        let sections = match &root {
            Value::Object(sections) => sections,
            other => return Err(ValidationFailure::single("", "object", describe(other))),
        };

        let mut issues = Vec::new();
        for kind in expected {
            let path = pointer("", kind.key());
            match sections.get(kind.key()) {
                Some(value) => {
                    let root_schema = self.registry.schema(*kind);
                    check_object(
                        &root_schema.definitions,
                        &root_schema.schema,
                        value,
                        &path,
                        &mut issues,
                    );
                }
                None => issues.push(issue(path, format!("{} report", kind), "missing key")),
            }
        }
        for key in sections.keys() {
            if ReportKind::from_key(key).is_none() {
                issues.push(issue(pointer("", key), "no additional properties", "unexpected key"));
            }
        }
        if !issues.is_empty() {
            return Err(ValidationFailure { issues });
        }

        let mut reports = Vec::with_capacity(expected.len());
        for kind in expected {
            let value = sections.get(kind.key()).cloned().unwrap_or(Value::Null);
            match Report::decode(*kind, value) {
                Ok(report) => reports.push(report),
                Err(e) => issues.push(issue(
                    pointer("", kind.key()),
                    format!("decodable {} report", kind),
                    e.to_string(),
                )),
            }
        }
        for report in &reports {
            if let Report::ExpenseBreakdown(breakdown) = report {
                check_unique_labels(breakdown, &mut issues);
            }
        }
        if !issues.is_empty() {
            return Err(ValidationFailure { issues });
        }

        let warnings = cross_field_warnings(&reports);
        for warning in &warnings {
            debug!("Advisory check at {}: {}", warning.path, warning.message);
        }

        Ok(ValidatedReport { reports, warnings })
    }
}

fn issue(path: impl Into<String>, expected: impl Into<String>, found: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        path: path.into(),
        expected: expected.into(),
        found: found.into(),
    }
}

fn pointer(parent: &str, token: &str) -> String {
    format!("{}/{}", parent, token.replace('~', "~0").replace('/', "~1"))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => {
            let shown: String = s.chars().take(40).collect();
            format!("string {:?}", shown)
        }
        Value::Array(items) => format!("array of {} item(s)", items.len()),
        Value::Object(_) => "object".to_string(),
    }
}

fn check_schema(defs: &Definitions, schema: &Schema, value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    match schema {
        Schema::Bool(true) => {}
        Schema::Bool(false) => issues.push(issue(path, "no value", describe(value))),
        Schema::Object(object) => check_object(defs, object, value, path, issues),
    }
}

fn check_object(
    defs: &Definitions,
    schema: &SchemaObject,
    value: &Value,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    // Draft-07: siblings of `$ref` are ignored.
    if let Some(reference) = &schema.reference {
        let name = reference.trim_start_matches("#/definitions/");
        match defs.get(name) {
            Some(target) => check_schema(defs, target, value, path, issues),
            None => issues.push(issue(path, format!("schema {}", reference), "unresolvable reference")),
        }
        return;
    }

    if let Some(all_of) = schema.subschemas.as_ref().and_then(|s| s.all_of.as_ref()) {
        for subschema in all_of {
            check_schema(defs, subschema, value, path, issues);
        }
    }

    if let Some(types) = &schema.instance_type {
        if !matches_type(types, value) {
            issues.push(issue(path, describe_types(types), describe(value)));
            return;
        }
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(value) {
            issues.push(issue(path, format!("one of {:?}", allowed), describe(value)));
        }
    }

    if let (Some(validation), Value::Object(map)) = (&schema.object, value) {
        for key in &validation.required {
            if !map.contains_key(key) {
                issues.push(issue(pointer(path, key), "required key", "missing key"));
            }
        }
        for (key, child) in map {
            let child_path = pointer(path, key);
            match validation.properties.get(key) {
                Some(child_schema) => check_schema(defs, child_schema, child, &child_path, issues),
                None => match validation.additional_properties.as_deref() {
                    Some(Schema::Bool(false)) => {
                        issues.push(issue(child_path, "no additional properties", "unexpected key"))
                    }
                    Some(extra) => check_schema(defs, extra, child, &child_path, issues),
                    None => {}
                },
            }
        }
    }

    if let (Some(validation), Value::Array(items)) = (&schema.array, value) {
        let len = items.len() as u32;
        if let Some(min) = validation.min_items {
            if len < min {
                issues.push(issue(path, format!("at least {} item(s)", min), format!("{} item(s)", len)));
            }
        }
        if let Some(max) = validation.max_items {
            if len > max {
                issues.push(issue(path, format!("at most {} item(s)", max), format!("{} item(s)", len)));
            }
        }
        match &validation.items {
            Some(SingleOrVec::Single(item_schema)) => {
                for (idx, item) in items.iter().enumerate() {
                    check_schema(defs, item_schema, item, &pointer(path, &idx.to_string()), issues);
                }
            }
            Some(SingleOrVec::Vec(item_schemas)) => {
                for (idx, (item_schema, item)) in item_schemas.iter().zip(items).enumerate() {
                    check_schema(defs, item_schema, item, &pointer(path, &idx.to_string()), issues);
                }
            }
            None => {}
        }
    }
}

fn matches_type(types: &SingleOrVec<InstanceType>, value: &Value) -> bool {
    let matches = |ty: &InstanceType| match ty {
        InstanceType::Null => value.is_null(),
        InstanceType::Boolean => value.is_boolean(),
        InstanceType::Object => value.is_object(),
        InstanceType::Array => value.is_array(),
        InstanceType::Number => value.is_number(),
        InstanceType::String => value.is_string(),
        InstanceType::Integer => value.is_i64() || value.is_u64(),
    };
    match types {
        SingleOrVec::Single(ty) => matches(ty),
        SingleOrVec::Vec(tys) => tys.iter().any(matches),
    }
}

fn describe_types(types: &SingleOrVec<InstanceType>) -> String {
    let name = |ty: &InstanceType| {
        match ty {
            InstanceType::Null => "null",
            InstanceType::Boolean => "boolean",
            InstanceType::Object => "object",
            InstanceType::Array => "array",
            InstanceType::Number => "number",
            InstanceType::String => "string",
            InstanceType::Integer => "integer",
        }
        .to_string()
    };
    match types {
        SingleOrVec::Single(ty) => name(ty),
        SingleOrVec::Vec(tys) => tys.iter().map(name).collect::<Vec<_>>().join(" or "),
    }
}

fn check_unique_labels(breakdown: &ExpenseBreakdown, issues: &mut Vec<ValidationIssue>) {
    let base = pointer("", ReportKind::ExpenseBreakdown.key());
    for (field, entries) in breakdown.collections() {
        let collection = pointer(&base, field);
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            if let Some(first) = seen.insert(entry.label.as_str(), idx) {
                issues.push(issue(
                    pointer(&pointer(&collection, &idx.to_string()), "label"),
                    "unique label",
                    format!("duplicate of {:?} at index {}", entry.label, first),
                ));
                // keep pointing at the first occurrence
                seen.insert(entry.label.as_str(), first);
            }
        }
    }
}

fn tolerance(expected: f64) -> f64 {
    (expected.abs() * 0.005).max(1.0)
}

fn cross_field_warnings(reports: &[Report]) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let mut check = |path: String, field: &str, actual: f64, expected: f64, formula: &str| {
        if (actual - expected).abs() > tolerance(expected) {
            warnings.push(ValidationWarning {
                path,
                message: format!(
                    "{} is {} but {} gives {}",
                    field, actual, formula, expected
                ),
            });
        }
    };

    for report in reports {
        match report {
            Report::IncomeStatement(statement) => {
                let base = pointer("", ReportKind::IncomeStatement.key());
                for (idx, period) in statement.periods.iter().enumerate() {
                    let at = |field: &str| pointer(&pointer(&pointer(&base, "periods"), &idx.to_string()), field);
                    check(
                        at("gross_profit"),
                        "gross_profit",
                        period.gross_profit,
                        period.revenue - period.cogs,
                        "revenue - cogs",
                    );
                    check(
                        at("operating_income"),
                        "operating_income",
                        period.operating_income,
                        period.gross_profit - period.operating_expenses,
                        "gross_profit - operating_expenses",
                    );
                    check(
                        at("net_income"),
                        "net_income",
                        period.net_income,
                        period.operating_income + period.other_net - period.taxes,
                        "operating_income + other_net - taxes",
                    );
                }
            }
            Report::CashFlow(cash_flow) => {
                check(
                    pointer(&pointer("", ReportKind::CashFlow.key()), "net_change"),
                    "net_change",
                    cash_flow.net_change,
                    cash_flow.operating + cash_flow.investing + cash_flow.financing,
                    "operating + investing + financing",
                );
            }
            Report::ExpenseBreakdown(_) => {}
        }
    }

    warnings
}

/// Parses JSON text while rejecting duplicate object keys, which
/// `serde_json::Value` would otherwise collapse silently.
fn parse_strict(raw: &str) -> Result<Value, ValidationFailure> {
    let duplicate = RefCell::new(None);
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    let parsed = StrictSeed {
        path: String::new(),
        duplicate: &duplicate,
    }
    .deserialize(&mut deserializer)
    .and_then(|value| deserializer.end().map(|_| value));

    match parsed {
        Ok(value) => Ok(value),
        Err(e) => match duplicate.into_inner() {
            Some(path) => Err(ValidationFailure::single(path, "unique object keys", "duplicate key")),
            None => Err(ValidationFailure::single("", "well-formed JSON document", e.to_string())),
        },
    }
}

struct StrictSeed<'a> {
    path: String,
    duplicate: &'a RefCell<Option<String>>,
}

impl<'de, 'a> DeserializeSeed<'de> for StrictSeed<'a> {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de, 'a> Visitor<'de> for StrictSeed<'a> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Number::from_f64(v)
            .map(Value::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        loop {
            let seed = StrictSeed {
                path: pointer(&self.path, &items.len().to_string()),
                duplicate: self.duplicate,
            };
            match seq.next_element_seed(seed)? {
                Some(item) => items.push(item),
                None => break,
            }
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = Map::new();
        while let Some(key) = access.next_key::<String>()? {
            let path = pointer(&self.path, &key);
            if map.contains_key(&key) {
                *self.duplicate.borrow_mut() = Some(path);
                return Err(de::Error::custom(format!("duplicate key `{}`", key)));
            }
            let value = access.next_value_seed(StrictSeed {
                path,
                duplicate: self.duplicate,
            })?;
            map.insert(key, value);
        }
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(list: &[ReportKind]) -> BTreeSet<ReportKind> {
        list.iter().copied().collect()
    }

    fn period() -> Value {
        json!({
            "label": "FY2024",
            "revenue": 1200.5,
            "cogs": 400.0,
            "gross_profit": 800.5,
            "operating_expenses": 300.0,
            "operating_income": 500.5,
            "other_net": -20.0,
            "taxes": 100.0,
            "net_income": 380.5,
            "margins": { "gross": 0.667, "operating": 0.417, "net": 0.317 }
        })
    }

    fn full_payload() -> Value {
        json!({
            "income_statement": { "periods": [period()] },
            "cash_flow": { "operating": 500.0, "investing": -200.0, "financing": -50.0, "net_change": 250.0 },
            "expense_breakdown": {
                "by_category": [{ "label": "Rent", "total": 120.0 }, { "label": "Payroll", "total": 180.0 }],
                "by_vendor": [{ "label": "Landlord Ltd", "total": 120.0 }],
                "by_month": [{ "label": "2024-01", "total": 300.0 }]
            }
        })
    }

    #[test]
    fn test_conforming_payload_round_trips_without_loss() {
        let validator = OutputValidator::default();
        let raw = full_payload().to_string();

        let report = validator.validate(&raw, &kinds(&ReportKind::ALL)).unwrap();
        assert_eq!(report.reports.len(), 3);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);

        let income = report.income_statement().unwrap();
        assert_eq!(income.periods[0].revenue, 1200.5);
        assert_eq!(income.periods[0].label, "FY2024");

        let cash = report.cash_flow().unwrap();
        assert_eq!(serde_json::to_value(cash).unwrap(), full_payload()["cash_flow"]);

        let breakdown = report.expense_breakdown().unwrap();
        assert_eq!(breakdown.by_category[1].label, "Payroll");
        assert_eq!(breakdown.by_category[1].total, 180.0);
    }

    #[test]
    fn test_numeral_string_is_rejected_with_path() {
        let validator = OutputValidator::default();
        let mut payload = full_payload();
        payload["income_statement"]["periods"][0]["revenue"] = json!("1,200.50");

        let failure = validator
            .validate(&payload.to_string(), &kinds(&[ReportKind::IncomeStatement]))
            .unwrap_err();

        assert_eq!(failure.issues.len(), 1);
        let issue = &failure.issues[0];
        assert_eq!(issue.path, "/income_statement/periods/0/revenue");
        assert_eq!(issue.expected, "number");
        assert!(issue.found.contains("1,200.50"));
    }

    #[test]
    fn test_missing_nested_key_is_reported() {
        let validator = OutputValidator::default();
        let mut payload = full_payload();
        payload["income_statement"]["periods"][0]["margins"]
            .as_object_mut()
            .unwrap()
            .remove("net");

        let failure = validator
            .validate(&payload.to_string(), &kinds(&[ReportKind::IncomeStatement]))
            .unwrap_err();
        assert!(failure.touches("/income_statement/periods/0/margins/net"));
    }

    #[test]
    fn test_only_requested_kinds_are_required() {
        let validator = OutputValidator::default();
        let raw = json!({ "cash_flow": full_payload()["cash_flow"].clone() }).to_string();

        let report = validator.validate(&raw, &kinds(&[ReportKind::CashFlow])).unwrap();
        assert_eq!(report.kinds(), kinds(&[ReportKind::CashFlow]));

        let failure = validator
            .validate(&raw, &kinds(&[ReportKind::CashFlow, ReportKind::ExpenseBreakdown]))
            .unwrap_err();
        assert!(failure.touches("/expense_breakdown"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let validator = OutputValidator::default();
        let mut payload = full_payload();
        payload["cash_flow"]["fx_effect"] = json!(1.0);
        payload["balance_sheet"] = json!({});

        let failure = validator
            .validate(&payload.to_string(), &kinds(&[ReportKind::CashFlow]))
            .unwrap_err();
        assert!(failure.touches("/cash_flow/fx_effect"));
        assert!(failure.touches("/balance_sheet"));
    }

    #[test]
    fn test_empty_periods_fail_min_items() {
        let validator = OutputValidator::default();
        let raw = json!({ "income_statement": { "periods": [] } }).to_string();

        let failure = validator
            .validate(&raw, &kinds(&[ReportKind::IncomeStatement]))
            .unwrap_err();
        assert_eq!(failure.issues[0].path, "/income_statement/periods");
        assert_eq!(failure.issues[0].expected, "at least 1 item(s)");
    }

    #[test]
    fn test_duplicate_object_keys_are_rejected() {
        let validator = OutputValidator::default();
        let raw = r#"{"cash_flow": {"operating": 1, "operating": 2, "investing": 0, "financing": 0, "net_change": 1}}"#;

        let failure = validator.validate(raw, &kinds(&[ReportKind::CashFlow])).unwrap_err();
        assert_eq!(failure.issues[0].path, "/cash_flow/operating");
        assert_eq!(failure.issues[0].expected, "unique object keys");
    }

    #[test]
    fn test_duplicate_labels_are_rejected() {
        let validator = OutputValidator::default();
        let mut payload = full_payload();
        payload["expense_breakdown"]["by_vendor"] = json!([
            { "label": "Landlord Ltd", "total": 100.0 },
            { "label": "Power Co", "total": 20.0 },
            { "label": "Landlord Ltd", "total": 20.0 }
        ]);

        let failure = validator
            .validate(&payload.to_string(), &kinds(&[ReportKind::ExpenseBreakdown]))
            .unwrap_err();
        assert_eq!(failure.issues.len(), 1);
        assert_eq!(failure.issues[0].path, "/expense_breakdown/by_vendor/2/label");
        assert!(failure.issues[0].found.contains("index 0"));
    }

    #[test]
    fn test_malformed_json_is_a_failure_not_a_panic() {
        let validator = OutputValidator::default();
        let failure = validator
            .validate("Here is your report: {", &kinds(&[ReportKind::CashFlow]))
            .unwrap_err();
        assert_eq!(failure.issues[0].path, "");
        assert_eq!(failure.issues[0].expected, "well-formed JSON document");

        let failure = validator.validate("[1, 2]", &kinds(&[ReportKind::CashFlow])).unwrap_err();
        assert_eq!(failure.issues[0].expected, "object");
    }

    #[test]
    fn test_arithmetic_drift_is_a_warning_only() {
        let validator = OutputValidator::default();
        let mut payload = full_payload();
        payload["income_statement"]["periods"][0]["net_income"] = json!(999.0);
        payload["cash_flow"]["net_change"] = json!(0.0);

        let report = validator.validate(&payload.to_string(), &kinds(&ReportKind::ALL)).unwrap();
        let paths: Vec<&str> = report.warnings.iter().map(|w| w.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/income_statement/periods/0/net_income", "/cash_flow/net_change"]
        );
        assert_eq!(report.income_statement().unwrap().periods[0].net_income, 999.0);
    }

    #[test]
    fn test_validation_is_repeatable() {
        let validator = OutputValidator::default();
        let raw = full_payload().to_string();
        let first = validator.validate(&raw, &kinds(&ReportKind::ALL)).unwrap();
        let second = validator.validate(&raw, &kinds(&ReportKind::ALL)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_pointer_escapes_reserved_characters() {
        assert_eq!(pointer("/a", "b/c~d"), "/a/b~1c~0d");
    }
}
