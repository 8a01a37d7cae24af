// Prompt construction for the financial reporting agent. Pure: no I/O, no
// network. Spreadsheet content never appears here; files are referenced by
// their remote handles only.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use chrono::Month;
use serde::{Deserialize, Serialize};

use crate::error::{ReportingError, Result};
use crate::files::ExternalFileRef;
use crate::run::{RunContext, RunRequest};
use crate::schema::{ReportKind, SCHEMA_NAME};

pub const MAX_EXAMPLE_ROWS: usize = 3;

pub const SYSTEM_PROMPT_REPORTS: &str = r#"
You are a Financial Reporting Analyst. You read accounting exports (CSV or XLSX spreadsheets from packages such as Xero, MYOB or QuickBooks) that are attached to this conversation and summarise them into structured reports.

## OUTPUT CONTRACT
- Respond with ONLY one JSON object. No prose, no markdown fences, no comments.
- The object MUST conform to the structured output schema supplied with this run.
- Include exactly the report sections listed under REQUESTED SECTIONS, each under its key. Add no other keys.
- Every amount MUST be a JSON number (e.g. 1200.5). Never quote numbers. Never include currency symbols, thousands separators or percent signs.
- Never invent figures. If a required amount is genuinely absent from the sources, use 0 and keep the structure complete.

## READING THE SPREADSHEETS
- Decimal separators vary. Some exports write "1.234,56" for 1234.56; infer the convention from the whole file before converting.
- Amounts in parentheses are negative: "(1,200.00)" means -1200.00.
- A trailing "CR"/"DR" marker or a leading minus sign sets the sign; respect it.
- Blank lines, repeated header rows, title banners and subtotal rows are layout, not data. Skip them rather than failing.
- Ignore byte-order marks and stray whitespace around headers and cells.
- Prefer line-item rows over printed totals when both are present, and report the totals you derive.
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system_message: String,
    pub user_message: String,
}

/// Inputs to `build_prompt`, separate from the attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptConfig {
    pub report_kinds: BTreeSet<ReportKind>,
    pub context: RunContext,
    pub example_rows: Vec<String>,
    pub instructions: Option<String>,
}

impl From<&RunRequest> for PromptConfig {
    fn from(request: &RunRequest) -> Self {
        Self {
            report_kinds: request.report_kinds.clone(),
            context: request.context.clone(),
            example_rows: request.example_rows.clone(),
            instructions: request.instructions.clone(),
        }
    }
}

fn section_guide(kind: ReportKind) -> &'static str {
    match kind {
        ReportKind::IncomeStatement => {
            "one entry in `periods` per reporting period, each with label, revenue, cogs, gross_profit, \
             operating_expenses, operating_income, other_net, taxes (positive when an expense), net_income \
             and margins (gross, operating, net as fractions of revenue, e.g. 0.25)"
        }
        ReportKind::CashFlow => {
            "operating, investing and financing cash totals plus net_change for the whole covered period"
        }
        ReportKind::ExpenseBreakdown => {
            "expense totals by_category, by_vendor and by_month (label formatted YYYY-MM); \
             each label appears at most once per list"
        }
    }
}

/// Composes the system and user messages for one run.
pub fn build_prompt(config: &PromptConfig, file_refs: &[ExternalFileRef]) -> Result<Prompt> {
    validate_prompt_config(config, file_refs)?;

    let mut system_message = SYSTEM_PROMPT_REPORTS.trim_start().to_string();
    let _ = write!(
        system_message,
        "\n## REQUESTED SECTIONS (schema `{}`)\n",
        SCHEMA_NAME
    );
    for kind in &config.report_kinds {
        let _ = writeln!(system_message, "- `{}`: {}", kind.key(), section_guide(*kind));
    }

    let mut user_message = String::from(
        "Please review the attached spreadsheets and produce the requested financial summaries.\n",
    );

    user_message.push_str("\n### ATTACHMENTS\n");
    for (i, file_ref) in file_refs.iter().enumerate() {
        let _ = writeln!(user_message, "  [{}] {}", i, file_ref);
    }
    user_message.push_str("Refer to the files only through these attachments.\n");

    user_message.push_str("\n### REQUESTED REPORTS\n");
    for kind in &config.report_kinds {
        let _ = writeln!(user_message, "- {} (`{}`)", kind.display_name(), kind.key());
    }

    let context = &config.context;
    if context.fiscal_start_month.is_some() || context.currency.is_some() || context.provider.is_some() {
        user_message.push_str("\n### FISCAL CONTEXT\n");
        if let Some(month) = context.fiscal_start_month.and_then(|m| Month::try_from(m as u8).ok()) {
            let _ = writeln!(user_message, "- Fiscal year starts in {}.", month.name());
        }
        if let Some(currency) = &context.currency {
            let _ = writeln!(
                user_message,
                "- Report amounts in {} as plain numbers.",
                currency.trim().to_ascii_uppercase()
            );
        }
        if let Some(provider) = &context.provider {
            let _ = writeln!(user_message, "- The exports come from {}.", provider.trim());
        }
    }

    let rows: Vec<&str> = config
        .example_rows
        .iter()
        .map(|row| row.trim_end())
        .filter(|row| !row.trim().is_empty())
        .collect();
    if !rows.is_empty() {
        user_message.push_str("\n### EXAMPLE ROWS\nThe exports contain rows like these (copied verbatim):\n");
        for row in rows {
            let _ = writeln!(user_message, "    {}", row);
        }
    }

    if let Some(instructions) = config.instructions.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        user_message.push_str("\n### ADDITIONAL INSTRUCTIONS\n");
        user_message.push_str(instructions);
        user_message.push('\n');
    }

    Ok(Prompt {
        system_message,
        user_message,
    })
}

fn validate_prompt_config(config: &PromptConfig, file_refs: &[ExternalFileRef]) -> Result<()> {
    if config.report_kinds.is_empty() {
        return Err(ReportingError::InvalidConfiguration(
            "at least one report kind must be requested".to_string(),
        ));
    }
    if file_refs.is_empty() {
        return Err(ReportingError::InvalidConfiguration(
            "at least one file reference is required".to_string(),
        ));
    }
    if let Some(idx) = file_refs.iter().position(|f| f.as_str().trim().is_empty()) {
        return Err(ReportingError::InvalidConfiguration(format!(
            "file reference #{} is blank",
            idx
        )));
    }
    if let Some(month) = config.context.fiscal_start_month {
        if !(1..=12).contains(&month) {
            return Err(ReportingError::InvalidConfiguration(format!(
                "fiscal start month {} must be between 1 and 12",
                month
            )));
        }
    }
    if let Some(currency) = &config.context.currency {
        let code = currency.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ReportingError::InvalidConfiguration(format!(
                "currency {:?} is not a three-letter ISO 4217 code",
                currency
            )));
        }
    }
    if config.example_rows.len() > MAX_EXAMPLE_ROWS {
        return Err(ReportingError::InvalidConfiguration(format!(
            "at most {} example rows may be supplied, got {}",
            MAX_EXAMPLE_ROWS,
            config.example_rows.len()
        )));
    }
    Ok(())
}
