use dotenv::dotenv;
use ledger_agent_runs::*;
use std::error::Error;
use std::result::Result;
use std::sync::Arc;

fn load_file_refs() -> Result<Vec<ExternalFileRef>, Box<dyn Error>> {
    let ids = std::env::var("OPENAI_FILE_IDS")?;
    let refs: Vec<ExternalFileRef> = ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ExternalFileRef::new)
        .collect();

    if refs.is_empty() {
        return Err("OPENAI_FILE_IDS must list at least one uploaded file id".into());
    }
    Ok(refs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = OrchestratorConfig::from_env()?;
    let client = OpenAiAgentClient::from_config(&config)?;
    let store = SqliteStore::open(std::env::var("RUN_STORE_PATH").unwrap_or_else(|_| "runs.db".to_string())).await?;
    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(client), Arc::new(store)));

    let resumed = orchestrator.recover().await?;
    if !resumed.is_empty() {
        println!("Resuming {} run(s) left over from a previous session", resumed.len());
        for result in orchestrator.drive_all(&resumed).await {
            match result {
                Ok(record) => println!("  {} -> {:?}", record.id, record.status),
                Err(e) => println!("  resume failed: {}", e),
            }
        }
    }

    let request = RunRequest::new(load_file_refs()?, ReportKind::ALL)
        .with_currency(std::env::var("REPORT_CURRENCY").unwrap_or_else(|_| "NZD".to_string()))
        .with_fiscal_start_month(4)
        .with_provider("Xero");

    println!("Submitting {} file(s)...", request.file_refs.len());
    let report = run_reports(&orchestrator, request).await?;

    if let Some(statement) = report.income_statement() {
        println!("\nIncome statement");
        for period in &statement.periods {
            println!(
                "  {:<10} revenue {:>12.2}  net {:>12.2}  net margin {:>6.1}%",
                period.label,
                period.revenue,
                period.net_income,
                period.margins.net * 100.0
            );
        }
    }
    if let Some(cash_flow) = report.cash_flow() {
        println!("\nCash flow");
        println!("  operating {:>12.2}", cash_flow.operating);
        println!("  investing {:>12.2}", cash_flow.investing);
        println!("  financing {:>12.2}", cash_flow.financing);
        println!("  net       {:>12.2}", cash_flow.net_change);
    }
    if let Some(breakdown) = report.expense_breakdown() {
        for (name, totals) in breakdown.collections() {
            println!("\nExpenses {}", name);
            for entry in totals {
                println!("  {:<30} {:>12.2}", entry.label, entry.total);
            }
        }
    }
    for warning in &report.warnings {
        println!("⚠️  {}: {}", warning.path, warning.message);
    }

    Ok(())
}
