use anyhow::{bail, Context};
use chrono::Utc;
use coach_pricing::domain::{BatchId, CoachId, PaymentId, RefundEventId};
use coach_pricing::{config::Config, db::init_db, PricingService, Repository};
use serde::Serialize;
use std::sync::Arc;

const USAGE: &str = "usage:
  coach-pricing rates <coach-id>
  coach-pricing breakdown <payment-id>
  coach-pricing refund <payment-id> <refund-event-id>
  coach-pricing payout <coach-id> [batch-id] [--dry-run]";

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let Some((command, rest)) = args.split_first() else {
        bail!("{}", USAGE);
    };

    let config = Config::from_env().context("Configuration error")?;
    let pool = init_db(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let service = PricingService::new(Arc::new(Repository::new(pool)), config);

    match (command.as_str(), rest) {
        ("rates", [coach_id]) => {
            let rates = service.rate_config(&CoachId::new(coach_id.as_str())).await?;
            print_json(&rates)
        }
        ("breakdown", [payment_id]) => {
            let breakdown = service.earnings(&PaymentId::new(payment_id.as_str())).await?;
            print_json(&breakdown)
        }
        ("refund", [payment_id, refund_event_id]) => {
            let outcome = service
                .process_refund(
                    &PaymentId::new(payment_id.as_str()),
                    &RefundEventId::new(refund_event_id.as_str()),
                    Utc::now(),
                )
                .await?;
            print_json(&outcome)
        }
        ("payout", [coach_id, flags @ ..]) => {
            let dry_run = flags.iter().any(|f| f == "--dry-run");
            let batch_id = flags
                .iter()
                .find(|f| !f.starts_with("--"))
                .map(|s| BatchId::new(s.as_str()))
                .unwrap_or_else(|| BatchId::new(uuid::Uuid::new_v4().to_string()));
            let coach_id = CoachId::new(coach_id.as_str());

            let plan = if dry_run {
                service.plan_payout(&coach_id, &batch_id).await?
            } else {
                service.payout_batch(&coach_id, &batch_id, Utc::now()).await?
            };
            print_json(&plan)
        }
        _ => bail!("{}", USAGE),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
