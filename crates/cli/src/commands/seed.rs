use chrono::{NaiveDate, Utc};

use crate::commands::{open_reservations, prepare, CommandResult};
use mesa_db::{SeedPlan, SeedReport};

pub const DEFAULT_SEED_DAYS: u32 = 7;

/// Seeds demo reservations from `start` (today when absent) and verifies them.
pub fn run(start: Option<NaiveDate>, days: u32) -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let plan = SeedPlan::new(start.unwrap_or_else(|| Utc::now().date_naive()), days.max(1));

    let result = runtime.block_on(async {
        let reservations = open_reservations(&config).await?;

        let report = plan
            .load(&reservations)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = plan
            .verify(&reservations)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        if !verification.all_present {
            let failed_checks = verification
                .checks
                .iter()
                .filter(|check| !check.present)
                .map(|check| check.label.as_str())
                .collect::<Vec<_>>();
            return Err(("seed_verification", verification_message(&failed_checks), 6u8));
        }
        Ok::<SeedReport, (&'static str, String, u8)>(report)
    });

    match result {
        Ok(report) => CommandResult::success("seed", summary(&plan, &report)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for dates: {}", failed_checks.join(", "))
    }
}

fn summary(plan: &SeedPlan, report: &SeedReport) -> String {
    format!(
        "seeded {} reservations ({} confirmed, {} slots already full) over {} days from {}",
        report.created, report.confirmed, report.skipped_full, plan.days, plan.start
    )
}
