//! Text output for plans and run reports

use std::io::{self, Write};
use std::time::Duration;

use etm_core::build::{Backend, RunPlan};
use etm_core::report::{RunReport, StepOutcome};

/// Print what a run would do without running it
pub fn write_plan(out: &mut impl Write, plan: &RunPlan, backend: &Backend) -> io::Result<()> {
    if plan.modules.is_empty() {
        writeln!(out, "No modules selected")?;
    }

    for module_plan in &plan.modules {
        let module = &module_plan.module;
        writeln!(out, "{} ({})", module.name, module.path)?;

        if module_plan.targets.is_empty() {
            writeln!(out, "  (no targets)")?;
            continue;
        }

        writeln!(out, "  configure: {}", backend.configure(&module.path))?;
        for target in &module_plan.targets {
            writeln!(out, "  {}: {}", target, backend.target(&module.path, target))?;
        }
    }

    writeln!(
        out,
        "{} step(s) across {} module(s)",
        plan.total_steps(),
        plan.work().count()
    )?;
    write_unknown(out, plan)
}

/// Print one row per step, then the failed steps and the overall outcome
pub fn write_report(out: &mut impl Write, report: &RunReport) -> io::Result<()> {
    let rows: Vec<[String; 5]> = report
        .steps
        .iter()
        .map(|step| {
            [
                step.module.clone(),
                step.step.to_string(),
                step.outcome.to_string(),
                step.exit_code.map_or_else(|| "-".to_string(), |code| code.to_string()),
                format_duration(step.duration),
            ]
        })
        .collect();

    let header = ["MODULE", "STEP", "RESULT", "EXIT", "DURATION"].map(String::from);
    let mut widths = header.clone().map(|h| h.len());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    if !rows.is_empty() {
        for row in std::iter::once(&header).chain(&rows) {
            writeln!(
                out,
                "{:<w0$}  {:<w1$}  {:<w2$}  {:>w3$}  {:>w4$}",
                row[0],
                row[1],
                row[2],
                row[3],
                row[4],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2],
                w3 = widths[3],
                w4 = widths[4],
            )?;
        }
    }

    let failed: Vec<_> = report.failed_steps().collect();
    if !failed.is_empty() {
        writeln!(out)?;
        writeln!(out, "Failed steps:")?;
        for step in failed {
            let detail = match (&step.reason, step.exit_code) {
                (Some(reason), _) => reason.clone(),
                (None, Some(code)) => format!("exit code {}", code),
                (None, None) => "no exit code".to_string(),
            };
            writeln!(out, "  {} {}: {}", step.module, step.step, detail)?;
        }
    }

    writeln!(out)?;
    writeln!(
        out,
        "Outcome: {} ({} ok, {} failed, {} skipped)",
        report.outcome,
        report.count(StepOutcome::Succeeded),
        report.count(StepOutcome::Failed),
        report.count(StepOutcome::Skipped)
    )
}

/// Print filter names that matched nothing
pub fn write_unknown(out: &mut impl Write, plan: &RunPlan) -> io::Result<()> {
    for name in &plan.unknown_modules {
        writeln!(out, "Unknown module: {}", name)?;
    }
    for name in &plan.unknown_targets {
        writeln!(out, "Unknown target: {}", name)?;
    }
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 60.0 {
        format!("{}m{:02}s", duration.as_secs() / 60, duration.as_secs() % 60)
    } else {
        format!("{:.2}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etm_core::report::{RunOutcome, Step, StepResult};

    fn report(steps: Vec<StepResult>, outcome: RunOutcome) -> RunReport {
        let now = chrono::Utc::now();
        RunReport {
            steps,
            outcome,
            started_at: now,
            finished_at: now,
        }
    }

    fn render(report: &RunReport) -> String {
        let mut out = Vec::new();
        write_report(&mut out, report).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_report_table_and_failures() {
        let mut flash = StepResult::skipped("bootloader", Step::Target("flash".into()), 2, "x");
        flash.outcome = StepOutcome::Failed;
        flash.exit_code = Some(2);
        flash.reason = None;
        flash.duration = Duration::from_millis(1500);

        let text = render(&report(
            vec![
                StepResult::reused("bootloader", Step::Configure, 0, "build directory already configured"),
                flash,
            ],
            RunOutcome::PartialFailure,
        ));

        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("MODULE"));
        assert!(lines[1].contains("<configure>"));
        assert!(lines[2].contains("FAILED"));
        assert!(lines[2].contains("1.50s"));
        assert!(text.contains("Failed steps:\n  bootloader flash: exit code 2\n"));
        assert!(text.ends_with("Outcome: partial failure (1 ok, 1 failed, 0 skipped)\n"));
    }

    #[test]
    fn test_empty_report() {
        let text = render(&report(Vec::new(), RunOutcome::AllSucceeded));

        assert_eq!(text, "\nOutcome: all succeeded (0 ok, 0 failed, 0 skipped)\n");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "0.25s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
    }

    #[test]
    fn test_unknown_names() {
        let plan = RunPlan {
            unknown_modules: vec!["ghost".into()],
            unknown_targets: vec!["nope".into()],
            ..Default::default()
        };
        let mut out = Vec::new();

        write_unknown(&mut out, &plan).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Unknown module: ghost\nUnknown target: nope\n");
    }
}
