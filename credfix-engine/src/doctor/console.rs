//! Terminal front end of the doctor
//!
//! `ConsoleDecisions` answers the doctor's questions from stdin; the
//! `print_*` functions render sessions, analyses and execution reports.

use anyhow::Result;
use async_trait::async_trait;
use std::io::{self, Write};
use tracing::warn;

use super::session::DiagnosticSession;
use super::{DecisionProvider, DoctorOutcome, OptionChoice, SummaryChoice};
use crate::consent::backup::BackupRecord;
use crate::consent::{ConsentDecision, ConsentPrompt, FixProposal};
use crate::model::{Issue, Severity};
use crate::repair::{Analysis, ExecutionReport, FixStatus};

pub struct ConsoleDecisions;

#[async_trait]
impl ConsentPrompt for ConsoleDecisions {
    async fn on_proposal(&self, proposal: &FixProposal) -> ConsentDecision {
        print_proposal(proposal);
        match prompt_yes_no("Apply these changes?", false) {
            Ok(true) => ConsentDecision::approve("approved at the terminal"),
            Ok(false) => ConsentDecision::reject("declined at the terminal"),
            Err(e) => {
                warn!("Could not read an answer: {}", e);
                ConsentDecision::reject(format!("no answer: {e}"))
            }
        }
    }
}

#[async_trait]
impl DecisionProvider for ConsoleDecisions {
    async fn on_summary(&self, session: &DiagnosticSession) -> SummaryChoice {
        print_summary(session);
        let options = [
            ("fix", "Fix critical issues now"),
            ("review", "Review issues and pick fixes"),
            ("report", "Show the full report"),
            ("exit", "Exit without changes"),
        ];
        let default = if session.counts.critical > 0 { "fix" } else { "review" };
        match prompt_with_options("What next", &options, default).as_deref() {
            Ok("fix") => SummaryChoice::FixCritical,
            Ok("review") => SummaryChoice::ReviewIndividually,
            Ok("report") => SummaryChoice::ViewFullReport,
            _ => SummaryChoice::Exit,
        }
    }

    async fn on_options(&self, analysis: &Analysis) -> OptionChoice {
        print_analysis(analysis);
        let options = [
            ("all", "Apply every automatic fix"),
            ("pick", "Choose fixes by number"),
            ("rec", "Apply one recommendation by number"),
            ("report", "Report only, change nothing"),
            ("exit", "Exit without changes"),
        ];
        let choice = match prompt_with_options("Choose", &options, "all") {
            Ok(choice) => choice,
            Err(_) => return OptionChoice::Exit,
        };
        match choice.as_str() {
            "all" => OptionChoice::AutoFixAll,
            "report" => OptionChoice::ReportOnly,
            "pick" => {
                let Ok(Some(answer)) = prompt_optional("Fix numbers, comma separated") else {
                    return OptionChoice::Exit;
                };
                let ids = answer
                    .split(',')
                    .filter_map(|n| n.trim().parse::<usize>().ok())
                    .filter_map(|n| analysis.fixes.get(n.wrapping_sub(1)))
                    .map(|f| f.id.clone())
                    .collect();
                OptionChoice::FixSpecific(ids)
            }
            "rec" => match prompt_optional("Recommendation number") {
                Ok(Some(n)) => match n.trim().parse::<usize>() {
                    Ok(n) if n >= 1 => OptionChoice::ApplyRecommendation(n - 1),
                    _ => OptionChoice::Exit,
                },
                _ => OptionChoice::Exit,
            },
            _ => OptionChoice::Exit,
        }
    }

    async fn on_report(&self, session: &DiagnosticSession, analysis: &Analysis) {
        print_report(session, analysis);
    }

    async fn on_failed_fixes(&self, report: &ExecutionReport, backup: &BackupRecord) -> bool {
        print_execution(report);
        prompt_yes_no(&format!("Some fixes failed. Restore backup {}?", backup.id), false).unwrap_or(false)
    }
}

fn marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🔴",
        Severity::High => "🟠",
        Severity::Medium => "🟡",
        Severity::Low => "🔵",
    }
}

fn print_issue(index: usize, issue: &Issue) {
    println!("  {} {}. [{}] {}", marker(issue.severity), index + 1, issue.severity, issue.description);
    println!("       evidence: {}", issue.evidence);
    println!("       ➜ {}", issue.suggestion);
}

pub fn print_summary(session: &DiagnosticSession) {
    println!();
    println!("🩺 DIAGNOSTIC SUMMARY");
    println!("────────────────────────────────────────");
    if let Some(platform) = &session.results.platform {
        println!("🖥️  {} {} ({})", platform.os, platform.os_version.as_deref().unwrap_or(""), platform.architecture);
        println!("🐳 Docker: {}", platform.docker_version.as_deref().unwrap_or("not found"));
        println!(
            "🔑 Credential helper: {}",
            platform.credential_helper.as_deref().unwrap_or("none")
        );
    }
    let counts = &session.counts;
    println!(
        "Issues: {} critical, {} high, {} medium, {} low",
        counts.critical, counts.high, counts.medium, counts.low
    );
    for error in &session.errors {
        println!("⚠️  {}", error);
    }
    println!();
}

pub fn print_analysis(analysis: &Analysis) {
    println!("📋 ISSUES");
    println!("────────────────────────────────────────");
    for (index, issue) in analysis.issues.iter().enumerate() {
        print_issue(index, issue);
    }
    println!();
    println!("🔧 AVAILABLE FIXES");
    println!("────────────────────────────────────────");
    if analysis.fixes.is_empty() {
        println!("  (none; see the suggestions above)");
    }
    for (index, fix) in analysis.fixes.iter().enumerate() {
        println!(
            "  {}. {} [risk: {}{}{}]",
            index + 1,
            fix.title,
            fix.risk_level,
            if fix.requires_restart { ", restart" } else { "" },
            if fix.requires_reauth { ", re-login" } else { "" }
        );
    }
    println!();
}

pub fn print_report(session: &DiagnosticSession, analysis: &Analysis) {
    print_summary(session);
    print_analysis(analysis);
    println!("💡 RECOMMENDATIONS");
    println!("────────────────────────────────────────");
    for (index, recommendation) in analysis.recommendations.iter().enumerate() {
        println!(
            "  {} {}. {}: {}",
            marker(recommendation.priority),
            index + 1,
            recommendation.title,
            recommendation.action
        );
    }
    println!();
}

pub fn print_proposal(proposal: &FixProposal) {
    println!();
    println!("📝 PROPOSED CHANGES");
    println!("────────────────────────────────────────");
    println!("{}", proposal.description);
    println!("Risk: {}", proposal.risk);
    println!("Affects:");
    for resource in &proposal.affected_resources {
        println!("  • {}", resource);
    }
    println!("Backup: {}", proposal.backup.id);
    if let Some(diff) = &proposal.diff {
        println!();
        println!("{}", diff);
    }
    println!();
}

pub fn print_execution(report: &ExecutionReport) {
    println!();
    println!(
        "🔧 FIX RESULTS{}",
        if report.dry_run { " (dry run)" } else { "" }
    );
    println!("────────────────────────────────────────");
    for outcome in &report.outcomes {
        let icon = match outcome.status {
            FixStatus::Applied | FixStatus::Simulated => "✅",
            FixStatus::Failed => "❌",
            FixStatus::Skipped => "⏭️ ",
        };
        println!("{} {}", icon, outcome.message);
        if let Some(diff) = &outcome.diff {
            for line in diff.lines() {
                println!("     {}", line);
            }
        }
        if let Some(error) = &outcome.error {
            println!("     error: {}", error);
        }
        if let Some(suggestion) = &outcome.suggestion {
            println!("     ➜ {}", suggestion);
        }
    }
    println!(
        "Executed {}, successful {}, failed {}, skipped {}",
        report.executed, report.successful, report.failed, report.skipped
    );
    for step in &report.next_steps {
        println!("👉 {}", step);
    }
    println!();
}

pub fn print_outcome(outcome: &DoctorOutcome) {
    match outcome {
        DoctorOutcome::Healthy => println!("✅ Docker credentials look healthy"),
        DoctorOutcome::IssuesFound { counts, rejected } => {
            println!("⚠️  {} issue(s) left unchanged", counts.total());
            if let Some(reason) = rejected {
                println!("   ({})", reason);
            }
        }
        DoctorOutcome::FixesApplied {
            successful,
            failed,
            requires_restart,
            requires_reauth,
            dry_run,
            before,
            remaining,
            resolved,
            rolled_back,
        } => {
            let verb = if *dry_run { "simulated" } else { "applied" };
            println!("🔧 {} fix(es) {}, {} failed", successful, verb, failed);
            println!(
                "   issues: {} before, {} remaining, {} resolved",
                before.total(),
                remaining.total(),
                resolved
            );
            if *requires_restart {
                println!("   ↻ restart Docker Desktop or the Docker service");
            }
            if *requires_reauth {
                println!("   🔑 run `docker login` again for your registries");
            }
            if let Some(id) = rolled_back {
                println!("   ⏪ restored backup {}", id);
            }
        }
        DoctorOutcome::UserCancelled => println!("👋 Exited without changes"),
    }
}

fn read_line() -> Result<String> {
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_optional(prompt: &str) -> Result<Option<String>> {
    print!("❓ {}: ", prompt);
    let input = read_line()?;
    Ok((!input.is_empty()).then_some(input))
}

fn prompt_yes_no(prompt: &str, default: bool) -> Result<bool> {
    let default_str = if default { "Y/n" } else { "y/N" };

    loop {
        print!("❓ {} [{}]: ", prompt, default_str);
        let input = read_line()?.to_lowercase();

        if input.is_empty() {
            return Ok(default);
        }

        match input.as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("❌ Please enter 'y' or 'n'."),
        }
    }
}

fn prompt_with_options(prompt: &str, options: &[(&str, &str)], default: &str) -> Result<String> {
    println!("❓ {}:", prompt);
    for (key, description) in options {
        let marker = if *key == default { "►" } else { " " };
        println!("  {} {} - {}", marker, key, description);
    }

    loop {
        print!("Choice [{}]: ", default);
        let input = read_line()?;

        if input.is_empty() {
            return Ok(default.to_string());
        }

        if options.iter().any(|(key, _)| *key == input) {
            return Ok(input);
        }

        println!("❌ Invalid choice. Please select from the available options.");
    }
}
