//! Cross-component scenarios: scan, analysis, consent, repair and verification

use credfix_devkit::{scenario_test, ScriptedDecisions, TestHarness};
use credfix_engine::consent::backup::BackupStore;
use credfix_engine::consent::ConsentPolicy;
use credfix_engine::doctor::{AutomaticDecisions, DoctorOutcome};
use credfix_engine::model::{IssueType, Severity};
use credfix_engine::repair::{CredentialRepairer, ExecuteOptions, FixStatus};
use std::time::{Duration, Instant};

const BROKEN_SECRETSERVICE: &str = "Cannot autolaunch D-Bus without X11 $DISPLAY";

fn critical_helper_issues(session: &credfix_engine::doctor::session::DiagnosticSession) -> Vec<String> {
    session
        .issues
        .iter()
        .filter(|i| i.issue_type == IssueType::CredentialHelper && i.severity == Severity::Critical)
        .map(|i| i.evidence.clone())
        .collect()
}

#[tokio::test]
async fn list_exit_code_one_is_a_critical_helper_issue() {
    for helper in ["secretservice", "pass"] {
        let harness = TestHarness::new()
            .unwrap()
            .with_healthy_docker()
            .with_broken_helper(helper, "store unavailable");
        harness
            .fixture
            .write_config(&format!(r#"{{"auths": {{}}, "credsStore": "{helper}"}}"#))
            .unwrap();

        let session = harness.scan().await;
        let broken: Vec<_> = session.issues.iter().filter(|i| i.code == "HELPER_BROKEN").collect();
        assert_eq!(broken.len(), 1, "{helper}: {:?}", session.issues);
        assert_eq!(broken[0].issue_type, IssueType::CredentialHelper);
        assert_eq!(broken[0].severity, Severity::Critical);
    }
}

scenario_test!(repeated_scans_report_identical_issues, |harness| {
    let harness = harness
        .with_healthy_docker()
        .with_broken_helper("secretservice", BROKEN_SECRETSERVICE);
    harness.fixture.write_config(r#"{"auths": {}, "credsStore": "secretservice"}"#)?;

    let first = harness.scan().await;
    let second = harness.scan().await;

    let first_critical = critical_helper_issues(&first);
    assert_eq!(first_critical.len(), 1, "{:?}", first.issues);
    assert_eq!(first_critical, critical_helper_issues(&second));
    assert_eq!(first.issues, second.issues);
    Ok(())
});

scenario_test!(manual_issues_never_get_fixes, |harness| {
    let harness = harness
        .with_healthy_docker()
        .with_broken_helper("ecr-login", "no credentials configured");
    harness
        .fixture
        .write_config(r#"{"auths": {}, "credHelpers": {"123456789.dkr.ecr.eu-west-1.amazonaws.com": "ecr-login"}}"#)?;

    let session = harness.scan().await;
    let manual: Vec<_> = session.issues.iter().filter(|i| !i.auto_fixable).collect();
    assert!(manual.iter().any(|i| i.code == "HELPER_BROKEN"));

    let repairer = CredentialRepairer::new(harness.context());
    let analysis = repairer.analyze_and_repair(&session.results);
    for fix in &analysis.fixes {
        assert!(
            fix.target_issue_ids.iter().any(|id| session.issues.iter().any(|i| &i.id == id && i.auto_fixable)),
            "fix {} targets only manual issues",
            fix.id
        );
    }
    let report = repairer.execute_fixes(&analysis.fixes, &ExecuteOptions::default(), &()).await;
    assert!(report.outcomes.iter().all(|o| analysis.fixes.iter().any(|f| f.id == o.fix_id)));
    Ok(())
});

scenario_test!(dry_run_leaves_config_untouched, |harness| {
    let harness = harness
        .with_healthy_docker()
        .with_broken_helper("secretservice", BROKEN_SECRETSERVICE)
        .with_working_helper("pass");
    harness.fixture.write_config(r#"{"auths": {}, "credsStore": "secretservice"}"#)?;
    let before = harness.fixture.config_bytes();
    let modified = harness.fixture.config_modified();

    let options = ExecuteOptions {
        dry_run: true,
        stop_on_failure: false,
    };
    let decisions = ScriptedDecisions::fix_all();
    let report = harness.run_doctor(ConsentPolicy::Interactive, options, &decisions).await?;

    assert_eq!(harness.fixture.config_bytes(), before);
    assert_eq!(harness.fixture.config_modified(), modified);
    // dry runs are never put to consent
    assert!(decisions.proposals().is_empty());

    let execution = report.execution.expect("dry run executes");
    assert!(execution.dry_run);
    assert!(!execution.outcomes.is_empty());
    for outcome in &execution.outcomes {
        assert_eq!(outcome.status, FixStatus::Simulated);
        assert!(outcome.diff.is_some());
    }
    let diff = execution.outcomes.iter().filter_map(|o| o.diff.as_deref()).collect::<String>();
    assert!(diff.contains("pass"), "{diff}");
    Ok(())
});

scenario_test!(rejected_proposal_changes_nothing, |harness| {
    let harness = harness
        .with_healthy_docker()
        .with_broken_helper("secretservice", BROKEN_SECRETSERVICE)
        .with_working_helper("pass");
    let original = "{\n  \"auths\": {},\n  \"credsStore\": \"secretservice\"\n}\n";
    harness.fixture.write_config(original)?;

    let decisions = ScriptedDecisions::rejecting();
    let report = harness
        .run_doctor(ConsentPolicy::Interactive, ExecuteOptions::default(), &decisions)
        .await?;

    assert_eq!(harness.fixture.config_bytes(), Some(original.as_bytes().to_vec()));
    assert!(matches!(report.outcome, DoctorOutcome::IssuesFound { rejected: Some(_), .. }));
    assert_eq!(report.outcome.exit_code(), 1);
    assert!(report.execution.is_none());

    // the proposal was backed up before it was shown
    let proposals = decisions.proposals();
    assert_eq!(proposals.len(), 1);
    let backups = harness.backup_store().list_backups()?;
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].id, proposals[0].backup.id);
    Ok(())
});

scenario_test!(fresh_machine_gets_a_helper_installed, |harness| {
    let harness = harness
        .with_healthy_docker()
        .with_apt()
        .installing_provides("pass");

    let baseline = harness.scan().await;
    assert_eq!(critical_helper_issues(&baseline).len(), 1, "{:?}", baseline.issues);
    let missing = baseline
        .issues
        .iter()
        .find(|i| i.code == "NO_CREDENTIAL_HELPER")
        .expect("no helper reported");
    assert!(missing.auto_fixable);
    assert!(!baseline.issues.iter().any(|i| i.issue_type == IssueType::Configuration));
    assert_eq!(baseline.counts.critical, 1);

    let report = harness
        .run_doctor(ConsentPolicy::Batch, ExecuteOptions::default(), &AutomaticDecisions::approving())
        .await?;

    match &report.outcome {
        DoctorOutcome::FixesApplied {
            successful,
            failed,
            remaining,
            resolved,
            requires_reauth,
            ..
        } => {
            assert_eq!(*failed, 0);
            assert!(*successful >= 1);
            assert_eq!(remaining.critical, 0);
            assert!(*resolved >= 1);
            assert!(*requires_reauth);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(
        harness.fixture.config_json().and_then(|c| c["credsStore"].as_str().map(str::to_string)),
        Some("pass".to_string())
    );
    assert_eq!(
        harness
            .runner
            .call_count("sudo -n apt-get install -y golang-docker-credential-helpers"),
        1
    );
    Ok(())
});

scenario_test!(probes_run_concurrently, |harness| {
    let harness = harness.with_healthy_docker();
    let delay = Duration::from_millis(400);
    // one slow command in each of the three components
    harness.runner.delayed("uname -r", delay, "6.8.0");
    harness.runner.delayed("ps -eo comm", delay, "bash\n");
    harness.runner.delayed(
        credfix_devkit::command_line("docker", &["version", "--format", "{{json .}}"]),
        delay,
        r#"{"Server": {"Version": "24.0.7"}}"#,
    );

    let start = Instant::now();
    let session = harness.scan().await;
    let elapsed = start.elapsed();

    assert!(session.errors.iter().all(|e| !e.contains("did not complete")));
    assert!(elapsed >= delay, "{elapsed:?}");
    assert!(elapsed < delay * 2, "scan took {elapsed:?}, probes ran sequentially?");
    Ok(())
});
