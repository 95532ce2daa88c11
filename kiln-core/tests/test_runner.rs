mod common;

use common::{sh, TestEnv};
use kiln_common::error::KilnError;
use kiln_common::model::{Arg, InstallSource, Step, TestProcedure};
use kiln_common::pipeline::TestResult;
use kiln_core::{install, run_test, test_installed, InstallRequest};

fn installed_greeter(env: &TestEnv, test: Option<TestProcedure>) -> kiln_common::Manifest {
    let mut manifest = env.artifact_manifest(
        "greeter",
        "1.0",
        &[("bin/greeter", "#!/bin/sh\necho \"name: $1\"\n")],
    );
    manifest.test = test;
    let source = InstallSource::Artifact {
        platform: common::host(),
    };
    install(&env.ctx, InstallRequest::new(&manifest, &source)).unwrap();
    manifest
}

#[test]
fn expected_output_must_appear() {
    let env = TestEnv::new();
    let manifest = installed_greeter(
        &env,
        Some(TestProcedure {
            steps: vec![sh("greeter test", vec![])],
            expect_output: vec!["name: test".to_string()],
        }),
    );

    let result = test_installed(&env.ctx, &manifest).unwrap();
    assert!(result.passed(), "{result:?}");
    assert!(result.output().contains("name: test"));

    let mut picky = manifest.clone();
    if let Some(test) = picky.test.as_mut() {
        test.expect_output = vec!["name: production".to_string()];
    }
    match test_installed(&env.ctx, &picky).unwrap() {
        TestResult::Failed { reason, output } => {
            assert!(reason.contains("name: production"), "{reason}");
            assert!(output.contains("name: test"));
        }
        other => panic!("expected a failed test, got {other:?}"),
    }
}

#[test]
fn missing_test_procedure_passes_with_a_note() {
    let env = TestEnv::new();
    let manifest = installed_greeter(&env, None);

    let result = test_installed(&env.ctx, &manifest).unwrap();
    assert_eq!(
        result,
        TestResult::Passed {
            output: "no test defined for 'greeter'".to_string()
        }
    );
    assert_eq!(env.runner.count(), 0);
}

#[test]
fn failing_step_becomes_a_failed_result() {
    let env = TestEnv::new();
    let manifest = installed_greeter(
        &env,
        Some(TestProcedure {
            steps: vec![sh("greeter first", vec![]), sh("echo broken; exit 7", vec![])],
            expect_output: Vec::new(),
        }),
    );

    match test_installed(&env.ctx, &manifest).unwrap() {
        TestResult::Failed { reason, output } => {
            assert!(reason.starts_with("step 1 failed"), "{reason}");
            assert!(output.contains("broken"));
        }
        other => panic!("expected a failed test, got {other:?}"),
    }
    // The install itself is untouched.
    assert!(env.ctx.store.get("greeter").unwrap().is_some());
}

#[test]
fn test_steps_run_in_a_scratch_directory() {
    let env = TestEnv::new();
    let manifest = installed_greeter(
        &env,
        Some(TestProcedure {
            steps: vec![
                Step::WriteFile {
                    path: Arg::work_dir("input.txt"),
                    contents: "hello\n".to_string(),
                },
                sh("cat input.txt; pwd", vec![]),
            ],
            expect_output: vec!["hello".to_string(), "testpath".to_string()],
        }),
    );

    let result = test_installed(&env.ctx, &manifest).unwrap();
    assert!(result.passed(), "{result:?}");
    assert_eq!(env.tmp_entries(), 0);
}

#[test]
fn testing_an_uninstalled_target_is_not_found() {
    let env = TestEnv::new();
    let manifest = env.artifact_manifest("ghost", "1.0", &[("bin/ghost", "")]);
    let err = test_installed(&env.ctx, &manifest).unwrap_err();
    assert!(matches!(err, KilnError::NotFound(_)));
}

#[test]
fn run_test_sees_given_dependency_prefixes() {
    let env = TestEnv::new();
    let mut manifest = installed_greeter(&env, None);
    manifest.test = Some(TestProcedure {
        steps: vec![sh("test -d \"$1\" && echo dep-ok", vec![Arg::dependency("helper", "")])],
        expect_output: vec!["dep-ok".to_string()],
    });
    let install_path = env.config.formula_keg_path("greeter", "1.0");
    let helper = env.root.path().join("helper-prefix");
    std::fs::create_dir_all(&helper).unwrap();

    let result = run_test(
        &env.ctx,
        &manifest,
        &install_path,
        &[("helper".to_string(), helper)],
    )
    .unwrap();
    assert!(result.passed(), "{result:?}");
}
