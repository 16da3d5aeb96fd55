//! Global subscriber installation

use stratum_log::{Config, LogError, init_test, init_with};

#[test]
fn second_install_reports_init_error_and_test_init_stays_quiet() {
    let _first = init_test().expect("first install");

    // A subscriber is now set: explicit installs fail, test installs no-op.
    let err = init_with(Config::test()).expect_err("already installed");
    assert!(matches!(err, LogError::Init(_)));
    assert!(init_test().is_ok());

    stratum_log::info!(target: "os::vm", size = 4096_usize, "event after install");
}
