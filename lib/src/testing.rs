//! In-kernel test harness.
//!
//! Hosted logic is covered by ordinary `#[cfg(test)]` modules; this
//! harness exists for the paths that need a live CPU — ring transitions,
//! preemption, real IRQs. Suites are built with [`define_test_suite!`],
//! compiled under the `builtin-tests` feature of `catos_kernel`, and run
//! from `kernel_main` after bring-up, reporting through klog.

use crate::klog_info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }
}

/// Run one test function, logging its outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => klog_info!("TEST pass: {}", name),
        TestResult::Skipped => klog_info!("TEST skip: {}", name),
        TestResult::Fail => klog_info!("TEST FAIL: {}", name),
    }
    result
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TestSuiteResult {
    pub name: &'static str,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

#[derive(Clone, Copy)]
pub struct TestSuiteDesc {
    pub name: &'static str,
    pub run: fn() -> TestSuiteResult,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TestRunSummary {
    pub suites: u32,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestRunSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Run every suite in `suites` and log a combined summary.
pub fn run_suites(suites: &[&TestSuiteDesc]) -> TestRunSummary {
    let mut summary = TestRunSummary::default();
    for desc in suites {
        let result = (desc.run)();
        summary.suites += 1;
        summary.total += result.total;
        summary.passed += result.passed;
        summary.failed += result.failed;
        klog_info!(
            "TEST suite {}: {}/{} passed",
            result.name,
            result.passed,
            result.total
        );
    }
    klog_info!(
        "TEST summary: {} suites, {}/{} passed",
        summary.suites,
        summary.passed,
        summary.total
    );
    summary
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

/// Fail the enclosing test unless `cond` holds.
#[macro_export]
macro_rules! assert_test {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return $crate::fail!($msg);
        }
    };
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:path) => {{
        $total += 1;
        if $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()).is_pass() {
            $passed += 1;
        }
    }};
}

/// Define a suite runner plus its static descriptor:
///
/// ```ignore
/// define_test_suite!(sched, [test_yield_rotates, test_block_unblock]);
/// // generates `run_sched_suite()` and `static SCHED_SUITE: TestSuiteDesc`
/// ```
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            pub fn [<run_ $suite_name _suite>]() -> $crate::testing::TestSuiteResult {
                let mut passed = 0u32;
                let mut total = 0u32;
                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*
                $crate::testing::TestSuiteResult {
                    name: stringify!($suite_name),
                    total,
                    passed,
                    failed: total.saturating_sub(passed),
                }
            }

            pub static [<$suite_name:upper _SUITE>]: $crate::testing::TestSuiteDesc =
                $crate::testing::TestSuiteDesc {
                    name: stringify!($suite_name),
                    run: [<run_ $suite_name _suite>],
                };
        }
    };
}
