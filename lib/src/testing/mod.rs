//! In-tree test harness.
//!
//! Test functions return [`TestResult`] and live in `*_tests.rs` modules
//! next to the code under test. Suites are plain `run() -> (passed, total)`
//! entry points built from [`run_test!`]; the `rill-tests` crate registers
//! every suite and a host integration test fails if any of them fail.

/// Outcome of a single test function.
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

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

/// Result of executing one suite.
#[derive(Clone, Copy, Debug)]
pub struct TestSuiteResult {
    pub name: &'static str,
    pub total: u32,
    pub passed: u32,
}

impl TestSuiteResult {
    pub const fn new(name: &'static str) -> Self {
        Self { name, total: 0, passed: 0 }
    }

    pub fn fill(&mut self, passed: u32, total: u32) {
        self.passed = passed;
        self.total = total;
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// A registered suite: a name and its runner.
#[derive(Clone, Copy)]
pub struct TestSuiteDesc {
    pub name: &'static str,
    pub run: fn() -> (u32, u32),
}

/// Run one test function, logging its name and outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => crate::klog_debug!("TEST PASS: {}", name),
        TestResult::Skipped => crate::klog_debug!("TEST SKIP: {}", name),
        TestResult::Fail => crate::klog_error!("TEST FAIL: {}", name),
    }
    result
}

/// Succeed.
#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

/// Fail, logging an explanation.
#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_error!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_error!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

/// Fail the enclosing test unless `cond` holds.
#[macro_export]
macro_rules! assert_test {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            return $crate::fail!($msg);
        }
    };
    ($cond:expr) => {
        if !($cond) {
            return $crate::fail!(stringify!($cond));
        }
    };
}

/// Fail the enclosing test unless `left == right`.
#[macro_export]
macro_rules! assert_eq_test {
    ($left:expr, $right:expr, $msg:expr) => {{
        let l = $left;
        let r = $right;
        if l != r {
            return $crate::fail!("{}: {:?} != {:?}", $msg, l, r);
        }
    }};
    ($left:expr, $right:expr) => {
        $crate::assert_eq_test!($left, $right, stringify!($left == $right))
    };
}

/// Run a test function inside a suite, updating the pass/total counters.
#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:expr) => {{
        $total += 1;
        let result =
            $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
        result
    }};
}
