//! Test-suite registry.
//!
//! Every in-tree suite of the networking core is listed here; `run_all`
//! executes them in order and reports an aggregate. The host integration
//! test drives this and fails if anything does.

#![no_std]

use rill_lib::testing::{TestSuiteDesc, TestSuiteResult};

/// All registered suites, in execution order. Earlier suites exercise the
/// leaves later ones build on.
pub const SUITES: &[TestSuiteDesc] = &[
    TestSuiteDesc { name: "pkt", run: rill_net::pkt_tests::run },
    TestSuiteDesc { name: "softnet", run: rill_net::softnet_tests::run },
    TestSuiteDesc { name: "qdisc", run: rill_net::qdisc_tests::run },
    TestSuiteDesc { name: "cbq", run: rill_net::cbq_tests::run },
    TestSuiteDesc { name: "unix", run: rill_net::unix_tests::run },
];

/// Aggregate outcome of a full run.
#[derive(Clone, Copy, Debug)]
pub struct RunSummary {
    pub suites: usize,
    pub passed: u32,
    pub total: u32,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// Run every suite, reporting per-suite results through `report`.
pub fn run_all(mut report: impl FnMut(&TestSuiteResult)) -> RunSummary {
    let mut summary = RunSummary { suites: 0, passed: 0, total: 0 };
    for suite in SUITES {
        let (passed, total) = (suite.run)();
        let mut result = TestSuiteResult::new(suite.name);
        result.fill(passed, total);
        report(&result);
        summary.suites += 1;
        summary.passed += passed;
        summary.total += total;
    }
    summary
}
