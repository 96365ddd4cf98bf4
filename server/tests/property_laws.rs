//! Property tests for the ledger/tracker dedupe laws and finalizer
//! idempotence.

use proptest::prelude::*;

use dumpscope::models::report::{CrashReport, StackFrame, ThreadInfo};
use dumpscope::services::ai::hypotheses::{HypothesisInput, HypothesisTracker};
use dumpscope::services::ai::ledger::{EvidenceLedger, LedgerItemInput};
use dumpscope::services::finalizer;

fn ledger_inputs() -> impl Strategy<Value = Vec<LedgerItemInput>> {
    prop::collection::vec(
        ("[a-z!]{1,12}", "[a-zA-Z0-9 ]{1,24}").prop_map(|(source, finding)| LedgerItemInput {
            id: None,
            source,
            finding,
        }),
        1..12,
    )
}

proptest! {
    /// Adding the same batch twice never changes the ledger.
    #[test]
    fn ledger_add_is_idempotent(inputs in ledger_inputs()) {
        let mut ledger = EvidenceLedger::default();
        ledger.add_or_update(inputs.clone());
        let before = ledger.snapshot();

        let diff = ledger.add_or_update(inputs);
        prop_assert!(diff.added_ids.is_empty());
        prop_assert!(diff.updated_ids.is_empty());
        prop_assert_eq!(ledger.snapshot().items, before.items);
    }

    /// Registering a hypothesis twice adds it once and reports the original
    /// id the second time.
    #[test]
    fn tracker_register_is_idempotent(text in "[a-zA-Z ]{1,40}") {
        prop_assume!(!text.trim().is_empty());
        let ledger = EvidenceLedger::default();
        let mut tracker = HypothesisTracker::new();

        let first = tracker.register(vec![HypothesisInput {
            hypothesis: text.clone(),
            ..Default::default()
        }], &ledger);
        prop_assert_eq!(first.added_ids.len(), 1);
        let original = first.added_ids[0].clone();

        let second = tracker.register(vec![HypothesisInput {
            hypothesis: text,
            ..Default::default()
        }], &ledger);
        prop_assert!(second.added_ids.is_empty());
        prop_assert_eq!(second.ignored_duplicate_ids, vec![original]);
        prop_assert_eq!(tracker.hypotheses().len(), 1);
    }

    /// Finalize is idempotent for arbitrary frame numberings.
    #[test]
    fn finalize_is_idempotent(frame_numbers in prop::collection::vec(0usize..100, 0..8)) {
        let mut report = CrashReport::default();
        report.analysis.threads.all.push(ThreadInfo {
            thread_id: "1".into(),
            is_faulting: true,
            call_stack: frame_numbers
                .iter()
                .map(|&n| StackFrame {
                    frame_number: n,
                    module: "app".into(),
                    function: format!("fn{n}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        });

        finalizer::finalize(&mut report);
        let once = serde_json::to_value(&report).unwrap();
        finalizer::finalize(&mut report);
        let twice = serde_json::to_value(&report).unwrap();
        prop_assert_eq!(once, twice);
        finalizer::validate(&report).unwrap();
    }
}
