//! Property-based tests for dmc-core
//!
//! These tests verify correctness properties using proptest.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::collections::HashMap;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::actions::generate_pin;
    use crate::correlator::DeviceState;
    use crate::types::{
        ActionKind, ActionRecord, ActionRef, ActionResult, CorrelationId, DeviceId,
        ExpectedProfile, InstalledProfile, InstalledProfileReport,
    };
    use crate::verification::classify;

    fn base_time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_else(Utc::now)
    }

    /// One expected profile plus what the device reported for it.
    #[derive(Debug, Clone)]
    struct ProfileCase {
        /// Install offset relative to `earliest_install_date`, in seconds.
        /// `None` means the device did not report the profile.
        install_offset: Option<i64>,
        counter: Option<u32>,
    }

    fn profile_case() -> impl Strategy<Value = ProfileCase> {
        (
            prop::option::of(-86_400i64..86_400),
            prop::option::of(0u32..4),
        )
            .prop_map(|(install_offset, counter)| ProfileCase {
                install_offset,
                counter,
            })
    }

    fn build(
        cases: &[ProfileCase],
    ) -> (Vec<ExpectedProfile>, InstalledProfileReport, HashMap<String, u32>) {
        let earliest = base_time();
        let mut expected = Vec::new();
        let mut installed = InstalledProfileReport::new();
        let mut counters = HashMap::new();
        for (i, case) in cases.iter().enumerate() {
            let identifier = format!("com.example.profile.{i}");
            expected.push(ExpectedProfile {
                identifier: identifier.clone(),
                earliest_install_date: earliest,
            });
            if let Some(offset) = case.install_offset {
                installed.insert(
                    identifier.clone(),
                    InstalledProfile {
                        install_date: earliest + Duration::seconds(offset),
                    },
                );
            }
            if let Some(counter) = case.counter {
                counters.insert(identifier, counter);
            }
        }
        (expected, installed, counters)
    }

    // Property: every expected profile lands in exactly one set, and the
    // set is determined by install freshness and the retry counter alone.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_classification_is_a_partition(
            cases in prop::collection::vec(profile_case(), 0..12),
            max_retries in 0u32..3,
        ) {
            let (expected, installed, counters) = build(&cases);
            let update = classify(&expected, &installed, &counters, max_retries, base_time());

            prop_assert_eq!(
                update.verified.len() + update.retry.len() + update.failed.len(),
                expected.len()
            );

            for (i, case) in cases.iter().enumerate() {
                let id = format!("com.example.profile.{i}");
                let in_verified = update.verified.contains(&id);
                let in_retry = update.retry.contains(&id);
                let in_failed = update.failed.contains(&id);
                prop_assert_eq!(
                    [in_verified, in_retry, in_failed].iter().filter(|b| **b).count(),
                    1
                );

                let current = matches!(case.install_offset, Some(offset) if offset >= 0);
                let counter = case.counter.unwrap_or(0);
                if current {
                    prop_assert!(in_verified);
                } else if counter < max_retries {
                    prop_assert!(in_retry);
                } else {
                    prop_assert!(in_failed);
                }
            }
        }

        #[test]
        fn test_default_budget_retries_once(
            cases in prop::collection::vec(profile_case(), 1..8),
        ) {
            let (expected, _, counters) = build(&cases);
            let update = classify(&expected, &InstalledProfileReport::new(), &counters, 1, base_time());

            prop_assert!(update.verified.is_empty());
            for (i, case) in cases.iter().enumerate() {
                let id = format!("com.example.profile.{i}");
                if case.counter.unwrap_or(0) >= 1 {
                    prop_assert!(update.failed.contains(&id));
                } else {
                    prop_assert!(update.retry.contains(&id));
                }
            }
        }

        #[test]
        fn test_pin_is_numeric(len in 4usize..=10) {
            let pin = generate_pin(len).unwrap();
            prop_assert_eq!(pin.len(), len);
            prop_assert!(pin.bytes().all(|b| b.is_ascii_digit()));
        }

        #[test]
        fn test_lock_state_follows_last_successful_lock_or_unlock(
            steps in prop::collection::vec((0u8..2, any::<bool>()), 0..20),
        ) {
            let now = base_time();
            let history: Vec<ActionRecord> = steps
                .iter()
                .map(|(kind, ok)| ActionRecord {
                    device_id: DeviceId::new_random(),
                    kind: if *kind == 0 { ActionKind::Lock } else { ActionKind::Unlock },
                    action_ref: ActionRef::NoDelivery { correlation_id: CorrelationId::generate() },
                    unlock_pin: None,
                    requested_at: now,
                    completed_at: now,
                    result: if *ok { ActionResult::Succeeded } else { ActionResult::Failed },
                })
                .collect();

            let expected_locked = steps
                .iter()
                .rev()
                .find(|(_, ok)| *ok)
                .map(|(kind, _)| *kind == 0)
                .unwrap_or(false);

            let state = DeviceState::from_history(&history);
            prop_assert_eq!(state.locked, expected_locked);
            prop_assert!(!state.wiped);
        }
    }
}
