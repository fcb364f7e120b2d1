//! State tests
//!
//! These cover:
//! - Pool maintenance around query, label and delete
//! - Snapshot replacement and exclusion of labeled records
//! - Audit trail and dirty tracking for retraining

use super::*;
use chrono::TimeZone;
use serde_json::json;
use tempfile::TempDir;

fn models() -> ModelNames {
    ModelNames {
        classifier: Some("nb".to_string()),
        querier: Some("max".to_string()),
        balancer: Some("balanced".to_string()),
        feature_extractor: Some("tfidf".to_string()),
    }
}

/// State with priors 1 (relevant) and 2 (irrelevant) and a snapshot over 3..=7
fn seeded_state() -> State {
    let mut state = State::in_memory().unwrap();
    state
        .add_labeling_data(&[1, 2], &[Label::Relevant, Label::Irrelevant], None, None)
        .unwrap();
    state
        .add_last_ranking(&[7, 3, 6, 4, 5], &models(), 2)
        .unwrap();
    state
}

fn rankings(state: &State) -> Vec<(i64, i64)> {
    state
        .get_last_ranking_table()
        .unwrap()
        .into_iter()
        .map(|r| (r.record_id, r.ranking))
        .collect()
}

mod labeling_tests {
    use super::*;

    #[test]
    fn test_priors_and_labeled() {
        let state = seeded_state();
        assert_eq!(state.n_labeled().unwrap(), 2);
        assert_eq!(state.get_priors().unwrap().len(), 2);
        assert_eq!(state.get_labeled().unwrap().len(), 2);
        assert_eq!(state.n_pending().unwrap(), 0);
    }

    #[test]
    fn test_length_mismatch_changes_nothing() {
        let mut state = State::in_memory().unwrap();
        let err = state
            .add_labeling_data(&[1, 2], &[Label::Relevant], None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            SiftError::LengthMismatch {
                record_ids: 2,
                labels: 1,
                tags: 2
            }
        ));

        let tags = [Some(json!(["a"]))];
        assert!(state
            .add_labeling_data(&[1, 2], &[Label::Relevant, Label::Irrelevant], Some(&tags), None)
            .is_err());
        assert!(state.get_results_table().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_in_batch_rolls_back() {
        let mut state = State::in_memory().unwrap();
        let err = state
            .add_labeling_data(
                &[4, 5, 4],
                &[Label::Relevant, Label::Irrelevant, Label::Irrelevant],
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SiftError::DuplicateRecord(4)));
        assert_eq!(state.n_labeled().unwrap(), 0);
    }

    #[test]
    fn test_relabel_is_audited() {
        let mut state = seeded_state();
        state
            .add_labeling_data(&[2], &[Label::Irrelevant], None, None)
            .unwrap();
        assert!(state.get_decision_changes().unwrap().is_empty());

        state
            .add_labeling_data(&[2], &[Label::Relevant], None, Some(9))
            .unwrap();
        let changes = state.get_decision_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].record_id, 2);
        assert_eq!(changes[0].new_label, Some(Label::Relevant));
        assert_eq!(state.get_results_record(2).unwrap().user_id, Some(9));
    }

    #[test]
    fn test_labeling_pending_keeps_model_attribution() {
        let mut state = seeded_state();
        assert_eq!(state.query_top_ranked(2, Some(3)).unwrap(), vec![7, 3]);
        assert_eq!(state.get_pending(Some(3)).unwrap().len(), 2);
        assert!(state.get_pending(Some(4)).unwrap().is_empty());

        let tags = [Some(json!({"reason": "method"}))];
        state
            .add_labeling_data(&[7], &[Label::Relevant], Some(&tags), None)
            .unwrap();

        let row = state.get_results_record(7).unwrap();
        assert_eq!(row.label, Some(Label::Relevant));
        assert_eq!(row.models, models());
        assert_eq!(row.training_set, Some(2));
        assert_eq!(row.user_id, Some(3));
        assert_eq!(row.tags, Some(json!({"reason": "method"})));
        assert!(!row.is_prior());

        // Labeled records leave the snapshot; the rest stay dense
        assert_eq!(rankings(&state), vec![(3, 0), (6, 1), (4, 2), (5, 3)]);
        assert_eq!(state.get_pool().unwrap(), vec![6, 4, 5]);
    }

    #[test]
    fn test_update_audits_every_call() {
        let mut state = seeded_state();
        state.update(1, Some(Label::Relevant), None).unwrap();
        state
            .update(1, Some(Label::Irrelevant), Some(json!(["x"])))
            .unwrap();
        state.update(1, None, None).unwrap();

        assert_eq!(state.get_decision_changes().unwrap().len(), 3);
        let row = state.get_results_record(1).unwrap();
        assert!(row.is_pending());
        assert_eq!(row.tags, Some(json!(["x"])));
    }

    #[test]
    fn test_update_missing_record() {
        let mut state = seeded_state();
        assert!(matches!(
            state.update(42, Some(Label::Relevant), None),
            Err(SiftError::RecordNotFound(42))
        ));
        assert!(matches!(
            state.update_note(42, Some("n")),
            Err(SiftError::RecordNotFound(42))
        ));
        assert!(state.get_decision_changes().unwrap().is_empty());
    }

    #[test]
    fn test_update_note() {
        let mut state = seeded_state();
        state.update_note(1, Some("seed paper")).unwrap();
        assert_eq!(
            state.get_results_record(1).unwrap().note.as_deref(),
            Some("seed paper")
        );
    }
}

mod pool_tests {
    use super::*;

    #[test]
    fn test_query_top_ranked_exhausted_changes_nothing() {
        let mut state = State::in_memory().unwrap();
        state.add_last_ranking(&[10, 11, 12], &models(), 0).unwrap();
        let before_results = state.get_results_table().unwrap();
        let before_ranking = state.get_last_ranking_table().unwrap();

        let err = state.query_top_ranked(5, None).unwrap_err();
        assert!(matches!(
            err,
            SiftError::PoolExhausted {
                requested: 5,
                available: 3
            }
        ));
        assert_eq!(state.get_results_table().unwrap(), before_results);
        assert_eq!(state.get_last_ranking_table().unwrap(), before_ranking);
    }

    #[test]
    fn test_deleted_record_returns_to_pool() {
        let mut state = seeded_state();
        state.delete_record_labeling_data(1).unwrap();

        assert!(state.get_pool().unwrap().contains(&1));
        assert_eq!(*state.get_pool().unwrap().last().unwrap(), 1);
        let changes = state.get_decision_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].record_id, 1);
        assert_eq!(changes[0].new_label, None);

        let restored = rankings(&state);
        assert_eq!(restored.last(), Some(&(1, 5)));
        let snapshot = state.get_last_ranking_table().unwrap();
        assert!(snapshot.last().unwrap().models.is_empty());
    }

    #[test]
    fn test_delete_without_snapshot_starts_one() {
        let mut state = State::in_memory().unwrap();
        state
            .add_labeling_data(&[3], &[Label::Relevant], None, None)
            .unwrap();
        state.delete_record_labeling_data(3).unwrap();
        assert_eq!(state.get_pool().unwrap(), vec![3]);
        assert!(matches!(
            state.delete_record_labeling_data(3),
            Err(SiftError::RecordNotFound(3))
        ));
    }

    #[test]
    fn test_add_last_ranking_is_idempotent_and_excludes_results() {
        let mut state = seeded_state();
        let ids = [9, 1, 8, 9, 2, 3];
        state.add_last_ranking(&ids, &models(), 2).unwrap();
        let first = rankings(&state);
        state.add_last_ranking(&ids, &models(), 2).unwrap();
        assert_eq!(rankings(&state), first);
        assert_eq!(first, vec![(9, 0), (8, 1), (3, 2)]);
    }

    #[test]
    fn test_pending_records_are_not_in_pool() {
        let mut state = seeded_state();
        state.query_top_ranked(1, None).unwrap();
        assert_eq!(state.get_pool().unwrap(), vec![3, 6, 4, 5]);
        assert_eq!(state.n_pending().unwrap(), 1);
    }
}

mod dirty_tracking_tests {
    use super::*;

    #[test]
    fn test_no_snapshot() {
        let mut state = State::in_memory().unwrap();
        assert!(!state.exist_new_labeled_records().unwrap());
        state
            .add_labeling_data(&[1], &[Label::Relevant], None, None)
            .unwrap();
        assert!(state.exist_new_labeled_records().unwrap());
    }

    #[test]
    fn test_new_labels_after_snapshot() {
        let mut state = seeded_state();
        assert!(!state.exist_new_labeled_records().unwrap());
        state
            .add_labeling_data(&[5], &[Label::Irrelevant], None, None)
            .unwrap();
        assert!(state.exist_new_labeled_records().unwrap());
    }

    #[test]
    fn test_label_change_marks_dirty() {
        let mut state = seeded_state();
        state.update(2, Some(Label::Relevant), None).unwrap();
        assert_eq!(state.n_labeled().unwrap(), 2);
        assert!(state.exist_new_labeled_records().unwrap());

        state.add_last_ranking(&[3, 4, 5, 6, 7], &models(), 2).unwrap();
        assert!(!state.exist_new_labeled_records().unwrap());
    }
}

mod persistence_tests {
    use super::*;

    #[test]
    fn test_results_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let time = Utc.timestamp_micros(1_700_000_000_123_456).unwrap();
        let rows = vec![
            ResultRow {
                time: Some(time),
                ..ResultRow::prior(5, Label::Irrelevant)
            },
            ResultRow {
                record_id: 3,
                label: Some(Label::Relevant),
                models: models(),
                training_set: Some(1),
                time: Some(time),
                note: Some("found it".to_string()),
                tags: Some(json!({"k": [1, 2]})),
                user_id: Some(2),
            },
        ];

        {
            let mut state = State::open(&path).unwrap();
            state.write_results(&rows).unwrap();
        }
        let state = State::open(&path).unwrap();
        assert_eq!(state.get_results_table().unwrap(), rows);
    }

    #[test]
    fn test_write_results_rejects_duplicates() {
        let mut state = State::in_memory().unwrap();
        let rows = vec![
            ResultRow::prior(1, Label::Relevant),
            ResultRow::prior(1, Label::Irrelevant),
        ];
        assert!(matches!(
            state.write_results(&rows),
            Err(SiftError::DuplicateRecord(1))
        ));
        assert!(state.get_results_table().unwrap().is_empty());
    }
}
