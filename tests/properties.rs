use csv_translator::{
    batch::BatchPlanner,
    schema::{ColumnRequest, ColumnSet, merge_schema},
    table::Table,
};
use proptest::prelude::*;

fn column_request() -> impl Strategy<Value = ColumnRequest> {
    let name = prop::sample::select(vec!["A", "B", "English", "Refined", "Errors", "X_Marker"]);
    let anchor = prop::option::of(prop::sample::select(vec!["A", "English", "Missing"]));
    (name, anchor).prop_map(|(name, anchor)| match anchor {
        Some(anchor) => ColumnRequest::after(name, anchor),
        None => ColumnRequest::append(name),
    })
}

proptest! {
    #[test]
    fn planner_covers_every_row_once_in_order(total in 0usize..500, size in 1usize..64) {
        let planner = BatchPlanner::new(total, size).expect("planner");
        let covered = planner
            .batches_from(0)
            .flat_map(|batch| batch.range())
            .collect::<Vec<_>>();
        prop_assert_eq!(covered, (0..total).collect::<Vec<_>>());
        prop_assert!(planner.batches_from(0).all(|batch| batch.len >= 1 && batch.len <= size));
    }

    #[test]
    fn planner_resumes_at_processed_count(total in 0usize..200, size in 1usize..32, k in 0usize..200) {
        let planner = BatchPlanner::new(total, size).expect("planner");
        let k = k.min(total);
        let first = planner.batches_from(k).next().map(|batch| batch.offset);
        prop_assert_eq!(first, (k < total).then_some(k));
        prop_assert!(planner.batches_from(k).all(|batch| batch.offset >= k));
    }

    #[test]
    fn merging_twice_equals_merging_once(requests in prop::collection::vec(column_request(), 0..8)) {
        let mut once = ColumnSet::from_headers(["Japanese", "A"]);
        once.apply(&requests);
        let mut twice = once.clone();
        let changes = twice.apply(&requests);
        prop_assert!(changes.is_empty());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merged_rows_are_rectangular(requests in prop::collection::vec(column_request(), 0..6), processed in 0usize..4) {
        let mut table = Table::from_records(
            vec!["Japanese".into(), "A".into()],
            (0..3).map(|i| vec![format!("行{i}"), String::new()]).collect(),
        )
        .expect("table");
        merge_schema(&mut table, &requests, processed);
        for row in &table.rows[..processed.min(3)] {
            prop_assert!(table.columns.iter().all(|name| row.contains_key(name)));
        }
    }
}
