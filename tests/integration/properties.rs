#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use sqldao::batch::chunk_ranges;
use sqldao::bind::ValueResolver;
use sqldao::merge::merge_all;
use sqldao::{compile, BindOptions, Binder, BindingContext, Row, TemplateCache, Value};

fn arb_piece() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z0-9 ,=<>()*]{1,12}",
        "[a-z_][a-z0-9_]{0,6}".prop_map(|name| format!(":{name}")),
        ("[a-z_][a-z0-9_]{0,6}", "[a-z][a-z0-9]{0,4}").prop_map(|(n, p)| format!(":{n}.{p}")),
        "[a-z_][a-z0-9_]{0,6}".prop_map(|name| format!("{{{name}}}")),
        ("[a-z_][a-z0-9_]{0,6}", "[a-z ]{0,8}").prop_map(|(n, d)| format!("{{{n} -> {d}}}")),
        "[a-z :{}]{0,8}".prop_map(|s| format!("'{s}'")),
        Just("::int".to_owned()),
        Just("\\:".to_owned()),
    ]
}

fn arb_template() -> impl Strategy<Value = String> {
    // A separator keeps adjacent pieces from fusing into one identifier.
    prop::collection::vec(arb_piece(), 0..12).prop_map(|pieces| pieces.join(" "))
}

proptest! {
    #[test]
    fn prop_compile_round_trips(sql in arb_template()) {
        let template = compile(&sql).unwrap();
        prop_assert_eq!(template.to_source(), sql.clone());
        prop_assert_eq!(compile(&sql).unwrap(), template);
    }

    #[test]
    fn prop_chunks_cover_units_in_order(len in 0usize..200, batch_size in 1usize..50) {
        let ranges = chunk_ranges(len, batch_size);
        let flat: Vec<usize> = ranges.iter().cloned().flatten().collect();
        prop_assert_eq!(flat, (0..len).collect::<Vec<_>>());
        for (i, range) in ranges.iter().enumerate() {
            prop_assert_eq!(range.start, i * batch_size);
            if i + 1 < ranges.len() {
                prop_assert_eq!(range.len(), batch_size);
            }
        }
    }

    #[test]
    fn prop_placeholders_match_values(
        ids in prop::collection::vec(any::<i64>(), 0..20),
        flag in any::<bool>(),
    ) {
        let binder = Binder::new(Arc::new(TemplateCache::new()), Arc::new(ValueResolver));
        let template = compile("SELECT * FROM t WHERE id IN (:ids) AND flag = :flag").unwrap();
        let ctx = BindingContext::new()
            .with_param("ids", ids.iter().copied().map(Value::Int).collect::<Vec<_>>())
            .with_param("flag", flag);
        let plan = binder.bind(&template, &ctx, &BindOptions::default()).unwrap();
        prop_assert_eq!(plan.sql().matches('?').count(), plan.placeholder_count());
        prop_assert_eq!(plan.placeholder_count(), ids.len() + 1);
    }

    #[test]
    fn prop_grouped_rows_merge_to_distinct_keys(groups in prop::collection::vec(1usize..5, 0..20)) {
        let header: Arc<[String]> = vec!["id".to_owned(), "tag".to_owned()].into();
        let rows: Vec<_> = groups
            .iter()
            .enumerate()
            .flat_map(|(id, &n)| {
                let header = Arc::clone(&header);
                (0..n).map(move |t| {
                    Ok(Row::new(
                        Arc::clone(&header),
                        vec![Value::Int(id as i64), Value::from(format!("t{t}"))],
                    ))
                })
            })
            .collect();
        let spec = sqldao::IdentitySpec::new(["id"])
            .nested(sqldao::NestedSpec::scalar("tags", "tag"));
        let entities = merge_all(rows, spec).unwrap();
        prop_assert_eq!(entities.len(), groups.len());
        for (entity, &n) in entities.iter().zip(&groups) {
            let tags = entity.as_object().unwrap()["tags"].as_list().unwrap().len();
            prop_assert_eq!(tags, n);
        }
    }
}
