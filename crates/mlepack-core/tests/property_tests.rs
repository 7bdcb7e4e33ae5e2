//! # Property-Based Tests
//!
//! Generation and row-mapping invariants checked with proptest.

use mlepack_core::{
    ArtifactGenerator, FunctionDescriptor, MleError, Parameter, RowMapper, RowSet, Type,
};
use proptest::collection::vec;
use proptest::prelude::*;
use serde_json::{Value, json};

fn concrete_type() -> impl Strategy<Value = Type> {
    prop_oneof![Just(Type::String), Just(Type::Number)]
}

fn any_return_type() -> impl Strategy<Value = Type> {
    prop_oneof![Just(Type::String), Just(Type::Number), Just(Type::None)]
}

fn descriptor() -> impl Strategy<Value = FunctionDescriptor> {
    (
        "[a-z][a-z0-9_]{0,10}",
        vec(("[a-z][a-z0-9]{0,6}", concrete_type()), 0..5),
        any_return_type(),
    )
        .prop_map(|(name, params, ret)| {
            let params = params
                .into_iter()
                .map(|(n, t)| Parameter::new(n, t))
                .collect();
            FunctionDescriptor::new(name, params, ret)
        })
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Concrete parameter types always generate, one wrapper per descriptor.
    #[test]
    fn concrete_descriptors_always_generate(descriptors in vec(descriptor(), 0..8)) {
        let artifact = ArtifactGenerator::default()
            .generate("bundle", &descriptors)
            .expect("generate");

        prop_assert_eq!(artifact.wrappers().len(), descriptors.len());
        for (wrapper, d) in artifact.wrappers().iter().zip(&descriptors) {
            prop_assert_eq!(&wrapper.function, &d.name);
            prop_assert_eq!(wrapper.sql.contains("PROCEDURE"), d.is_procedure());
        }
    }

    /// A `None` parameter anywhere fails the whole generation call.
    #[test]
    fn none_parameter_always_fails(
        mut descriptors in vec(descriptor(), 1..6),
        victim in any::<prop::sample::Index>(),
        arity in 0usize..4,
    ) {
        let idx = victim.index(descriptors.len());
        let target = &mut descriptors[idx];
        let at = arity.min(target.parameters.len());
        target.parameters.insert(at, Parameter::new("broken", Type::None));

        let result = ArtifactGenerator::default().generate("bundle", &descriptors);
        let is_untypeable = matches!(
            result,
            Err(MleError::UntypeableParameter { ref parameter, .. }) if parameter == "broken"
        );
        prop_assert!(is_untypeable);
    }

    /// Folding by hand over `eject` matches `reduce`.
    #[test]
    fn reduce_agrees_with_ejected_rows(ids in vec(-1000i64..1000, 0..40)) {
        let rows = ids.iter().map(|id| vec![json!(id), json!(format!("n{id}"))]).collect();
        let mapper = RowMapper::new(RowSet {
            columns: vec!["ID".into(), "NAME".into()],
            rows,
        })
        .map(|mut r| {
            let doubled = r.get("id").and_then(Value::as_i64).map_or(0, |v| v * 2);
            r.insert("id".into(), json!(doubled));
            r
        });

        let reduced = mapper.reduce(
            |acc, r| acc + r.get("id").and_then(Value::as_i64).unwrap_or(0),
            0i64,
        );
        prop_assert!(!mapper.is_materialized());

        let by_hand: i64 = mapper
            .eject()
            .iter()
            .map(|r| r.get("id").and_then(Value::as_i64).unwrap_or(0))
            .sum();
        prop_assert_eq!(reduced, by_hand);
        prop_assert_eq!(by_hand, ids.iter().sum::<i64>() * 2);
    }
}
