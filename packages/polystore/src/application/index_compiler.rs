//! Class Index Compiler
//!
//! All classes share one physical collection. Every class contributes:
//! 1. a class-only index keyed by its membership predicate `<Class>?`
//! 2. one index per declared index, with the membership predicate prepended
//!
//! So any class-scoped query has an index whose first segment is "member of
//! this class", and declared orderings stay usable inside that scope.

use crate::domain::{ClassDeclaration, CollectionSpec, IndexDeclaration, IndexKey};

/// Physical collection backing every class
pub const INSTANCES_COLLECTION: &str = "$Instances";

/// Reserved document field holding the ordered class list
pub const CLASSES_FIELD: &str = "_classes";

/// Query name of a class membership predicate
pub fn membership_key(class: &str) -> String {
    format!("{}?", class)
}

pub fn membership_index_key(class: &str) -> IndexKey {
    IndexKey::Membership {
        name: membership_key(class),
        field: CLASSES_FIELD.to_string(),
        member: class.to_string(),
    }
}

/// Flatten class declarations into index declarations
///
/// Declaration order is preserved and nothing is deduplicated.
pub fn compile_indexes(classes: &[ClassDeclaration]) -> Vec<IndexDeclaration> {
    let mut indexes = Vec::new();

    for class in classes {
        let predicate = membership_index_key(&class.name);

        indexes.push(IndexDeclaration {
            name: index_name(std::slice::from_ref(&predicate)),
            keys: vec![predicate.clone()],
            projection: None,
        });

        for spec in &class.indexes {
            let mut keys = vec![predicate.clone()];
            keys.extend(spec.properties().into_iter().map(IndexKey::Property));

            let projection = spec.projection().map(|projection| {
                let mut projection = projection.to_vec();
                if !projection.iter().any(|p| p == CLASSES_FIELD) {
                    projection.push(CLASSES_FIELD.to_string());
                }
                projection
            });

            indexes.push(IndexDeclaration {
                name: index_name(&keys),
                keys,
                projection,
            });
        }
    }

    indexes
}

/// Collection declaration for the instances collection
pub fn instances_collection(classes: &[ClassDeclaration]) -> CollectionSpec {
    CollectionSpec::new(INSTANCES_COLLECTION).with_indexes(compile_indexes(classes))
}

fn index_name(keys: &[IndexKey]) -> String {
    keys.iter().map(IndexKey::name).collect::<Vec<_>>().join("+")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IndexSpec;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn property(name: &str) -> IndexKey {
        IndexKey::Property(name.to_string())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Compilation Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_compile_account_person_company() {
        let classes = vec![
            ClassDeclaration::new("Account"),
            ClassDeclaration::new("Person")
                .with_index("accountNumber")
                .with_index("country"),
            ClassDeclaration::new("Company"),
        ];

        let indexes = compile_indexes(&classes);
        let names: Vec<_> = indexes.iter().map(|i| i.name.as_str()).collect();

        assert_eq!(
            names,
            vec![
                "Account?",
                "Person?",
                "Person?+accountNumber",
                "Person?+country",
                "Company?",
            ]
        );
        assert_eq!(
            indexes[3].keys,
            vec![membership_index_key("Person"), property("country")]
        );
    }

    #[test]
    fn test_class_without_indexes_gets_one() {
        let indexes = compile_indexes(&[ClassDeclaration::new("Tag")]);
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].keys, vec![membership_index_key("Tag")]);
        assert_eq!(indexes[0].projection, None);
    }

    #[test]
    fn test_compound_index_keeps_property_order() {
        let classes =
            vec![ClassDeclaration::new("Person").with_index(vec!["lastName", "firstName"])];
        let indexes = compile_indexes(&classes);

        assert_eq!(
            indexes[1].keys,
            vec![
                membership_index_key("Person"),
                property("lastName"),
                property("firstName"),
            ]
        );
    }

    #[test]
    fn test_projection_gets_class_field() {
        let classes = vec![ClassDeclaration::new("Person").with_index(IndexSpec::Detailed {
            properties: vec!["country".into()],
            projection: Some(vec!["firstName".into()]),
        })];
        let indexes = compile_indexes(&classes);

        assert_eq!(
            indexes[1].projection,
            Some(vec!["firstName".to_string(), CLASSES_FIELD.to_string()])
        );
    }

    #[test]
    fn test_duplicate_declarations_not_deduplicated() {
        let classes = vec![ClassDeclaration::new("Person")
            .with_index("country")
            .with_index("country")];
        let indexes = compile_indexes(&classes);

        assert_eq!(indexes.len(), 3);
        assert_eq!(indexes[1], indexes[2]);
    }

    #[test]
    fn test_membership_key() {
        assert_eq!(membership_key("Person"), "Person?");
        assert_eq!(membership_index_key("Person").name(), "Person?");
    }

    #[test]
    fn test_instances_collection() {
        let collection = instances_collection(&[ClassDeclaration::new("Account")]);
        assert_eq!(collection.name, INSTANCES_COLLECTION);
        assert!(collection.computed_keys().contains_key("Account?"));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Property Tests
    // ═══════════════════════════════════════════════════════════════════════

    fn class_strategy() -> impl Strategy<Value = ClassDeclaration> {
        (
            "[A-Z][a-z]{1,8}",
            prop::collection::vec(prop::collection::vec("[a-z]{1,6}", 1..4), 0..4),
        )
            .prop_map(|(name, indexes)| ClassDeclaration {
                name,
                indexes: indexes.into_iter().map(IndexSpec::Properties).collect(),
            })
    }

    proptest! {
        #[test]
        fn prop_every_index_is_scoped_to_its_class(
            classes in prop::collection::vec(class_strategy(), 0..6)
        ) {
            let indexes = compile_indexes(&classes);
            let expected: usize = classes.iter().map(|c| 1 + c.indexes.len()).sum();
            prop_assert_eq!(indexes.len(), expected);

            let mut cursor = indexes.iter();
            for class in &classes {
                let class_only = cursor.next().unwrap();
                prop_assert_eq!(&class_only.keys, &vec![membership_index_key(&class.name)]);

                for spec in &class.indexes {
                    let index = cursor.next().unwrap();
                    prop_assert_eq!(&index.keys[0], &membership_index_key(&class.name));
                    let rest: Vec<String> =
                        index.keys[1..].iter().map(|k| k.name().to_string()).collect();
                    prop_assert_eq!(rest, spec.properties());
                }
            }
        }
    }
}
