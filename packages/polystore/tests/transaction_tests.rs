//! Transaction context visibility tests

use polystore::{
    ClassDeclaration, CountOptions, ErrorKind, FindOptions, GetOptions, Instance, PutOptions,
    StorageError, Store, StoreConfig,
};
use serde_json::json;

fn store() -> Store {
    Store::open(
        StoreConfig::new("ledger", "memory:")
            .with_class(ClassDeclaration::new("Account").with_index("owner"))
            .with_class(ClassDeclaration::new("Entry")),
    )
    .unwrap()
}

fn instance(value: serde_json::Value) -> Instance {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_writes_visible_inside_before_commit_and_outside_after() {
    let store = store();
    let root = store.clone();

    store
        .transaction(|tx| async move {
            tx.put(&["Account"], "acc-1", &instance(json!({"owner": "ann"})), PutOptions::default())
                .await?;

            let inside = tx.get("Account", "acc-1", GetOptions::default()).await?;
            assert!(inside.is_some());
            assert_eq!(tx.count("Account", CountOptions::new()).await?, 1);

            let outside = root
                .get("Account", "acc-1", GetOptions::allow_missing())
                .await?;
            assert!(outside.is_none());
            Ok(())
        })
        .await
        .unwrap();

    let after = store
        .get("Account", "acc-1", GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.instance, instance(json!({"owner": "ann"})));
}

#[tokio::test]
async fn test_failed_callback_discards_every_write() {
    let store = store();
    store
        .put(&["Entry"], "e-1", &Instance::new(), PutOptions::default())
        .await
        .unwrap();

    let err = store
        .transaction(|tx| async move {
            tx.put(&["Entry"], "e-2", &Instance::new(), PutOptions::default())
                .await?;
            tx.delete("Entry", "e-1", Default::default()).await?;
            tx.find_and_delete("Entry", FindOptions::new()).await?;
            Err::<(), _>(StorageError::validation("insufficient funds"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    let entries = store.find("Entry", FindOptions::new()).await.unwrap();
    let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["e-1"]);
}

#[tokio::test]
async fn test_membership_error_inside_transaction_rolls_back() {
    let store = store();
    store
        .put(&["Entry"], "e-1", &Instance::new(), PutOptions::default())
        .await
        .unwrap();

    let result = store
        .transaction(|tx| async move {
            tx.put(&["Account"], "acc-2", &Instance::new(), PutOptions::default())
                .await?;
            tx.get("Account", "e-1", GetOptions::default()).await
        })
        .await;
    assert_eq!(result.unwrap_err().kind, ErrorKind::Membership);

    assert!(store
        .get("Account", "acc-2", GetOptions::allow_missing())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_transaction_returns_callback_value() {
    let store = store();
    let total = store
        .transaction(|tx| async move {
            for i in 0..3 {
                tx.put(
                    &["Entry"],
                    &format!("e-{}", i),
                    &instance(json!({"amount": i * 10})),
                    PutOptions::default(),
                )
                .await?;
            }
            tx.count("Entry", CountOptions::new()).await
        })
        .await
        .unwrap();

    assert_eq!(total, 3);
    assert!(!store.in_transaction());
}
