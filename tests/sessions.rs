use std::sync::Arc;

use keepsake::{
    Attribution, EntityRef, Fields, KeepsakeError, KindRegistry, MemoryPersistor, Persistor, SqlitePersistor, Store,
    StoreConfig, Value,
};

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn store() -> (Store, Arc<MemoryPersistor>) {
    let persistor = Arc::new(MemoryPersistor::new());
    let store = Store::new(StoreConfig::default(), KindRegistry::financial(), persistor.clone());
    (store, persistor)
}

fn account(store: &Store, name: &str) -> EntityRef {
    let key = fields(&[("name", name.into()), ("currency", "USD".into())]);
    store.get_or_create("account", key, Fields::new()).unwrap()
}

fn decimal(s: &str) -> Value {
    Value::decimal(s).unwrap()
}

#[test]
fn commit_applies_every_update() {
    let (store, persistor) = store();
    let a = account(&store, "A");
    let b = account(&store, "B");
    let mut session = store.session_as(Attribution::new("alice").because("month end"));
    session.update(&a, "balance", decimal("10")).unwrap();
    session.update(&b, "balance", decimal("20")).unwrap();
    session.update(&a, "balance", decimal("30")).unwrap();
    session.update(&a, "description", "main").unwrap();
    assert_eq!(session.len(), 4);
    // queued, not applied
    assert!(a.field("balance").unwrap().is_null());

    assert_eq!(session.commit().unwrap(), 4);
    assert_eq!(a.field("balance").unwrap(), decimal("30"));
    assert_eq!(b.field("balance").unwrap(), decimal("20"));
    let log = a.log().unwrap();
    assert_eq!(log.len(), 4);
    assert!(log[1..].iter().all(|e| e.who() == "alice" && e.why() == Some("month end")));
    assert_eq!(a.replay().unwrap(), a.record().unwrap());
    // one commit per entity, saved together
    assert_eq!(persistor.commits(), 4);
    assert_eq!(persistor.load().unwrap().iter().map(|p| p.log.len()).sum::<usize>(), 6);
}

#[test]
fn updates_are_checked_when_queued() {
    let (other, _) = store();
    let (store, _) = store();
    let a = account(&store, "A");
    let elsewhere = account(&other, "Elsewhere");
    let mut session = store.session();
    assert!(matches!(session.update(&a, "balance", "plenty"), Err(KeepsakeError::Validation { .. })));
    assert!(matches!(session.update(&a, "name", "B"), Err(KeepsakeError::Validation { .. })));
    assert!(matches!(session.update(&elsewhere, "balance", decimal("1")), Err(KeepsakeError::Validation { .. })));
    assert!(session.is_empty());
}

#[test]
fn one_failure_fails_the_whole_session() {
    let (store, persistor) = store();
    let a = account(&store, "A");
    let b = account(&store, "B");
    let mut session = store.session();
    session.update(&a, "balance", decimal("10")).unwrap();
    session.update(&b, "balance", decimal("20")).unwrap();
    store.retire(&b.uid()).unwrap();
    assert!(matches!(session.commit(), Err(KeepsakeError::RetiredEntity(u)) if u == b.uid()));
    assert!(a.field("balance").unwrap().is_null());
    assert_eq!(a.log().unwrap().len(), 1);
    assert_eq!(persistor.commits(), 3);
}

#[test]
fn failed_saves_change_nothing() {
    let (store, persistor) = store();
    let a = account(&store, "A");
    let b = account(&store, "B");
    let mut session = store.session();
    session.update(&a, "balance", decimal("10")).unwrap();
    session.update(&b, "balance", decimal("20")).unwrap();
    persistor.set_failing(true);
    assert!(matches!(session.commit(), Err(KeepsakeError::Persistence(_))));
    persistor.set_failing(false);
    assert_eq!(a.log().unwrap().len(), 1);
    assert_eq!(b.log().unwrap().len(), 1);
    // history continues from the same place
    a.mutate("balance", decimal("10")).unwrap();
    assert_eq!(a.version().unwrap(), 2);
}

#[test]
fn aborted_and_idle_sessions_write_nothing() {
    let (store, persistor) = store();
    let a = account(&store, "A");
    a.mutate("balance", decimal("5")).unwrap();
    let mut session = store.session();
    session.update(&a, "balance", decimal("6")).unwrap();
    session.abort();
    let mut session = store.session();
    session.update(&a, "balance", decimal("5.00")).unwrap();
    assert_eq!(session.commit().unwrap(), 0);
    assert_eq!(store.session().commit().unwrap(), 0);
    assert_eq!(a.log().unwrap().len(), 2);
    assert_eq!(persistor.commits(), 2);
}

#[test]
fn sessions_survive_a_reopen() {
    let persistor = Arc::new(SqlitePersistor::in_memory().unwrap());
    let store = Store::new(StoreConfig::default(), KindRegistry::financial(), persistor.clone());
    let a = account(&store, "A");
    let b = account(&store, "B");
    let mut session = store.session();
    session.update(&a, "balance", decimal("1")).unwrap();
    session.update(&b, "closed", true).unwrap();
    session.commit().unwrap();

    let reopened = Store::open(StoreConfig::default(), KindRegistry::financial(), persistor).unwrap();
    assert_eq!(reopened.verify().unwrap(), 2);
    assert_eq!(reopened.get(&a.uid()).unwrap().record().unwrap(), a.record().unwrap());
    assert_eq!(reopened.get(&b.uid()).unwrap().field("closed").unwrap(), Value::Boolean(true));
}
