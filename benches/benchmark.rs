use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use keepsake::identity::derive;
use keepsake::kind::{Account, Instrument};
use keepsake::{Fields, KindRegistry, MemoryPersistor, Store, StoreConfig, Value};

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn identity_benchmark(c: &mut Criterion) {
    let account = fields(&[("name", "Brokerage ".into()), ("currency", "USD".into())]);
    let instrument = fields(&[
        ("isin", "US0378331005".into()),
        ("ticker", "AAPL".into()),
        ("currency", "USD".into()),
    ]);
    c.bench_function("derive account uid", |b| b.iter(|| derive(&Account, black_box(&account), 8)));
    c.bench_function("derive instrument uid", |b| b.iter(|| derive(&Instrument, black_box(&instrument), 8)));
}

fn store_benchmark(c: &mut Criterion) {
    let store = Store::new(StoreConfig::default(), KindRegistry::financial(), Arc::new(MemoryPersistor::new()));
    let key = fields(&[("name", "Brokerage".into()), ("currency", "USD".into())]);
    store.get_or_create("account", key.clone(), Fields::new()).unwrap();
    c.bench_function("get_or_create hit", |b| {
        b.iter(|| store.get_or_create("account", black_box(key.clone()), Fields::new()).unwrap())
    });

    let mut n = 0u64;
    c.bench_function("get_or_create miss", |b| {
        b.iter(|| {
            n += 1;
            let key = fields(&[("name", Value::text(format!("Account {}", n))), ("currency", "USD".into())]);
            store.get_or_create("account", key, Fields::new()).unwrap()
        })
    });
}

criterion_group!(benches, identity_benchmark, store_benchmark);
criterion_main!(benches);
