use std::sync::Arc;

use keepsake::identity::{derive, CanonicalKey};
use keepsake::kind::{Account, Instrument, Ledger};
use keepsake::{
    EntityKind, FieldSpec, Fields, KeepsakeError, KindRegistry, MemoryPersistor, Store, StoreConfig, Uid, Value,
    ValueType,
};

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

// A kind keyed by a decimal, to see rounding take part in identity.
#[derive(Debug)]
struct Quote;

impl EntityKind for Quote {
    fn tag(&self) -> &'static str {
        "quote"
    }
    fn key_fields(&self) -> &'static [FieldSpec] {
        const KEY: &[FieldSpec] = &[
            FieldSpec::required("symbol", ValueType::Text),
            FieldSpec::required("price", ValueType::Decimal),
        ];
        KEY
    }
    fn fields(&self) -> &'static [FieldSpec] {
        &[]
    }
}

fn quote(price: Value) -> Fields {
    fields(&[("symbol", "ACME".into()), ("price", price)])
}

#[test]
fn the_same_key_always_derives_the_same_uid() {
    let key = fields(&[("name", "Brokerage".into()), ("currency", "USD".into())]);
    let first = derive(&Account, &key, 8).unwrap();
    for _ in 0..10 {
        assert_eq!(derive(&Account, &key, 8).unwrap(), first);
    }
    // the hex form is what gets persisted, and must come back unchanged
    assert_eq!(first.to_string().parse::<Uid>().unwrap(), first);
}

#[test]
fn field_order_and_whitespace_carry_no_identity() {
    let a = fields(&[("name", "Brokerage".into()), ("currency", "USD".into())]);
    let b = fields(&[("currency", " USD".into()), ("name", "Brokerage ".into())]);
    assert_eq!(derive(&Account, &a, 8).unwrap(), derive(&Account, &b, 8).unwrap());
}

#[test]
fn kinds_separate_equal_keys() {
    let listing = fields(&[("ticker", "USD".into()), ("currency", "USD".into())]);
    let instrument = derive(&Instrument, &listing, 8).unwrap();
    let account = derive(&Account, &fields(&[("name", "USD".into()), ("currency", "USD".into())]), 8).unwrap();
    assert_ne!(instrument, account);
}

#[test]
fn decimals_round_half_even_before_hashing() {
    let at = |price: &str| derive(&Quote, &quote(Value::decimal(price).unwrap()), 2).unwrap();
    assert_eq!(at("1.005"), at("1.00"));
    assert_eq!(at("1.015"), at("1.02"));
    assert_eq!(at("1.5"), at("1.50"));
    assert_ne!(at("1.01"), at("1.02"));
    // integers are accepted where decimals are declared
    assert_eq!(derive(&Quote, &quote(Value::Integer(10)), 2).unwrap(), at("10.00"));
}

#[test]
fn the_scale_is_part_of_the_canonical_form() {
    let price = quote(Value::decimal("1.00").unwrap());
    assert_ne!(derive(&Quote, &price, 2).unwrap(), derive(&Quote, &price, 4).unwrap());
    let key = CanonicalKey::new(&Quote, &price, 2).unwrap();
    assert_eq!(key.scale(), 2);
    assert_eq!(key.fields().get("price").unwrap().to_string(), "1.00");
}

#[test]
fn malformed_keys_are_rejected() {
    let missing = fields(&[("name", "Brokerage".into())]);
    assert!(matches!(derive(&Account, &missing, 8), Err(KeepsakeError::InvalidKey(_))));
    let mistyped = quote(Value::text("cheap"));
    assert!(matches!(derive(&Quote, &mistyped, 2), Err(KeepsakeError::InvalidKey(_))));
    let no_listing = fields(&[("currency", "USD".into())]);
    assert!(matches!(derive(&Instrument, &no_listing, 8), Err(KeepsakeError::InvalidKey(_))));
    let dangling = fields(&[("account", "not a uid".into()), ("instrument", "x".into())]);
    assert!(matches!(derive(&Ledger, &dangling, 8), Err(KeepsakeError::InvalidKey(_))));
}

#[test]
fn references_take_part_in_identity() {
    let account = derive(&Account, &fields(&[("name", "Brokerage".into()), ("currency", "USD".into())]), 8).unwrap();
    let apple = derive(&Instrument, &fields(&[("ticker", "AAPL".into()), ("currency", "USD".into())]), 8).unwrap();
    let msft = derive(&Instrument, &fields(&[("ticker", "MSFT".into()), ("currency", "USD".into())]), 8).unwrap();
    let ledger = |instrument: Uid| {
        derive(&Ledger, &fields(&[("account", account.into()), ("instrument", instrument.into())]), 8).unwrap()
    };
    assert_eq!(ledger(apple), ledger(apple));
    assert_ne!(ledger(apple), ledger(msft));
}

#[test]
fn the_store_derives_what_the_calculator_derives() {
    let mut kinds = KindRegistry::financial();
    kinds.register(Quote);
    let store = Store::new(
        StoreConfig { decimal_scale: 2, ..StoreConfig::default() },
        kinds,
        Arc::new(MemoryPersistor::new()),
    );
    let price = quote(Value::decimal("12.345").unwrap());
    let entity = store.get_or_create("quote", price.clone(), Fields::new()).unwrap();
    assert_eq!(entity.uid(), derive(&Quote, &price, 2).unwrap());
    assert_eq!(entity.field("price").unwrap(), Value::decimal("12.34").unwrap());
    assert_eq!(entity.record().unwrap().scale(), 2);
}
