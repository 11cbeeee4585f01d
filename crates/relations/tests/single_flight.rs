//! Single-flight and cache coherence behavior under concurrent callers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use elif_relations::{
    CollectionRelation, FailurePolicy, NullableSingleRelation, Record, RelationConfig,
    RelationConfigBuilder, RelationError, RelationResult, SingleRelation,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

#[derive(Debug, Clone, PartialEq)]
struct Invoice {
    id: i64,
}

impl Record for Invoice {
    type Key = i64;
    const TYPE_NAME: &'static str = "example:invoice";

    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
struct InvoiceLine {
    id: i64,
    invoice_id: i64,
}

impl Record for InvoiceLine {
    type Key = i64;
    const TYPE_NAME: &'static str = "example:invoice-line";

    fn key(&self) -> i64 {
        self.id
    }
}

/// Call-scoped context handed through to fetch functions
#[derive(Debug, Default)]
struct RequestContext {
    request_id: u64,
}

type Gate = Arc<Mutex<Option<oneshot::Receiver<()>>>>;

/// A fetch that blocks on `gate` the first time it runs
fn gated_relation(
    gate: Gate,
    calls: Arc<Mutex<Vec<i64>>>,
) -> SingleRelation<Invoice, RequestContext> {
    SingleRelation::new("invoiceId", move |_: &RequestContext, key: i64| {
        calls.lock().push(key);
        let rx = gate.lock().take();
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            Ok(Some(Invoice { id: key }))
        }
    })
}

fn gate() -> (oneshot::Sender<()>, Gate) {
    let (tx, rx) = oneshot::channel();
    (tx, Arc::new(Mutex::new(Some(rx))))
}

#[tokio::test]
async fn concurrent_get_item_issues_one_fetch() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&calls);
    let rel: SingleRelation<Invoice, RequestContext> =
        SingleRelation::new("invoiceId", move |_: &RequestContext, key: i64| {
            recorded.lock().push(key);
            async move {
                sleep(Duration::from_millis(10)).await;
                Ok(Some(Invoice { id: key }))
            }
        });
    rel.init_key(11).unwrap();

    let ctx = RequestContext::default();
    let (a, b, c) = tokio::join!(rel.get_item(&ctx), rel.get_item(&ctx), rel.get_item(&ctx));
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(a.id, 11);
    assert_eq!(*calls.lock(), vec![11]);
}

#[tokio::test]
async fn waiters_stay_pending_until_fetch_settles() {
    let (tx, gate) = gate();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let rel = gated_relation(gate, Arc::clone(&calls));
    rel.init_key(11).unwrap();
    let ctx = RequestContext { request_id: 7 };

    let mut first = task::spawn(rel.get_item(&ctx));
    let mut second = task::spawn(rel.get_item(&ctx));
    assert_pending!(first.poll());
    assert_pending!(second.poll());
    assert!(rel.is_pending());
    assert!(rel.item().is_none());

    tx.send(()).unwrap();
    assert!(first.is_woken());

    let a = assert_ready_ok!(first.poll());
    let b = assert_ready_ok!(second.poll());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!rel.is_pending());
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(ctx.request_id, 7);
}

#[tokio::test]
async fn cached_item_is_returned_without_suspending() {
    let rel: SingleRelation<Invoice, RequestContext> =
        SingleRelation::new("invoiceId", |_: &RequestContext, _key: i64| async move {
            futures::future::pending::<RelationResult<Option<Invoice>>>().await
        });
    let cached = Arc::new(Invoice { id: 3 });
    rel.init_item(Arc::clone(&cached)).unwrap();

    let ctx = RequestContext::default();
    let mut lookup = task::spawn(rel.get_item(&ctx));
    let item = assert_ready_ok!(lookup.poll());
    assert!(Arc::ptr_eq(&item, &cached));
}

#[tokio::test]
async fn missing_key_fails_before_fetch() {
    let (_tx, gate) = gate();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let rel = gated_relation(gate, Arc::clone(&calls));
    let ctx = RequestContext::default();

    let mut lookup = task::spawn(rel.get_item(&ctx));
    let err = assert_ready!(lookup.poll()).unwrap_err();
    assert_eq!(err, RelationError::key_not_set("invoiceId"));
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn key_change_during_fetch_keeps_stale_result_out_of_cache() {
    let (tx, gate) = gate();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let rel = gated_relation(gate, Arc::clone(&calls));
    rel.init_key(11).unwrap();
    let ctx = RequestContext::default();

    let mut stale = task::spawn(rel.get_item(&ctx));
    assert_pending!(stale.poll());

    rel.set_key(12);
    assert!(!rel.is_pending());

    tx.send(()).unwrap();
    let old = assert_ready_ok!(stale.poll());
    assert_eq!(old.id, 11);
    assert!(rel.item().is_none());
    assert_eq!(rel.key(), Some(12));

    let fresh = rel.get_item(&ctx).await.unwrap();
    assert_eq!(fresh.id, 12);
    assert_eq!(*calls.lock(), vec![11, 12]);
}

fn reset_config() -> RelationConfig {
    RelationConfigBuilder::new()
        .failure_policy(FailurePolicy::Reset)
        .build_with_defaults()
        .unwrap()
}

fn flaky_relation(config: RelationConfig, calls: Arc<AtomicUsize>) -> SingleRelation<Invoice, ()> {
    SingleRelation::with_config("invoiceId", config, move |_: &(), key: i64| {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            sleep(Duration::from_millis(5)).await;
            if attempt == 0 {
                Err(RelationError::Backend("connection reset".into()))
            } else {
                Ok(Some(Invoice { id: key }))
            }
        }
    })
}

#[tokio::test]
async fn concurrent_callers_share_one_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let rel = flaky_relation(RelationConfig::default(), Arc::clone(&calls));
    rel.init_key(5).unwrap();

    let (a, b, c) = tokio::join!(rel.get_item(&()), rel.get_item(&()), rel.get_item(&()));
    let expected = RelationError::Backend("connection reset".into());
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(c.unwrap_err(), expected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sticky_failure_requires_clear_before_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let rel = flaky_relation(RelationConfig::default(), Arc::clone(&calls));
    rel.init_key(5).unwrap();

    assert!(rel.get_item(&()).await.is_err());
    assert!(rel.get_item(&()).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    rel.clear_item();
    let item = rel.get_item(&()).await.unwrap();
    assert_eq!(item.id, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reset_policy_retries_on_next_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = reset_config();
    let rel = flaky_relation(config, Arc::clone(&calls));
    rel.init_key(5).unwrap();

    assert!(rel.get_item(&()).await.is_err());
    let item = rel.get_item(&()).await.unwrap();
    assert_eq!(item.id, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn nullable_concurrent_get_item_issues_one_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let rel: NullableSingleRelation<Invoice, ()> =
        NullableSingleRelation::new("parentInvoiceId", move |_: &(), key: i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(Duration::from_millis(10)).await;
                Ok(Some(Invoice { id: key }))
            }
        });
    rel.init_key(Some(21)).unwrap();

    let (a, b, c) = tokio::join!(rel.get_item(&()), rel.get_item(&()), rel.get_item(&()));
    let (a, b, c) = (a.unwrap().unwrap(), b.unwrap().unwrap(), c.unwrap().unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nullable_null_key_resolves_without_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let rel: NullableSingleRelation<Invoice, ()> =
        NullableSingleRelation::new("parentInvoiceId", move |_: &(), key: i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Some(Invoice { id: key })) }
        });
    rel.init_key(None).unwrap();

    let mut lookup = task::spawn(rel.get_item(&()));
    assert_eq!(assert_ready_ok!(lookup.poll()), None);
    assert!(rel.loaded());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_get_items_issues_one_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let rel: CollectionRelation<Invoice, InvoiceLine, ()> =
        CollectionRelation::new(move |_: &(), invoice: &Invoice| {
            counter.fetch_add(1, Ordering::SeqCst);
            let invoice_id = invoice.id;
            async move {
                sleep(Duration::from_millis(10)).await;
                Ok(vec![
                    InvoiceLine { id: 1, invoice_id },
                    InvoiceLine { id: 2, invoice_id },
                ])
            }
        });
    let invoice = Invoice { id: 30 };

    let (a, b, c) = tokio::join!(
        rel.get_items(&(), &invoice),
        rel.get_items(&(), &invoice),
        rel.get_items(&(), &invoice)
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(a.len(), 2);
    assert!(a.iter().all(|line| line.invoice_id == 30));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn set_collection_during_fetch_wins() {
    let (tx, rx) = oneshot::channel::<()>();
    let gate = Arc::new(Mutex::new(Some(rx)));
    let rel: CollectionRelation<Invoice, InvoiceLine, ()> =
        CollectionRelation::new(move |_: &(), invoice: &Invoice| {
            let rx = gate.lock().take();
            let invoice_id = invoice.id;
            async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(vec![InvoiceLine { id: 1, invoice_id }])
            }
        });
    let invoice = Invoice { id: 30 };

    let mut fetch = task::spawn(rel.get_items(&(), &invoice));
    assert_pending!(fetch.poll());

    rel.set_collection(vec![InvoiceLine { id: 9, invoice_id: 30 }]);
    tx.send(()).unwrap();
    let fetched = assert_ready_ok!(fetch.poll());
    assert_eq!(fetched[0].id, 1);

    let cached = rel.items().unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, 9);
}

fn flaky_lines(config: RelationConfig, calls: Arc<AtomicUsize>) -> CollectionRelation<Invoice, InvoiceLine, ()> {
    CollectionRelation::with_config(config, move |_: &(), invoice: &Invoice| {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        let invoice_id = invoice.id;
        async move {
            sleep(Duration::from_millis(5)).await;
            if attempt == 0 {
                Err(RelationError::Backend("connection reset".into()))
            } else {
                Ok(vec![InvoiceLine { id: 1, invoice_id }])
            }
        }
    })
}

#[tokio::test]
async fn concurrent_get_items_share_one_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let rel = flaky_lines(RelationConfig::default(), Arc::clone(&calls));
    let invoice = Invoice { id: 30 };

    let (a, b, c) = tokio::join!(
        rel.get_items(&(), &invoice),
        rel.get_items(&(), &invoice),
        rel.get_items(&(), &invoice)
    );
    let expected = RelationError::Backend("connection reset".into());
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(c.unwrap_err(), expected);
    assert!(!rel.loaded());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sticky_collection_failure_requires_clear_before_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let rel = flaky_lines(RelationConfig::default(), Arc::clone(&calls));
    let invoice = Invoice { id: 30 };

    assert!(rel.get_items(&(), &invoice).await.is_err());
    assert!(rel.get_items(&(), &invoice).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    rel.clear();
    let items = rel.get_items(&(), &invoice).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(rel.loaded());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reset_policy_retries_collection_on_next_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let rel = flaky_lines(reset_config(), Arc::clone(&calls));
    let invoice = Invoice { id: 30 };

    assert!(rel.get_items(&(), &invoice).await.is_err());
    let items = rel.get_items(&(), &invoice).await.unwrap();
    assert_eq!(items[0].invoice_id, 30);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Parent record that owns its collection relation
#[derive(Debug)]
struct Order {
    id: i64,
    lines: CollectionRelation<Order, InvoiceLine, ()>,
}

/// Child record whose relation fetch receives the child itself as context
#[derive(Debug)]
struct Shipment {
    id: i64,
    invoice: SingleRelation<Invoice, Shipment>,
}

/// Run `f` on a worker thread, failing the test instead of hanging if it blocks
fn within_deadline<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(3))
        .expect("relation lock held while running the fetch function")
}

#[test]
fn collection_fetch_may_inspect_its_parent() {
    let seen = within_deadline(|| {
        let order = Order {
            id: 8,
            lines: CollectionRelation::new(|_: &(), order: &Order| {
                let described = format!("{:?}", order);
                let loaded = order.lines.loaded();
                let invoice_id = order.id;
                async move {
                    assert!(described.contains("CollectionRelation"));
                    assert!(!loaded);
                    Ok(vec![InvoiceLine { id: 1, invoice_id }])
                }
            }),
        };
        let items = futures::executor::block_on(order.lines.get_items(&(), &order)).unwrap();
        items[0].invoice_id
    });
    assert_eq!(seen, 8);
}

#[test]
fn item_fetch_may_inspect_its_context() {
    let seen = within_deadline(|| {
        let shipment = Shipment {
            id: 2,
            invoice: SingleRelation::new("invoiceId", |shipment: &Shipment, key: i64| {
                let described = format!("{:?}", shipment);
                let pending = shipment.invoice.is_pending();
                async move {
                    assert!(described.contains("invoiceId"));
                    assert!(!pending);
                    Ok(Some(Invoice { id: key }))
                }
            }),
        };
        shipment.invoice.init_key(40).unwrap();
        let invoice = futures::executor::block_on(shipment.invoice.get_item(&shipment)).unwrap();
        assert_eq!(shipment.id, 2);
        invoice.id
    });
    assert_eq!(seen, 40);
}
