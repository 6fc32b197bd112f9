use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use orderly::{Deferred, Promise, Timer, promise_ext::IntoPromise, sleep};

#[test]
fn deferred_settles_once() {
    let deferred = Deferred::<u32, &str>::new();
    let promise = deferred.promise();
    assert!(promise.is_pending());

    deferred.resolve(1);
    deferred.reject("late");
    deferred.resolve(2);

    assert!(deferred.is_settled());
    assert_eq!(promise.outcome(), Some(Ok(1)), "Only the first settlement counts");
}

#[test]
fn continuations_run_in_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let deferred = Deferred::<u32, ()>::new();
    let promise = deferred.promise();

    for i in 0..3 {
        let seen_cl = Arc::clone(&seen);
        promise.on_settled(move |outcome| seen_cl.lock().unwrap().push((i, outcome.clone())));
    }
    assert!(seen.lock().unwrap().is_empty(), "Nothing runs before settlement");

    deferred.resolve(7);
    assert_eq!(*seen.lock().unwrap(), vec![(0, Ok(7)), (1, Ok(7)), (2, Ok(7))]);
}

#[test]
fn continuation_on_settled_promise_runs_immediately() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_cl = Arc::clone(&calls);

    let promise = Promise::<(), &str>::rejected("boom");
    promise.on_success(|_| panic!("Success continuation on a rejected promise"));
    promise.on_failure(move |error| {
        assert_eq!(*error, "boom");
        calls_cl.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn continuation_can_reenter_its_promise() {
    let deferred = Deferred::<u32, ()>::new();
    let promise = deferred.promise();
    let observed = Arc::new(Mutex::new(None));
    let observed_cl = Arc::clone(&observed);

    let reentered = promise.clone();
    promise.on_settled(move |_| {
        *observed_cl.lock().unwrap() = reentered.outcome();
    });
    deferred.resolve(3);

    assert_eq!(*observed.lock().unwrap(), Some(Ok(3)));
}

#[test]
fn pipe_forwards_outcome() {
    let source = Deferred::<u32, String>::new();
    let target = Deferred::new();
    source.promise().pipe(&target);

    source.reject("nope".to_string());
    assert_eq!(target.promise().outcome(), Some(Err("nope".to_string())));
}

#[test]
fn long_pipe_chain_settles_flat() {
    let head = Deferred::<u64, ()>::new();
    let mut tail = head.promise();
    for _ in 0..100_000 {
        let next = Deferred::new();
        tail.pipe(&next);
        tail = next.promise();
    }

    head.resolve(5);
    assert_eq!(tail.outcome(), Some(Ok(5)));
}

#[test]
fn nested_settlement_keeps_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let outer = Deferred::<(), ()>::new();
    let inner = Deferred::<(), ()>::new();
    let inner_promise = inner.promise();

    let seen_cl = Arc::clone(&seen);
    inner_promise.on_settled(move |_| seen_cl.lock().unwrap().push("registered first"));

    let seen_cl = Arc::clone(&seen);
    outer.promise().on_settled(move |_| {
        inner.resolve(());
        assert!(!inner_promise.is_pending(), "Settles right away");
        let seen_in = Arc::clone(&seen_cl);
        inner_promise.on_settled(move |_| seen_in.lock().unwrap().push("registered later"));
        seen_cl.lock().unwrap().push("outer");
    });

    outer.resolve(());
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["outer", "registered first", "registered later"]
    );
}

#[test]
fn clones_share_identity() {
    let deferred = Deferred::<(), ()>::new();
    let a = deferred.promise();
    let b = a.clone();
    let other = Deferred::<(), ()>::new().promise();

    assert!(Promise::ptr_eq(&a, &b));
    assert!(!Promise::ptr_eq(&a, &other));
}

#[tokio::test(flavor = "multi_thread")]
async fn promise_await() {
    let deferred = Deferred::<String, ()>::new();
    let promise = deferred.promise();

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        deferred.resolve("Result".to_string());
    });

    assert_eq!(promise.await, Ok("Result".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn future_into_promise() {
    let promise = async {
        sleep(Duration::from_millis(5)).await.ok();
        Ok::<_, String>(42)
    }
    .into_promise();

    assert_eq!(promise.clone().await, Ok(42));
    assert_eq!(promise.outcome(), Some(Ok(42)));
}

#[tokio::test(flavor = "multi_thread")]
async fn sleep_waits() {
    let start = Instant::now();
    sleep(Duration::from_millis(30)).await.ok();
    assert!(
        start.elapsed() >= Duration::from_millis(30),
        "Sleep should not resolve early"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn timer_fires_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cl = Arc::clone(&fired);

    let timer = Timer::start(Duration::from_millis(10), move || {
        fired_cl.fetch_add(1, Ordering::Relaxed);
    });
    assert!(timer.is_armed());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert!(timer.is_fired());
    assert!(!timer.cancel(), "Cancelling a fired timer has no effect");
}

#[tokio::test(flavor = "multi_thread")]
async fn timer_cancel() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cl = Arc::clone(&fired);

    let timer = Timer::start(Duration::from_millis(20), move || {
        fired_cl.fetch_add(1, Ordering::Relaxed);
    });
    assert!(timer.cancel());
    assert!(!timer.cancel(), "Second cancel reports nothing to cancel");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(fired.load(Ordering::Relaxed), 0, "Canceled timer never fires");
    assert!(!timer.is_armed());
    assert!(!timer.is_fired());
}

#[tokio::test(flavor = "multi_thread")]
async fn timers_fire_in_deadline_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut promises = Vec::new();

    for (label, millis) in [("slow", 60), ("fast", 10), ("medium", 30)] {
        let seen_cl = Arc::clone(&seen);
        let deferred = Deferred::<(), ()>::new();
        promises.push(deferred.promise());
        Timer::start(Duration::from_millis(millis), move || {
            seen_cl.lock().unwrap().push(label);
            deferred.resolve(());
        });
    }
    for promise in promises {
        promise.await.ok();
    }

    assert_eq!(*seen.lock().unwrap(), vec!["fast", "medium", "slow"]);
}
